use crate::error::Error;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

/// Digit runs longer than this cannot be compared numerically.
const MAX_DIGITS: usize = 38;

/// The sortable part of a change unit's name.
///
/// The prefix is the text before the first `_` (or the whole name). It is split into runs of
/// ASCII digits, compared numerically, and runs of anything else, compared lexicographically.
/// So `A2` sorts before `A10`, and `001` and `1` are the same key.
#[derive(Debug, Clone)]
pub struct OrderingKey {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Segment {
    Number(u128),
    Text(String),
}

impl OrderingKey {
    /// Derive the ordering key from a change unit name.
    pub fn from_name(name: &str) -> Result<Self, String> {
        let raw = name.split('_').next().unwrap_or_default();
        if raw.is_empty() {
            return Err(format!(
                "change unit name '{}' has no sortable prefix before '_'",
                name
            ));
        }

        let mut segments = Vec::new();
        let mut rest = raw;
        while let Some(first) = rest.chars().next() {
            let is_digit = first.is_ascii_digit();
            let end = rest
                .find(|c: char| c.is_ascii_digit() != is_digit)
                .unwrap_or(rest.len());
            let (run, tail) = rest.split_at(end);
            if is_digit {
                if run.trim_start_matches('0').len() > MAX_DIGITS {
                    return Err(format!(
                        "ordering prefix '{}' of '{}' has a numeric run longer than {} digits",
                        raw, name, MAX_DIGITS
                    ));
                }
                let value = run
                    .parse::<u128>()
                    .map_err(|e| format!("invalid ordering prefix '{}': {}", raw, e))?;
                segments.push(Segment::Number(value));
            } else {
                segments.push(Segment::Text(run.to_string()));
            }
            rest = tail;
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The prefix text as it appears in the name.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for OrderingKey {
    fn eq(&self, other: &Self) -> bool {
        self.segments == other.segments
    }
}

impl Eq for OrderingKey {}

impl PartialOrd for OrderingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments.cmp(&other.segments)
    }
}

impl fmt::Display for OrderingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One named, ordered schema change script, with an optional rollback script.
///
/// Units are immutable once constructed. The checksum is computed from the exact bytes of
/// `body`, which are the bytes handed to the database.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeUnit {
    name: String,
    key: OrderingKey,
    body: String,
    checksum: String,
    rollback_body: Option<String>,
}

impl ChangeUnit {
    /// Create a unit from its name and forward script.
    /// Returns an error if the name has no usable ordering prefix.
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        let body = body.into();
        let key = OrderingKey::from_name(&name).map_err(|reason| Error::Discovery {
            location: name.clone(),
            reason,
        })?;
        let checksum = checksum(&body);
        Ok(Self {
            name,
            key,
            body,
            checksum,
            rollback_body: None,
        })
    }

    /// Attach the script that reverses this unit.
    pub fn with_rollback(mut self, rollback_body: impl Into<String>) -> Self {
        self.rollback_body = Some(rollback_body.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ordering_key(&self) -> &OrderingKey {
        &self.key
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn rollback_body(&self) -> Option<&str> {
        self.rollback_body.as_deref()
    }

    /// The human-readable part of the name after the ordering prefix, with underscores as spaces.
    /// `None` when the name is only a prefix.
    pub fn description(&self) -> Option<String> {
        self.name
            .split_once('_')
            .map(|(_, rest)| rest.trim_matches('_').replace('_', " "))
            .filter(|d| !d.is_empty())
    }

    /// Build the journal entry recording that this unit was applied at `applied_at`.
    pub fn journal_entry(&self, applied_at: DateTime<Utc>) -> JournalEntry {
        JournalEntry {
            name: self.name.clone(),
            checksum: self.checksum.clone(),
            applied_at,
        }
    }
}

/// A durable record that a change unit was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// The name of the applied change unit.
    pub name: String,
    /// The checksum of the unit's body at the time it was applied.
    pub checksum: String,
    /// When the unit's scope committed.
    pub applied_at: DateTime<Utc>,
}

/// Lowercase hex SHA-256 of a script body.
pub fn checksum(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Sort units by ordering key, rejecting any two that share a key.
pub(crate) fn sort_and_check_unique(units: &mut [ChangeUnit]) -> Result<(), Error> {
    units.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.name.cmp(&b.name)));
    for pair in units.windows(2) {
        if pair[0].key == pair[1].key {
            return Err(Error::DuplicateChangeUnit {
                key: pair[1].key.to_string(),
                first: pair[0].name.clone(),
                second: pair[1].name.clone(),
            });
        }
    }
    Ok(())
}
