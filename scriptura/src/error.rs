use std::fmt;
use std::time::Duration;

/// Error type for the scriptura crate.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("failed to discover change units from {location}: {reason}")]
    Discovery { location: String, reason: String },
    #[error("change units '{first}' and '{second}' share the ordering key '{key}'")]
    DuplicateChangeUnit {
        key: String,
        first: String,
        second: String,
    },
    #[error(
        "change unit '{name}' checksum mismatch. Journal recorded '{recorded}' but the script now hashes to '{current}'. \
        This indicates the script was modified after being applied."
    )]
    ChecksumMismatch {
        name: String,
        recorded: String,
        current: String,
    },
    #[error("change unit '{name}' was previously applied but is no longer present in the script source")]
    UnknownJournalEntry { name: String },
    #[error("change unit '{name}' is pending but sorts before already-applied unit '{latest}'")]
    OutOfOrder { name: String, latest: String },
    #[error("journal unavailable during {phase}: {reason}")]
    JournalUnavailable { phase: Phase, reason: String },
    #[error("change unit '{unit}' failed: {cause}")]
    Apply { unit: String, cause: ApplyCause },
    #[error("change unit '{name}' does not exist in the script source")]
    UnknownChangeUnit { name: String },
    #[error("change unit '{name}' has not been applied")]
    NotApplied { name: String },
    #[error("change unit '{name}' has no rollback script")]
    NoRollback { name: String },
}

impl Error {
    pub(crate) fn journal(phase: Phase, reason: impl fmt::Display) -> Self {
        Self::JournalUnavailable {
            phase,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn discovery(location: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Discovery {
            location: location.into(),
            reason: reason.to_string(),
        }
    }
}

/// Why a single change unit could not be applied (or reversed).
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ApplyCause {
    /// The script itself failed against the target database.
    #[error("{0}")]
    Script(String),
    /// The script ran longer than the configured unit timeout and was interrupted.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// The journal operation that was in progress when storage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    Initialize,
    List,
    Begin,
    Check,
    Record,
    Remove,
    Commit,
    Rollback,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Open => "open",
            Phase::Initialize => "initialize",
            Phase::List => "list",
            Phase::Begin => "begin",
            Phase::Check => "check",
            Phase::Record => "record",
            Phase::Remove => "remove",
            Phase::Commit => "commit",
            Phase::Rollback => "rollback",
        };
        f.write_str(name)
    }
}
