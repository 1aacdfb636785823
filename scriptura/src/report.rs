use crate::error::{ApplyCause, Error};
use std::fmt;
use std::time::Duration;

/// What happened to one change unit during a run (or a reversal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// The unit's script ran and its journal entry was committed.
    Applied,
    /// Another run journaled the unit first; nothing was executed in this run.
    Skipped,
    /// The unit's script failed and its scope was rolled back.
    Failed,
    /// The unit ran inside a single-scope run whose scope was rolled back after a later failure.
    RolledBack,
    /// The unit's rollback script ran and its journal entry was removed.
    Reversed,
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UnitOutcome::Applied => "applied",
            UnitOutcome::Skipped => "skipped",
            UnitOutcome::Failed => "failed",
            UnitOutcome::RolledBack => "rolled back",
            UnitOutcome::Reversed => "reversed",
        };
        f.write_str(label)
    }
}

/// One entry of the execution log.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitRecord {
    pub name: String,
    pub outcome: UnitOutcome,
    pub duration: Duration,
    pub error: Option<ApplyCause>,
}

/// Overall result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every discovered unit was already journaled.
    NothingToDo,
    /// All pending units were handled.
    Completed,
    /// A unit failed; see [ExecutionSummary::failure].
    Failed,
    /// The run was cancelled between units.
    Cancelled,
}

/// The unit that stopped a failed run, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitFailure {
    pub unit: String,
    pub cause: ApplyCause,
}

/// A report of what a run did.
///
/// A summary is produced for every run that gets past discovery and diffing, including runs with
/// nothing pending, so callers can tell "up to date" apart from "did not run".
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSummary {
    /// Whether this run created the journal.
    pub journal_created: bool,
    /// One record per attempted unit, in execution order.
    pub records: Vec<UnitRecord>,
    /// Units whose effects and journal entries were committed by this run.
    pub total_applied: usize,
    /// Units that were pending when the run diffed the source against the journal.
    pub total_pending: usize,
    /// Units that were already journaled before the run started.
    pub up_to_date: usize,
    /// Journal entries with no matching unit, tolerated under [DriftPolicy::Warn](crate::DriftPolicy::Warn).
    pub unknown_entries: Vec<String>,
    pub outcome: RunOutcome,
    pub failure: Option<UnitFailure>,
}

impl ExecutionSummary {
    pub(crate) fn new(journal_created: bool, up_to_date: usize, total_pending: usize) -> Self {
        Self {
            journal_created,
            records: Vec::new(),
            total_applied: 0,
            total_pending,
            up_to_date,
            unknown_entries: Vec::new(),
            outcome: if total_pending == 0 {
                RunOutcome::NothingToDo
            } else {
                RunOutcome::Completed
            },
            failure: None,
        }
    }

    pub(crate) fn push(&mut self, record: UnitRecord) {
        if record.outcome == UnitOutcome::Applied {
            self.total_applied += 1;
        }
        self.records.push(record);
    }

    /// Names of units with the given outcome, in execution order.
    pub fn names_with(&self, outcome: UnitOutcome) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.outcome == outcome)
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Turn a failed summary into [Error::Apply], passing successful ones through.
    pub fn into_result(self) -> Result<Self, Error> {
        match self.failure {
            Some(UnitFailure { unit, cause }) => Err(Error::Apply { unit, cause }),
            None => Ok(self),
        }
    }
}

impl fmt::Display for ExecutionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.records {
            write!(
                f,
                "{:<12} {} ({} ms)",
                record.outcome.to_string(),
                record.name,
                record.duration.as_millis()
            )?;
            if let Some(error) = &record.error {
                write!(f, ": {}", error)?;
            }
            writeln!(f)?;
        }
        for name in &self.unknown_entries {
            writeln!(f, "{:<12} {} (journaled but not in source)", "unknown", name)?;
        }
        let outcome = match self.outcome {
            RunOutcome::NothingToDo => "nothing to do",
            RunOutcome::Completed => "completed",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        };
        write!(
            f,
            "{}: {} of {} pending applied, {} already up to date",
            outcome, self.total_applied, self.total_pending, self.up_to_date
        )
    }
}

type StartHook = Box<dyn Fn(&str) + Send + Sync>;
type CompleteHook = Box<dyn Fn(&str, Duration) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&str, &ApplyCause) + Send + Sync>;

/// Callbacks invoked as units are processed.
#[derive(Default)]
pub(crate) struct ExecutionHooks {
    pub on_unit_start: Option<StartHook>,
    pub on_unit_complete: Option<CompleteHook>,
    pub on_unit_skipped: Option<StartHook>,
    pub on_unit_error: Option<ErrorHook>,
}

impl ExecutionHooks {
    pub fn start(&self, name: &str) {
        if let Some(ref callback) = self.on_unit_start {
            callback(name);
        }
    }

    pub fn complete(&self, name: &str, duration: Duration) {
        if let Some(ref callback) = self.on_unit_complete {
            callback(name, duration);
        }
    }

    pub fn skipped(&self, name: &str) {
        if let Some(ref callback) = self.on_unit_skipped {
            callback(name);
        }
    }

    pub fn error(&self, name: &str, cause: &ApplyCause) {
        if let Some(ref callback) = self.on_unit_error {
            callback(name, cause);
        }
    }
}

// Manual Debug impl since closures don't implement Debug
impl fmt::Debug for ExecutionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHooks")
            .field("on_unit_start", &self.on_unit_start.is_some())
            .field("on_unit_complete", &self.on_unit_complete.is_some())
            .field("on_unit_skipped", &self.on_unit_skipped.is_some())
            .field("on_unit_error", &self.on_unit_error.is_some())
            .finish()
    }
}
