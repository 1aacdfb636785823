use crate::error::{ApplyCause, Error, Phase};
use crate::journal::{AtomicScope, JournalStore, Recorded};
use crate::report::{
    ExecutionHooks, ExecutionSummary, RunOutcome, UnitFailure, UnitOutcome, UnitRecord,
};
use crate::source::ScriptSource;
use crate::unit::{sort_and_check_unique, ChangeUnit, JournalEntry};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How pending units are grouped into atomic scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyMode {
    /// Each unit runs in its own scope. A failure stops the run, but units committed before it
    /// stay committed, and the next run resumes from the failed unit.
    #[default]
    PerUnit,
    /// All pending units run in one scope. A failure rolls back every unit of the run.
    SingleScope,
}

/// What to do with journal entries whose unit is no longer in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriftPolicy {
    /// Fail the run with [Error::UnknownJournalEntry].
    #[default]
    Fail,
    /// Continue, listing the entries in [ExecutionSummary::unknown_entries].
    Warn,
}

/// Engine settings. See the `with_*` methods on [MigrationEngine].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    pub mode: ApplyMode,
    /// Upper bound on a single unit's script runtime.
    pub unit_timeout: Option<Duration>,
    pub drift_policy: DriftPolicy,
    /// Reject pending units that sort before the latest applied unit.
    pub strict_ordering: bool,
}

/// Where the engine is in its current (or last) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Discovering,
    Diffing,
    /// Working on the pending unit at this index.
    Applying(usize),
    Completed,
    Failed,
    Cancelled,
}

/// Requests that a run stop before its next unit. Cloneable and shareable across threads.
///
/// A unit that is already executing always finishes (committing or rolling back its scope) first.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Applies the change units of a [ScriptSource] that a [JournalStore] has not recorded yet.
///
/// # Example
///
/// ```
/// use rusqlite::Connection;
/// use scriptura::{EmbeddedSource, MigrationEngine, RunOutcome, SqliteJournal};
///
/// let source = EmbeddedSource::from_files(vec![
///     ("001_create_users.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)"),
///     ("002_add_email.sql", "ALTER TABLE users ADD COLUMN email TEXT"),
/// ]);
/// let journal = SqliteJournal::new(Connection::open_in_memory().unwrap());
/// let mut engine = MigrationEngine::new(source, journal);
///
/// let summary = engine.run().unwrap();
/// assert_eq!(summary.total_applied, 2);
/// assert_eq!(summary.outcome, RunOutcome::Completed);
///
/// // a second run finds nothing to do
/// let summary = engine.run().unwrap();
/// assert_eq!(summary.total_applied, 0);
/// assert_eq!(summary.outcome, RunOutcome::NothingToDo);
/// ```
pub struct MigrationEngine<S, J> {
    source: S,
    journal: J,
    config: EngineConfig,
    hooks: ExecutionHooks,
    state: RunState,
    cancel: CancelToken,
}

// Manual Debug impl since the sources and journals need not implement Debug
impl<S, J> std::fmt::Debug for MigrationEngine<S, J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .field("state", &self.state)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Result of comparing discovered units against the journal.
struct Plan {
    pending: Vec<ChangeUnit>,
    up_to_date: usize,
    unknown_entries: Vec<String>,
}

impl<S: ScriptSource, J: JournalStore> MigrationEngine<S, J> {
    pub fn new(source: S, journal: J) -> Self {
        Self {
            source,
            journal,
            config: EngineConfig::default(),
            hooks: ExecutionHooks::default(),
            state: RunState::Idle,
            cancel: CancelToken::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Choose between one scope per unit (the default) and one scope for the whole run.
    pub fn with_mode(mut self, mode: ApplyMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Interrupt any unit whose script runs longer than `timeout`.
    pub fn with_unit_timeout(mut self, timeout: Duration) -> Self {
        self.config.unit_timeout = Some(timeout);
        self
    }

    pub fn with_drift_policy(mut self, policy: DriftPolicy) -> Self {
        self.config.drift_policy = policy;
        self
    }

    /// Fail with [Error::OutOfOrder] instead of applying a new unit that sorts before one that is
    /// already applied.
    pub fn with_strict_ordering(mut self, strict: bool) -> Self {
        self.config.strict_ordering = strict;
        self
    }

    /// Set a callback to be invoked when a unit starts.
    /// The callback receives the unit name.
    pub fn on_unit_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.hooks.on_unit_start = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked after a unit's scope commits.
    /// The callback receives the unit name and how long the unit took.
    pub fn on_unit_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Duration) + Send + Sync + 'static,
    {
        self.hooks.on_unit_complete = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a unit turns out to be journaled by a concurrent run.
    pub fn on_unit_skipped<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.hooks.on_unit_skipped = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a unit fails.
    pub fn on_unit_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &ApplyCause) + Send + Sync + 'static,
    {
        self.hooks.on_unit_error = Some(Box::new(callback));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// A token that stops the run before its next unit.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn journal(&self) -> &J {
        &self.journal
    }

    pub fn journal_mut(&mut self) -> &mut J {
        &mut self.journal
    }

    pub fn into_parts(self) -> (S, J) {
        (self.source, self.journal)
    }

    /// Apply all pending units, failing with [Error::Apply] if one of them fails.
    ///
    /// Units committed before the failing one stay committed. Use [MigrationEngine::execute] to
    /// get the full [ExecutionSummary] of a failed run.
    pub fn run(&mut self) -> Result<ExecutionSummary, Error> {
        self.execute()?.into_result()
    }

    /// Apply all pending units, reporting a unit failure inside the returned summary.
    ///
    /// Errors are still returned for everything that prevents the run from starting or from
    /// keeping the journal consistent: discovery problems, checksum mismatches, drift and
    /// journal storage failures.
    pub fn execute(&mut self) -> Result<ExecutionSummary, Error> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("scriptura_run", source = %self.source.location()).entered();

        let result = self.execute_internal();
        self.state = match &result {
            Ok(summary) => match summary.outcome {
                RunOutcome::Failed => RunState::Failed,
                RunOutcome::Cancelled => RunState::Cancelled,
                RunOutcome::NothingToDo | RunOutcome::Completed => RunState::Completed,
            },
            Err(_error) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %_error, "Run aborted");
                RunState::Failed
            }
        };

        #[cfg(feature = "tracing")]
        if let Ok(summary) = &result {
            tracing::info!(
                applied = summary.total_applied,
                pending = summary.total_pending,
                outcome = ?summary.outcome,
                "Run finished"
            );
        }

        result
    }

    fn execute_internal(&mut self) -> Result<ExecutionSummary, Error> {
        self.state = RunState::Discovering;
        let units = self.discover()?;

        self.state = RunState::Diffing;
        let journal_created = self.journal.initialize()?;
        let applied = self.journal.list_applied()?;
        let plan = diff(units, &applied, &self.config)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            pending = ?plan.pending.iter().map(|u| u.name()).collect::<Vec<_>>(),
            up_to_date = plan.up_to_date,
            "Considering units to apply"
        );

        let mut summary =
            ExecutionSummary::new(journal_created, plan.up_to_date, plan.pending.len());
        summary.unknown_entries = plan.unknown_entries;

        match self.config.mode {
            ApplyMode::PerUnit => self.apply_per_unit(&plan.pending, &mut summary)?,
            ApplyMode::SingleScope => self.apply_single_scope(&plan.pending, &mut summary)?,
        }
        Ok(summary)
    }

    fn discover(&self) -> Result<Vec<ChangeUnit>, Error> {
        let mut units = self.source.discover()?;
        // sources may be user implementations, so the ordering contract is re-checked
        sort_and_check_unique(&mut units)?;
        Ok(units)
    }

    fn apply_per_unit(
        &mut self,
        pending: &[ChangeUnit],
        summary: &mut ExecutionSummary,
    ) -> Result<(), Error> {
        for (index, unit) in pending.iter().enumerate() {
            if self.cancel.is_cancelled() {
                #[cfg(feature = "tracing")]
                tracing::warn!(remaining = pending.len() - index, "Run cancelled");
                summary.outcome = RunOutcome::Cancelled;
                break;
            }
            self.state = RunState::Applying(index);

            #[cfg(feature = "tracing")]
            let _span = tracing::info_span!("unit_apply", name = %unit.name()).entered();
            #[cfg(feature = "tracing")]
            tracing::info!("Starting unit");

            self.hooks.start(unit.name());
            let started = Instant::now();

            let mut scope = self.journal.begin()?;
            if scope.is_recorded(unit.name())? {
                scope.rollback()?;
                skip(&self.hooks, summary, unit, started);
                continue;
            }

            match scope.execute(unit.body(), self.config.unit_timeout) {
                Ok(()) => match scope.record_applied(&unit.journal_entry(Utc::now()))? {
                    Recorded::Inserted => {
                        scope.commit()?;
                        let duration = started.elapsed();

                        #[cfg(feature = "tracing")]
                        tracing::info!(duration_ms = duration.as_millis(), "Unit applied");

                        self.hooks.complete(unit.name(), duration);
                        summary.push(UnitRecord {
                            name: unit.name().to_string(),
                            outcome: UnitOutcome::Applied,
                            duration,
                            error: None,
                        });
                    }
                    Recorded::AlreadyPresent => {
                        scope.rollback()?;
                        skip(&self.hooks, summary, unit, started);
                    }
                },
                Err(cause) => {
                    scope.rollback()?;
                    fail(&self.hooks, summary, unit, started, cause);
                    break;
                }
            }
        }
        Ok(())
    }

    fn apply_single_scope(
        &mut self,
        pending: &[ChangeUnit],
        summary: &mut ExecutionSummary,
    ) -> Result<(), Error> {
        if pending.is_empty() {
            return Ok(());
        }

        let mut scope = self.journal.begin()?;
        let mut records: Vec<UnitRecord> = Vec::with_capacity(pending.len());
        let mut failed: Option<(&ChangeUnit, Instant, ApplyCause)> = None;
        let mut cancelled = false;

        for (index, unit) in pending.iter().enumerate() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            self.state = RunState::Applying(index);

            #[cfg(feature = "tracing")]
            let _span = tracing::info_span!("unit_apply", name = %unit.name()).entered();
            #[cfg(feature = "tracing")]
            tracing::info!("Starting unit");

            self.hooks.start(unit.name());
            let started = Instant::now();

            if scope.is_recorded(unit.name())? {
                self.hooks.skipped(unit.name());
                records.push(UnitRecord {
                    name: unit.name().to_string(),
                    outcome: UnitOutcome::Skipped,
                    duration: started.elapsed(),
                    error: None,
                });
                continue;
            }

            if let Err(cause) = scope.execute(unit.body(), self.config.unit_timeout) {
                failed = Some((unit, started, cause));
                break;
            }
            // the scope has held the write lock since before the is_recorded check
            if scope.record_applied(&unit.journal_entry(Utc::now()))? == Recorded::AlreadyPresent
            {
                scope.rollback()?;
                return Err(Error::journal(
                    Phase::Record,
                    format!(
                        "entry for '{}' appeared while the run held the journal lock",
                        unit.name()
                    ),
                ));
            }
            records.push(UnitRecord {
                name: unit.name().to_string(),
                outcome: UnitOutcome::Applied,
                duration: started.elapsed(),
                error: None,
            });
        }

        if failed.is_none() && !cancelled {
            scope.commit()?;
            for record in records {
                if record.outcome == UnitOutcome::Applied {
                    #[cfg(feature = "tracing")]
                    tracing::info!(name = %record.name, duration_ms = record.duration.as_millis(), "Unit applied");
                    self.hooks.complete(&record.name, record.duration);
                }
                summary.push(record);
            }
            return Ok(());
        }

        scope.rollback()?;
        #[cfg(feature = "tracing")]
        tracing::warn!(
            units = records.len(),
            "Rolled back single-scope run"
        );
        for mut record in records {
            if record.outcome == UnitOutcome::Applied {
                record.outcome = UnitOutcome::RolledBack;
            }
            summary.push(record);
        }
        match failed {
            Some((unit, started, cause)) => fail(&self.hooks, summary, unit, started, cause),
            None => summary.outcome = RunOutcome::Cancelled,
        }
        Ok(())
    }

    /// Dry run: the units the next run would apply, in order.
    ///
    /// Performs the same checksum and drift validation as a run, but never creates the journal
    /// or executes anything.
    pub fn pending(&mut self) -> Result<Vec<ChangeUnit>, Error> {
        let units = self.discover()?;
        let applied = self.journal.list_applied()?;
        Ok(diff(units, &applied, &self.config)?.pending)
    }

    /// All journal entries, in the order they were applied.
    pub fn history(&mut self) -> Result<Vec<JournalEntry>, Error> {
        self.journal.list_applied()
    }

    /// Undo one applied unit by running its rollback script and deleting its journal entry,
    /// both in one atomic scope.
    ///
    /// This is an operator action. The forward engine never reverses units on its own, not even
    /// after a failure.
    pub fn reverse(&mut self, name: &str) -> Result<UnitRecord, Error> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("unit_reverse", name = %name).entered();

        let units = self.discover()?;
        let unit = units
            .into_iter()
            .find(|u| u.name() == name)
            .ok_or_else(|| Error::UnknownChangeUnit {
                name: name.to_string(),
            })?;
        let rollback_body = unit.rollback_body().ok_or_else(|| Error::NoRollback {
            name: name.to_string(),
        })?;

        let applied = self.journal.list_applied()?;
        let entry = applied
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::NotApplied {
                name: name.to_string(),
            })?;
        if entry.checksum != unit.checksum() {
            return Err(Error::ChecksumMismatch {
                name: name.to_string(),
                recorded: entry.checksum.clone(),
                current: unit.checksum().to_string(),
            });
        }

        self.hooks.start(name);
        let started = Instant::now();

        let mut scope = self.journal.begin()?;
        // a concurrent reversal may have won
        if !scope.is_recorded(name)? {
            scope.rollback()?;
            return Err(Error::NotApplied {
                name: name.to_string(),
            });
        }
        if let Err(cause) = scope.execute(rollback_body, self.config.unit_timeout) {
            scope.rollback()?;
            #[cfg(feature = "tracing")]
            tracing::error!(error = %cause, "Reversal failed");
            self.hooks.error(name, &cause);
            return Err(Error::Apply {
                unit: name.to_string(),
                cause,
            });
        }
        scope.remove(name)?;
        scope.commit()?;

        let duration = started.elapsed();
        #[cfg(feature = "tracing")]
        tracing::info!(duration_ms = duration.as_millis(), "Unit reversed");
        self.hooks.complete(name, duration);

        Ok(UnitRecord {
            name: name.to_string(),
            outcome: UnitOutcome::Reversed,
            duration,
            error: None,
        })
    }
}

fn skip(hooks: &ExecutionHooks, summary: &mut ExecutionSummary, unit: &ChangeUnit, started: Instant) {
    #[cfg(feature = "tracing")]
    tracing::warn!("Unit already journaled by a concurrent run, skipping");

    hooks.skipped(unit.name());
    summary.push(UnitRecord {
        name: unit.name().to_string(),
        outcome: UnitOutcome::Skipped,
        duration: started.elapsed(),
        error: None,
    });
}

fn fail(
    hooks: &ExecutionHooks,
    summary: &mut ExecutionSummary,
    unit: &ChangeUnit,
    started: Instant,
    cause: ApplyCause,
) {
    #[cfg(feature = "tracing")]
    tracing::error!(name = %unit.name(), error = %cause, "Unit failed");

    hooks.error(unit.name(), &cause);
    summary.push(UnitRecord {
        name: unit.name().to_string(),
        outcome: UnitOutcome::Failed,
        duration: started.elapsed(),
        error: Some(cause.clone()),
    });
    summary.outcome = RunOutcome::Failed;
    summary.failure = Some(UnitFailure {
        unit: unit.name().to_string(),
        cause,
    });
}

/// Validate the journal against the discovered units and work out what is pending.
///
/// Checksums are checked first, for every applied unit, so that tampered history blocks the run
/// before anything else is considered.
fn diff(
    units: Vec<ChangeUnit>,
    applied: &[JournalEntry],
    config: &EngineConfig,
) -> Result<Plan, Error> {
    let by_name: HashMap<&str, &ChangeUnit> = units.iter().map(|u| (u.name(), u)).collect();

    for entry in applied {
        if let Some(unit) = by_name.get(entry.name.as_str()) {
            if unit.checksum() != entry.checksum {
                return Err(Error::ChecksumMismatch {
                    name: entry.name.clone(),
                    recorded: entry.checksum.clone(),
                    current: unit.checksum().to_string(),
                });
            }
        }
    }

    let unknown_entries: Vec<String> = applied
        .iter()
        .filter(|e| !by_name.contains_key(e.name.as_str()))
        .map(|e| e.name.clone())
        .collect();
    if let Some(name) = unknown_entries.first() {
        match config.drift_policy {
            DriftPolicy::Fail => {
                return Err(Error::UnknownJournalEntry { name: name.clone() });
            }
            DriftPolicy::Warn => {
                #[cfg(feature = "tracing")]
                tracing::warn!(entries = ?unknown_entries, "Journal has entries with no matching unit");
            }
        }
    }

    let applied_names: HashMap<&str, &JournalEntry> =
        applied.iter().map(|e| (e.name.as_str(), e)).collect();

    if config.strict_ordering {
        let latest = units
            .iter()
            .filter(|u| applied_names.contains_key(u.name()))
            .max_by(|a, b| a.ordering_key().cmp(b.ordering_key()));
        if let Some(latest) = latest {
            let early = units.iter().find(|u| {
                !applied_names.contains_key(u.name()) && u.ordering_key() < latest.ordering_key()
            });
            if let Some(early) = early {
                return Err(Error::OutOfOrder {
                    name: early.name().to_string(),
                    latest: latest.name().to_string(),
                });
            }
        }
    }

    let up_to_date = units
        .iter()
        .filter(|u| applied_names.contains_key(u.name()))
        .count();
    let pending: Vec<ChangeUnit> = units
        .iter()
        .filter(|u| !applied_names.contains_key(u.name()))
        .cloned()
        .collect();

    Ok(Plan {
        pending,
        up_to_date,
        unknown_entries,
    })
}
