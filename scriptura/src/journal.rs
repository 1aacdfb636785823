use crate::error::{ApplyCause, Error};
use crate::unit::JournalEntry;
use std::time::Duration;

/// Default name of the table that records applied change units.
pub const DEFAULT_JOURNAL_TABLE_NAME: &str = "_scriptura_journal_";

/// Durable record of which change units have been applied.
///
/// The journal lives in the same transactional resource as the migrations themselves: every write
/// happens inside an [AtomicScope] obtained from [JournalStore::begin], so a unit's effects and its
/// journal entry become visible together or not at all.
pub trait JournalStore {
    /// The atomic scope type handed out by [JournalStore::begin].
    type Scope<'s>: AtomicScope
    where
        Self: 's;

    /// Create the journal if it does not exist yet. Returns `true` if this call created it.
    /// Must be safe to call concurrently from several processes.
    fn initialize(&mut self) -> Result<bool, Error>;

    /// All applied entries as of now, ordered by application time.
    /// Returns an empty list if the journal has not been created.
    fn list_applied(&mut self) -> Result<Vec<JournalEntry>, Error>;

    /// Open an atomic scope covering script effects and journal writes.
    fn begin(&mut self) -> Result<Self::Scope<'_>, Error>;
}

/// Outcome of [AtomicScope::record_applied].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// The entry was written in this scope.
    Inserted,
    /// An entry with the same name already exists, typically written by a concurrent run.
    AlreadyPresent,
}

/// A transactional boundary: everything done through it is committed together or not at all.
///
/// Dropping a scope without calling [AtomicScope::commit] must roll it back.
pub trait AtomicScope {
    /// Whether the journal already holds an entry for `name`, as seen from inside this scope.
    fn is_recorded(&mut self, name: &str) -> Result<bool, Error>;

    /// Run a script body. When `timeout` is set, a body running longer than it is interrupted and
    /// reported as [ApplyCause::Timeout].
    fn execute(&mut self, body: &str, timeout: Option<Duration>) -> Result<(), ApplyCause>;

    /// Write a journal entry.
    fn record_applied(&mut self, entry: &JournalEntry) -> Result<Recorded, Error>;

    /// Delete the journal entry for `name`. Returns whether an entry existed.
    fn remove(&mut self, name: &str) -> Result<bool, Error>;

    fn commit(self) -> Result<(), Error>;

    fn rollback(self) -> Result<(), Error>;
}
