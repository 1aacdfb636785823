//! SQLite journal and atomic scope, built on [`rusqlite`](https://crates.io/crates/rusqlite).
//!
//! The journal is one table (default [`_scriptura_journal_`](crate::DEFAULT_JOURNAL_TABLE_NAME)):
//!
//! ```sql
//! CREATE TABLE "_scriptura_journal_" (
//!     name TEXT PRIMARY KEY NOT NULL,
//!     checksum TEXT NOT NULL,
//!     applied_at TEXT NOT NULL -- RFC 3339, UTC
//! )
//! ```
//!
//! Each scope is a `BEGIN IMMEDIATE` transaction, so the write lock is taken before a unit's
//! script runs. Together with the connection's busy timeout, this makes concurrent processes
//! queue up behind each other instead of failing, and a process that loses the race finds the
//! unit already journaled when its own scope opens. SQLite DDL is transactional, so a rolled back
//! scope leaves neither the unit's schema changes nor its journal entry behind.
//!
//! A script may not end its scope itself: `BEGIN`, `COMMIT`, `END` and `ROLLBACK` are refused
//! by an authorizer while the script runs.

use crate::error::{ApplyCause, Error, Phase};
use crate::journal::{AtomicScope, JournalStore, Recorded, DEFAULT_JOURNAL_TABLE_NAME};
use crate::unit::JournalEntry;
use chrono::{SecondsFormat, Utc};
use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::{params, Connection, ErrorCode, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

/// How often the watchdog repeats its interrupt until the script returns.
const INTERRUPT_INTERVAL: Duration = Duration::from_millis(10);

/// A [JournalStore] backed by a SQLite database.
///
/// # Example
///
/// ```
/// use rusqlite::Connection;
/// use scriptura::{JournalStore, SqliteJournal};
///
/// let mut journal = SqliteJournal::new(Connection::open_in_memory().unwrap());
/// assert_eq!(journal.initialize().unwrap(), true);
/// assert_eq!(journal.initialize().unwrap(), false);
/// assert!(journal.list_applied().unwrap().is_empty());
/// ```
#[derive(Debug)]
pub struct SqliteJournal {
    conn: Connection,
    table_name: String,
    busy_timeout: Duration,
}

impl SqliteJournal {
    /// Wrap an open connection. The journal table is only created by [JournalStore::initialize].
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            table_name: DEFAULT_JOURNAL_TABLE_NAME.to_string(),
            busy_timeout: Duration::from_secs(30),
        }
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open(path).map_err(|e| Error::journal(Phase::Open, e))?;
        Ok(Self::new(conn))
    }

    /// Set a custom name for the journal table.
    /// Defaults to "_scriptura_journal_".
    pub fn with_table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = name.into();
        self
    }

    /// Set how long operations wait for a lock held by another connection.
    /// Defaults to 30 seconds.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// The underlying connection, e.g. to inspect what applied units did.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn into_inner(self) -> Connection {
        self.conn
    }

    fn apply_busy_timeout(&self, phase: Phase) -> Result<(), Error> {
        self.conn
            .busy_timeout(self.busy_timeout)
            .map_err(|e| Error::journal(phase, e))
    }

    fn table_exists(&self) -> rusqlite::Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [&self.table_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

impl JournalStore for SqliteJournal {
    type Scope<'s> = SqliteScope<'s>;

    fn initialize(&mut self) -> Result<bool, Error> {
        self.apply_busy_timeout(Phase::Initialize)?;

        let existed = self
            .table_exists()
            .map_err(|e| Error::journal(Phase::Initialize, e))?;
        if existed {
            return Ok(false);
        }

        // IF NOT EXISTS covers a concurrent process creating it between the check and here
        self.conn
            .execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (name TEXT PRIMARY KEY NOT NULL, checksum TEXT NOT NULL, applied_at TEXT NOT NULL)",
                    quote_identifier(&self.table_name)
                ),
                [],
            )
            .map_err(|e| Error::journal(Phase::Initialize, e))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(table = %self.table_name, "Created journal table");

        Ok(true)
    }

    fn list_applied(&mut self) -> Result<Vec<JournalEntry>, Error> {
        self.apply_busy_timeout(Phase::List)?;
        let exists = self.table_exists().map_err(|e| Error::journal(Phase::List, e))?;
        if !exists {
            return Ok(vec![]);
        }

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT name, checksum, applied_at FROM {} ORDER BY applied_at, name",
                quote_identifier(&self.table_name)
            ))
            .map_err(|e| Error::journal(Phase::List, e))?;

        let entries = stmt
            .query_map([], |row| {
                let applied_at_str: String = row.get(2)?;
                let applied_at = chrono::DateTime::parse_from_rfc3339(&applied_at_str)
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?
                    .with_timezone(&Utc);

                Ok(JournalEntry {
                    name: row.get(0)?,
                    checksum: row.get(1)?,
                    applied_at,
                })
            })
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|e| Error::journal(Phase::List, e))?;

        Ok(entries)
    }

    fn begin(&mut self) -> Result<SqliteScope<'_>, Error> {
        self.apply_busy_timeout(Phase::Begin)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::journal(Phase::Begin, e))?;
        Ok(SqliteScope {
            tx,
            table: quote_identifier(&self.table_name),
        })
    }
}

/// One `BEGIN IMMEDIATE` transaction on a [SqliteJournal]'s connection.
/// Rolls back when dropped without a commit.
#[derive(Debug)]
pub struct SqliteScope<'conn> {
    tx: Transaction<'conn>,
    table: String,
}

impl AtomicScope for SqliteScope<'_> {
    fn is_recorded(&mut self, name: &str) -> Result<bool, Error> {
        let count: i64 = self
            .tx
            .query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE name = ?1", self.table),
                [name],
                |row| row.get(0),
            )
            .map_err(|e| Error::journal(Phase::Check, e))?;
        Ok(count > 0)
    }

    fn execute(&mut self, body: &str, timeout: Option<Duration>) -> Result<(), ApplyCause> {
        self.tx.authorizer(Some(refuse_transaction_control));
        let result = self.run_batch(body, timeout);
        self.tx.authorizer(None::<fn(AuthContext<'_>) -> Authorization>);
        result?;

        if self.tx.is_autocommit() {
            return Err(ApplyCause::Script("script ended the transaction".to_string()));
        }
        Ok(())
    }

    fn record_applied(&mut self, entry: &JournalEntry) -> Result<Recorded, Error> {
        let result = self.tx.execute(
            &format!(
                "INSERT INTO {} (name, checksum, applied_at) VALUES (?1, ?2, ?3)",
                self.table
            ),
            params![
                entry.name,
                entry.checksum,
                entry.applied_at.to_rfc3339_opts(SecondsFormat::Micros, true)
            ],
        );
        match result {
            Ok(_) => Ok(Recorded::Inserted),
            Err(e) if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
                Ok(Recorded::AlreadyPresent)
            }
            Err(e) => Err(Error::journal(Phase::Record, e)),
        }
    }

    fn remove(&mut self, name: &str) -> Result<bool, Error> {
        let deleted = self
            .tx
            .execute(
                &format!("DELETE FROM {} WHERE name = ?1", self.table),
                [name],
            )
            .map_err(|e| Error::journal(Phase::Remove, e))?;
        Ok(deleted > 0)
    }

    fn commit(self) -> Result<(), Error> {
        self.tx
            .commit()
            .map_err(|e| Error::journal(Phase::Commit, e))
    }

    fn rollback(self) -> Result<(), Error> {
        // SQLite already rolled back, e.g. after an interrupted write or INSERT OR ROLLBACK
        if self.tx.is_autocommit() {
            return Ok(());
        }
        self.tx
            .rollback()
            .map_err(|e| Error::journal(Phase::Rollback, e))
    }
}

impl SqliteScope<'_> {
    fn run_batch(&self, body: &str, timeout: Option<Duration>) -> Result<(), ApplyCause> {
        let Some(limit) = timeout else {
            return self
                .tx
                .execute_batch(body)
                .map_err(|e| ApplyCause::Script(e.to_string()));
        };

        // Once the limit passes, the watchdog keeps interrupting until the batch returns.
        // SQLite clears a pending interrupt when the next statement of the batch starts.
        let handle = self.tx.get_interrupt_handle();
        let fired = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let watchdog = {
            let fired = Arc::clone(&fired);
            thread::spawn(move || {
                let mut wait = limit;
                while let Err(mpsc::RecvTimeoutError::Timeout) = done_rx.recv_timeout(wait) {
                    fired.store(true, Ordering::SeqCst);
                    handle.interrupt();
                    wait = INTERRUPT_INTERVAL;
                }
            })
        };

        let result = self.tx.execute_batch(body);
        let _ = done_tx.send(());
        let _ = watchdog.join();

        match result {
            Ok(()) => Ok(()),
            Err(e)
                if fired.load(Ordering::SeqCst)
                    && e.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) =>
            {
                Err(ApplyCause::Timeout(limit))
            }
            Err(e) => Err(ApplyCause::Script(e.to_string())),
        }
    }
}

fn refuse_transaction_control(ctx: AuthContext<'_>) -> Authorization {
    match ctx.action {
        AuthAction::Transaction { .. } => Authorization::Deny,
        _ => Authorization::Allow,
    }
}

/// Quote a table name for interpolation into SQL.
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{row_count, table_exists};
    use crate::unit::ChangeUnit;
    use std::time::Instant;

    fn journal() -> SqliteJournal {
        SqliteJournal::new(Connection::open_in_memory().unwrap())
    }

    fn entry(name: &str, body: &str) -> JournalEntry {
        ChangeUnit::new(name, body).unwrap().journal_entry(Utc::now())
    }

    #[test]
    fn initialize_is_idempotent() {
        let mut journal = journal();
        assert!(journal.initialize().unwrap());
        assert!(!journal.initialize().unwrap());
        assert!(table_exists(journal.connection(), DEFAULT_JOURNAL_TABLE_NAME).unwrap());
    }

    #[test]
    fn list_applied_without_table_is_empty_and_does_not_create_it() {
        let mut journal = journal();
        assert_eq!(journal.list_applied().unwrap(), vec![]);
        assert!(!table_exists(journal.connection(), DEFAULT_JOURNAL_TABLE_NAME).unwrap());
    }

    #[test]
    fn committed_entries_are_listed_in_application_order() {
        let mut journal = journal();
        journal.initialize().unwrap();

        let first = entry("002_second_by_name", "SELECT 2");
        let mut second = entry("001_first_by_name", "SELECT 1");
        second.applied_at = first.applied_at + chrono::Duration::seconds(5);

        let mut scope = journal.begin().unwrap();
        assert_eq!(scope.record_applied(&first).unwrap(), Recorded::Inserted);
        assert_eq!(scope.record_applied(&second).unwrap(), Recorded::Inserted);
        scope.commit().unwrap();

        let listed = journal.list_applied().unwrap();
        let names: Vec<_> = listed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["002_second_by_name", "001_first_by_name"]);
        assert_eq!(listed[0].checksum, first.checksum);
        // stored with microsecond precision
        assert_eq!(
            listed[0].applied_at.timestamp_micros(),
            first.applied_at.timestamp_micros()
        );
    }

    #[test]
    fn duplicate_record_is_already_present() {
        let mut journal = journal();
        journal.initialize().unwrap();
        let e = entry("001_init", "SELECT 1");

        let mut scope = journal.begin().unwrap();
        assert_eq!(scope.record_applied(&e).unwrap(), Recorded::Inserted);
        assert!(scope.is_recorded("001_init").unwrap());
        assert_eq!(scope.record_applied(&e).unwrap(), Recorded::AlreadyPresent);
        scope.commit().unwrap();

        assert_eq!(journal.list_applied().unwrap().len(), 1);
    }

    #[test]
    fn rollback_discards_effects_and_entry() {
        let mut journal = journal();
        journal.initialize().unwrap();

        let mut scope = journal.begin().unwrap();
        scope
            .execute("CREATE TABLE users (id INTEGER PRIMARY KEY)", None)
            .unwrap();
        scope.record_applied(&entry("001_users", "x")).unwrap();
        scope.rollback().unwrap();

        assert!(!table_exists(journal.connection(), "users").unwrap());
        assert!(journal.list_applied().unwrap().is_empty());
    }

    #[test]
    fn dropped_scope_rolls_back() {
        let mut journal = journal();
        journal.initialize().unwrap();
        {
            let mut scope = journal.begin().unwrap();
            scope
                .execute("CREATE TABLE users (id INTEGER PRIMARY KEY)", None)
                .unwrap();
        }
        assert!(!table_exists(journal.connection(), "users").unwrap());
    }

    #[test]
    fn execute_runs_multiple_statements() {
        let mut journal = journal();
        journal.initialize().unwrap();

        let mut scope = journal.begin().unwrap();
        scope
            .execute(
                "CREATE TABLE users (id INTEGER PRIMARY KEY);\nINSERT INTO users (id) VALUES (1);\nINSERT INTO users (id) VALUES (2);",
                None,
            )
            .unwrap();
        scope.commit().unwrap();

        assert_eq!(row_count(journal.connection(), "users").unwrap(), 2);
    }

    #[test]
    fn script_error_is_reported() {
        let mut journal = journal();
        journal.initialize().unwrap();
        let mut scope = journal.begin().unwrap();
        let cause = scope.execute("bleep blorp", None).unwrap_err();
        match cause {
            ApplyCause::Script(message) => assert!(message.contains("near \"bleep\": syntax error")),
            other => panic!("expected script error, got {:?}", other),
        }
    }

    #[test]
    fn long_script_is_interrupted_at_timeout() {
        let mut journal = journal();
        journal.initialize().unwrap();
        let limit = Duration::from_millis(100);

        let mut scope = journal.begin().unwrap();
        let started = Instant::now();
        let cause = scope
            .execute(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT COUNT(*) FROM c;",
                Some(limit),
            )
            .unwrap_err();
        assert_eq!(cause, ApplyCause::Timeout(limit));
        assert!(started.elapsed() < Duration::from_secs(10));
        scope.rollback().unwrap();
    }

    #[test]
    fn fast_script_is_unaffected_by_timeout() {
        let mut journal = journal();
        journal.initialize().unwrap();
        let mut scope = journal.begin().unwrap();
        scope
            .execute(
                "CREATE TABLE quick (id INTEGER)",
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        // the connection is still usable after the watchdog exits
        assert!(!scope.is_recorded("001_quick").unwrap());
        scope.commit().unwrap();
        assert!(table_exists(journal.connection(), "quick").unwrap());
    }

    #[test]
    fn interrupted_write_rolls_back_cleanly() {
        let mut journal = journal();
        journal.initialize().unwrap();
        let limit = Duration::from_millis(100);

        let mut scope = journal.begin().unwrap();
        let cause = scope
            .execute(
                "CREATE TABLE big (x INTEGER);\nINSERT INTO big WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT x FROM c;",
                Some(limit),
            )
            .unwrap_err();
        assert_eq!(cause, ApplyCause::Timeout(limit));
        // SQLite has already ended the transaction
        scope.rollback().unwrap();

        assert!(!table_exists(journal.connection(), "big").unwrap());
        let mut scope = journal.begin().unwrap();
        scope.execute("CREATE TABLE after (id INTEGER)", None).unwrap();
        scope.commit().unwrap();
        assert!(table_exists(journal.connection(), "after").unwrap());
    }

    #[test]
    fn timeout_holds_across_many_short_statements() {
        let mut journal = journal();
        journal.initialize().unwrap();
        let limit = Duration::from_millis(100);
        let mut body = String::from(
            "CREATE TABLE sink (x INTEGER);\nINSERT INTO sink WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c LIMIT 5000) SELECT x FROM c;\n",
        );
        body.push_str(&"UPDATE sink SET x = x + 1;\n".repeat(50_000));

        let mut scope = journal.begin().unwrap();
        let started = Instant::now();
        let cause = scope.execute(&body, Some(limit)).unwrap_err();
        assert_eq!(cause, ApplyCause::Timeout(limit));
        assert!(started.elapsed() < Duration::from_secs(10));
        scope.rollback().unwrap();
        assert!(!table_exists(journal.connection(), "sink").unwrap());
    }

    #[test]
    fn rollback_after_insert_or_rollback_succeeds() {
        let mut journal = journal();
        journal.initialize().unwrap();

        let mut scope = journal.begin().unwrap();
        let cause = scope
            .execute(
                "CREATE TABLE t (id INTEGER PRIMARY KEY);\nINSERT INTO t VALUES (1);\nINSERT OR ROLLBACK INTO t VALUES (1);",
                None,
            )
            .unwrap_err();
        match cause {
            ApplyCause::Script(message) => assert!(message.contains("UNIQUE constraint failed")),
            other => panic!("expected script error, got {:?}", other),
        }
        scope.rollback().unwrap();
        assert!(!table_exists(journal.connection(), "t").unwrap());
    }

    #[test]
    fn script_cannot_end_the_scope() {
        let mut journal = journal();
        journal.initialize().unwrap();

        for statement in ["COMMIT;", "END;", "ROLLBACK;", "BEGIN;"] {
            let mut scope = journal.begin().unwrap();
            let body = format!("CREATE TABLE leak (id INTEGER);\n{}\nbleep blorp;", statement);
            match scope.execute(&body, None).unwrap_err() {
                ApplyCause::Script(message) => {
                    assert!(message.contains("not authorized"), "{}: {}", statement, message)
                }
                other => panic!("expected script error, got {:?}", other),
            }
            scope.rollback().unwrap();
            assert!(!table_exists(journal.connection(), "leak").unwrap());
        }

        // the scope's own commit is still allowed afterwards
        let mut scope = journal.begin().unwrap();
        scope.execute("CREATE TABLE kept (id INTEGER)", None).unwrap();
        scope.record_applied(&entry("001_kept", "x")).unwrap();
        scope.commit().unwrap();
        assert!(table_exists(journal.connection(), "kept").unwrap());
        assert_eq!(journal.list_applied().unwrap().len(), 1);
    }

    #[test]
    fn busy_timeout_applies_to_begin() {
        let db = tempfile::NamedTempFile::new().unwrap();
        let mut journal = SqliteJournal::open(db.path())
            .unwrap()
            .with_busy_timeout(Duration::from_millis(50));
        let holder = Connection::open(db.path()).unwrap();
        holder.execute_batch("BEGIN IMMEDIATE;").unwrap();

        let started = Instant::now();
        let err = journal.begin().unwrap_err();
        assert!(
            matches!(err, Error::JournalUnavailable { phase: Phase::Begin, .. }),
            "{:?}",
            err
        );
        assert!(started.elapsed() < Duration::from_secs(2));
        holder.execute_batch("ROLLBACK;").unwrap();
    }

    #[test]
    fn remove_deletes_entry() {
        let mut journal = journal();
        journal.initialize().unwrap();
        let mut scope = journal.begin().unwrap();
        scope.record_applied(&entry("001_init", "x")).unwrap();
        assert!(scope.remove("001_init").unwrap());
        assert!(!scope.remove("001_init").unwrap());
        scope.commit().unwrap();
        assert!(journal.list_applied().unwrap().is_empty());
    }

    #[test]
    fn custom_table_name_is_quoted() {
        let mut journal = journal().with_table_name("my journal");
        assert!(journal.initialize().unwrap());
        assert!(table_exists(journal.connection(), "my journal").unwrap());
        let mut scope = journal.begin().unwrap();
        scope.record_applied(&entry("001_init", "x")).unwrap();
        scope.commit().unwrap();
        assert_eq!(journal.list_applied().unwrap().len(), 1);
    }
}
