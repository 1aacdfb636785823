#![cfg_attr(docsrs, feature(doc_cfg))]
//! `scriptura` applies an ordered set of SQL change scripts to a database exactly once each,
//! recording every applied script in a journal table that lives in the same database.
//!
//! Core concepts:
//! - A [ChangeUnit] is one named script, plus an optional rollback script. Its name starts with a
//!   sortable prefix (`001_create_users`, `A2_add_index`) that fixes the order units are applied in.
//! - A [ScriptSource] finds units, either in a directory ([DirectorySource]) or compiled into the
//!   binary ([EmbeddedSource], [embed_scripts!]).
//! - A [JournalStore] records which units were applied, and when, and with what checksum.
//! - The [MigrationEngine] diffs the two and applies whatever is pending.
//!
//! # Guarantees
//!
//! - **Exactly once.** Each unit's effects and its journal entry are committed in one transaction,
//!   so a crash can never leave a unit applied but unrecorded, or recorded but not applied.
//! - **Safe under concurrency.** Several processes may start against the same database at once.
//!   Each unit is claimed under the database write lock, and a run that loses the race reports the
//!   unit as [UnitOutcome::Skipped] instead of executing it a second time.
//! - **Tamper evident.** The journal stores a SHA-256 checksum of every applied script. Editing a
//!   script after it was applied fails the next run with [Error::ChecksumMismatch] before anything
//!   else happens.
//! - **Resumable.** A failing unit is rolled back on its own. Units before it stay applied, and the
//!   next run picks up where the failed one stopped. Use [ApplyMode::SingleScope] to roll back
//!   the whole run instead.
//!
//! # Example
//!
//! ```
//! use rusqlite::Connection;
//! use scriptura::{EmbeddedSource, MigrationEngine, SqliteJournal, UnitOutcome};
//!
//! let source = EmbeddedSource::from_files(vec![
//!     ("001_create_users.up.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)"),
//!     ("001_create_users.down.sql", "DROP TABLE users"),
//!     ("002_seed.sql", "INSERT INTO users (name) VALUES ('admin')"),
//! ]);
//! let journal = SqliteJournal::new(Connection::open_in_memory().unwrap());
//! let mut engine = MigrationEngine::new(source, journal);
//!
//! let summary = engine.run().unwrap();
//! assert_eq!(
//!     summary.names_with(UnitOutcome::Applied),
//!     vec!["001_create_users", "002_seed"]
//! );
//!
//! let history = engine.history().unwrap();
//! assert_eq!(history.len(), 2);
//! ```
//!
//! # Observability
//!
//! Callbacks can be registered on the engine with [MigrationEngine::on_unit_start],
//! [MigrationEngine::on_unit_complete], [MigrationEngine::on_unit_skipped] and
//! [MigrationEngine::on_unit_error].
//!
//! With the `tracing` feature the engine also emits spans (`scriptura_run`, `unit_apply`,
//! `unit_reverse`) and events through the [tracing](https://docs.rs/tracing) crate:
//!
//! ```rust
//! # #[cfg(not(feature = "tracing"))]
//! # fn main() {}
//! # #[cfg(feature = "tracing")]
//! # fn main() {
//! use rusqlite::Connection;
//! use scriptura::{EmbeddedSource, MigrationEngine, SqliteJournal};
//! use std::sync::{Arc, Mutex};
//!
//! let events = Arc::new(Mutex::new(Vec::<u8>::new()));
//! let events_clone = Arc::clone(&events);
//!
//! let subscriber = tracing_subscriber::fmt()
//!     .with_max_level(tracing::Level::INFO)
//!     .without_time()
//!     .with_target(false)
//!     .with_ansi(false)
//!     .with_writer(move || {
//!         struct W(Arc<Mutex<Vec<u8>>>);
//!         impl std::io::Write for W {
//!             fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
//!                 self.0.lock().unwrap().extend_from_slice(buf);
//!                 Ok(buf.len())
//!             }
//!             fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
//!         }
//!         W(events_clone.clone())
//!     })
//!     .finish();
//!
//! tracing::subscriber::with_default(subscriber, || {
//!     let source = EmbeddedSource::from_files(vec![
//!         ("001_create_users.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY)"),
//!     ]);
//!     let journal = SqliteJournal::new(Connection::open_in_memory().unwrap());
//!     MigrationEngine::new(source, journal).run().unwrap();
//! });
//!
//! let output = String::from_utf8(events.lock().unwrap().clone()).unwrap();
//! assert!(output.contains("Unit applied"));
//! assert!(output.contains("001_create_users"));
//! # }
//! ```
//!
//! # Features
//!
//! - `sqlite` (default): the [SqliteJournal] journal backed by [rusqlite](https://docs.rs/rusqlite).
//! - `tracing`: spans and events for every run.
//! - `testing`: [testing] helpers for writing tests against change units.

mod error;
pub use error::{ApplyCause, Error, Phase};

mod unit;
pub use unit::{checksum, ChangeUnit, JournalEntry, OrderingKey};

mod source;
pub use source::{DirectorySource, EmbeddedSource, ScriptSource};

mod journal;
pub use journal::{AtomicScope, JournalStore, Recorded, DEFAULT_JOURNAL_TABLE_NAME};

mod report;
pub use report::{ExecutionSummary, RunOutcome, UnitFailure, UnitOutcome, UnitRecord};

mod engine;
pub use engine::{ApplyMode, CancelToken, DriftPolicy, EngineConfig, MigrationEngine, RunState};

#[macro_use]
mod macros;

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteJournal, SqliteScope};

#[cfg(any(test, feature = "testing"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;
