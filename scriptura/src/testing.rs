//! Testing utilities for change unit development.
//!
//! [ScriptFixture] gives tests a throwaway scripts directory, and the free functions inspect a
//! SQLite database after a run.
//!
//! # Example
//!
//! ```
//! use rusqlite::Connection;
//! use scriptura::testing::{table_exists, ScriptFixture};
//! use scriptura::{MigrationEngine, SqliteJournal};
//!
//! let fixture = ScriptFixture::new().unwrap();
//! fixture.write("001_users.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY)").unwrap();
//!
//! let journal = SqliteJournal::new(Connection::open_in_memory().unwrap());
//! let mut engine = MigrationEngine::new(fixture.source(), journal);
//! engine.run().unwrap();
//!
//! assert!(table_exists(engine.journal().connection(), "users").unwrap());
//! ```

use crate::source::DirectorySource;
#[cfg(feature = "sqlite")]
use rusqlite::Connection;
use std::fs;
use std::io;
use std::path::Path;
use tempfile::TempDir;

/// A temporary scripts directory, deleted when dropped.
#[derive(Debug)]
pub struct ScriptFixture {
    dir: TempDir,
}

impl ScriptFixture {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Create or overwrite a script file.
    pub fn write(&self, file_name: &str, contents: &str) -> io::Result<()> {
        fs::write(self.dir.path().join(file_name), contents)
    }

    pub fn remove(&self, file_name: &str) -> io::Result<()> {
        fs::remove_file(self.dir.path().join(file_name))
    }

    /// A [DirectorySource] reading this fixture's directory.
    pub fn source(&self) -> DirectorySource {
        DirectorySource::new(self.dir.path())
    }
}

/// Whether a table with this exact name exists.
#[cfg(feature = "sqlite")]
pub fn table_exists(conn: &Connection, table_name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [table_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Number of rows in a table.
#[cfg(feature = "sqlite")]
pub fn row_count(conn: &Connection, table_name: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM \"{}\"", table_name.replace('"', "\"\"")),
        [],
        |row| row.get(0),
    )
}
