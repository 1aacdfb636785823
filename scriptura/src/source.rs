//! Discovery of change units from a directory or from scripts embedded in the binary.
//!
//! Both sources follow the same file conventions:
//! - only `*.sql` files are scripts; hidden files, other extensions and subdirectories are ignored
//! - `<name>.sql` or `<name>.up.sql` holds the forward script
//! - `<name>.down.sql` holds the optional rollback script
//!
//! The name's prefix before the first `_` is its ordering key (see [OrderingKey](crate::OrderingKey)),
//! e.g. `20240101120000_create_users.up.sql` or `A001_init.sql`.

use crate::error::Error;
use crate::unit::{sort_and_check_unique, ChangeUnit};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const SCRIPT_EXTENSION: &str = ".sql";
const UP_MARKER: &str = ".up";
const DOWN_MARKER: &str = ".down";

/// Enumerates the change units available to a [MigrationEngine](crate::MigrationEngine).
///
/// `discover` must be deterministic: repeated calls against the same backing store return the same
/// units in the same order, sorted by ordering key. Two units sharing an ordering key must fail
/// with [Error::DuplicateChangeUnit].
pub trait ScriptSource {
    /// Enumerate all change units, sorted by ordering key.
    fn discover(&self) -> Result<Vec<ChangeUnit>, Error>;

    /// A short description of where units come from, for diagnostics.
    fn location(&self) -> String;
}

/// Reads change units from the `*.sql` files of one directory (not recursive).
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ScriptSource for DirectorySource {
    fn discover(&self) -> Result<Vec<ChangeUnit>, Error> {
        let location = self.location();
        let entries = fs::read_dir(&self.root).map_err(|e| Error::discovery(&location, e))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::discovery(&location, e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| Error::discovery(&location, e))?;
            if file_type.is_dir() {
                continue;
            }
            let file_name = match entry.file_name().into_string() {
                Ok(name) => name,
                // Non-UTF-8 names cannot be .sql scripts we could journal by name.
                Err(_) => continue,
            };
            if !is_script(&file_name) {
                continue;
            }
            let contents = fs::read_to_string(entry.path()).map_err(|e| {
                Error::discovery(&location, format!("failed to read '{}': {}", file_name, e))
            })?;
            files.push((file_name, contents));
        }

        assemble(&location, files)
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

/// Change units held in memory, typically compiled into the binary with [embed_scripts!](crate::embed_scripts).
///
/// # Example
///
/// ```
/// use scriptura::{EmbeddedSource, ScriptSource};
///
/// let source = EmbeddedSource::from_files(vec![
///     ("002_add_email.sql", "ALTER TABLE users ADD COLUMN email TEXT"),
///     ("001_create_users.up.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY)"),
///     ("001_create_users.down.sql", "DROP TABLE users"),
///     ("README.md", "ignored"),
/// ]);
///
/// let units = source.discover().unwrap();
/// assert_eq!(units.len(), 2);
/// assert_eq!(units[0].name(), "001_create_users");
/// assert_eq!(units[0].rollback_body(), Some("DROP TABLE users"));
/// assert_eq!(units[1].name(), "002_add_email");
/// ```
#[derive(Debug, Clone, Default)]
pub struct EmbeddedSource {
    files: Vec<(String, String)>,
}

impl EmbeddedSource {
    /// Create a source from `(file_name, contents)` pairs. The pairs may be in any order.
    pub fn from_files<N, C>(files: impl IntoIterator<Item = (N, C)>) -> Self
    where
        N: Into<String>,
        C: Into<String>,
    {
        Self {
            files: files
                .into_iter()
                .map(|(name, contents)| (name.into(), contents.into()))
                .collect(),
        }
    }

    /// Add one more file.
    pub fn with_file(mut self, file_name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.push((file_name.into(), contents.into()));
        self
    }
}

impl ScriptSource for EmbeddedSource {
    fn discover(&self) -> Result<Vec<ChangeUnit>, Error> {
        let files = self
            .files
            .iter()
            .filter(|(name, _)| is_script(name))
            .map(|(name, contents)| (name.clone(), contents.clone()));
        assemble(&self.location(), files)
    }

    fn location(&self) -> String {
        format!("embedded bundle ({} files)", self.files.len())
    }
}

fn is_script(file_name: &str) -> bool {
    !file_name.starts_with('.') && file_name.ends_with(SCRIPT_EXTENSION)
}

#[derive(Debug, PartialEq)]
enum Role {
    Forward,
    Rollback,
}

/// Split a script file name into the unit name and the role the file plays.
fn classify(file_name: &str) -> (&str, Role) {
    let stem = file_name
        .strip_suffix(SCRIPT_EXTENSION)
        .unwrap_or(file_name);
    if let Some(name) = stem.strip_suffix(DOWN_MARKER) {
        (name, Role::Rollback)
    } else if let Some(name) = stem.strip_suffix(UP_MARKER) {
        (name, Role::Forward)
    } else {
        (stem, Role::Forward)
    }
}

/// Pair forward and rollback scripts into sorted, uniquely keyed units.
fn assemble(
    location: &str,
    files: impl IntoIterator<Item = (String, String)>,
) -> Result<Vec<ChangeUnit>, Error> {
    // BTreeMap keeps pairing independent of the order files were listed in.
    let mut forward: BTreeMap<String, (String, String)> = BTreeMap::new();
    let mut rollback: BTreeMap<String, String> = BTreeMap::new();

    let mut files: Vec<(String, String)> = files.into_iter().collect();
    files.sort_by(|a, b| a.0.cmp(&b.0));

    for (file_name, contents) in files {
        let (name, role) = classify(&file_name);
        match role {
            Role::Forward => {
                if let Some((existing, _)) = forward.get(name) {
                    return Err(Error::DuplicateChangeUnit {
                        key: name.to_string(),
                        first: existing.clone(),
                        second: file_name.clone(),
                    });
                }
                forward.insert(name.to_string(), (file_name.clone(), contents));
            }
            Role::Rollback => {
                rollback.insert(name.to_string(), contents);
            }
        }
    }

    if let Some(orphan) = rollback.keys().find(|name| !forward.contains_key(*name)) {
        return Err(Error::discovery(
            location,
            format!("rollback script for '{}' has no forward script", orphan),
        ));
    }

    let mut units = Vec::with_capacity(forward.len());
    for (name, (_, body)) in forward {
        let mut unit = ChangeUnit::new(name.as_str(), body).map_err(|e| match e {
            Error::Discovery { reason, .. } => Error::discovery(location, reason),
            other => other,
        })?;
        if let Some(down) = rollback.remove(&name) {
            unit = unit.with_rollback(down);
        }
        units.push(unit);
    }

    sort_and_check_unique(&mut units)?;
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptFixture;

    fn names(units: &[ChangeUnit]) -> Vec<&str> {
        units.iter().map(|u| u.name()).collect()
    }

    #[test]
    fn directory_discovery_sorts_and_pairs() {
        let fixture = ScriptFixture::new().unwrap();
        fixture
            .write("10_ten.sql", "CREATE TABLE ten (id INTEGER)")
            .unwrap();
        fixture
            .write("2_two.up.sql", "CREATE TABLE two (id INTEGER)")
            .unwrap();
        fixture.write("2_two.down.sql", "DROP TABLE two").unwrap();
        fixture
            .write("1_one.sql", "CREATE TABLE one (id INTEGER)")
            .unwrap();

        let units = fixture.source().discover().unwrap();
        assert_eq!(names(&units), vec!["1_one", "2_two", "10_ten"]);
        assert_eq!(units[1].body(), "CREATE TABLE two (id INTEGER)");
        assert_eq!(units[1].rollback_body(), Some("DROP TABLE two"));
        assert_eq!(units[0].rollback_body(), None);
    }

    #[test]
    fn directory_discovery_is_stable() {
        let fixture = ScriptFixture::new().unwrap();
        fixture.write("A002.sql", "SELECT 2").unwrap();
        fixture.write("A001.sql", "SELECT 1").unwrap();
        fixture.write("A003.sql", "SELECT 3").unwrap();

        let source = fixture.source();
        let first = source.discover().unwrap();
        let second = source.discover().unwrap();
        assert_eq!(first, second);
        assert_eq!(names(&first), vec!["A001", "A002", "A003"]);
    }

    #[test]
    fn non_script_entries_are_ignored() {
        let fixture = ScriptFixture::new().unwrap();
        fixture.write("001_init.sql", "SELECT 1").unwrap();
        fixture.write("notes.txt", "not a script").unwrap();
        fixture.write(".002_hidden.sql", "SELECT 2").unwrap();
        fixture.write("003_draft.sql.bak", "SELECT 3").unwrap();
        std::fs::create_dir(fixture.path().join("004_nested.sql")).unwrap();

        let units = fixture.source().discover().unwrap();
        assert_eq!(names(&units), vec!["001_init"]);
    }

    #[test]
    fn shared_ordering_prefix_is_a_duplicate() {
        let fixture = ScriptFixture::new().unwrap();
        fixture.write("001_create_users.sql", "SELECT 1").unwrap();
        fixture.write("001_create_posts.sql", "SELECT 2").unwrap();

        let err = fixture.source().discover().unwrap_err();
        assert_eq!(
            err,
            Error::DuplicateChangeUnit {
                key: "001".to_string(),
                first: "001_create_posts".to_string(),
                second: "001_create_users".to_string(),
            }
        );
    }

    #[test]
    fn plain_and_up_script_for_same_name_is_a_duplicate() {
        let fixture = ScriptFixture::new().unwrap();
        fixture.write("001_init.sql", "SELECT 1").unwrap();
        fixture.write("001_init.up.sql", "SELECT 1").unwrap();

        let err = fixture.source().discover().unwrap_err();
        assert!(matches!(err, Error::DuplicateChangeUnit { .. }), "{:?}", err);
    }

    #[test]
    fn rollback_without_forward_fails_discovery() {
        let fixture = ScriptFixture::new().unwrap();
        fixture.write("001_init.sql", "SELECT 1").unwrap();
        fixture.write("002_gone.down.sql", "SELECT 2").unwrap();

        let err = fixture.source().discover().unwrap_err();
        match err {
            Error::Discovery { reason, .. } => assert!(reason.contains("002_gone"), "{}", reason),
            other => panic!("expected discovery error, got {:?}", other),
        }
    }

    #[test]
    fn missing_directory_fails_discovery() {
        let fixture = ScriptFixture::new().unwrap();
        let source = DirectorySource::new(fixture.path().join("does-not-exist"));
        assert!(matches!(
            source.discover().unwrap_err(),
            Error::Discovery { .. }
        ));
    }

    #[test]
    fn non_utf8_script_fails_discovery() {
        let fixture = ScriptFixture::new().unwrap();
        std::fs::write(fixture.path().join("001_binary.sql"), [0xff, 0xfe, 0x00]).unwrap();

        let err = fixture.source().discover().unwrap_err();
        match err {
            Error::Discovery { reason, .. } => assert!(reason.contains("001_binary.sql")),
            other => panic!("expected discovery error, got {:?}", other),
        }
    }

    #[test]
    fn unsortable_name_fails_discovery() {
        let source = EmbeddedSource::from_files(vec![("_no_prefix.sql", "SELECT 1")]);
        assert!(matches!(
            source.discover().unwrap_err(),
            Error::Discovery { .. }
        ));
    }

    #[test]
    fn embedded_order_does_not_matter() {
        let source = EmbeddedSource::default()
            .with_file("A003_c.sql", "SELECT 3")
            .with_file("A001_a.sql", "SELECT 1")
            .with_file("A002_b.sql", "SELECT 2");
        let units = source.discover().unwrap();
        assert_eq!(names(&units), vec!["A001_a", "A002_b", "A003_c"]);
    }

    #[test]
    fn classify_recognizes_markers() {
        assert_eq!(classify("001_a.sql"), ("001_a", Role::Forward));
        assert_eq!(classify("001_a.up.sql"), ("001_a", Role::Forward));
        assert_eq!(classify("001_a.down.sql"), ("001_a", Role::Rollback));
    }
}
