//! Resolves CLI settings from flags, environment variables and `scriptura.toml`.
//!
//! Clap handles flags and environment variables (flags win). Anything neither of them set falls
//! back to the settings file, then to built-in defaults.

use clap::ValueEnum;
use scriptura::{ApplyMode, DriftPolicy, EngineConfig, DEFAULT_JOURNAL_TABLE_NAME};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SETTINGS_FILE: &str = "scriptura.toml";
pub const DEFAULT_SCRIPTS_DIR: &str = "migrations";
const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DriftSetting {
    Fail,
    Warn,
}

impl From<DriftSetting> for DriftPolicy {
    fn from(value: DriftSetting) -> Self {
        match value {
            DriftSetting::Fail => DriftPolicy::Fail,
            DriftSetting::Warn => DriftPolicy::Warn,
        }
    }
}

/// Contents of the settings file. Every key is optional.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileSettings {
    pub database: Option<String>,
    pub scripts: Option<PathBuf>,
    pub table: Option<String>,
    pub busy_timeout_secs: Option<u64>,
    pub unit_timeout_secs: Option<u64>,
    pub single_scope: Option<bool>,
    pub strict_ordering: Option<bool>,
    pub drift: Option<DriftSetting>,
}

impl FileSettings {
    /// Read the settings file.
    ///
    /// A missing file is only an error if it was asked for explicitly; the default
    /// `scriptura.toml` is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let (path, explicit) = match path {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_SETTINGS_FILE), false),
        };
        if !explicit && !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Could not read settings file {}: {}", path.display(), e))?;
        Self::parse(&contents)
            .map_err(|e| format!("Invalid settings file {}: {}", path.display(), e))
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

/// Values that came from flags or the environment.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub database: Option<String>,
    pub scripts: Option<PathBuf>,
    pub table: Option<String>,
    pub busy_timeout_secs: Option<u64>,
    pub unit_timeout_secs: Option<u64>,
    pub single_scope: bool,
    pub strict_ordering: bool,
    pub drift: Option<DriftSetting>,
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database: Option<String>,
    pub scripts: PathBuf,
    pub table: String,
    pub busy_timeout: Duration,
    pub engine: EngineConfig,
}

impl Settings {
    pub fn resolve(overrides: Overrides, file: FileSettings) -> Self {
        let single_scope = overrides.single_scope || file.single_scope.unwrap_or(false);
        let drift = overrides.drift.or(file.drift).unwrap_or(DriftSetting::Fail);

        Self {
            database: overrides.database.or(file.database),
            scripts: overrides
                .scripts
                .or(file.scripts)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCRIPTS_DIR)),
            table: overrides
                .table
                .or(file.table)
                .unwrap_or_else(|| DEFAULT_JOURNAL_TABLE_NAME.to_string()),
            busy_timeout: Duration::from_secs(
                overrides
                    .busy_timeout_secs
                    .or(file.busy_timeout_secs)
                    .unwrap_or(DEFAULT_BUSY_TIMEOUT_SECS),
            ),
            engine: EngineConfig {
                mode: if single_scope {
                    ApplyMode::SingleScope
                } else {
                    ApplyMode::PerUnit
                },
                unit_timeout: overrides
                    .unit_timeout_secs
                    .or(file.unit_timeout_secs)
                    .map(Duration::from_secs),
                drift_policy: drift.into(),
                strict_ordering: overrides.strict_ordering
                    || file.strict_ordering.unwrap_or(false),
            },
        }
    }

    /// The SQLite database path, with any `sqlite://` prefix removed.
    pub fn database_path(&self) -> Result<PathBuf, String> {
        let database = self.database.as_deref().ok_or(
            "No database configured. Pass --database, set SCRIPTURA_DATABASE, or add `database` to scriptura.toml",
        )?;
        let path = database.strip_prefix("sqlite://").unwrap_or(database);
        if path.is_empty() {
            return Err(format!("Invalid database '{}'", database));
        }
        Ok(PathBuf::from(path))
    }
}
