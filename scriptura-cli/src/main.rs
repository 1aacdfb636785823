//! Command line runner for scriptura change units.
//!
//! Applies the scripts in a directory to a SQLite database, and inspects or reverses what has
//! been applied.

mod settings;

use clap::{Parser, Subcommand};
use rusqlite::Connection;
use scriptura::{DirectorySource, MigrationEngine, ScriptSource, SqliteJournal};
use settings::{DriftSetting, FileSettings, Overrides, Settings};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scriptura", version, about = "Apply versioned SQL scripts exactly once")]
struct CliArgs {
    /// SQLite database path, optionally prefixed with sqlite://
    #[arg(long, short = 'd', env = "SCRIPTURA_DATABASE", global = true)]
    database: Option<String>,

    /// Directory holding the change scripts [default: migrations]
    #[arg(long, short = 's', env = "SCRIPTURA_SCRIPTS", global = true)]
    scripts: Option<PathBuf>,

    /// Settings file [default: scriptura.toml, if present]
    #[arg(long, short = 'c', env = "SCRIPTURA_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Name of the journal table
    #[arg(long, global = true)]
    table: Option<String>,

    /// Seconds to wait for another process holding the database lock
    #[arg(long, global = true)]
    busy_timeout_secs: Option<u64>,

    /// Interrupt any unit running longer than this many seconds
    #[arg(long, global = true)]
    unit_timeout_secs: Option<u64>,

    /// Apply all pending units in one transaction
    #[arg(long, global = true)]
    single_scope: bool,

    /// Refuse new units that sort before the latest applied unit
    #[arg(long, global = true)]
    strict_ordering: bool,

    /// What to do with journal entries that have no script
    #[arg(long, value_enum, global = true)]
    drift: Option<DriftSetting>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply all pending units
    Upgrade,
    /// Show applied and pending counts
    Status,
    /// List the units the next upgrade would apply, without applying them
    Preview,
    /// Show the journal, oldest first
    History,
    /// List all discovered units (no database required)
    List,
    /// Run one applied unit's rollback script and remove its journal entry
    Reverse {
        /// Name of the unit, e.g. 003_add_email
        name: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Returns whether the command succeeded.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    let file = FileSettings::load(args.config.as_deref())?;
    let settings = Settings::resolve(
        Overrides {
            database: args.database,
            scripts: args.scripts,
            table: args.table,
            busy_timeout_secs: args.busy_timeout_secs,
            unit_timeout_secs: args.unit_timeout_secs,
            single_scope: args.single_scope,
            strict_ordering: args.strict_ordering,
            drift: args.drift,
        },
        file,
    );
    tracing::debug!(?settings, "Resolved settings");
    let source = DirectorySource::new(&settings.scripts);

    match args.command {
        Commands::List => {
            let units = source.discover()?;
            if units.is_empty() {
                println!("No change units found in {}.", source.location());
            } else {
                println!("Change units ({}):", units.len());
                for unit in &units {
                    let rollback = if unit.rollback_body().is_some() {
                        " [rollback]"
                    } else {
                        ""
                    };
                    println!("  {}{}", unit.name(), rollback);
                }
            }
            Ok(true)
        }
        Commands::Upgrade => {
            let summary = open(&settings, source)?.execute()?;
            println!("{}", summary);
            Ok(summary.is_success())
        }
        Commands::Status => {
            let mut engine = open(&settings, source)?;
            let applied = engine.history()?;
            let pending = engine.pending()?;
            println!("Applied: {}", applied.len());
            println!("Pending: {}", pending.len());
            for unit in &pending {
                println!("  {}", unit.name());
            }
            Ok(true)
        }
        Commands::Preview => {
            let pending = open(&settings, source)?.pending()?;
            if pending.is_empty() {
                println!("No pending units. Database is up to date.");
            } else {
                println!("Pending units ({}):", pending.len());
                for unit in &pending {
                    match unit.description() {
                        Some(description) => println!("  {}: {}", unit.name(), description),
                        None => println!("  {}", unit.name()),
                    }
                }
            }
            Ok(true)
        }
        Commands::History => {
            let history = open(&settings, source)?.history()?;
            if history.is_empty() {
                println!("No units applied yet.");
            } else {
                println!("Applied units ({}):", history.len());
                for entry in &history {
                    println!(
                        "  {}  {}  {}",
                        entry.applied_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        short_checksum(&entry.checksum),
                        entry.name
                    );
                }
            }
            Ok(true)
        }
        Commands::Reverse { name } => {
            let record = open(&settings, source)?.reverse(&name)?;
            println!(
                "{} {} ({} ms)",
                record.outcome,
                record.name,
                record.duration.as_millis()
            );
            Ok(true)
        }
    }
}

/// First 12 characters of a journaled checksum, which is not necessarily ASCII.
fn short_checksum(checksum: &str) -> String {
    checksum.chars().take(12).collect()
}

fn open(
    settings: &Settings,
    source: DirectorySource,
) -> Result<MigrationEngine<DirectorySource, SqliteJournal>, Box<dyn std::error::Error>> {
    let conn = Connection::open(settings.database_path()?)?;
    let journal = SqliteJournal::new(conn)
        .with_table_name(settings.table.clone())
        .with_busy_timeout(settings.busy_timeout);
    Ok(MigrationEngine::new(source, journal).with_config(settings.engine.clone()))
}
