use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn scriptura(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_scriptura"))
        .current_dir(dir)
        .env_remove("SCRIPTURA_DATABASE")
        .env_remove("SCRIPTURA_SCRIPTS")
        .env_remove("SCRIPTURA_CONFIG")
        .env("RUST_LOG", "off")
        .args(args)
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn write_scripts(dir: &Path) {
    let scripts = dir.join("migrations");
    fs::create_dir_all(&scripts).unwrap();
    fs::write(
        scripts.join("001_create_users.up.sql"),
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);",
    )
    .unwrap();
    fs::write(scripts.join("001_create_users.down.sql"), "DROP TABLE users;").unwrap();
    fs::write(
        scripts.join("002_seed_admin.sql"),
        "INSERT INTO users (name) VALUES ('admin');",
    )
    .unwrap();
}

#[test]
fn list_works_without_a_database() {
    let dir = tempfile::tempdir().unwrap();
    write_scripts(dir.path());

    let output = scriptura(dir.path(), &["list"]);
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("001_create_users [rollback]"));
    assert!(out.contains("002_seed_admin"));
}

#[test]
fn upgrade_status_and_history() {
    let dir = tempfile::tempdir().unwrap();
    write_scripts(dir.path());

    let output = scriptura(dir.path(), &["--database", "sqlite://app.db", "preview"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("001_create_users: create users"));

    let output = scriptura(dir.path(), &["--database", "app.db", "upgrade"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("completed: 2 of 2 pending applied"));

    let output = scriptura(dir.path(), &["--database", "app.db", "status"]);
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("Applied: 2"));
    assert!(out.contains("Pending: 0"));

    let output = scriptura(dir.path(), &["--database", "app.db", "history"]);
    assert!(stdout(&output).contains("002_seed_admin"));

    let output = scriptura(dir.path(), &["--database", "app.db", "upgrade"]);
    assert!(stdout(&output).contains("nothing to do"));
}

#[test]
fn settings_file_supplies_the_database() {
    let dir = tempfile::tempdir().unwrap();
    write_scripts(dir.path());
    fs::write(
        dir.path().join("scriptura.toml"),
        "database = \"from_file.db\"\ntable = \"journal\"\n",
    )
    .unwrap();

    let output = scriptura(dir.path(), &["upgrade"]);
    assert!(output.status.success(), "{:?}", output);
    assert!(dir.path().join("from_file.db").exists());

    let conn = rusqlite::Connection::open(dir.path().join("from_file.db")).unwrap();
    let entries: i64 = conn
        .query_row("SELECT COUNT(*) FROM journal", [], |row| row.get(0))
        .unwrap();
    assert_eq!(entries, 2);
}

#[test]
fn failing_unit_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    write_scripts(dir.path());
    fs::write(dir.path().join("migrations/003_broken.sql"), "bleep blorp;").unwrap();

    let output = scriptura(dir.path(), &["--database", "app.db", "upgrade"]);
    assert_eq!(output.status.code(), Some(1));
    let out = stdout(&output);
    assert!(out.contains("failed"));
    assert!(out.contains("003_broken"));
}

#[test]
fn missing_database_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    write_scripts(dir.path());

    let output = scriptura(dir.path(), &["upgrade"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("No database configured"));
}

#[test]
fn reverse_removes_the_unit() {
    let dir = tempfile::tempdir().unwrap();
    write_scripts(dir.path());
    fs::remove_file(dir.path().join("migrations/002_seed_admin.sql")).unwrap();

    assert!(scriptura(dir.path(), &["-d", "app.db", "upgrade"]).status.success());
    let output = scriptura(dir.path(), &["-d", "app.db", "reverse", "001_create_users"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("reversed 001_create_users"));

    let output = scriptura(dir.path(), &["-d", "app.db", "status"]);
    assert!(stdout(&output).contains("Pending: 1"));
}
