use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Command running in an empty directory against an in-memory warehouse.
fn branch_sync(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("branch_sync").unwrap();
    cmd.current_dir(dir.path())
        .env_clear()
        .env("ERPSYNC_DATABASE_URL", "sqlite::memory:")
        .env("ERPSYNC_DB_MAX_CONNECTIONS", "1")
        .env("ERPSYNC_LOG_LEVEL", "warn")
        .env("ERPSYNC_SYNC_RETRY_DELAY_SECONDS", "0")
        .env(
            "ERPSYNC_SYNC_WATERMARK_DIR",
            dir.path().join("watermarks").display().to_string(),
        );
    cmd
}

fn with_empty_source(cmd: &mut Command, dir: &TempDir) {
    let path = dir.path().join("branch_a.db");
    cmd.env("ERPSYNC_SOURCES", "branch_a").env(
        "ERPSYNC_SOURCE_BRANCH_A_URL",
        format!("sqlite://{}?mode=rwc", path.display()),
    );
}

#[test]
fn run_without_sources_fails() {
    let dir = TempDir::new().unwrap();
    branch_sync(&dir)
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no source connections are configured"));
}

#[test]
fn batches_reports_empty_ledger() {
    let dir = TempDir::new().unwrap();
    branch_sync(&dir)
        .arg("batches")
        .assert()
        .success()
        .stdout(predicate::str::contains("No batches recorded"));
}

#[test]
fn status_of_unknown_batch_fails() {
    let dir = TempDir::new().unwrap();
    branch_sync(&dir)
        .args(["status", "19990101_000000_abcdef"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn resume_of_unknown_batch_fails() {
    let dir = TempDir::new().unwrap();
    let mut cmd = branch_sync(&dir);
    with_empty_source(&mut cmd, &dir);
    cmd.args(["run", "--resume", "19990101_000000_abcdef"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn run_against_branch_without_tables_completes() {
    let dir = TempDir::new().unwrap();
    let mut cmd = branch_sync(&dir);
    with_empty_source(&mut cmd, &dir);
    cmd.args(["run", "--tables", "business_partners,orders"])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"))
        .stdout(predicate::str::contains("0 failed"));
}

#[test]
fn check_reports_reachable_source() {
    let dir = TempDir::new().unwrap();
    let mut cmd = branch_sync(&dir);
    with_empty_source(&mut cmd, &dir);
    cmd.arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("warehouse: ok"))
        .stdout(predicate::str::contains("branch_a: ok"));
}
