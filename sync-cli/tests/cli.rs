//! Command-line behavior of the `rtsync` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn rtsync() -> Command {
    let mut cmd = Command::cargo_bin("rtsync").unwrap();
    // Keep ./rtsync.toml of the invoking directory out of the way
    cmd.current_dir(std::env::temp_dir());
    cmd
}

#[test]
fn show_config_prints_defaults() {
    rtsync()
        .arg("show-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("timeout_ms = 5000"))
        .stdout(predicate::str::contains("debounce_ms = 100"))
        .stdout(predicate::str::contains("max_attempts = 5"));
}

#[test]
fn show_config_reads_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[ledger]\ntimeout_ms = 750").unwrap();

    rtsync()
        .arg("--config")
        .arg(file.path())
        .arg("show-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("timeout_ms = 750"))
        .stdout(predicate::str::contains("match_window_ms = 10000"));
}

#[test]
fn invalid_config_fails() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[ledger]\ntimeout_ms = \"soon\"").unwrap();

    rtsync()
        .arg("--config")
        .arg(file.path())
        .arg("show-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn missing_config_fails() {
    rtsync()
        .args(["--config", "/nonexistent/rtsync.toml", "show-config"])
        .assert()
        .failure();
}

#[test]
fn simulate_confirms_write() {
    rtsync()
        .args(["simulate", "--events", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cached entities: 3"))
        .stdout(predicate::str::contains("Write confirmed"));
}

#[test]
fn simulate_rejected_write_rolls_back() {
    rtsync()
        .args(["simulate", "--events", "1", "--reject"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Write failed"))
        .stdout(predicate::str::contains("[rollback]"))
        .stdout(predicate::str::contains("\"status\":\"pending\""));
}

#[test]
fn simulate_logs_to_stderr() {
    rtsync()
        .env("RUST_LOG", "info")
        .args(["simulate", "--events", "1"])
        .assert()
        .success()
        .stderr(predicate::str::contains("starting simulation"))
        .stderr(predicate::str::contains("simulated write confirmed"))
        .stdout(predicate::str::contains("starting simulation").not());
}
