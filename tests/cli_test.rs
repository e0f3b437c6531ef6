//! CLI Integration Tests

use assert_cmd::Command;
use predicates::prelude::*;

/// Test: --help describes the configuration flags
#[test]
fn test_help() {
    Command::cargo_bin("tus-uploadr")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--log-format"));
}

/// Test: a missing configuration file is a startup error
#[test]
fn test_missing_config() {
    Command::cargo_bin("tus-uploadr")
        .unwrap()
        .args(["--config", "/nonexistent/tus-uploadr.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

/// Test: an invalid configuration is rejected before binding
#[test]
fn test_invalid_config() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(
        &mut file,
        b"server:\n  address: 127.0.0.1:0\nendpoints: []\n",
    )
    .unwrap();

    Command::cargo_bin("tus-uploadr")
        .unwrap()
        .arg("--config")
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("At least one endpoint"));
}

/// Test: unknown log formats are rejected by the argument parser
#[test]
fn test_invalid_log_format() {
    Command::cargo_bin("tus-uploadr")
        .unwrap()
        .args(["--log-format", "xml"])
        .assert()
        .failure();
}
