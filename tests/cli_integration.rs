//! CLI Integration Tests
//!
//! Wiring between the binary and trustfeed-core, end to end.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("trustfeed-node").expect("Failed to find trustfeed-node binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

fn permalink(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|l| l.strip_prefix("  Permalink: "))
        .map(|p| p.trim().to_string())
}

#[test]
fn test_init_creates_identity_and_config() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["init", "--name", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Identity:"))
        .stdout(predicate::str::contains("Name: alice"))
        .stdout(predicate::str::contains("Permalink:"));

    assert!(data_dir.path().join("config.json").exists());
    assert!(data_dir.path().join("trustfeed.redb").exists());
}

#[test]
fn test_identity_is_stable_across_runs() {
    let data_dir = TempDir::new().unwrap();

    let first = cli_cmd(&data_dir).arg("init").output().unwrap();
    assert!(first.status.success());
    let second = cli_cmd(&data_dir).arg("info").output().unwrap();
    assert!(second.status.success());

    let a = permalink(&String::from_utf8_lossy(&first.stdout));
    let b = permalink(&String::from_utf8_lossy(&second.stdout));
    assert!(a.is_some());
    assert_eq!(a, b);
}

#[test]
fn test_info_requires_init() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .failure()
        .stderr(predicate::str::contains("trustfeed-node init"));
}

#[test]
fn test_log_prints_identity_entry() {
    let data_dir = TempDir::new().unwrap();
    cli_cmd(&data_dir).arg("init").assert().success();

    cli_cmd(&data_dir)
        .arg("log")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"topic\":\"addcontact\""))
        .stdout(predicate::str::contains("\"seq\":1"));
}

#[test]
fn test_replay_matches_stored_projections() {
    let data_dir = TempDir::new().unwrap();
    cli_cmd(&data_dir).arg("init").assert().success();

    cli_cmd(&data_dir)
        .arg("replay")
        .assert()
        .success()
        .stdout(predicate::str::contains("Contacts: 1 (stored 1)"))
        .stdout(predicate::str::contains("Replay matches"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let data_dir = TempDir::new().unwrap();
    std::fs::write(
        data_dir.path().join("config.json"),
        r#"{ "sync_batch_size": 0 }"#,
    )
    .unwrap();

    cli_cmd(&data_dir).arg("init").assert().failure();
}
