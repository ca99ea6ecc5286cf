/// Command line integration tests
///
/// This test module tests the following functions:
/// - Printing and validating the effective configuration
/// - A single scheduler tick against a file-backed store
/// - Reading back events and baselines from that store
/// - Queued retries left in place for the host
/// - Error reporting for bad input
use assert_cmd::Command;
use chrono::{Duration, Utc};
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;
use warden::store::{FileStore, MonitorStore, ScheduledTask};

fn warden() -> Command {
    let mut cmd = Command::cargo_bin("warden").unwrap();
    cmd.env_remove("WARDEN_ENABLED")
        .env_remove("WARDEN_THROTTLE_LIMIT")
        .env_remove("WARDEN_MEMORY_LIMIT_BYTES")
        .env_remove("WARDEN_LOG_LEVEL")
        .args(["--log-level", "error"]);
    cmd
}

#[test]
fn test_config_prints_defaults_as_json() {
    warden()
        .args(["config", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"breaker_threshold\": 5"))
        .stdout(predicate::str::contains("\"duration_regression\""));
}

#[test]
fn test_config_prints_toml_by_default() {
    warden()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[bus]"))
        .stdout(predicate::str::contains("throttle_limit = 1000"));
}

#[test]
fn test_config_file_and_environment_are_applied() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("warden.toml");
    fs::write(&path, "[bus]\nbreaker_threshold = 9\n").unwrap();

    warden()
        .env("WARDEN_THROTTLE_LIMIT", "25")
        .args(["--config", path.to_str().unwrap(), "config", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"breaker_threshold\": 9"))
        .stdout(predicate::str::contains("\"throttle_limit\": 25"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("warden.json");
    fs::write(&path, r#"{"baseline": {"ema_weight": 0.0}, "health": {"max_recovery_attempts": 0}}"#)
        .unwrap();

    warden()
        .args(["--config", path.to_str().unwrap(), "config", "--validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("EMA weight"))
        .stderr(predicate::str::contains("recovery attempts"));

    warden()
        .args(["--config", path.to_str().unwrap(), "check"])
        .assert()
        .failure();
}

#[test]
fn test_run_once_then_inspect_store() {
    let dir = tempdir().unwrap();
    let store = dir.path().join("store");
    let store = store.to_str().unwrap();

    warden()
        .args(["--store", store, "run", "--once"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"health_checker\""))
        .stdout(predicate::str::contains("\"dispatched\""));

    warden()
        .args(["--store", store, "events", "--type", "health"])
        .assert()
        .success()
        .stdout(predicate::str::contains("scheduled_check"));

    warden()
        .args(["--store", store, "events", "--counts"])
        .assert()
        .success()
        .stdout(predicate::str::contains("health"));

    warden()
        .args(["--store", store, "baselines"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No baselines recorded"));
}

#[test]
fn test_run_once_leaves_due_retries_queued() {
    let dir = tempdir().unwrap();
    let store_dir = dir.path().join("store");
    {
        let store = FileStore::open(&store_dir).unwrap();
        store
            .schedule_task(ScheduledTask {
                task_name: "nightly_digest".to_string(),
                run_at: Utc::now() - Duration::minutes(5),
                attempt: 1,
                reason: "health_check_recovery".to_string(),
            })
            .unwrap();
    }

    warden()
        .args(["--store", store_dir.to_str().unwrap(), "run", "--once"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"pending_retries\""))
        .stdout(predicate::str::contains("nightly_digest"));

    let reopened = FileStore::open(&store_dir).unwrap();
    let queued = reopened.scheduled_tasks().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].task_name, "nightly_digest");
}

#[test]
fn test_check_prints_report() {
    warden()
        .args(["check", "--status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"ok\""))
        .stdout(predicate::str::contains("\"components\""));
}

#[test]
fn test_bad_input_fails_with_message() {
    warden()
        .args(["events", "--limit", "many"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Parse error (limit)"));

    warden()
        .assert()
        .failure()
        .stderr(predicate::str::contains("No command provided"));
}
