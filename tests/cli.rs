use assert_cmd::Command;
use predicates::prelude::*;
use std::fs::write;
use std::path::Path;
use tempfile::{tempdir, NamedTempFile};

fn config_file(yaml: &str) -> NamedTempFile {
    let config = NamedTempFile::new().expect("Creating temp config file failed");
    write(config.path(), yaml).expect("Writing temp config failed");
    config
}

fn local_config(root: &Path) -> String {
    format!(
        "canvas:\n  api_url: http://127.0.0.1:9\nstorage:\n  kind: local\n  root_dir: {}\nperformance:\n  max_retries: 0\n  request_timeout_secs: 2\nstate_file: {}\n",
        root.join("mirror").display(),
        root.join("state.json").display()
    )
}

fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("canvas-mirror").expect("Binary exists");
    cmd.env_remove("CANVAS_API_KEY")
        .env_remove("GOOGLE_DRIVE_ACCESS_TOKEN")
        .env("RUST_LOG", "warn");
    cmd
}

#[test]
fn help_lists_the_sync_command() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sync"));
}

#[test]
fn sync_fails_when_config_file_is_missing() {
    cmd()
        .args(["sync", "--config", "/definitely/not/here.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn sync_rejects_unknown_storage_kind() {
    let config = config_file("canvas:\n  api_url: https://lms.test\nstorage:\n  kind: s3\n");
    cmd()
        .arg("sync")
        .arg("--config")
        .arg(config.path())
        .env("CANVAS_API_KEY", "key")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid storage kind 's3'"));
}

#[test]
fn sync_requires_the_canvas_api_key() {
    let dir = tempdir().unwrap();
    let config = config_file(&local_config(dir.path()));
    cmd()
        .arg("sync")
        .arg("--config")
        .arg(config.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("CANVAS_API_KEY"));
    assert!(!dir.path().join("mirror").exists(), "nothing created before config is valid");
}

#[test]
fn sync_with_unreachable_canvas_finishes_without_courses() {
    let dir = tempdir().unwrap();
    let config = config_file(&local_config(dir.path()));
    cmd()
        .arg("sync")
        .arg("--config")
        .arg(config.path())
        .env("CANVAS_API_KEY", "key")
        .assert()
        .success()
        .stdout(predicate::str::contains("No available courses found."));
    assert!(!dir.path().join("state.json").exists());
}
