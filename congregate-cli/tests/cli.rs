use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use congregate_core::{Cursor, CursorName};
use congregate_sync::{CursorStore, FileCursorStore};

const SECRETS: [&str; 5] = [
    "PCO_APP_ID",
    "PCO_SECRET",
    "FIBERY_HOST",
    "FIBERY_SPACE",
    "FIBERY_TOKEN",
];

fn congregate_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("congregate"));
    cmd.env("HOME", home).env("USERPROFILE", home);
    for name in SECRETS {
        cmd.env_remove(name);
    }
    cmd
}

fn seed_cursors(home: &Path) {
    let mut store = FileCursorStore::at_home(home);
    store
        .set(CursorName::SourceA, &Cursor("2025-01-01T00:00:00.000Z".into()))
        .expect("seed Asource");
    store
        .set(CursorName::SourceB, &Cursor("2025-01-02T00:00:00.000Z".into()))
        .expect("seed Bsource");
}

#[test]
fn help_lists_subcommands() {
    let home = TempDir::new().expect("home");
    congregate_cmd(home.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("sync").and(contains("status")).and(contains("cursor")));
}

#[test]
fn status_on_fresh_home_reports_never() {
    let home = TempDir::new().expect("home");
    congregate_cmd(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("Asource").and(contains("never")));
}

#[test]
fn status_json_shows_stored_cursors() {
    let home = TempDir::new().expect("home");
    seed_cursors(home.path());

    let output = congregate_cmd(home.path())
        .args(["status", "--json"])
        .output()
        .expect("run status");
    assert!(output.status.success());
    let payload: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(payload["cursors"][0]["name"], "Asource");
    assert_eq!(payload["cursors"][0]["cursor"], "2025-01-01T00:00:00.000Z");
    assert_eq!(payload["cursors"][1]["cursor"], "2025-01-02T00:00:00.000Z");
}

#[test]
fn cursor_reset_removes_only_the_named_cursor() {
    let home = TempDir::new().expect("home");
    seed_cursors(home.path());

    congregate_cmd(home.path())
        .args(["cursor", "reset", "Asource"])
        .assert()
        .success()
        .stdout(contains("Asource reset"));

    let store = FileCursorStore::at_home(home.path());
    assert_eq!(store.get(CursorName::SourceA).expect("read"), None);
    assert!(store.get(CursorName::SourceB).expect("read").is_some());

    congregate_cmd(home.path())
        .args(["cursor", "reset", "all"])
        .assert()
        .success()
        .stdout(contains("Asource was not set").and(contains("Bsource reset")));
}

#[test]
fn cursor_reset_rejects_unknown_name() {
    let home = TempDir::new().expect("home");
    congregate_cmd(home.path())
        .args(["cursor", "reset", "Csource"])
        .assert()
        .failure()
        .stderr(contains("unknown cursor"));
}

#[test]
fn sync_without_credentials_fails_naming_the_variable() {
    let home = TempDir::new().expect("home");
    congregate_cmd(home.path())
        .arg("sync")
        .assert()
        .failure()
        .stderr(contains("PCO_APP_ID"));
    assert!(!home.path().join(".congregate/cursors.json").exists());
}

#[test]
fn explicit_config_path_must_exist() {
    let home = TempDir::new().expect("home");
    let missing = home.path().join("nope.yaml");
    congregate_cmd(home.path())
        .args(["check", "--config"])
        .arg(&missing)
        .assert()
        .failure()
        .stderr(contains("config not found"));
}

#[test]
fn invalid_config_file_is_reported_with_its_path() {
    let home = TempDir::new().expect("home");
    let path = home.path().join("bad.yaml");
    fs::write(&path, "sync:\n  max_per_run: [1, 2]\n").expect("write config");
    congregate_cmd(home.path())
        .args(["--config"])
        .arg(&path)
        .args(["sync", "--dry-run"])
        .assert()
        .failure()
        .stderr(contains("bad.yaml"));
}
