//! CLI integration tests: full online and offline admission lifecycles
//! through the `turnstile` binary.
//!
//! Uses `assert_cmd` to spawn the binary and verify exit codes and output.
//! Every test works inside its own temp directory with explicit --state and
//! --keys paths, so tests are independent and parallel-safe.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

fn turnstile(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("turnstile");
    cmd.current_dir(dir.path());
    cmd
}

/// Seed a venue: tenant + device keys, a registered device, two tickets.
fn seed(dir: &TempDir) {
    turnstile(dir)
        .args(["keygen", "tenant", "ta"])
        .assert()
        .success()
        .stdout(predicate::str::contains("verifying key"));
    turnstile(dir)
        .args(["keygen", "device", "dev-1"])
        .assert()
        .success();
    turnstile(dir)
        .args(["device", "add", "dev-1", "--tenant", "ta", "--venue", "v1"])
        .assert()
        .success();
    for ticket in ["t-1", "t-2"] {
        turnstile(dir)
            .args([
                "ticket", "add", ticket, "--event", "ev-1", "--tenant", "ta", "--venue", "v1",
            ])
            .assert()
            .success();
    }
}

fn issue(dir: &TempDir, ticket: &str, out: &str) {
    turnstile(dir)
        .args([
            "issue", ticket, "--event", "ev-1", "--tenant", "ta", "--venue", "v1", "--out", out,
        ])
        .assert()
        .success();
}

#[test]
fn help_exits_0_with_description() {
    let dir = TempDir::new().unwrap();
    turnstile(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Turnstile venue admission toolchain"));
}

#[test]
fn issue_without_tenant_key_fails() {
    let dir = TempDir::new().unwrap();
    turnstile(&dir)
        .args([
            "issue", "t-1", "--event", "ev-1", "--tenant", "ghost", "--venue", "v1",
        ])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("no signing key"));
}

#[test]
fn online_scan_allows_then_denies_replay() {
    let dir = TempDir::new().unwrap();
    seed(&dir);
    issue(&dir, "t-1", "cred.json");

    turnstile(&dir)
        .args(["scan", "cred.json", "--device", "dev-1", "--staff", "staff-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ALLOW"));

    // Identical credential again: the nonce ledger persisted in the state
    // file catches the replay.
    turnstile(&dir)
        .args(["scan", "cred.json", "--device", "dev-1", "--staff", "staff-1"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("nonce_replay"));
}

#[test]
fn regenerated_credential_for_used_ticket_is_duplicate() {
    let dir = TempDir::new().unwrap();
    seed(&dir);
    issue(&dir, "t-1", "cred-a.json");
    issue(&dir, "t-1", "cred-b.json");

    turnstile(&dir)
        .args(["scan", "cred-a.json", "--device", "dev-1", "--staff", "staff-1"])
        .assert()
        .success();
    turnstile(&dir)
        .args(["scan", "cred-b.json", "--device", "dev-1", "--staff", "staff-1"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("duplicate_scan"));

    turnstile(&dir)
        .args(["ticket", "show", "t-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Used"));
}

#[test]
fn unregistered_device_is_denied() {
    let dir = TempDir::new().unwrap();
    seed(&dir);
    issue(&dir, "t-1", "cred.json");
    turnstile(&dir)
        .args(["scan", "cred.json", "--device", "dev-ghost", "--staff", "staff-1"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("tenant_mismatch"));
}

#[test]
fn scan_outputs_json_when_requested() {
    let dir = TempDir::new().unwrap();
    seed(&dir);
    issue(&dir, "t-1", "cred.json");
    turnstile(&dir)
        .args([
            "--output", "json", "scan", "cred.json", "--device", "dev-1", "--staff", "staff-1",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"result\": \"allow\""));
}

#[test]
fn manifest_build_and_verify_roundtrip() {
    let dir = TempDir::new().unwrap();
    seed(&dir);
    turnstile(&dir)
        .args([
            "manifest", "build", "ev-1", "--tenant", "ta", "--venue", "v1", "--out", "m.json",
        ])
        .assert()
        .success();
    assert!(dir.path().join("m.json").exists());

    turnstile(&dir)
        .args(["manifest", "verify", "m.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("verified"));
}

#[test]
fn tampered_manifest_fails_verification() {
    let dir = TempDir::new().unwrap();
    seed(&dir);
    turnstile(&dir)
        .args([
            "manifest", "build", "ev-1", "--tenant", "ta", "--venue", "v1", "--out", "m.json",
        ])
        .assert()
        .success();

    let path = dir.path().join("m.json");
    let tampered = std::fs::read_to_string(&path)
        .unwrap()
        .replace("\"version\": 1", "\"version\": 7");
    std::fs::write(&path, tampered).unwrap();

    turnstile(&dir)
        .args(["manifest", "verify", "m.json"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("manifest invalid"));
}

fn offline_scan(dir: &TempDir, cred: &str) -> Command {
    let mut cmd = turnstile(dir);
    cmd.args([
        "offline", "scan", cred, "--manifest", "m.json", "--device", "dev-1", "--tenant", "ta",
        "--venue", "v1", "--staff", "staff-1",
    ]);
    cmd
}

#[test]
fn offline_lifecycle_scans_exports_and_reconciles() {
    let dir = TempDir::new().unwrap();
    seed(&dir);
    turnstile(&dir)
        .args([
            "manifest", "build", "ev-1", "--tenant", "ta", "--venue", "v1", "--out", "m.json",
        ])
        .assert()
        .success();

    // The device goes offline; t-1 is admitted from the cached manifest.
    issue(&dir, "t-1", "cred-1.json");
    offline_scan(&dir, "cred-1.json")
        .assert()
        .success()
        .stdout(predicate::str::contains("ALLOW"));

    // A ticket issued after the manifest snapshot is conservatively denied.
    turnstile(&dir)
        .args([
            "ticket", "add", "t-late", "--event", "ev-1", "--tenant", "ta", "--venue", "v1",
        ])
        .assert()
        .success();
    issue(&dir, "t-late", "cred-late.json");
    offline_scan(&dir, "cred-late.json")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("ticket_not_found"));

    // Reconnect: export the device log and reconcile.
    turnstile(&dir)
        .args([
            "offline", "export", "--device", "dev-1", "--event", "ev-1", "--out", "batch.json",
        ])
        .assert()
        .success();
    turnstile(&dir)
        .args(["reconcile", "ev-1", "batch.json"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("2 scans merged")
                .and(predicate::str::contains("applied offline admission"))
                .and(predicate::str::contains("FALSE DENY")),
        );

    // The offline admission is now authoritative.
    turnstile(&dir)
        .args(["ticket", "show", "t-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Used"));
    // The falsely denied ticket was reported, not admitted.
    turnstile(&dir)
        .args(["ticket", "show", "t-late"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Valid"));

    // Re-uploading the identical batch merges nothing new.
    turnstile(&dir)
        .args(["reconcile", "ev-1", "batch.json", "--output", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"scans_merged\": 2"));
}

#[test]
fn tampered_batch_is_rejected_at_reconcile() {
    let dir = TempDir::new().unwrap();
    seed(&dir);
    turnstile(&dir)
        .args([
            "manifest", "build", "ev-1", "--tenant", "ta", "--venue", "v1", "--out", "m.json",
        ])
        .assert()
        .success();
    issue(&dir, "t-1", "cred-1.json");
    offline_scan(&dir, "cred-1.json").assert().success();
    turnstile(&dir)
        .args([
            "offline", "export", "--device", "dev-1", "--event", "ev-1", "--out", "batch.json",
        ])
        .assert()
        .success();

    tamper_batch(&dir.path().join("batch.json"));
    turnstile(&dir)
        .args(["reconcile", "ev-1", "batch.json"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("rejected log batch"));

    // Nothing was applied.
    turnstile(&dir)
        .args(["ticket", "show", "t-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Valid"));
}

fn tamper_batch(path: &Path) {
    let tampered = std::fs::read_to_string(path)
        .unwrap()
        .replace("\"staff_user_id\": \"staff-1\"", "\"staff_user_id\": \"staff-9\"");
    std::fs::write(path, tampered).unwrap();
}

#[test]
fn voided_ticket_is_not_admitted() {
    let dir = TempDir::new().unwrap();
    seed(&dir);
    turnstile(&dir)
        .args(["ticket", "void", "t-1"])
        .assert()
        .success();
    issue(&dir, "t-1", "cred.json");
    turnstile(&dir)
        .args(["scan", "cred.json", "--device", "dev-1", "--staff", "staff-1"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("ticket_not_found"));
}
