use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;

const HEADER: &str = "step,action,available,processing,active,auto_renewing";

#[test]
fn test_cli_purchase_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!("billing-core"));
    cmd.arg("tests/fixtures/purchase.csv");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(HEADER))
        .stdout(predicate::str::contains("3,connect,true,idle,false,false"))
        .stdout(predicate::str::contains("4,purchase,true,success,true,true"))
        .stdout(predicate::str::contains("5,dismiss,true,idle,true,true"))
        // Reconnects after the store drops the session.
        .stdout(predicate::str::contains("6,disconnect,true,idle,true,true"));

    Ok(())
}

#[test]
fn test_cli_rejection_then_retry() {
    let mut cmd = Command::new(cargo_bin!("billing-core"));
    cmd.arg("tests/fixtures/rejected.csv");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("4,purchase,true,error,true,true"))
        .stdout(predicate::str::contains("5,retry,true,success,true,true"));
}

#[test]
fn test_cli_backend_timeout_is_network_error() {
    let mut cmd = Command::new(cargo_bin!("billing-core"));
    cmd.arg("tests/fixtures/timeout.csv")
        .arg("--transaction-timeout-ms")
        .arg("300");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("4,purchase,true,network_error,true,true"))
        .stdout(predicate::str::contains("5,retry,true,success,true,true"));
}

#[test]
fn test_cli_reconcile_recovers_store_subscription() {
    let mut cmd = Command::new(cargo_bin!("billing-core"));
    cmd.arg("tests/fixtures/recovery.csv");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("4,connect,true,idle,true,true"))
        .stdout(predicate::str::contains("5,reconcile,true,success,true,true"));
}

#[test]
fn test_cli_unavailable_billing_degrades() {
    let mut cmd = Command::new(cargo_bin!("billing-core"));
    cmd.arg("tests/fixtures/unavailable.csv");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("3,connect,false,idle,false,false"))
        .stdout(predicate::str::contains("4,purchase,false,idle,false,false"));
}

#[test]
fn test_cli_malformed_rows_are_reported() {
    let mut csv = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv, "action, subject, value").unwrap();
    writeln!(csv, "product, plus_1_renewing, not_micros").unwrap();
    writeln!(csv, "teleport, x, y").unwrap();
    writeln!(csv, "purchase, plus_1_renewing,").unwrap();
    writeln!(csv, "connect,,").unwrap();

    let mut cmd = Command::new(cargo_bin!("billing-core"));
    cmd.arg(csv.path());

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Error reading step"))
        .stderr(predicate::str::contains("Error applying step"))
        .stdout(predicate::str::contains(",connect,true,idle,false,false"));
}

#[test]
fn test_cli_rejects_invalid_config() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(config, r#"{{"transaction_timeout_ms": 0}}"#).unwrap();

    let mut cmd = Command::new(cargo_bin!("billing-core"));
    cmd.arg("tests/fixtures/purchase.csv")
        .arg("--config")
        .arg(config.path());

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("transaction_timeout_ms must be greater than zero"));
}

#[test]
fn test_cli_missing_scenario_fails() {
    let mut cmd = Command::new(cargo_bin!("billing-core"));
    cmd.arg("tests/fixtures/does_not_exist.csv");

    cmd.assert().failure();
}
