use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;
use tempfile::NamedTempFile;

fn loans_csv() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "loan,customer,due_date,amount,payment_account").unwrap();
    writeln!(file, "LOAN-1,CUST-1,2026-03-10,150.00,").unwrap();
    file
}

fn enabled_config() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
enabled = true

[processor]
merchant_id = "M-1"
merchant_gate_id = "G-1"
merchant_gate_key = "K-1"
"#
    )
    .unwrap();
    file
}

const LINK_TOKEN: [&str; 11] = [
    "link-token",
    "--customer",
    "CUST-1",
    "--token",
    "processor-sandbox-7f3a",
    "--bank-name",
    "Aggregated Credit Union",
    "--last4",
    "4321",
    "--name",
    "Jane Borrower",
];

fn autopay() -> Command {
    let mut cmd = Command::new(cargo_bin!("ach-autopay"));
    cmd.env("RUST_LOG", "off");
    cmd
}

#[test]
fn test_account_status_without_accounts() {
    let loans = loans_csv();

    autopay()
        .arg("--loans")
        .arg(loans.path())
        .args(["account-status", "--loan", "LOAN-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""success": true"#))
        .stdout(predicate::str::contains(r#""has_authorization": false"#))
        .stdout(predicate::str::contains(r#""resolution": "none""#));
}

#[test]
fn test_unknown_loan_reports_failure() {
    autopay()
        .args(["account-status", "--loan", "LOAN-404"])
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""success": false"#))
        .stdout(predicate::str::contains("Not found: Loan LOAN-404"));
}

#[test]
fn test_link_account_refused_while_disabled() {
    autopay()
        .args([
            "link-account",
            "--customer",
            "CUST-1",
            "--routing-number",
            "123456789",
            "--account-number",
            "12345678",
            "--name",
            "Jane Borrower",
        ])
        .assert()
        .failure()
        .stdout(predicate::str::contains("ACH autopay is not enabled"));
}

#[test]
fn test_list_accounts_empty() {
    autopay()
        .args(["list-accounts", "--customer", "CUST-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 account(s) found"));
}

#[test]
fn test_run_job_while_disabled() {
    autopay()
        .args(["run-job", "upcoming-scan"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""job": "upcoming-scan""#))
        .stdout(predicate::str::contains(r#""examined": 0"#));
}

#[test]
fn test_run_job_rejects_unknown_job() {
    autopay().args(["run-job", "nightly"]).assert().failure();
}

#[test]
fn test_webhook_file_is_acknowledged() {
    let mut body = NamedTempFile::new().unwrap();
    write!(body, r#"{{"TransactionID":"ACHQ-1","Status":"Cleared"}}"#).unwrap();

    autopay()
        .arg("webhook")
        .arg(body.path())
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status": "processed""#));
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut config = NamedTempFile::new().unwrap();
    writeln!(config, "enabled = true").unwrap();

    autopay()
        .arg("--config")
        .arg(config.path())
        .args(["list-accounts", "--customer", "CUST-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Merchant ID is required"));
}

#[test]
fn test_environment_overrides_config() {
    autopay()
        .env("ACH_AUTOPAY__SCHEDULE__INITIATION_LEAD_DAYS", "0")
        .args(["list-accounts", "--customer", "CUST-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Initiation lead days must be at least 1"));
}

#[test]
fn test_link_token_records_aggregator_account() {
    let config = enabled_config();

    autopay()
        .arg("--config")
        .arg(config.path())
        .args(LINK_TOKEN)
        .args(["--no-default"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""token_source": "Plaid""#))
        .stdout(predicate::str::contains(r#""account_last4": "4321""#))
        .stdout(predicate::str::contains(r#""is_default": true"#));
}

#[cfg(not(feature = "storage-rocksdb"))]
#[test]
fn test_rocksdb_fallback_warning() {
    autopay()
        .args(["--db-path", "some_db", "list-accounts", "--customer", "CUST-1"])
        .assert()
        .success()
        .stderr(predicate::str::contains("WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."));
}

#[cfg(feature = "storage-rocksdb")]
#[test]
fn test_rocksdb_no_fallback_warning() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    autopay()
        .arg("--db-path")
        .arg(&db_path)
        .args(["list-accounts", "--customer", "CUST-1"])
        .assert()
        .success()
        .stderr(predicate::str::contains("WARNING").not());
}

#[cfg(feature = "storage-rocksdb")]
#[test]
fn test_loan_account_override_persists_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("autopay_db");
    let config = enabled_config();
    let loans = loans_csv();
    let run = |args: &[&str]| {
        let mut cmd = autopay();
        cmd.arg("--config")
            .arg(config.path())
            .arg("--loans")
            .arg(loans.path())
            .arg("--db-path")
            .arg(&db_path)
            .args(args);
        cmd
    };

    let output = run(&LINK_TOKEN).output().unwrap();
    assert!(output.status.success());
    let linked: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let id = linked["account"]["authorization_id"].as_str().unwrap().to_string();

    run(&["set-loan-account", "--loan", "LOAN-1", "--authorization", &id])
        .assert()
        .success();
    run(&["account-status", "--loan", "LOAN-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""resolution": "loan_override""#))
        .stdout(predicate::str::contains(format!(r#""authorization_id": "{id}""#)));

    run(&["set-loan-account", "--loan", "LOAN-1"]).assert().success();
    run(&["account-status", "--loan", "LOAN-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""resolution": "customer_default""#));
}
