#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use churn_feedback_core::{ChurnLabel, FeatureVector, PredictionWrite, RecordStore};
use churn_feedback_store_sqlite::SqliteChurnStore;
use serde_json::Value;
use ulid::Ulid;

fn churnctl_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_churnctl") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/churnctl");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "churn-feedback-cli", "--bin", "churnctl"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build churnctl binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("churnctl-{label}-{}.sqlite3", Ulid::new()))
}

fn churnctl_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(churnctl_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run churnctl command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn seed_predictions(db_path: &Path, customers: &[i64], predicted: ChurnLabel) {
    let store = match SqliteChurnStore::open(db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open seed store: {err:#}"),
    };
    if let Err(err) = store.migrate() {
        panic!("failed to migrate seed store: {err:#}");
    }
    for customer_id in customers {
        let write = PredictionWrite {
            customer_id: *customer_id,
            features: FeatureVector::from_array([3.0; 13]),
            predicted_output: predicted,
            coupons: Some(1.0),
            cashback: Some(50.0),
        };
        if let Err(err) = store.upsert_prediction(&write) {
            panic!("failed to seed customer {customer_id}: {err}");
        }
    }
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(churnctl_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["db", "record", "feedback", "ledger"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn db_migrate_reports_schema_version() {
    let db_path = temp_db("migrate");
    let output = churnctl_output(&db_path, &["db", "migrate"]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["schema_version"], Value::from(1));
    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn missing_record_error_shape_is_stable() {
    let db_path = temp_db("missing");
    let output = churnctl_output(&db_path, &["record", "show", "--customer-id", "999"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("churn record not found for customer 999"),
        "unexpected stderr: {stderr}"
    );
    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn feedback_record_reports_mismatch_then_idempotent_replay() {
    let db_path = temp_db("feedback");
    seed_predictions(&db_path, &[42], ChurnLabel::ONE);

    let first = churnctl_output(
        &db_path,
        &["feedback", "record", "--customer-id", "42", "--actual-output", "0"],
    );
    assert!(first.status.success());
    let first = stdout_json(&first);
    assert_eq!(first["status"], Value::from("recorded"));
    assert_eq!(first["wrong_count"], Value::from(1));

    let replay = churnctl_output(
        &db_path,
        &["feedback", "record", "--customer-id", "42", "--actual-output", "1"],
    );
    assert!(replay.status.success());
    let replay = stdout_json(&replay);
    assert_eq!(replay["status"], Value::from("already_recorded"));
    assert_eq!(replay["wrong_count"], Value::from(1));

    let record = churnctl_output(&db_path, &["record", "show", "--customer-id", "42"]);
    assert!(record.status.success());
    let record = stdout_json(&record);
    assert_eq!(record["actual_output"], Value::from(0));
    assert_eq!(record["predicted_output"], Value::from(1));
    assert!(record.get("tenure").is_some());

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn feedback_record_reports_threshold_crossing_without_retrain_job() {
    let db_path = temp_db("threshold");
    seed_predictions(&db_path, &[1, 2], ChurnLabel::ZERO);

    for customer_id in ["1", "2"] {
        let output = churnctl_output(
            &db_path,
            &[
                "feedback",
                "record",
                "--customer-id",
                customer_id,
                "--actual-output",
                "1",
                "--retrain-threshold",
                "2",
            ],
        );
        assert!(output.status.success());
        let body = stdout_json(&output);
        if customer_id == "2" {
            assert_eq!(body["status"], Value::from("triggered"));
            assert_eq!(body["retrain"], Value::from("not_configured"));
        }
    }

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn feedback_record_rejects_out_of_range_label() {
    let db_path = temp_db("label");
    let output = churnctl_output(
        &db_path,
        &["feedback", "record", "--customer-id", "1", "--actual-output", "2"],
    );
    assert!(!output.status.success());
    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn ledger_count_list_and_export_agree() {
    let db_path = temp_db("ledger");
    seed_predictions(&db_path, &[10, 11, 12], ChurnLabel::ONE);
    for customer_id in ["10", "11"] {
        let output = churnctl_output(
            &db_path,
            &["feedback", "record", "--customer-id", customer_id, "--actual-output", "0"],
        );
        assert!(output.status.success());
    }
    let output = churnctl_output(
        &db_path,
        &["feedback", "record", "--customer-id", "12", "--actual-output", "1"],
    );
    assert_eq!(stdout_json(&output)["status"], Value::from("correct"));

    let count = churnctl_output(&db_path, &["ledger", "count", "--json"]);
    assert_eq!(stdout_json(&count)["wrongCount"], Value::from(2));

    let list = churnctl_output(&db_path, &["ledger", "list", "--json", "--limit", "1"]);
    let list = stdout_json(&list);
    let entries = match list.as_array() {
        Some(value) => value,
        None => panic!("expected ledger list array, got {list}"),
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["customer_id"], Value::from(10));
    assert_eq!(entries[0]["cashback"], Value::from(50.0));

    let export_path = std::env::temp_dir().join(format!("churnctl-export-{}.json", Ulid::new()));
    let export_arg = export_path.display().to_string();
    let export = churnctl_output(&db_path, &["ledger", "export", "--output", &export_arg]);
    assert!(export.status.success());
    assert_eq!(stdout_json(&export)["exported"], Value::from(2));

    let exported = match std::fs::read_to_string(&export_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to read export file: {err}"),
    };
    let exported: Value = match serde_json::from_str(&exported) {
        Ok(value) => value,
        Err(err) => panic!("export file is not JSON: {err}"),
    };
    assert_eq!(exported.as_array().map(Vec::len), Some(2));

    let _ = std::fs::remove_file(&export_path);
    let _ = std::fs::remove_file(&db_path);
}
