#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::{json, Value};
use ulid::Ulid;

fn pid_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_pid") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/pid");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "project-ledger-cli", "--bin", "pid"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build pid binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

struct Workspace {
    db_path: PathBuf,
    config_path: PathBuf,
}

impl Workspace {
    fn new(label: &str) -> Self {
        let id = Ulid::new();
        let db_path = std::env::temp_dir().join(format!("pid-contract-{label}-{id}.sqlite3"));
        let config_path = std::env::temp_dir().join(format!("pid-contract-{label}-{id}.json"));
        let config = json!({
            "users": {
                "wendy@example.com": {"password": "w-secret", "role": "requestor", "name": "Wendy"},
                "sam@example.com": {"password": "s-secret", "role": "requestor", "name": "Sam"},
                "bruce@example.com": {"password": "b-secret", "role": "approver", "name": "Bruce"}
            }
        });
        if let Err(err) = std::fs::write(&config_path, config.to_string()) {
            panic!("failed to write config fixture: {err}");
        }
        Self {
            db_path,
            config_path,
        }
    }

    fn pid(&self, user: &str, password: &str, args: &[&str]) -> Output {
        let mut command = Command::new(pid_binary_path());
        command
            .env_remove("PROJECT_LEDGER_DB")
            .env_remove("PROJECT_LEDGER_CONFIG")
            .env_remove("PROJECT_LEDGER_USER")
            .env_remove("PROJECT_LEDGER_PASSWORD")
            .arg("--db")
            .arg(&self.db_path)
            .arg("--config")
            .arg(&self.config_path)
            .args(["--user", user, "--password", password]);
        for arg in args {
            command.arg(arg);
        }

        match command.output() {
            Ok(output) => output,
            Err(err) => panic!("failed to run pid command {:?}: {err}", args),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.db_path);
        let _ = std::fs::remove_file(&self.config_path);
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

const RESERVE_02: [&str; 9] = [
    "reserve",
    "--client",
    "02",
    "--project-type",
    "S1",
    "--cooling",
    "A",
    "--department",
    "F",
];

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(pid_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "whoami", "catalog", "reserve", "show", "submit", "cancel", "history", "logout",
        "pending", "approve", "reject", "lock",
    ] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn reserve_emits_created_outcome_json() {
    let workspace = Workspace::new("reserve");
    let output = workspace.pid("wendy@example.com", "w-secret", &RESERVE_02);
    assert!(
        output.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );

    let value = stdout_json(&output);
    assert_eq!(value["outcome"], json!("created"));
    assert_eq!(value["record"]["project_id"], json!("02-S1-A-F-001"));
    assert_eq!(value["record"]["sequence_number"], json!("001"));
    assert_eq!(value["record"]["status"], json!("預留中"));
    assert_eq!(value["record"]["applicant"], json!("Wendy"));

    let again = workspace.pid("wendy@example.com", "w-secret", &RESERVE_02);
    assert!(again.status.success());
    assert_eq!(stdout_json(&again)["outcome"], json!("existing"));

    let lock = workspace.pid("wendy@example.com", "w-secret", &["lock", "status"]);
    let status = stdout_json(&lock);
    assert_eq!(status["contended"], json!(false));
    assert_eq!(status["holders"][0]["holder_name"], json!("Wendy"));
}

#[test]
fn busy_lock_exits_non_zero_naming_holder() {
    let workspace = Workspace::new("busy");
    let first = workspace.pid("wendy@example.com", "w-secret", &RESERVE_02);
    assert!(first.status.success());

    let second = workspace.pid("sam@example.com", "s-secret", &RESERVE_02);
    assert!(!second.status.success());
    assert_eq!(stdout_json(&second)["outcome"], json!("busy"));
    let stderr = String::from_utf8_lossy(&second.stderr);
    assert!(
        stderr.contains("allocation lock is held by Wendy"),
        "expected stable error shape, got stderr={stderr}"
    );
}

#[test]
fn approver_decision_reports_skipped_ids() {
    let workspace = Workspace::new("approve");
    assert!(workspace
        .pid("wendy@example.com", "w-secret", &RESERVE_02)
        .status
        .success());
    assert!(workspace
        .pid("wendy@example.com", "w-secret", &["submit"])
        .status
        .success());

    let output = workspace.pid(
        "bruce@example.com",
        "b-secret",
        &["reject", "02-S1-A-F-001", "missing-id"],
    );
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["action"], json!("reject"));
    assert_eq!(report["approver"], json!("Bruce"));
    assert_eq!(report["applied"], json!(["02-S1-A-F-001"]));
    assert_eq!(
        report["skipped"],
        json!([{"project_id": "missing-id", "reason": "not_found"}])
    );

    let show = workspace.pid("wendy@example.com", "w-secret", &["show"]);
    let record = stdout_json(&show);
    assert_eq!(record["status"], json!("預留中"));
    assert_eq!(record["approver"], json!("Bruce"));
}

#[test]
fn authentication_failure_exits_non_zero() {
    let workspace = Workspace::new("auth");
    let output = workspace.pid("wendy@example.com", "nope", &["whoami"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("authentication failed"),
        "expected stable error shape, got stderr={stderr}"
    );
}
