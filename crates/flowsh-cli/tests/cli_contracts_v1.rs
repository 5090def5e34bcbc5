#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use serde_json::Value;
use ulid::Ulid;

fn flowsh_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_flowsh") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/flowsh");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "flowsh-cli", "--bin", "flowsh"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build flowsh binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        let root = std::env::temp_dir().join(format!("flowsh-contract-{}", Ulid::new()));
        if let Err(err) = fs::create_dir_all(&root) {
            panic!("failed to create sandbox: {err}");
        }
        Self { root }
    }

    fn run(&self, args: &[&str]) -> Output {
        let mut command = Command::new(flowsh_binary_path());
        command
            .env("FLOWSH_DATA_DIR", self.root.join("data"))
            .env("FLOWSH_RUNTIME_DIR", self.root.join("runtime"))
            .env_remove("FLOWSH_CONFIG_DIR")
            .env_remove("FLOWSH_CONFIG_KEY")
            .env_remove("RUST_LOG")
            .arg("--config-dir")
            .arg(self.root.join("config"));
        for arg in args {
            command.arg(arg);
        }
        match command.output() {
            Ok(output) => output,
            Err(err) => panic!("failed to run flowsh command {:?}: {err}", args),
        }
    }

    fn run_ok(&self, args: &[&str]) -> Output {
        let output = self.run(args);
        assert!(
            output.status.success(),
            "flowsh {:?} failed\nstdout={}\nstderr={}",
            args,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        output
    }

    fn write_workflow(&self, name: &str, id: &str) -> String {
        let dir = self.root.join(name);
        if let Err(err) = fs::create_dir_all(&dir) {
            panic!("failed to create workflow dir: {err}");
        }
        let state = serde_json::json!({
            "id": id,
            "name": name,
            "tasks": [{"name": "simulate"}],
            "submissions": [{
                "start_time": "2024-01-01T10:00:05Z",
                "end_time": "2024-01-01T10:30:00Z",
                "submission_parts": {"2024-01-01 10:00:00": [0]},
                "jobscripts": [{"index": 0, "scheduler": "direct", "os_name": "posix"}],
                "actions": [{"task": 0, "element": 0, "states": ["success"]}]
            }]
        });
        if let Err(err) = fs::write(dir.join("workflow.json"), state.to_string()) {
            panic!("failed to write workflow state: {err}");
        }
        dir.display().to_string()
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
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

fn assert_schema(schema_path: &Path, value: &Value) {
    let body = fs::read_to_string(schema_path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", schema_path.display()));
    let schema: Value = serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", schema_path.display()));
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(flowsh_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "show",
        "show-legend",
        "cancel",
        "submissions",
        "config",
        "schedulers",
        "components",
        "info",
        "dirs",
    ] {
        assert!(
            stdout.contains(required),
            "help output missing subcommand {required}: {stdout}"
        );
    }
}

#[test]
fn show_json_contract_is_stable_v1() {
    let sandbox = Sandbox::new();
    let finished = sandbox.write_workflow("finished", "wf-finished");
    let gone = sandbox.root.join("gone").display().to_string();

    sandbox.run_ok(&[
        "submissions",
        "add",
        "--path",
        &finished,
        "--workflow-id",
        "wf-finished",
        "--submit-time",
        "2024-01-01 10:00:00",
    ]);
    sandbox.run_ok(&[
        "submissions",
        "add",
        "--path",
        &gone,
        "--workflow-id",
        "wf-gone",
        "--submit-time",
        "2024-01-02 09:00:00",
    ]);

    let report = stdout_json(&sandbox.run_ok(&["show", "--json"]));
    assert_schema(
        &repo_root().join("contracts/known-submissions.v1.schema.json"),
        &report,
    );
    assert_eq!(report["contract_version"], "known_submissions.v1");
    assert_eq!(report["deactivated"].as_array().map(Vec::len), Some(2));

    let rows = match report["rows"].as_array() {
        Some(rows) => rows.clone(),
        None => panic!("rows missing: {report}"),
    };
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["status"], "deleted");
    assert_eq!(rows[1]["status"], "inactive");
    assert_eq!(rows[1]["workflow_name"], "finished");
    assert_eq!(rows[1]["end_time"], "2024-01-01T10:30:00Z");

    let listed = stdout_json(&sandbox.run_ok(&["submissions", "list", "--json"]));
    let records = match listed["records"].as_array() {
        Some(records) => records.clone(),
        None => panic!("records missing: {listed}"),
    };
    assert!(records.iter().all(|record| record["is_active"] == false));
}

#[test]
fn show_table_and_legend_render() {
    let sandbox = Sandbox::new();
    let finished = sandbox.write_workflow("finished", "wf-finished");
    sandbox.run_ok(&[
        "submissions",
        "add",
        "--path",
        &finished,
        "--workflow-id",
        "wf-finished",
        "--submit-time",
        "2024-01-01 10:00:00",
    ]);

    let table = sandbox.run_ok(&["show", "--no-update"]);
    let stdout = String::from_utf8_lossy(&table.stdout);
    assert!(stdout.starts_with("ID"), "unexpected table: {stdout}");
    assert!(stdout.contains("finished"));

    let legend = sandbox.run_ok(&["show-legend"]);
    assert!(String::from_utf8_lossy(&legend.stdout).contains("Action states"));
}

#[test]
fn unknown_column_fails_with_allowed_list() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&["show", "--columns", "id,colour"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("allowed columns"), "stderr={stderr}");

    let empty = sandbox.run(&["show", "--columns", ","]);
    assert!(!empty.status.success());
    assert!(String::from_utf8_lossy(&empty.stderr).contains("allowed columns"));
}

#[test]
fn dirs_are_created_and_runtime_cleared() {
    let sandbox = Sandbox::new();
    let shown = sandbox.run_ok(&["--config-override", "machine=node7", "dirs", "show"]);
    let stdout = String::from_utf8_lossy(&shown.stdout);
    assert!(stdout.contains("runtime="), "stdout={stdout}");
    assert!(sandbox.root.join("data").join("node7").is_dir());
    assert!(sandbox.root.join("runtime").is_dir());

    sandbox.run_ok(&["dirs", "clear-runtime"]);
    assert!(!sandbox.root.join("runtime").exists());
    assert!(sandbox.root.join("data").is_dir());
}

#[test]
fn submissions_path_resolves_local_ids() {
    let sandbox = Sandbox::new();
    let finished = sandbox.write_workflow("finished", "wf-finished");
    let added = sandbox.run_ok(&[
        "submissions",
        "add",
        "--path",
        &finished,
        "--workflow-id",
        "wf-finished",
    ]);
    assert_eq!(String::from_utf8_lossy(&added.stdout).trim(), "0");

    let path = sandbox.run_ok(&["submissions", "path", "0"]);
    assert_eq!(String::from_utf8_lossy(&path.stdout).trim(), finished);

    let missing = sandbox.run(&["submissions", "path", "9"]);
    assert!(!missing.status.success());
}
