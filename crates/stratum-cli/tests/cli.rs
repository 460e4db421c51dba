//! End-to-end tests of the `stratum` binary against manifests that only use
//! the built-in `null` and `wait` kinds.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

const STACK: &str = r#"
[endpoint]
kind = "null"
parameters = { host = "db.internal", port = 5432 }

[dsn]
kind = "null"
create_depends_on = ["endpoint"]
destroy_depends_on = ["drain"]
parameters = { url = "postgres://${endpoint.host}:${endpoint.port}/tracking", port = "${endpoint.port}" }

[drain]
kind = "wait"
parameters = { destroy_delay_secs = 0 }
"#;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn state(&self) -> PathBuf {
        self.dir.path().join(".stratum").join("state.json")
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_stratum"))
            .current_dir(self.dir.path())
            .env_remove("STRATUM_CONFIG")
            .env_remove("STRATUM_STATE")
            .env("RUST_LOG", "warn")
            .arg("--state")
            .arg(self.state())
            .args(args)
            .output()
            .unwrap()
    }

    fn run_json(&self, args: &[&str]) -> Value {
        let mut all = vec!["--json"];
        all.extend_from_slice(args);
        let output = self.run(&all);
        assert!(output.status.success(), "{}", stderr(&output));
        serde_json::from_slice(&output.stdout).unwrap()
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_validate_reports_resource_count() {
    let ws = Workspace::new();
    let manifest = ws.write("stack.toml", STACK);

    let output = ws.run(&["validate", path_str(&manifest)]);

    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("3 resources, no structural errors"));
}

#[test]
fn test_validate_rejects_cycle() {
    let ws = Workspace::new();
    let manifest = ws.write(
        "cyclic.toml",
        r#"
[a]
kind = "null"
create_depends_on = ["b"]

[b]
kind = "null"
create_depends_on = ["a"]
"#,
    );

    let output = ws.run(&["validate", path_str(&manifest)]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("cycle"), "{}", stderr(&output));
}

#[test]
fn test_validate_notes_kinds_without_adapter() {
    let ws = Workspace::new();
    let manifest = ws.write(
        "cloud.json",
        r#"{"network": {"kind": "network"}, "marker": {"kind": "null"}}"#,
    );

    let report = ws.run_json(&["validate", path_str(&manifest)]);

    assert_eq!(report["valid"], true);
    assert_eq!(report["resources"], 2);
    assert_eq!(report["unsupported_kinds"], serde_json::json!(["network"]));
}

#[test]
fn test_plan_shows_create_and_destroy_batches() {
    let ws = Workspace::new();
    let manifest = ws.write("stack.toml", STACK);

    let output = ws.run(&["plan", path_str(&manifest)]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(
        stdout(&output),
        "create plan: 2 batches\n  batch 0: drain, endpoint\n  batch 1: dsn\n"
    );

    let destroy = ws.run_json(&["plan", "--destroy", path_str(&manifest)]);
    assert_eq!(destroy[0]["ids"], serde_json::json!(["dsn"]));
    assert_eq!(destroy[1]["ids"], serde_json::json!(["drain", "endpoint"]));
    assert!(!ws.state().exists());
}

#[test]
fn test_apply_state_and_destroy_round() {
    let ws = Workspace::new();
    let manifest = ws.write("stack.toml", STACK);

    let applied = ws.run_json(&["apply", path_str(&manifest)]);
    assert_eq!(applied["direction"], "create");
    let outcomes = applied["outcomes"].as_array().unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o["status"] == "ready"));

    let dsn = ws.run_json(&["state", "show", "dsn"]);
    assert_eq!(dsn["status"], "ready");
    assert_eq!(
        dsn["attributes"]["url"],
        "postgres://db.internal:5432/tracking"
    );
    assert_eq!(dsn["attributes"]["port"], 5432);

    let listed = ws.run(&["state", "list"]);
    assert!(listed.status.success());
    let text = stdout(&listed);
    assert_eq!(text.lines().count(), 3);
    assert!(text.lines().last().unwrap().contains("dsn"));

    let reapplied = ws.run(&["apply", path_str(&manifest)]);
    assert!(reapplied.status.success());
    assert!(stdout(&reapplied).contains("(unchanged)"));

    let destroyed = ws.run_json(&["destroy", path_str(&manifest)]);
    assert!(destroyed["outcomes"]
        .as_array()
        .unwrap()
        .iter()
        .all(|o| o["status"] == "destroyed"));

    let empty = ws.run_json(&["state", "list"]);
    assert_eq!(empty, serde_json::json!([]));
}

#[test]
fn test_apply_unknown_kind_fails_before_touching_state() {
    let ws = Workspace::new();
    let manifest = ws.write("cloud.toml", "[network]\nkind = \"network\"\n");

    let output = ws.run(&["apply", path_str(&manifest)]);

    assert!(!output.status.success());
    assert!(
        stderr(&output).contains("no provider is registered"),
        "{}",
        stderr(&output)
    );
    let listed = ws.run_json(&["state", "list"]);
    assert_eq!(listed, serde_json::json!([]));
}

#[test]
fn test_state_show_unknown_id_fails() {
    let ws = Workspace::new();

    let output = ws.run(&["state", "show", "ghost"]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("No resource 'ghost'"));
}

#[test]
fn test_invalid_config_rejected() {
    let ws = Workspace::new();
    let manifest = ws.write("stack.toml", STACK);
    ws.write("stratum.toml", "max_concurrency = 0\n");

    let output = ws.run(&["apply", path_str(&manifest)]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("max_concurrency"), "{}", stderr(&output));
}
