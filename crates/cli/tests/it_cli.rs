//! Integration tests - the `editgate` binary

mod common;
use common::*;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;

fn editgate(t: &Tmp) -> Command {
    let mut cmd = Command::cargo_bin("editgate").unwrap();
    cmd.arg("--root").arg(t.path()).env_remove("RUST_LOG");
    for key in ["EDITGATE_CONFIG", "EDITGATE_EXEC_TIMEOUT", "EDITGATE_SNAPSHOT_RETAIN"] {
        cmd.env_remove(key);
    }
    cmd
}

fn json(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("stdout is JSON")
}

#[test]
fn apply_then_undo_from_a_plan_file() {
    let t = Tmp::new();
    t.write("notes.txt", "first\n");
    t.write(
        "plan.json",
        r#"{
            "intent": "rename greeting",
            "edits": [
                {"path": "notes.txt", "action": "patch", "justification": "typo",
                 "patch_unified": "@@ -1 +1 @@\n-first\n+second\n"},
                {"path": "added.txt", "action": "create", "justification": "new", "content": "hi\n"}
            ]
        }"#,
    );

    let out = editgate(&t)
        .args(["apply", "--plan"])
        .arg(t.path().join("plan.json"))
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let body = json(&out);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["state"], "COMMITTED");
    assert_eq!(t.read("notes.txt"), "second\n");

    editgate(&t).arg("undo").assert().success();
    assert_eq!(t.read("notes.txt"), "first\n");
    assert!(!t.exists("added.txt"));
}

#[test]
fn rolled_back_batch_exits_non_zero() {
    let t = Tmp::new();
    t.write("a.txt", "a\n");
    let plan = r#"{"edits": [
        {"path": "a.txt", "action": "replace", "content": "b\n"},
        {"path": "a.txt", "action": "patch", "patch_unified": "@@ -1 +1 @@\n-zzz\n+y\n"}
    ]}"#;

    let out = editgate(&t)
        .args(["apply", "--plan", "-"])
        .write_stdin(plan)
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();
    assert_eq!(json(&out)["data"]["state"], "ROLLED_BACK");
    assert_eq!(t.read("a.txt"), "a\n");
}

#[test]
fn invalid_plan_and_path_escape_are_errors() {
    let t = Tmp::new();
    editgate(&t)
        .args(["apply", "--plan", "-"])
        .write_stdin(r#"{"edits": [{"path": "a", "action": "patch"}]}"#)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("E_INVALID_PLAN"));

    editgate(&t)
        .args(["apply", "--plan", "-"])
        .write_stdin(r#"{"edits": [{"path": "../x", "action": "create", "content": ""}]}"#)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("E_PATH_ESCAPE"));
}

#[test]
fn undo_with_nothing_committed_reports_no_snapshot() {
    let t = Tmp::new();
    editgate(&t)
        .arg("undo")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("E_NO_SNAPSHOT"));
}

#[test]
fn dry_run_prints_the_summary_only() {
    let t = Tmp::new();
    editgate(&t)
        .args(["apply", "--dry-run", "--plan", "-"])
        .write_stdin(r#"{"edits": [{"path": "x.txt", "action": "create", "justification": "demo", "content": "x"}]}"#)
        .assert()
        .success()
        .stdout(predicate::str::contains("create   x.txt"));
    assert!(!t.exists("x.txt"));
}

#[cfg(unix)]
#[test]
fn exec_denies_sudo_and_passes_exit_status_as_data() {
    let t = Tmp::new();
    let out = editgate(&t)
        .args(["exec", "sudo rm -rf /"])
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();
    let body = json(&out);
    assert_eq!(body["data"]["denied"], true);
    assert_eq!(body["data"]["exit_code"], -1);

    editgate(&t)
        .args(["exec", "echo hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello"));
}

#[cfg(unix)]
#[test]
fn check_runs_given_commands_and_summarizes_on_stderr() {
    let t = Tmp::new();
    editgate(&t)
        .args(["check", "true", "false"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Ran 2 check command(s): 1 passed, 1 failed"));
}

#[test]
fn snapshots_list_and_prune() {
    let t = Tmp::new();
    for content in ["1", "2", "3"] {
        editgate(&t)
            .args(["apply", "--plan", "-"])
            .write_stdin(format!(
                r#"{{"edits": [{{"path": "n.txt", "action": "replace", "content": "{content}"}}]}}"#
            ))
            .assert()
            .success();
    }

    let out = editgate(&t).args(["snapshots", "list"]).assert().success().get_output().stdout.clone();
    assert_eq!(json(&out)["data"].as_array().map(Vec::len), Some(3));

    editgate(&t).args(["snapshots", "prune", "--retain", "1"]).assert().success();
    let out = editgate(&t).args(["snapshots", "list"]).assert().success().get_output().stdout.clone();
    let listed = json(&out);
    assert_eq!(listed["data"].as_array().map(Vec::len), Some(1));
    assert_eq!(listed["data"][0]["is_last"], true);
}
