//! End-to-end CLI tests. Each test runs `fil` as a subprocess in its own
//! temp directory, with the user config directory pointed inside it.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn fil(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("fil"));
    cmd.current_dir(dir);
    cmd.env("HOME", dir);
    cmd.env("XDG_CONFIG_HOME", dir.join(".config"));
    cmd.env("FILAMENT_ACTOR", "alice");
    cmd.env_remove("FILAMENT_ACTOR_KIND");
    cmd.env_remove("FILAMENT_TIMING");
    cmd.env("FILAMENT_LOG", "off");
    cmd
}

fn project() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    fil(dir.path()).arg("init").assert().success();
    dir
}

/// Run with `--json`, require success, and parse stdout.
fn json_ok(dir: &Path, args: &[&str]) -> Value {
    let output = fil(dir).args(args).arg("--json").output().expect("run fil");
    assert!(
        output.status.success(),
        "fil {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

/// Run with `--json`, require failure, and return the error code on stderr.
fn json_err(dir: &Path, args: &[&str]) -> String {
    let output = fil(dir).args(args).arg("--json").output().expect("run fil");
    assert!(!output.status.success(), "fil {args:?} unexpectedly succeeded");
    let err: Value = serde_json::from_slice(&output.stderr).expect("stderr is JSON");
    err["error"]["error_code"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

fn head_hash(dir: &Path, resource: &str) -> String {
    json_ok(dir, &["queue", resource])["head_hash"]
        .as_str()
        .expect("head_hash")
        .to_string()
}

/// Two overlapping proposals against the current head of `doc`.
fn queue_overlapping_pair(dir: &Path) -> Value {
    json_ok(dir, &["write", "doc", "title=Draft"]);
    json_ok(
        dir,
        &["enqueue", "doc", "pa", "--task", "t1", "--loci", "A1,A2", "--base", "head", "--set", "A1=1"],
    );
    json_ok(
        dir,
        &["enqueue", "doc", "pb", "--task", "t2", "--loci", "A2", "--base", "head", "--set", "A2=2"],
    )
}

const AUTHORITY: [&str; 4] = ["--reason", "newer data", "--sig", "sig:alice"];

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

#[test]
fn init_is_idempotent() {
    let dir = project();
    assert!(dir.path().join(".filament/journal.jsonl").exists());
    assert!(dir.path().join(".filament/config.toml").exists());
    let again = json_ok(dir.path(), &["init"]);
    assert_eq!(again["created"], false);
}

#[test]
fn commands_require_an_initialized_project() {
    let dir = TempDir::new().expect("tempdir");
    assert_eq!(json_err(dir.path(), &["log"]), "E1001");
    fil(dir.path())
        .arg("log")
        .assert()
        .failure()
        .stderr(predicate::str::contains("fil init"));
}

#[test]
fn mutating_commands_need_an_actor() {
    let dir = project();
    fil(dir.path())
        .env_remove("FILAMENT_ACTOR")
        .args(["write", "doc", "a=1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("FILAMENT_ACTOR"));
    fil(dir.path())
        .env_remove("FILAMENT_ACTOR")
        .args(["--actor", "bob", "write", "doc", "a=1"])
        .assert()
        .success();
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[test]
fn writes_are_logged_in_append_order() {
    let dir = project();
    let first = json_ok(dir.path(), &["write", "doc", "title=Draft", "pages=3"]);
    assert_eq!(first["commit"], "doc@0");
    assert_eq!(first["keys"], serde_json::json!(["pages", "title"]));
    json_ok(dir.path(), &["write", "notes", "x=1", "--input", "doc@0"]);

    let log = json_ok(dir.path(), &["log"]);
    let commits: Vec<&str> = log
        .as_array()
        .expect("rows")
        .iter()
        .map(|r| r["commit"].as_str().unwrap_or_default())
        .collect();
    assert_eq!(commits, ["doc@0", "notes@0"]);
    assert_eq!(log[0]["actor"], "human:alice");
    assert_eq!(log[1]["position"], 1);

    let limited = json_ok(dir.path(), &["log", "-n", "1"]);
    assert_eq!(limited.as_array().map(Vec::len), Some(1));
}

#[test]
fn dangling_input_ref_is_rejected_and_nothing_is_written() {
    let dir = project();
    assert_eq!(
        json_err(dir.path(), &["write", "doc", "a=1", "--input", "ghost@4"]),
        "E2001"
    );
    assert_eq!(json_ok(dir.path(), &["log"]).as_array().map(Vec::len), Some(0));
}

#[test]
fn evidence_can_be_cited_by_a_write() {
    let dir = project();
    let file = dir.path().join("report.json");
    fs::write(&file, r#"{"passed": true}"#).expect("write report");

    let imported = json_ok(
        dir.path(),
        &["evidence", file.to_str().expect("utf8 path"), "--id", "scans"],
    );
    assert_eq!(imported["commit"], "scans@0");
    assert_eq!(imported["category"], "json");

    json_ok(dir.path(), &["write", "doc", "reviewed=true", "--evidence", "scans@0"]);
    fil(dir.path()).arg("verify").assert().success();
}

// ---------------------------------------------------------------------------
// Queue and conflicts
// ---------------------------------------------------------------------------

#[test]
fn overlapping_enqueue_opens_a_conflict_and_blocks_merge() {
    let dir = project();
    let second = queue_overlapping_pair(dir.path());
    assert_eq!(second["conflicts"], serde_json::json!(["conflict:doc:pa+pb"]));

    let queue = json_ok(dir.path(), &["queue", "doc"]);
    assert_eq!(queue["entries"][0]["proposal"], "pa");
    assert_eq!(queue["entries"][0]["state"], "head");
    assert_eq!(
        queue["entries"][1]["open_conflicts"],
        serde_json::json!(["conflict:doc:pa+pb"])
    );

    let open = json_ok(dir.path(), &["conflicts", "--open"]);
    assert_eq!(open["conflicts"].as_array().map(Vec::len), Some(1));
    assert_eq!(open["violations"], serde_json::json!([]));

    assert_eq!(json_err(dir.path(), &["merge", "doc", "pa"]), "E4006");
    assert_eq!(json_err(dir.path(), &["merge", "doc", "pb"]), "E4001");
}

#[test]
fn resolution_requires_human_authority() {
    let dir = project();
    queue_overlapping_pair(dir.path());
    let id = "conflict:doc:pa+pb";

    assert_eq!(json_err(dir.path(), &["resolve", id, "--select", "pa"]), "E4003");

    let output = fil(dir.path())
        .args(["--actor-kind", "system", "resolve", id, "--select", "pa", "--json"])
        .args(AUTHORITY)
        .output()
        .expect("run fil");
    assert!(!output.status.success());
    let err: Value = serde_json::from_slice(&output.stderr).expect("json");
    assert_eq!(err["error"]["error_code"], "E4004");

    let open = json_ok(dir.path(), &["conflicts", "--open"]);
    assert_eq!(open["conflicts"].as_array().map(Vec::len), Some(1));
}

#[test]
fn selected_proposal_merges_after_resolution() {
    let dir = project();
    queue_overlapping_pair(dir.path());

    let mut args = vec!["resolve", "conflict:doc:pa+pb", "--select", "pa"];
    args.extend(AUTHORITY);
    let resolved = json_ok(dir.path(), &args);
    assert_eq!(resolved["cancelled"], "pb");
    assert_eq!(resolved["resolution"]["kind"], "select");

    let merged = json_ok(dir.path(), &["merge", "doc", "pa"]);
    assert_eq!(merged["resource_commit"], "doc@1");

    let queue = json_ok(dir.path(), &["queue", "doc"]);
    assert_eq!(queue["entries"], serde_json::json!([]));
    assert_eq!(queue["head_hash"], merged["head_hash"]);

    assert_eq!(json_err(dir.path(), &["resolve", "conflict:doc:pa+pb", "--fork", "pb", "--reason", "x", "--sig", "s"]), "E4008");
    fil(dir.path()).arg("verify").assert().success();
}

#[test]
fn fork_resolution_moves_the_proposal_to_a_branch() {
    let dir = project();
    queue_overlapping_pair(dir.path());

    let mut args = vec!["resolve", "conflict:doc:pa+pb", "--fork", "pb"];
    args.extend(AUTHORITY);
    let resolved = json_ok(dir.path(), &args);
    assert_eq!(resolved["fork"], "doc~pb");

    let branch = json_ok(dir.path(), &["log", "doc~pb"]);
    let ops: Vec<&str> = branch
        .as_array()
        .expect("rows")
        .iter()
        .map(|r| r["op"].as_str().unwrap_or_default())
        .collect();
    assert_eq!(ops, ["fork", "proposal_merge"]);

    json_ok(dir.path(), &["merge", "doc", "pa"]);
}

#[test]
fn stale_base_is_refused() {
    let dir = project();
    let base = head_hash(dir.path(), "doc");
    json_ok(dir.path(), &["write", "doc", "title=Moved"]);
    json_ok(
        dir.path(),
        &["enqueue", "doc", "p1", "--task", "t1", "--loci", "A1", "--base", &base],
    );
    assert_eq!(json_err(dir.path(), &["merge", "doc", "p1"]), "E4002");
}

#[test]
fn enqueue_without_loci_or_base_is_rejected() {
    let dir = project();
    assert_eq!(
        json_err(dir.path(), &["enqueue", "doc", "p1", "--task", "t1", "--base", "head"]),
        "E3001"
    );
    assert_eq!(
        json_err(dir.path(), &["enqueue", "doc", "p1", "--task", "t1", "--loci", "A1"]),
        "E3002"
    );
}

#[test]
fn reorder_and_cancel_need_authority() {
    let dir = project();
    json_ok(dir.path(), &["enqueue", "doc", "p1", "--task", "t1", "--loci", "A1", "--base", "head"]);
    json_ok(dir.path(), &["enqueue", "doc", "p2", "--task", "t2", "--loci", "B1", "--base", "head"]);

    assert_eq!(json_err(dir.path(), &["reorder", "doc", "p2"]), "E4003");
    let mut args = vec!["reorder", "doc", "p2"];
    args.extend(AUTHORITY);
    let reordered = json_ok(dir.path(), &args);
    assert_eq!(reordered["order"], serde_json::json!(["p2", "p1"]));

    assert_eq!(json_err(dir.path(), &["cancel", "doc", "p1"]), "E4003");
    let mut args = vec!["cancel", "doc", "p1"];
    args.extend(AUTHORITY);
    json_ok(dir.path(), &args);
    assert_eq!(json_err(dir.path(), &["merge", "doc", "p1"]), "E4001");
}

// ---------------------------------------------------------------------------
// Replay and verify
// ---------------------------------------------------------------------------

#[test]
fn replay_matches_the_journal_projection() {
    let dir = project();
    for i in 0..10 {
        json_ok(dir.path(), &["write", "doc", &format!("k{}={i}", i % 4)]);
    }
    let replay = json_ok(dir.path(), &["replay", "doc"]);
    let row = &replay["resources"][0];
    assert_eq!(row["status"]["status"], "match");
    assert_eq!(row["applied"], 10);
    assert_eq!(row["replay_hash"], row["live_hash"]);

    let window = json_ok(dir.path(), &["replay", "doc", "--from", "0", "--to", "3"]);
    assert_eq!(window["resources"][0]["applied"], 4);
    assert_eq!(window["resources"][0]["status"]["status"], "match");

    let tail = json_ok(dir.path(), &["replay", "doc", "--from", "6"]);
    assert_eq!(tail["resources"][0]["applied"], 4);
    assert_eq!(tail["resources"][0]["status"]["status"], "match");
}

#[test]
fn module_window_is_compared_at_its_cut() {
    let dir = project();
    json_ok(dir.path(), &["write", "alpha", "status=open"]);
    json_ok(dir.path(), &["write", "beta", "status=open"]);
    json_ok(dir.path(), &["write", "alpha", "status=closed", "owner=ann"]);

    let report = json_ok(
        dir.path(),
        &["replay", "alpha", "beta", "--module", "ingest", "--to", "1"],
    );
    let stages = report["stages"].as_array().expect("stages");
    assert!(stages.iter().all(|s| s["status"] == "match"), "{stages:?}");
    assert_eq!(report["divergences"], serde_json::json!([]));
}

#[test]
fn drift_is_reported_and_recorded_not_repaired() {
    let dir = project();
    json_ok(dir.path(), &["write", "doc", "a=1", "b=2"]);
    let live = dir.path().join("live.json");
    fs::write(&live, r#"{"doc": {"a": 1, "b": 3}}"#).expect("write live");
    let live_arg = live.to_str().expect("utf8 path");

    let output = fil(dir.path())
        .args(["replay", "doc", "--live", live_arg, "--record", "--json"])
        .output()
        .expect("run fil");
    assert!(!output.status.success());
    let report: Value = serde_json::from_slice(&output.stdout).expect("json");
    let row = &report["resources"][0];
    assert_eq!(row["status"]["keys"], serde_json::json!(["b"]));
    let id = row["divergence"].as_str().expect("divergence id").to_string();
    assert!(id.starts_with("div-"));

    // Recording twice does not duplicate the record.
    fil(dir.path())
        .args(["replay", "doc", "--live", live_arg, "--record"])
        .assert()
        .failure();
    let records = json_ok(dir.path(), &["log", "divergence:doc"]);
    assert_eq!(records.as_array().map(Vec::len), Some(1));

    // The resource itself is untouched.
    json_ok(dir.path(), &["replay", "doc"]);
}

#[test]
fn module_replay_reports_every_stage() {
    let dir = project();
    json_ok(dir.path(), &["write", "alpha", "status=open", "pkt.size=3"]);
    json_ok(dir.path(), &["write", "beta", "status=open", "owner=bob"]);

    let report = json_ok(
        dir.path(),
        &["replay", "alpha", "beta", "--module", "ingest", "--packet-prefix", "pkt."],
    );
    let stages = report["stages"].as_array().expect("stages");
    assert_eq!(stages.len(), 6);
    assert!(stages.iter().all(|s| s["status"] == "match"));
    assert_eq!(report["divergences"], serde_json::json!([]));
    assert_eq!(report["within_budget"], true);

    let without_prefix = json_ok(dir.path(), &["replay", "alpha", "beta", "--module", "ingest"]);
    let packets = without_prefix["stages"]
        .as_array()
        .expect("stages")
        .iter()
        .find(|s| s["stage"] == "packets")
        .cloned()
        .expect("packets stage");
    assert_eq!(packets["vacuous"], true);
}

#[test]
fn torn_journal_tail_is_ignored_then_repaired() {
    let dir = project();
    json_ok(dir.path(), &["write", "doc", "a=1"]);
    let journal = dir.path().join(".filament/journal.jsonl");
    let mut file = OpenOptions::new().append(true).open(&journal).expect("open");
    file.write_all(br#"{"filament_id":"doc","commit_in"#).expect("tear");
    drop(file);

    assert_eq!(json_ok(dir.path(), &["log"]).as_array().map(Vec::len), Some(1));
    let verified = json_ok(dir.path(), &["verify", "--repair"]);
    assert_eq!(verified["repaired_bytes"], 31);
    assert_eq!(verified["ok"], true);

    json_ok(dir.path(), &["write", "doc", "b=2"]);
    assert_eq!(json_ok(dir.path(), &["log"]).as_array().map(Vec::len), Some(2));
}

#[test]
fn tampered_journal_line_is_corrupt() {
    let dir = project();
    json_ok(dir.path(), &["write", "doc", "a=1"]);
    let journal = dir.path().join(".filament/journal.jsonl");
    let content = fs::read_to_string(&journal).expect("read");
    fs::write(&journal, content.replace(r#""a":1"#, r#""a":2"#)).expect("tamper");

    assert_eq!(json_err(dir.path(), &["verify"]), "E5001");
}

#[test]
fn timing_report_goes_to_stderr() {
    let dir = project();
    fil(dir.path())
        .args(["--timing", "log"])
        .assert()
        .success()
        .stderr(predicate::str::contains("cmd.log"));
}
