//! CLI integration tests for tally call / parse-json / functions / trace.
//!
//! These tests invoke the compiled binary to verify end-to-end behavior.

use std::path::Path;
use std::process::{Command, Output};

fn tally_bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_tally"))
}

fn run(args: &[&str]) -> Output {
    tally_bin().args(args).output().expect("run binary")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn write_connector(dir: &Path) {
    std::fs::write(
        dir.join("connector.json"),
        r#"{"functions": [
            {"name": "Lookup", "params": [{"name": "key", "type": "String"}]},
            {"name": "Broken", "params": []}
        ]}"#,
    )
    .expect("write manifest");
    std::fs::write(dir.join("Lookup.json"), r#"{"value": 0.1000000000000000000000000001}"#)
        .expect("write response");
}

#[test]
fn cli_call_builtin() {
    let output = run(&["call", "ParseJSON", r#""{\"a\": [1, 2, 3]}""#]);
    assert!(
        output.status.success(),
        "tally call should succeed, stderr: {}",
        stderr(&output)
    );
    assert_eq!(stdout(&output).trim(), r#"{"a":[1,2,3]}"#);
}

#[test]
fn cli_call_with_fixed_clock_and_timezone() {
    let output = run(&[
        "call",
        "Now",
        "--now",
        "2024-01-01T12:00:00Z",
        "--timezone=-05:00",
    ]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output).trim(), "2024-01-01T07:00:00-05:00");
}

#[test]
fn cli_seeded_rand_repeats() {
    let args = ["call", "Rand", "--seed", "17", "--result-type", "Decimal"];
    let first = run(&args);
    let second = run(&args);
    assert!(first.status.success(), "stderr: {}", stderr(&first));
    assert_eq!(stdout(&first), stdout(&second));
    assert!(stdout(&first).trim().starts_with("0."));
}

#[test]
fn cli_error_value_exits_nonzero() {
    let output = run(&["call", "ParseJSON", r#""{oops""#]);
    assert!(!output.status.success());
    assert!(
        stderr(&output).contains("InvalidArgument"),
        "stderr should name the error kind: {}",
        stderr(&output)
    );
}

#[test]
fn cli_unknown_function() {
    let output = run(&["call", "NoSuchThing"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("unknown or unsupported function"));
}

#[test]
fn cli_rejects_non_json_argument() {
    let output = run(&["call", "ParseJSON", "not json"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("not a JSON literal"));
}

#[test]
fn cli_connector_call_and_raw() {
    let dir = tempfile::tempdir().expect("create tempdir");
    write_connector(dir.path());
    let connector = format!("Store={}", dir.path().display());

    let parsed = run(&["call", "Store.Lookup", r#""k""#, "--connector", &connector]);
    assert!(parsed.status.success(), "stderr: {}", stderr(&parsed));
    assert_eq!(stdout(&parsed).trim(), r#"{"value":0.1000000000000000000000000001}"#);

    let raw = run(&["call", "Store.Lookup", r#""k""#, "--connector", &connector, "--raw"]);
    assert!(raw.status.success(), "stderr: {}", stderr(&raw));
    assert!(stdout(&raw).trim().starts_with('"'));
}

#[test]
fn cli_connector_failure_and_throw() {
    let dir = tempfile::tempdir().expect("create tempdir");
    write_connector(dir.path());
    let connector = format!("Store={}", dir.path().display());

    let as_value = run(&["call", "Broken", "--namespace", "Store", "--connector", &connector]);
    assert!(!as_value.status.success());
    assert!(stderr(&as_value).contains("ExternalFailure"), "{}", stderr(&as_value));

    let thrown = run(&[
        "call",
        "Store.Broken",
        "--connector",
        &connector,
        "--throw-on-error",
    ]);
    assert!(!thrown.status.success());
    assert!(stderr(&thrown).contains("Error: ExternalFailure"), "{}", stderr(&thrown));
}

#[test]
fn cli_functions_lists_builtins_and_connectors() {
    let dir = tempfile::tempdir().expect("create tempdir");
    write_connector(dir.path());
    let connector = format!("Store={}", dir.path().display());
    let output = run(&["functions", "--connector", &connector]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(
        out.contains("Index(Untyped, Number)\tinvariant: Index\tenums: none"),
        "{out}"
    );
    assert!(
        out.contains("Store.Lookup(String)\tinvariant: Lookup\tenums: none"),
        "{out}"
    );
}

#[test]
fn cli_parse_json_file() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let file = dir.path().join("doc.json");
    std::fs::write(&file, r#"[true, null]"#).expect("write json");
    let output = run(&["parse-json", file.to_str().unwrap()]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output).trim(), "[true,null]");

    std::fs::write(&file, "[").expect("write json");
    let output = run(&["parse-json", file.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("not valid JSON"));
}

#[test]
fn cli_call_with_trace_and_summary() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let trace = dir.path().join("trace.jsonl");

    let output = run(&[
        "call",
        "RandBetween",
        "1",
        "6",
        "--seed",
        "3",
        "--trace",
        trace.to_str().unwrap(),
    ]);
    assert!(
        output.status.success(),
        "tally call --trace should succeed, stderr: {}",
        stderr(&output)
    );

    let content = std::fs::read_to_string(&trace).expect("read trace file");
    let lines: Vec<serde_json::Value> = content
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_str(l).expect("parse JSONL line"))
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[1]["function"], "RandBetween");
    assert_eq!(lines[1]["output"]["status"], "ok");
    assert_eq!(lines[2]["program_status"], "success");

    let summary = run(&["trace", trace.to_str().unwrap()]);
    assert!(summary.status.success(), "stderr: {}", stderr(&summary));
    let out = stdout(&summary);
    assert!(out.contains("Trace summary: 1 calls"), "{out}");
    assert!(out.contains("[0] RandBetween - ok"), "{out}");
}
