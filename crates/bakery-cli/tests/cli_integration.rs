use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn bakery() -> Command {
    let mut cmd = Command::cargo_bin("bakery").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("BAKERY_CONFIG")
        .env_remove("BAKERY_UNDEFINED");
    cmd
}

#[test]
fn test_help_exits_zero() {
    bakery()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("bakery"));
}

#[test]
fn test_unknown_subcommand() {
    bakery()
        .arg("totally-fake-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_tokenize_text() {
    bakery()
        .args(["tokenize", "Echo,\"a,b\",c"])
        .assert()
        .success()
        .stdout(predicate::str::contains("opcode: Echo (builtin)"))
        .stdout(predicate::str::contains("#1: a,b"));
}

#[test]
fn test_tokenize_json() {
    let assert = bakery()
        .args(["--format", "json", "tokenize", "FileCopy,a.txt,b.txt"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["opcode"]["name"], "FileCopy");
    assert_eq!(value["operands"][1], "b.txt");
}

#[test]
fn test_tokenize_odd_quotes_is_parse_error() {
    bakery()
        .args(["tokenize", "Echo,\"a"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Malformed command"));
}

#[test]
fn test_check_valid_script() {
    bakery()
        .args(["check", fixture_path("hello.script").to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 section(s) checked, 0 error(s)"));
}

#[test]
fn test_check_reports_every_broken_section() {
    bakery()
        .args(["check", fixture_path("broken.script").to_str().unwrap()])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("[End] does not match any [Begin]"))
        .stdout(predicate::str::contains("[Begin] must be matched with [End]"))
        .stdout(predicate::str::contains("2 error(s)"));
}

#[test]
fn test_check_single_section() {
    bakery()
        .args([
            "check",
            fixture_path("broken.script").to_str().unwrap(),
            "--section",
            "Other",
        ])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("1 section(s) checked, 1 error(s)"));
}

#[test]
fn test_compile_text_tree() {
    bakery()
        .args(["compile", fixture_path("hello.script").to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("IfCompact,Equal,%Name%,World\n  Echo,\"Greeting, done\""))
        .stdout(predicate::str::contains("ElseCompact\n  Echo,Unexpected"));
}

#[test]
fn test_compile_json_tree() {
    let assert = bakery()
        .args([
            "-f",
            "json",
            "compile",
            fixture_path("hello.script").to_str().unwrap(),
            "--section",
            "Process",
        ])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let tree: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let nodes = tree.as_array().unwrap();
    assert_eq!(nodes[1]["opcode"]["name"], "IfCompact");
    assert_eq!(nodes[1]["body"][0]["operands"][0], "Greeting, done");
}

#[test]
fn test_compile_missing_section() {
    bakery()
        .args([
            "compile",
            fixture_path("hello.script").to_str().unwrap(),
            "--section",
            "Nowhere",
        ])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Section [Nowhere] not found"));
}

#[test]
fn test_run_script() {
    bakery()
        .args(["run", fixture_path("hello.script").to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("[Success] Hello World"))
        .stdout(predicate::str::contains("Greeting, done"))
        .stdout(predicate::str::contains("1 script(s), 0 error(s)"));
}

#[test]
fn test_run_single_section_with_params() {
    bakery()
        .args([
            "run",
            fixture_path("hello.script").to_str().unwrap(),
            "--section",
            "Greet",
            "--param",
            "Bob",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Hi Bob"))
        .stdout(predicate::str::contains("Hello World").not());
}

#[test]
fn test_run_project_with_macros() {
    bakery()
        .args(["run", fixture_path("project").to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("from main!"))
        .stdout(predicate::str::contains("project dir found"));
}

#[test]
fn test_run_halt_exits_three() {
    bakery()
        .args(["run", fixture_path("halt.script").to_str().unwrap()])
        .assert()
        .code(3)
        .stdout(predicate::str::contains("before"))
        .stdout(predicate::str::contains("after").not())
        .stderr(predicate::str::contains("Build halted: giving up"));
}

#[test]
fn test_run_writes_jsonl_log() {
    let log = std::env::temp_dir().join(format!("bakery-cli-{}.jsonl", std::process::id()));
    bakery()
        .args([
            "run",
            fixture_path("hello.script").to_str().unwrap(),
            "--log-file",
            log.to_str().unwrap(),
        ])
        .assert()
        .success();

    let text = std::fs::read_to_string(&log).unwrap();
    let entries: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(entries.iter().any(|e| e["message"] == "Hello World" && e["state"] == "Success"));
    let _ = std::fs::remove_file(&log);
}

#[test]
fn test_run_literal_undefined_flag() {
    let assert = bakery()
        .args([
            "-f",
            "json",
            "run",
            fixture_path("hello.script").to_str().unwrap(),
            "--section",
            "Greet",
            "--undefined",
            "literal",
        ])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert!(stdout.lines().all(|line| serde_json::from_str::<serde_json::Value>(line).is_ok()));
    assert!(stdout.contains("\"Hi #1\""));
}

#[test]
fn test_run_nonexistent_path() {
    bakery()
        .args(["run", "nonexistent_file_that_does_not_exist.script"])
        .assert()
        .code(4);
}

#[test]
fn test_bad_config_file() {
    bakery()
        .args([
            "--config",
            "/nonexistent/bakery/config.json",
            "tokenize",
            "Echo,x",
        ])
        .assert()
        .code(4);
}
