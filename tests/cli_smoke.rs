//! Behavioural smoke tests for the `contractor` CLI.

use std::io::Write;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use tempfile::NamedTempFile;

fn document(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write document");
    file
}

#[test]
fn cli_without_arguments_prints_help() {
    let mut cmd = cargo_bin_cmd!("contractor");
    cmd.assert().failure().stderr(contains("Usage"));
}

#[test]
fn cli_graph_prints_execution_order() {
    let mut cmd = cargo_bin_cmd!("contractor");
    cmd.arg("graph");

    cmd.assert().success().stdout(
        "keypair\nrouter\nnetwork\nsecurity_group\nsubnet\nrouter_interface\nbeachhead\ninstance\n",
    );
}

#[test]
fn cli_run_rejects_unknown_environment() {
    let file = document(r#"{ "environments": { "prod": {}, "staging": {} } }"#);
    let mut cmd = cargo_bin_cmd!("contractor");
    cmd.arg("run")
        .args(["--environment", "qa", "--config"])
        .arg(file.path());

    cmd.assert()
        .code(1)
        .stderr(contains("environment `qa` is not defined (available: prod, staging)"));
}

#[test]
fn cli_run_reports_unreadable_document() {
    let mut cmd = cargo_bin_cmd!("contractor");
    cmd.args(["run", "--environment", "prod", "--config", "/nonexistent/env.json"]);

    cmd.assert()
        .code(1)
        .stderr(contains("failed to read"));
}
