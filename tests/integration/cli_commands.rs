#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

const PEOPLE_NT: &str = "\
<http://ex/alice> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://ex/Person> .
<http://ex/bob> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://ex/Person> .
<http://ex/carol> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://ex/Person> .
<http://ex/rex> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://ex/Dog> .
<http://ex/alice> <http://ex/name> \"Alice\"@en .
";

const PERSONS: &str = "SELECT ?s WHERE { ?s a <http://ex/Person> } ORDER BY ?s";

fn setup() -> (TempDir, PathBuf, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let data = dir.path().join("people.nt");
    fs::write(&data, PEOPLE_NT).expect("write data");
    let config = dir.path().join("cli.toml");
    (dir, data, config)
}

fn stdout_of(output: &std::process::Output) -> String {
    String::from_utf8(output.stdout.clone()).expect("utf8 stdout")
}

#[test]
fn query_json_output_follows_sparql_results_layout() {
    let (_dir, data, config) = setup();
    let output = cargo_bin_cmd!("sparrow")
        .arg("--config")
        .arg(&config)
        .args(["query", PERSONS, "--format", "json", "--source"])
        .arg(&data)
        .assert()
        .success()
        .get_output()
        .clone();
    let doc: Value = serde_json::from_str(&stdout_of(&output)).expect("json output");
    assert_eq!(doc["head"]["vars"], serde_json::json!(["s"]));
    let bindings = doc["results"]["bindings"].as_array().expect("bindings");
    assert_eq!(bindings.len(), 3);
    assert_eq!(bindings[0]["s"]["type"], "uri");
    assert_eq!(bindings[0]["s"]["value"], "http://ex/alice");
}

#[test]
fn query_tsv_output_streams_terms() {
    let (_dir, data, config) = setup();
    let output = cargo_bin_cmd!("sparrow")
        .arg("--config")
        .arg(&config)
        .args([
            "query",
            "SELECT ?s ?n WHERE { ?s a <http://ex/Person> OPTIONAL { ?s <http://ex/name> ?n } } ORDER BY ?s",
            "--format",
            "tsv",
            "-s",
        ])
        .arg(&data)
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = stdout_of(&output);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[0], "?s\t?n");
    assert_eq!(lines[1], "<http://ex/alice>\t\"Alice\"@en");
    assert_eq!(lines[2], "<http://ex/bob>\t");
    assert_eq!(lines.len(), 4);
}

#[test]
fn limit_flag_overrides_query() {
    let (_dir, data, config) = setup();
    let output = cargo_bin_cmd!("sparrow")
        .arg("--config")
        .arg(&config)
        .args(["query", PERSONS, "--format", "tsv", "--limit", "1", "--source"])
        .arg(&data)
        .assert()
        .success()
        .get_output()
        .clone();
    assert_eq!(stdout_of(&output).lines().count(), 2);
}

#[test]
fn table_output_lists_rows() {
    let (_dir, data, config) = setup();
    let output = cargo_bin_cmd!("sparrow")
        .arg("--config")
        .arg(&config)
        .args(["query", PERSONS, "--source"])
        .arg(&data)
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = stdout_of(&output);
    assert!(stdout.contains("<http://ex/carol>"));
    assert!(stdout.contains("3 rows"));
}

#[test]
fn ask_and_construct_forms_print_their_results() {
    let (_dir, data, config) = setup();
    let output = cargo_bin_cmd!("sparrow")
        .arg("--config")
        .arg(&config)
        .args(["query", "ASK { ?s a <http://ex/Dog> }", "--source"])
        .arg(&data)
        .assert()
        .success()
        .get_output()
        .clone();
    assert_eq!(stdout_of(&output).trim(), "true");

    let output = cargo_bin_cmd!("sparrow")
        .arg("--config")
        .arg(&config)
        .args([
            "query",
            "CONSTRUCT { ?s <http://ex/tag> \"pet\" } WHERE { ?s a <http://ex/Dog> }",
            "--format",
            "ntriples",
            "--source",
        ])
        .arg(&data)
        .assert()
        .success()
        .get_output()
        .clone();
    assert_eq!(
        stdout_of(&output).trim(),
        "<http://ex/rex> <http://ex/tag> \"pet\" ."
    );
}

#[test]
fn query_text_can_come_from_a_file() {
    let (dir, data, config) = setup();
    let query_file = dir.path().join("persons.rq");
    fs::write(&query_file, PERSONS).expect("write query");
    let output = cargo_bin_cmd!("sparrow")
        .arg("--config")
        .arg(&config)
        .arg("query")
        .arg(format!("@{}", query_file.display()))
        .args(["--format", "tsv", "--source"])
        .arg(&data)
        .assert()
        .success()
        .get_output()
        .clone();
    assert_eq!(stdout_of(&output).lines().count(), 4);
}

#[test]
fn syntax_error_exits_with_failure() {
    let (_dir, data, config) = setup();
    let output = cargo_bin_cmd!("sparrow")
        .arg("--config")
        .arg(&config)
        .args(["query", "SELECT ?s WHERE { ?s ?p", "--source"])
        .arg(&data)
        .assert()
        .failure()
        .get_output()
        .clone();
    let stderr = String::from_utf8(output.stderr).expect("utf8 stderr");
    assert!(stderr.contains("error["));
}

#[test]
fn missing_sources_are_reported() {
    let (_dir, _data, config) = setup();
    cargo_bin_cmd!("sparrow")
        .arg("--config")
        .arg(&config)
        .args(["query", PERSONS])
        .assert()
        .failure();
}

#[test]
fn explain_prints_plan_without_running() {
    let (_dir, data, config) = setup();
    let output = cargo_bin_cmd!("sparrow")
        .arg("--config")
        .arg(&config)
        .args(["explain", PERSONS, "--redact", "--source"])
        .arg(&data)
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = stdout_of(&output);
    assert!(stdout.contains("Scan"));
    assert!(stdout.contains("plan_hash:"));
    assert!(!stdout.contains("http://ex/Person"));
}

#[test]
fn source_sets_and_defaults_come_from_config() {
    let (_dir, data, config) = setup();
    fs::write(
        &config,
        format!(
            "default_source_set = \"people\"\n\n[defaults]\nformat = \"tsv\"\n\n[source_sets.people]\nsources = [\"{}\"]\n",
            data.display()
        ),
    )
    .expect("write config");

    let output = cargo_bin_cmd!("sparrow")
        .arg("--config")
        .arg(&config)
        .args(["query", PERSONS])
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = stdout_of(&output);
    assert!(stdout.starts_with("?s\n"));
    assert_eq!(stdout.lines().count(), 4);

    let output = cargo_bin_cmd!("sparrow")
        .arg("--config")
        .arg(&config)
        .args(["config", "show"])
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = stdout_of(&output);
    assert!(stdout.contains("default_source_set"));
    assert!(stdout.contains("people.nt"));
}

#[test]
fn unknown_source_set_is_rejected() {
    let (_dir, data, config) = setup();
    cargo_bin_cmd!("sparrow")
        .arg("--config")
        .arg(&config)
        .args(["query", PERSONS, "--source-set", "nope", "--source"])
        .arg(&data)
        .assert()
        .failure();
}
