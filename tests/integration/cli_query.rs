#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::{json, Value};
use tempfile::TempDir;

fn write_fixture(dir: &Path) -> (PathBuf, PathBuf) {
    let data = dir.join("docs.jsonl");
    let lines: Vec<String> = (0..60)
        .map(|i| json!({"id": format!("{i}"), "pk": format!("p{}", i % 9), "n": i}).to_string())
        .collect();
    fs::write(&data, lines.join("\n")).expect("write data");

    let query = dir.join("query.json");
    fs::write(
        &query,
        json!({
            "plan": {
                "query": "SELECT * FROM r WHERE r.n < 30 ORDER BY r.n",
                "order_by": [{"expression": "r.n", "order": "ascending"}]
            },
            "local": {
                "filter": [{"path": "r.n", "op": "lt", "value": 30}]
            }
        })
        .to_string(),
    )
    .expect("write query");
    (data, query)
}

fn run_json(args: &[&str]) -> Value {
    let output = cargo_bin_cmd!("docquery")
        .args(args)
        .env_remove("DOCQUERY_CONFIG")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("json output")
}

#[test]
fn run_prints_ordered_pages_as_json() {
    let dir = TempDir::new().expect("tempdir");
    let (data, query) = write_fixture(dir.path());
    let config = dir.path().join("none.toml");
    let report = run_json(&[
        "--format",
        "json",
        "--config",
        config.to_str().unwrap(),
        "run",
        "--data",
        data.to_str().unwrap(),
        "--query",
        query.to_str().unwrap(),
        "--partitions",
        "3",
        "--page-size",
        "8",
    ]);

    let pages = report["pages"].as_array().unwrap();
    assert_eq!(pages.len(), 4);
    let numbers: Vec<i64> = pages
        .iter()
        .flat_map(|page| page["items"].as_array().unwrap().iter())
        .map(|item| item["n"].as_i64().unwrap())
        .collect();
    assert_eq!(numbers, (0..30).collect::<Vec<_>>());
    assert_eq!(report["continuation"], Value::Null);
    assert_eq!(report["pipeline"], json!("Specialized(OrderByMerge)"));
}

#[test]
fn run_resumes_from_a_printed_token() {
    let dir = TempDir::new().expect("tempdir");
    let (data, query) = write_fixture(dir.path());
    let config = dir.path().join("none.toml");
    let base = [
        "--format",
        "json",
        "--config",
        config.to_str().unwrap(),
        "run",
        "--data",
        data.to_str().unwrap(),
        "--query",
        query.to_str().unwrap(),
        "--page-size",
        "10",
    ];
    let mut first_args = base.to_vec();
    first_args.extend(["--pages", "1"]);
    let first = run_json(&first_args);
    let token = first["continuation"].as_str().unwrap().to_owned();

    let mut rest_args = base.to_vec();
    rest_args.extend(["--continuation", token.as_str()]);
    let rest = run_json(&rest_args);
    let numbers: Vec<i64> = rest["pages"]
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|page| page["items"].as_array().unwrap().iter())
        .map(|item| item["n"].as_i64().unwrap())
        .collect();
    assert_eq!(numbers, (10..30).collect::<Vec<_>>());
}

#[test]
fn profiles_supply_defaults() {
    let dir = TempDir::new().expect("tempdir");
    let (data, query) = write_fixture(dir.path());
    let config = dir.path().join("cli.toml");
    fs::write(
        &config,
        "default_profile = \"small\"\n\n[profiles.small]\npartitions = 2\npage_size = 5\nmax_concurrency = 0\n",
    )
    .expect("write config");

    let report = run_json(&[
        "--format",
        "json",
        "--config",
        config.to_str().unwrap(),
        "run",
        "--data",
        data.to_str().unwrap(),
        "--query",
        query.to_str().unwrap(),
    ]);
    assert_eq!(report["pages"].as_array().unwrap().len(), 6);

    let listed = run_json(&["--format", "json", "--config", config.to_str().unwrap(), "profiles"]);
    assert_eq!(listed[0]["name"], json!("small"));
}

#[test]
fn explain_reports_the_pipeline() {
    let dir = TempDir::new().expect("tempdir");
    let (data, query) = write_fixture(dir.path());
    let config = dir.path().join("none.toml");
    let output = cargo_bin_cmd!("docquery")
        .args([
            "--config",
            config.to_str().unwrap(),
            "explain",
            "--data",
            data.to_str().unwrap(),
            "--query",
            query.to_str().unwrap(),
            "--partition-key",
            "\"p4\"",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    assert!(text.contains("pipeline: TryExecute"), "{text}");
    assert!(text.contains("targets: 1 of 4 ranges"), "{text}");
}

#[test]
fn malformed_continuation_fails_with_code() {
    let dir = TempDir::new().expect("tempdir");
    let (data, query) = write_fixture(dir.path());
    let config = dir.path().join("none.toml");
    let output = cargo_bin_cmd!("docquery")
        .args([
            "--config",
            config.to_str().unwrap(),
            "run",
            "--data",
            data.to_str().unwrap(),
            "--query",
            query.to_str().unwrap(),
            "--continuation",
            "garbage!",
        ])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let text = String::from_utf8(output).unwrap();
    assert!(text.contains("[BadRequest]"), "{text}");
}
