#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn write_config(contents: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("keyclaim.toml");
    fs::write(&path, contents).expect("write config");
    (dir, path)
}

const FAST: &str = r#"
[instance]
timestamp_resolution = "micro"

[locking]
wait_ms = 2
expire_ms = 10000

[ids]
block_size = 50
authority_wait_ms = 2
partition_bound = 8

[placement]
concurrent_partitions = 2
seed = 7
"#;

fn json(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("json output")
}

#[test]
fn config_prints_effective_toml() {
    let (_dir, path) = write_config(FAST);
    let output = cargo_bin_cmd!("keyclaim")
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    assert!(text.contains("wait_ms = 2"), "{text}");
    assert!(text.contains("retry_count = 3"), "{text}");
    assert!(text.contains("partition_bound = 8"), "{text}");
}

#[test]
fn invalid_config_is_rejected() {
    let (_dir, path) = write_config("[locking]\nwait_ms = 10\nexpire_ms = 5\n");
    let output = cargo_bin_cmd!("keyclaim")
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8_lossy(&output);
    assert!(stderr.contains("expire_ms"), "{stderr}");
}

#[test]
fn allocate_reports_disjoint_blocks() {
    let (_dir, path) = write_config(FAST);
    let output = cargo_bin_cmd!("keyclaim")
        .arg("--config")
        .arg(&path)
        .args(["--format", "json", "allocate", "--instances", "3", "--blocks", "2"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report = json(&output);
    assert_eq!(report["disjoint"], Value::Bool(true));
    let blocks = report["blocks"].as_array().unwrap();
    assert_eq!(blocks.len(), 6);
    let starts: Vec<u64> = blocks.iter().map(|b| b["start"].as_u64().unwrap()).collect();
    assert_eq!(starts, vec![0, 50, 100, 150, 200, 250]);
}

#[test]
fn contend_has_exactly_one_winner() {
    let (_dir, path) = write_config(FAST);
    let output = cargo_bin_cmd!("keyclaim")
        .arg("--config")
        .arg(&path)
        .args(["--format", "json", "contend", "--instances", "4"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report = json(&output);
    assert_eq!(report["winner"], Value::String("instance-0".into()));
    let held = report["outcomes"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|o| o["held"] == Value::Bool(true))
        .count();
    assert_eq!(held, 1);
}

#[test]
fn place_uses_property_strategy() {
    let (_dir, path) = write_config(
        "[ids]\npartition_bound = 16\n[placement]\nstrategy = \"property\"\npartition_key = \"tenant\"\nconcurrent_partitions = 4\n",
    );
    let output = cargo_bin_cmd!("keyclaim")
        .arg("--config")
        .arg(&path)
        .args(["--format", "json", "place", "--count", "5", "--value", "acme"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report = json(&output);
    let partitions: Vec<u64> = report["partitions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p.as_u64().unwrap())
        .collect();
    assert_eq!(partitions.len(), 5);
    assert!(partitions.iter().all(|p| *p == partitions[0] && *p < 16));
}
