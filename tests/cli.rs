//! End-to-end tests of the `gtest-sieve` binary.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn sieve(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("gtest-sieve").unwrap();
    cmd.current_dir(dir.path()).env("RUST_LOG", "warn");
    cmd
}

fn write_config(dir: &TempDir, extra: &str) {
    let config = format!(
        r#"
[sieve]
binary = "{}"
wrapper = ["sh"]
filter_file = "unit.filter.json"
workers = 2
max_runs = 3

{}
"#,
        fixture("fake_gtest.sh").display(),
        extra
    );
    std::fs::write(dir.path().join("sieve.toml"), config).unwrap();
}

#[test]
fn test_validate_accepts_minimal_config() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "");

    sieve(&dir)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Provider: local"));
}

#[test]
fn test_validate_rejects_zero_workers() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("sieve.toml"),
        "[sieve]\nbinary = \"./unit_tests\"\nworkers = 0\n",
    )
    .unwrap();

    sieve(&dir)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("sieve.workers must be at least 1"));
}

#[test]
fn test_init_writes_loadable_config() {
    let dir = TempDir::new().unwrap();

    sieve(&dir)
        .args(["init", "--binary", "./out/base_unittests"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created sieve.toml"));

    let written = std::fs::read_to_string(dir.path().join("sieve.toml")).unwrap();
    let config = gtest_sieve::config::load_config_str(&written).unwrap();
    assert_eq!(config.sieve.binary, "./out/base_unittests");
    gtest_sieve::config::validate(&config).unwrap();

    sieve(&dir).arg("init").assert().failure();
}

#[test]
fn test_list_prints_enumerated_tests() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "");

    sieve(&dir)
        .args(["list", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""Math": ["#))
        .stdout(predicate::str::contains("Subtracts"))
        .stdout(predicate::str::contains("Fails"));
}

#[test]
fn test_run_filters_failing_suite_and_stabilises() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "[report]\noutput_dir = \"reports\"\n");

    sieve(&dir)
        .arg("run")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("Suite is stable."));

    let filter: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("unit.filter.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(filter["failing_tests"], serde_json::json!(["Net.*"]));

    let junit = std::fs::read_to_string(dir.path().join("reports").join("junit.xml")).unwrap();
    assert!(junit.contains(r#"tests="2" failures="0""#));

    sieve(&dir)
        .args(["list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Math.Adds"))
        .stdout(predicate::str::contains("Net.Fails").not());
}

#[test]
fn test_run_exhausts_budget_with_single_run() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "[report]\njunit = false\n");

    sieve(&dir)
        .args(["run", "--max-runs", "1"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Run budget exhausted"));

    assert!(dir.path().join("unit.filter.json").exists());
    assert!(!dir.path().join("test-results").exists());
}
