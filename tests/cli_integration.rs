//! Binary-level tests

mod common;

use assert_cmd::Command;
use predicates::prelude::*;

use common::temp_config_file;

#[test]
fn test_help_lists_commands() {
    let mut cmd = Command::cargo_bin("llamachat").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("chat"))
        .stdout(predicate::str::contains("bench"));
}

#[test]
fn test_bench_requires_model() {
    let mut cmd = Command::cargo_bin("llamachat").unwrap();
    cmd.arg("bench")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--model"));
}

#[test]
fn test_invalid_backend_in_config_is_rejected() {
    let (_dir, path) = temp_config_file("engine:\n  backend: onnx\n");
    let mut cmd = Command::cargo_bin("llamachat").unwrap();
    cmd.env_remove("LLAMACHAT_ENGINE_BACKEND")
        .arg("--config")
        .arg(&path)
        .arg("bench")
        .arg("--model")
        .arg("tiny.gguf")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid engine backend: onnx"));
}

#[test]
fn test_bench_with_scripted_backend_prints_table() {
    let (dir, path) = temp_config_file("engine:\n  backend: scripted\n");
    let session = dir.path().join("llama-session.bin");
    let mut cmd = Command::cargo_bin("llamachat").unwrap();
    cmd.env("LLAMACHAT_SESSION_PATH", &session)
        .arg("--config")
        .arg(&path)
        .arg("bench")
        .arg("--model")
        .arg("tiny.gguf")
        .assert()
        .success()
        .stdout(predicate::str::contains("Context initialized!"))
        .stdout(predicate::str::contains("Heat up time: "))
        .stdout(predicate::str::contains("| model | size | params | test | t/s |"));
}
