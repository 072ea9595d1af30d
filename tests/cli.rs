//! CLI test cases, run against the offline `echo` backend.

use std::{path::Path, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("distill").unwrap()
}

/// Set up a scratch workspace: a config with an echo model and a small
/// JSONL input. Returns the config path and the input path.
fn workspace(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let config_path = dir.join("distill.toml");
    std::fs::write(
        &config_path,
        format!(
            "state_dir = {:?}\n\n[models.stub]\nkind = \"echo\"\n",
            dir.join("state").to_string_lossy()
        ),
    )
    .unwrap();

    let input_path = dir.join("input.jsonl");
    std::fs::write(
        &input_path,
        "{\"instruction\":\"What is distillation?\"}\n\
         {\"instruction\":\"Why checkpoints?\"}\n\
         {\"instruction\":\"How fast is it?\"}\n",
    )
    .unwrap();
    (config_path, input_path)
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_start_report_tasks_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (config, input) = workspace(dir.path());
    let output = dir.path().join("out.jsonl");

    let assert = cmd()
        .arg("start")
        .arg("--config")
        .arg(&config)
        .arg("--input")
        .arg(&input)
        .arg("--strategy")
        .arg("q_to_a")
        .arg("--model")
        .arg("stub")
        .arg("--out")
        .arg(&output)
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let task_id = stdout.lines().next().expect("start prints the task id");

    // Output and its sibling files exist.
    assert_eq!(std::fs::read_to_string(&output).unwrap().lines().count(), 3);
    assert!(dir.path().join("checkpoint.json").exists());
    assert!(dir.path().join("quality_report.json").exists());
    assert!(dir.path().join("task_params.json").exists());

    cmd()
        .arg("report")
        .arg("--config")
        .arg(&config)
        .arg(task_id)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"quality_passed_items\": 3"))
        .stdout(predicate::str::contains("\"total_input_items\": 3"));

    cmd()
        .arg("tasks")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains(task_id))
        .stdout(predicate::str::contains("completed"));
}

#[test]
fn test_resume_completed_task_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let (config, input) = workspace(dir.path());
    let output = dir.path().join("out.jsonl");

    let assert = cmd()
        .arg("start")
        .arg("--config")
        .arg(&config)
        .arg("--input")
        .arg(&input)
        .arg("--strategy")
        .arg("enhance")
        .arg("--model")
        .arg("stub")
        .arg("--target-field")
        .arg("instruction")
        .arg("--out")
        .arg(&output)
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let task_id = stdout.lines().next().unwrap();
    let first_run = std::fs::read_to_string(&output).unwrap();

    cmd()
        .arg("resume")
        .arg("--config")
        .arg(&config)
        .arg(task_id)
        .assert()
        .success();
    // Nothing was regenerated.
    assert_eq!(std::fs::read_to_string(&output).unwrap(), first_run);
}

#[test]
fn test_quality_failures_do_not_fail_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let (config, input) = workspace(dir.path());
    let output = dir.path().join("out.jsonl");

    // The echo backend returns the whole prompt, which never matches a
    // label, so every record is a quality failure.
    let assert = cmd()
        .arg("start")
        .arg("--config")
        .arg(&config)
        .arg("--input")
        .arg(&input)
        .arg("--strategy")
        .arg("classify_label")
        .arg("--model")
        .arg("stub")
        .arg("--labels")
        .arg("pos,neg")
        .arg("--target-field")
        .arg("instruction")
        .arg("--out")
        .arg(&output)
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let task_id = stdout.lines().next().unwrap();

    assert_eq!(std::fs::read_to_string(&output).unwrap().lines().count(), 0);
    cmd()
        .arg("report")
        .arg("--config")
        .arg(&config)
        .arg(task_id)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"quality_pass_rate\": 0.0"));
}

#[test]
fn test_unknown_model_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let (config, input) = workspace(dir.path());

    cmd()
        .arg("start")
        .arg("--config")
        .arg(&config)
        .arg("--input")
        .arg(&input)
        .arg("--strategy")
        .arg("q_to_a")
        .arg("--model")
        .arg("nope")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_missing_labels_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let (config, input) = workspace(dir.path());

    cmd()
        .arg("start")
        .arg("--config")
        .arg(&config)
        .arg("--input")
        .arg(&input)
        .arg("--strategy")
        .arg("classify_label")
        .arg("--model")
        .arg("stub")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_report_on_unknown_task_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let (config, _input) = workspace(dir.path());

    cmd()
        .arg("report")
        .arg("--config")
        .arg(&config)
        .arg("no-such-task")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_models_lists_the_registry() {
    let dir = tempfile::tempdir().unwrap();
    let (config, _input) = workspace(dir.path());

    cmd()
        .arg("models")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("stub"))
        .stdout(predicate::str::contains("echo"));
}
