//! Integration tests for the pissm CLI.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use pissm_rs::PissmConfig;
use tempfile::TempDir;

/// Helper function to run the pissm CLI with given arguments.
fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("pissm").expect("Failed to find pissm binary");
    cmd.args(args);
    cmd
}

/// Write a small toy-linear config whose outputs land in `dir`.
fn create_small_config(dir: &Path) -> PathBuf {
    let mut config = PissmConfig::toy_linear_preset();
    config.system.horizon = 6;
    config.data.train_size = 8;
    config.data.valid_size = 4;
    config.data.test_size = 2;
    config.training.epochs = 1;
    config.training.batch_size = 4;
    config.output_dir = dir.join("outputs").to_string_lossy().into_owned();

    let config_path = dir.join("config.yaml");
    config.to_file(&config_path).expect("Failed to write test config");
    config_path
}

#[test]
fn test_init_writes_loadable_preset() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output = temp_dir.path().join("config.yaml");

    run_cli(&["init", output.to_str().unwrap(), "--preset", "toy-linear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration written"));

    let config = PissmConfig::from_file(&output).expect("Failed to load written config");
    assert_eq!(config.system.state_dim, 2);
    assert_eq!(config.system.obs_dim, 1);
}

#[test]
fn test_init_unknown_preset_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output = temp_dir.path().join("config.yaml");

    run_cli(&["init", output.to_str().unwrap(), "--preset", "no-such-preset"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown preset"));
    assert!(!output.exists());
}

#[test]
fn test_validate_command_valid_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_small_config(temp_dir.path());

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("Cell: pissm"));
}

#[test]
fn test_validate_command_mismatched_dimensions() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = PissmConfig::toy_linear_preset();
    config.model.observation_shape = vec![3];
    let config_path = temp_dir.path().join("config.yaml");
    config.to_file(&config_path).unwrap();

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn test_validate_command_missing_file() {
    run_cli(&["validate", "/nonexistent/config.yaml"])
        .assert()
        .failure();
}

#[test]
fn test_simulate_train_test_pipeline() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_small_config(temp_dir.path());
    let config = config_path.to_str().unwrap();
    let data = temp_dir.path().join("data.safetensors");
    let data = data.to_str().unwrap();

    run_cli(&["simulate", config, "--output", data])
        .assert()
        .success()
        .stdout(predicate::str::contains("Simulated data written"));
    assert!(Path::new(data).exists());

    run_cli(&["train", config, "--data", data])
        .assert()
        .success()
        .stdout(predicate::str::contains("Training complete (2 steps)"));

    let outputs = temp_dir.path().join("outputs");
    let checkpoint = outputs.join("checkpoint-final");
    assert!(checkpoint.join("training_state.json").exists());
    let history = fs::read_to_string(outputs.join("loss_history.json")).unwrap();
    let history: Vec<f64> = serde_json::from_str(&history).unwrap();
    assert_eq!(history.len(), 2);

    run_cli(&[
        "test",
        config,
        "--checkpoint",
        checkpoint.to_str().unwrap(),
        "--data",
        data,
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("Test RMSE"));
}

#[test]
fn test_train_resume_from_checkpoint() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_small_config(temp_dir.path());
    let config = config_path.to_str().unwrap();

    run_cli(&["train", config]).assert().success();

    // Same run extended to two epochs: only the second one is trained.
    let mut longer = PissmConfig::from_file(&config_path).unwrap();
    longer.training.epochs = 2;
    let longer_path = temp_dir.path().join("config-2-epochs.yaml");
    longer.to_file(&longer_path).unwrap();

    let checkpoint = temp_dir.path().join("outputs").join("checkpoint-final");
    run_cli(&[
        "train",
        longer_path.to_str().unwrap(),
        "--resume",
        checkpoint.to_str().unwrap(),
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("Training complete (4 steps)"));

    let history = fs::read_to_string(temp_dir.path().join("outputs").join("loss_history.json"))
        .unwrap();
    let history: Vec<f64> = serde_json::from_str(&history).unwrap();
    assert_eq!(history.len(), 2);
}

#[test]
fn test_help_lists_commands() {
    run_cli(&["--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("simulate"))
        .stdout(predicate::str::contains("train"))
        .stdout(predicate::str::contains("init"));
}
