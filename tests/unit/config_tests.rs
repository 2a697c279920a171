use std::path::PathBuf;
use std::time::Duration;

use duo_relay::{config::GlobalConfig, AppError};

fn sample_toml(runtime: &str) -> String {
    format!(
        r#"
runtime_dir = '{runtime}'
agent_cli = "/usr/local/bin/droid"
agent_args = ["exec", "--input-format", "stream-jsonrpc"]
auto_level = "medium"
default_model = "gpt-5.2"
daemon_bin = "/opt/duo/duo-relayd"
store_retry_attempts = 3

[timeouts]
handshake_seconds = 30
ready_seconds = 45
send_seconds = 2
terminate_grace_seconds = 4
"#
    )
}

#[test]
fn parses_full_config() {
    let config = GlobalConfig::from_toml_str(&sample_toml("/var/run/duo")).expect("valid config");

    assert_eq!(config.runtime_dir, PathBuf::from("/var/run/duo"));
    assert_eq!(config.agent_cli, "/usr/local/bin/droid");
    assert_eq!(config.agent_args, ["exec", "--input-format", "stream-jsonrpc"]);
    assert_eq!(config.auto_level, "medium");
    assert_eq!(config.default_model, "gpt-5.2");
    assert_eq!(config.store_retry_attempts, 3);
    assert_eq!(config.timeouts.handshake(), Duration::from_secs(30));
    assert_eq!(config.timeouts.ready(), Duration::from_secs(45));
    assert_eq!(config.timeouts.send(), Duration::from_secs(2));
    assert_eq!(config.timeouts.terminate_grace(), Duration::from_secs(4));
    assert_eq!(
        config.daemon_bin().expect("daemon bin"),
        PathBuf::from("/opt/duo/duo-relayd")
    );
}

#[test]
fn empty_document_uses_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("defaults are valid");

    assert_eq!(config.runtime_dir, PathBuf::from("/tmp"));
    assert_eq!(config.auto_level, "high");
    assert_eq!(config.store_retry_attempts, 5);
    assert_eq!(config.timeouts.handshake_seconds, 60);
    assert_eq!(config.timeouts.terminate_grace_seconds, 5);
    assert!(config
        .agent_args
        .iter()
        .any(|arg| arg == "--allow-background-processes"));
    assert_eq!(config, GlobalConfig::default());
}

#[test]
fn partial_timeouts_keep_other_defaults() {
    let config = GlobalConfig::from_toml_str("[timeouts]\nsend_seconds = 9\n").expect("valid");
    assert_eq!(config.timeouts.send_seconds, 9);
    assert_eq!(config.timeouts.ready_seconds, 90);
}

#[test]
fn zero_timeout_is_rejected() {
    let err = GlobalConfig::from_toml_str("[timeouts]\nhandshake_seconds = 0\n")
        .expect_err("zero timeout must fail");
    assert!(matches!(err, AppError::Config(msg) if msg.contains("handshake_seconds")));
}

#[test]
fn empty_agent_cli_is_rejected() {
    let err = GlobalConfig::from_toml_str("agent_cli = \"  \"\n").expect_err("must fail");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn zero_retry_attempts_are_rejected() {
    let err = GlobalConfig::from_toml_str("store_retry_attempts = 0\n").expect_err("must fail");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn malformed_toml_is_a_config_error() {
    let err = GlobalConfig::from_toml_str("runtime_dir = [").expect_err("must fail");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn loads_from_file_and_explicit_path_wins() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("duo.toml");
    std::fs::write(&path, sample_toml("/srv/duo")).expect("write config");

    let config = GlobalConfig::discover(Some(&path)).expect("discover");
    assert_eq!(config.runtime_dir, PathBuf::from("/srv/duo"));
}

#[test]
fn missing_file_is_a_config_error() {
    let err = GlobalConfig::load_from_path("/definitely/not/here.toml").expect_err("must fail");
    assert!(matches!(err, AppError::Config(_)));
}
