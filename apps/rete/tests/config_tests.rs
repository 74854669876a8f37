//! Integration tests for TOML configuration loading.

#![allow(clippy::unwrap_used, clippy::panic)]

use rete::config::{Config, LogFormat};
use rete_core::ReteError;
use std::io::Write;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_full_config_file() {
    let file = write_config(
        r#"
[server]
host = "0.0.0.0"
port = 9090
rate_limit = 25
cors_origins = "https://rules.example"

[submission]
timeout_ms = 5000
initial_backoff_ms = 2

[actions]
history_limit = 16

[logging]
format = "json"
"#,
    );

    let config = Config::from_file(file.path()).unwrap();

    assert_eq!(config.server.addr(), "0.0.0.0:9090");
    assert_eq!(config.server.rate_limit, 25);
    assert_eq!(config.server.cors_origins.as_deref(), Some("https://rules.example"));
    assert_eq!(config.submission.timeout_ms, 5000);
    assert_eq!(config.submission.initial_backoff_ms, 2);
    assert_eq!(config.submission.max_backoff_ms, 500);
    assert_eq!(config.actions.history_limit, 16);
    assert_eq!(config.logging.format, LogFormat::Json);
}

#[test]
fn test_partial_config_keeps_defaults() {
    let file = write_config("[server]\nport = 7000\n");

    let config = Config::from_file(file.path()).unwrap();

    assert_eq!(config.server.port, 7000);
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.rate_limit, 100);
    assert_eq!(config.actions.history_limit, 1024);
    assert_eq!(config.logging.format, LogFormat::Text);
}

#[test]
fn test_api_key_never_read_from_file() {
    let file = write_config("[server]\napi_key = \"leaked\"\n");

    let config = Config::from_file(file.path()).unwrap();

    assert!(config.server.api_key.is_none());
}

#[test]
fn test_malformed_config_rejected() {
    let file = write_config("[server\nport = 1");

    let err = Config::from_file(file.path()).unwrap_err();

    assert!(matches!(err, ReteError::SerializationError(_)));
}

#[test]
fn test_wrong_value_type_rejected() {
    let file = write_config("[server]\nport = \"eighty\"\n");

    assert!(Config::from_file(file.path()).is_err());
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();

    let err = Config::from_file(&dir.path().join("absent.toml")).unwrap_err();

    assert!(matches!(err, ReteError::IoError(_)));
}
