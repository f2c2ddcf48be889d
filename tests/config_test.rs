use std::time::Duration;

use evidence_queue::config::{ServerConfig, ToolsConfig, WorkerConfig};
use secrecy::ExposeSecret;

// Environment variables are process-wide, so each config type is exercised
// by a single test that sets and clears its own variables.

#[test]
fn server_config_from_env() {
    unsafe {
        std::env::remove_var("DATABASE_URL");
    }
    assert!(ServerConfig::from_env().is_err());

    unsafe {
        std::env::set_var("DATABASE_URL", "sqlite://evq-test.db");
        std::env::set_var("POLL_INTERVAL_MS", "250");
        std::env::set_var("BIND_ADDR", "127.0.0.1:9090");
    }
    let config = ServerConfig::from_env().unwrap();
    assert_eq!(config.database_url, "sqlite://evq-test.db");
    assert_eq!(config.poll_interval, Duration::from_millis(250));
    assert_eq!(config.keepalive_interval, Duration::from_secs(60));
    assert_eq!(config.bind_addr.port(), 9090);
    assert!(!config.log_level.is_empty());

    unsafe {
        std::env::set_var("POLL_INTERVAL_MS", "soon");
    }
    assert!(ServerConfig::from_env().is_err());

    unsafe {
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("POLL_INTERVAL_MS");
        std::env::remove_var("BIND_ADDR");
    }
}

#[test]
fn worker_config_from_env() {
    unsafe {
        std::env::remove_var("SERVER_URL");
    }
    assert!(WorkerConfig::from_env().is_err());

    unsafe {
        std::env::set_var("SERVER_URL", "http://dispatcher:8080");
        std::env::set_var("WORKER_CONCURRENCY", "5");
        std::env::set_var("SKIP_VERIFY_TLS", "true");
    }
    let config = WorkerConfig::from_env().unwrap();
    assert_eq!(config.server_url, "http://dispatcher:8080");
    assert_eq!(config.concurrency, 5);
    assert!(config.skip_verify_tls);
    assert_eq!(config.reconnect_delay, Duration::from_secs(5));
    assert_eq!(config.evidence_dir.to_str(), Some("files/evidences"));

    unsafe {
        std::env::set_var("WORKER_CONCURRENCY", "0");
    }
    assert!(WorkerConfig::from_env().is_err());

    unsafe {
        std::env::remove_var("SERVER_URL");
        std::env::remove_var("WORKER_CONCURRENCY");
        std::env::remove_var("SKIP_VERIFY_TLS");
    }
}

#[test]
fn tools_config_loads_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tools.toml");
    std::fs::write(
        &path,
        r#"
        [hayabusa]
        command = ["/opt/hayabusa/hayabusa"]

        [timesketch]
        command = ["timesketch_importer"]
        url = "https://ts.example"
        user = "importer"
        password = "s3cret"
        "#,
    )
    .unwrap();

    let tools = ToolsConfig::load(&path).unwrap();
    assert!(tools.hayabusa.is_some());
    assert!(tools.plaso.is_none());
    assert_eq!(tools.timesketch.unwrap().password.expose_secret(), "s3cret");
}

#[test]
fn missing_tools_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ToolsConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, evidence_queue::error::Error::Config(_)));
}
