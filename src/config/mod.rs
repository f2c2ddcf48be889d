//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The API key is wrapped in `secrecy::SecretString` so it never
//! shows up in logs.

pub mod tools;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::{Error, Result};

pub use tools::{TimesketchConfig, ToolCommand, ToolsConfig};

/// Settings for `evq serve`.
#[derive(Debug)]
pub struct ServerConfig {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    /// When set, every request must carry it in `X-API-Key`.
    pub api_key: Option<SecretString>,
    pub poll_interval: Duration,
    pub keepalive_interval: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: required_var("DATABASE_URL")?,
            bind_addr: parsed_var("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            api_key: secret_var("API_KEY"),
            poll_interval: Duration::from_millis(parsed_var("POLL_INTERVAL_MS", 1000)?),
            keepalive_interval: Duration::from_secs(parsed_var("KEEPALIVE_INTERVAL_SECS", 60)?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Settings for `evq work`.
#[derive(Debug)]
pub struct WorkerConfig {
    pub server_url: String,
    pub api_key: Option<SecretString>,
    /// Upper bound on jobs this worker runs at once.
    pub concurrency: usize,
    pub tools_config: PathBuf,
    /// Root of `<case>/<evidence name>` files shared with the server.
    pub evidence_dir: PathBuf,
    pub skip_verify_tls: bool,
    pub reconnect_delay: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let concurrency = parsed_var("WORKER_CONCURRENCY", 3usize)?;
        if concurrency == 0 {
            return Err(Error::Config(
                "WORKER_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            server_url: required_var("SERVER_URL")?,
            api_key: secret_var("API_KEY"),
            concurrency,
            tools_config: std::env::var("TOOLS_CONFIG")
                .unwrap_or_else(|_| "tools.toml".to_string())
                .into(),
            evidence_dir: std::env::var("EVIDENCE_DIR")
                .unwrap_or_else(|_| "files/evidences".to_string())
                .into(),
            skip_verify_tls: parsed_var("SKIP_VERIFY_TLS", false)?,
            reconnect_delay: Duration::from_secs(parsed_var("RECONNECT_DELAY_SECS", 5)?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn secret_var(name: &str) -> Option<SecretString> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .map(SecretString::from)
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        Err(_) => Ok(default),
    }
}
