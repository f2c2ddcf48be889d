//! Error types for evidence-queue.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a module's run function. Recorded as the job's error text.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module {0} is not configured on this worker")]
    NotConfigured(String),

    #[error("failed to start tool: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("tool exited {0}")]
    Exited(i32),

    #[error("tool terminated by signal")]
    Terminated,

    #[error("evidence missing from job descriptor")]
    MissingEvidence,

    #[error("{0}")]
    Failed(String),
}
