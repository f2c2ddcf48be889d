//! Database connection pool, migrations, and health check.
//!
//! The pool is shared by the job store, the evidence catalog and every
//! dispatcher connection. Each `Db` handle also carries the token of the
//! server process that opened it.

pub mod catalog;
pub mod jobs;

pub use jobs::validate_module_name;

use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::error::Result;
use crate::model::InstanceToken;

/// Database handle. Owns the connection pool and this process's instance token.
pub struct Db {
    pool: SqlitePool,
    instance: InstanceToken,
}

impl Db {
    /// Open (or create) the database at `url` and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            instance: InstanceToken::generate(),
        })
    }

    /// Create a migrated in-memory database (for testing).
    ///
    /// Every SQLite in-memory connection is its own database, so the pool is
    /// pinned to a single connection that never expires.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self {
            pool,
            instance: InstanceToken::generate(),
        };
        db.migrate().await?;
        Ok(db)
    }

    /// A handle on the same store owned by a fresh server instance, as seen
    /// by a process started after this one.
    pub fn with_new_instance(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            instance: InstanceToken::generate(),
        }
    }

    /// Token identifying the server process that owns this handle.
    pub fn instance_token(&self) -> &InstanceToken {
        &self.instance
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
