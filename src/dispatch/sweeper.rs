//! Reclaims jobs whose owner is gone.
//!
//! Two owners can vanish: a worker connection (its stream closed) and a
//! whole server process (it crashed or restarted). In both cases the jobs
//! they held go back to `Scheduled` so another worker picks them up.

use std::sync::Arc;

use tracing::{info, warn};

use crate::db::Db;
use crate::error::Result;
use crate::model::WorkerToken;

#[derive(Clone)]
pub struct Sweeper {
    db: Arc<Db>,
}

impl Sweeper {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Reschedule jobs left `Running` by earlier server instances.
    ///
    /// Must run once at startup, before any worker connects.
    pub async fn reclaim_stale_server_jobs(&self) -> Result<u64> {
        let instance = self.db.instance_token();
        let released = self.db.release_stale_server_jobs(instance).await?;
        if released > 0 {
            warn!(released, %instance, "rescheduled jobs orphaned by a previous server instance");
        } else {
            info!(%instance, "no orphaned jobs from previous server instances");
        }
        Ok(released)
    }

    /// Reschedule jobs held by a departed worker connection.
    pub async fn reclaim_worker_jobs(&self, worker: &WorkerToken) -> Result<u64> {
        let released = self.db.release_worker_jobs(worker).await?;
        if released > 0 {
            info!(released, %worker, "rescheduled jobs of departed worker");
        }
        Ok(released)
    }
}
