//! One worker's job stream.
//!
//! Each connected worker gets a task that polls the store for jobs it can
//! run, writes them as JSON lines, and sends a heartbeat on a slower timer.
//! The task ends when the worker goes away, a write fails, the store fails,
//! or the server shuts down. Whatever the cause, it reschedules the jobs the
//! worker held and only then drops the session.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use super::sessions::WorkerSessions;
use super::sweeper::Sweeper;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{Job, JobDescriptor, JobStatus, WorkerToken};
use crate::telemetry::job::start_connection_span;
use crate::telemetry::metrics;

/// Why a connection loop stopped.
#[derive(Debug)]
enum Closed {
    WorkerGone,
    Shutdown,
}

pub(crate) struct Connection {
    pub(crate) db: Arc<Db>,
    pub(crate) sessions: Arc<WorkerSessions>,
    pub(crate) sweeper: Sweeper,
    pub(crate) token: WorkerToken,
    pub(crate) modules: Vec<String>,
    pub(crate) tx: mpsc::Sender<Bytes>,
    pub(crate) poll_interval: Duration,
    pub(crate) keepalive_interval: Duration,
    pub(crate) shutdown: CancellationToken,
}

impl Connection {
    pub(crate) async fn run(self) {
        let span = start_connection_span(&self.token, &self.modules);
        async move {
            metrics::workers_connected().add(1, &[]);

            match self.serve().await {
                Ok(Closed::WorkerGone) => info!("worker disconnected"),
                Ok(Closed::Shutdown) => info!("closing worker stream for shutdown"),
                Err(e) => warn!(error = %e, "worker stream failed"),
            }
            self.cleanup().await;

            metrics::workers_connected().add(-1, &[]);
        }
        .instrument(span)
        .await
    }

    async fn serve(&self) -> Result<Closed> {
        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keepalive = interval_at(
            Instant::now() + self.keepalive_interval,
            self.keepalive_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.tx.closed() => return Ok(Closed::WorkerGone),
                _ = self.shutdown.cancelled() => return Ok(Closed::Shutdown),
                _ = keepalive.tick() => {
                    self.send(&JobDescriptor::keep_alive(&self.token)).await?;
                }
                _ = poll.tick() => self.poll_once().await?,
            }
        }
    }

    /// Claim at most one job and hand it to the worker.
    async fn poll_once(&self) -> Result<()> {
        let Some(job) = self.db.claim_next(&self.token, &self.modules).await? else {
            return Ok(());
        };

        let descriptor = match self.describe(&job).await {
            Ok(descriptor) => descriptor,
            Err(Error::NotFound(what)) => {
                warn!(job = %job.id, %what, "claimed job references missing record, failing it");
                self.db
                    .ack(&job.id, JobStatus::Failed, &format!("{what} no longer exists"))
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.send(&descriptor).await?;
        info!(job = %job.id, module = %job.module_name, evidence = %job.evidence_id, "job dispatched");
        Ok(())
    }

    async fn describe(&self, job: &Job) -> Result<JobDescriptor> {
        let case = self.db.get_case(&job.case_id).await?;
        let evidence = self.db.get_evidence(&job.case_id, &job.evidence_id).await?;
        Ok(JobDescriptor::for_job(job, &self.token, case, evidence))
    }

    async fn send(&self, descriptor: &JobDescriptor) -> Result<()> {
        let mut line = serde_json::to_vec(descriptor)
            .map_err(|e| Error::Other(format!("failed to encode job descriptor: {e}")))?;
        line.push(b'\n');

        tokio::select! {
            sent = self.tx.send(Bytes::from(line)) => {
                sent.map_err(|_| Error::Transport("worker stream closed".to_string()))
            }
            _ = self.shutdown.cancelled() => {
                Err(Error::Transport("server shutting down".to_string()))
            }
        }
    }

    /// Release before deregistering, so no session is ever gone while its
    /// jobs still look owned.
    async fn cleanup(&self) {
        match self.sweeper.reclaim_worker_jobs(&self.token).await {
            Ok(released) => debug!(released, "worker jobs released"),
            Err(e) => error!(error = %e, "failed to reschedule worker jobs"),
        }
        self.sessions.remove(&self.token).await;
        info!("worker session removed");
    }
}
