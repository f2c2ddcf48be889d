//! The dispatcher: hands queued jobs to connected workers.
//!
//! Workers open a long-lived stream declaring the modules they run. Each
//! stream gets its own [`Connection`](connection::Connection) task that polls
//! the store and writes job descriptors. Completion comes back separately
//! through [`Dispatcher::ack`].

mod connection;
pub mod sessions;
pub mod sweeper;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::db::{Db, validate_module_name};
use crate::error::{Error, Result};
use crate::hooks::{HookRunner, RuleEngine};
use crate::model::{
    AckRequest, ConnectParams, Evidence, Job, JobId, ModuleRun, NewJob, PushJobRequest,
    WorkerToken,
};
use crate::module::{Module, ModuleRegistry};

use connection::Connection;
pub use sessions::{WorkerSession, WorkerSessions};
pub use sweeper::Sweeper;

/// Lines buffered per worker stream before the connection task waits.
const STREAM_BUFFER: usize = 16;

/// Timing for worker streams.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How often each connection tries to claim a job.
    pub poll_interval: Duration,
    /// How often each connection sends a heartbeat.
    pub keepalive_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(60),
        }
    }
}

pub struct Dispatcher {
    db: Arc<Db>,
    registry: Arc<ModuleRegistry>,
    sessions: Arc<WorkerSessions>,
    sweeper: Sweeper,
    hooks: HookRunner,
    config: DispatchConfig,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        db: Arc<Db>,
        registry: Arc<ModuleRegistry>,
        rules: Arc<dyn RuleEngine>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            hooks: HookRunner::new(Arc::clone(&db), Arc::clone(&registry), rules),
            sweeper: Sweeper::new(Arc::clone(&db)),
            sessions: Arc::new(WorkerSessions::new()),
            db,
            registry,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Build a dispatcher for a freshly started server: reclaims jobs
    /// orphaned by earlier instances before anything can connect.
    pub async fn start(
        db: Arc<Db>,
        registry: Arc<ModuleRegistry>,
        rules: Arc<dyn RuleEngine>,
        config: DispatchConfig,
    ) -> Result<Self> {
        let dispatcher = Self::new(db, registry, rules, config);
        dispatcher.sweeper.reclaim_stale_server_jobs().await?;
        Ok(dispatcher)
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn hooks(&self) -> &HookRunner {
        &self.hooks
    }

    /// Cancelled when the server shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close every worker stream. Each connection releases its jobs first.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Open a job stream for a worker.
    ///
    /// Returns newline-terminated JSON descriptors. The connection task runs
    /// until the returned stream is dropped or the dispatcher shuts down.
    pub async fn connect(
        &self,
        params: ConnectParams,
        remote_address: String,
    ) -> Result<ReceiverStream<Bytes>> {
        let modules = params.module_names();
        if modules.is_empty() {
            return Err(Error::Validation("worker declared no modules".to_string()));
        }
        for name in &modules {
            validate_module_name(name)?;
            if !self.registry.contains(name) {
                debug!(module = %name, "worker declared a module the server does not know");
            }
        }

        let token = WorkerToken::generate();
        self.sessions
            .insert(WorkerSession {
                worker_token: token.clone(),
                remote_address: remote_address.clone(),
                supported_modules: modules.clone(),
                concurrency: params.workers,
                connected_at: Utc::now(),
            })
            .await;
        info!(
            worker = %token,
            remote = %remote_address,
            modules = ?modules,
            concurrency = params.workers,
            "worker connected"
        );

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let connection = Connection {
            db: Arc::clone(&self.db),
            sessions: Arc::clone(&self.sessions),
            sweeper: self.sweeper.clone(),
            token,
            modules,
            tx,
            poll_interval: self.config.poll_interval,
            keepalive_interval: self.config.keepalive_interval,
            shutdown: self.shutdown.child_token(),
        };
        tokio::spawn(connection.run());

        Ok(ReceiverStream::new(rx))
    }

    /// Record a worker's completion report. Returns whether it changed the job.
    pub async fn ack(&self, ack: AckRequest) -> Result<bool> {
        let id = JobId(ack.id);
        let applied = self.db.ack(&id, ack.status, &ack.error).await?;
        if applied {
            info!(job = %id, status = %ack.status, error = %ack.error, "job finished");
        }
        Ok(applied)
    }

    /// Enqueue a module run requested by an operator.
    pub async fn push_job(&self, request: PushJobRequest) -> Result<Job> {
        validate_module_name(&request.module_name)?;
        if !self.registry.contains(&request.module_name) {
            return Err(Error::Validation(format!(
                "unknown module {:?}",
                request.module_name
            )));
        }
        self.db
            .get_evidence(&request.case_id, &request.evidence_id)
            .await?;

        self.db
            .enqueue(NewJob::new(
                request.case_id,
                request.evidence_id,
                request.module_name,
            ))
            .await
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Job> {
        self.db.get_job(id).await
    }

    /// Jobs for one evidence item, oldest first.
    pub async fn evidence_jobs(&self, case_id: &str, evidence_id: &str) -> Result<Vec<Job>> {
        self.db.get_evidence(case_id, evidence_id).await?;
        self.db.list_jobs(evidence_id).await
    }

    /// Modules that apply to an evidence item, each with its latest outcome.
    pub async fn runnable_modules(&self, case_id: &str, evidence_id: &str) -> Result<Vec<ModuleRun>> {
        let evidence = self.db.get_evidence(case_id, evidence_id).await?;

        // Later jobs overwrite earlier ones, leaving the latest per module.
        let latest: HashMap<String, Job> = self
            .db
            .list_jobs(evidence_id)
            .await?
            .into_iter()
            .map(|job| (job.module_name.clone(), job))
            .collect();

        Ok(self
            .registry
            .supported(&evidence)
            .map(|module| {
                let job = latest.get(module.name());
                ModuleRun {
                    name: module.name().to_string(),
                    description: module.description().to_string(),
                    status: job.map(|j| j.status),
                    error: job.map(|j| j.error.clone()).unwrap_or_default(),
                }
            })
            .collect())
    }

    /// Store an evidence item and fire `OnEvidenceAdded` hooks for it.
    pub async fn register_evidence(&self, evidence: Evidence) -> Result<Vec<Job>> {
        self.db.get_case(&evidence.case_id).await?;
        self.db.save_evidence(&evidence).await?;
        info!(evidence = %evidence.id, case = %evidence.case_id, name = %evidence.name, "evidence registered");
        self.hooks.on_evidence_added(&evidence).await
    }

    pub async fn workers(&self) -> Vec<WorkerSession> {
        self.sessions.list().await
    }

    pub async fn health_check(&self) -> Result<()> {
        self.db.health_check().await
    }
}
