//! Worker runtime: reads the job stream and runs modules.
//!
//! The worker declares the modules it has, then reads descriptors off the
//! dispatcher's stream. Each job runs on its own task, bounded by a
//! semaphore; heartbeats are dropped. Module failures become `Failed` acks
//! and never end the read loop. When the stream breaks the worker waits and
//! reconnects with a fresh session.

pub mod client;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use opentelemetry::KeyValue;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::error::{Error, ModuleError, Result};
use crate::model::{AckRequest, JobDescriptor};
use crate::module::{Module, ModuleRegistry};
use crate::telemetry::job::{record_job_outcome, start_job_span};
use crate::telemetry::metrics;

pub use client::{DispatcherClient, JobStream};

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct WorkerRuntime {
    client: DispatcherClient,
    registry: Arc<ModuleRegistry>,
    concurrency: usize,
    permits: Arc<Semaphore>,
    reconnect_delay: Duration,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl WorkerRuntime {
    /// `registry` should already be filtered to the modules this host can
    /// run (see [`ModuleRegistry::available`]).
    pub fn new(client: DispatcherClient, registry: Arc<ModuleRegistry>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            client,
            registry,
            concurrency,
            permits: Arc::new(Semaphore::new(concurrency)),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop reading new jobs. [`run`](Self::run) returns once in-flight
    /// jobs have been acked.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run until shut down, reconnecting whenever the stream breaks.
    pub async fn run(&self) -> Result<()> {
        let modules = self.registry.names();
        if modules.is_empty() {
            return Err(Error::Config("no modules available on this worker".to_string()));
        }
        info!(modules = ?modules, concurrency = self.concurrency, "worker starting");

        while !self.shutdown.is_cancelled() {
            match self.run_session(&modules).await {
                Ok(()) if self.shutdown.is_cancelled() => break,
                Ok(()) => info!("job stream closed by dispatcher"),
                Err(e) => warn!(error = %e, "job stream failed"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {
                    info!(delay = ?self.reconnect_delay, "reconnecting to dispatcher");
                }
            }
        }

        self.drain().await;
        info!("worker stopped");
        Ok(())
    }

    /// One connection: read descriptors until the stream ends or fails.
    ///
    /// On shutdown the stream stays open until in-flight jobs are acked, so
    /// their claims are not released underneath them.
    async fn run_session(&self, modules: &[String]) -> Result<()> {
        let mut stream = self.client.open_stream(modules, self.concurrency).await?;
        info!("connected to dispatcher");

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.drain().await;
                    return Ok(());
                }
                next = stream.next() => next?,
            };
            let Some(descriptor) = next else {
                return Ok(());
            };
            self.dispatch(descriptor);
        }
    }

    fn dispatch(&self, descriptor: JobDescriptor) {
        if descriptor.is_keep_alive() {
            debug!("keep-alive");
            return;
        }

        let module = self.registry.get(&descriptor.name).cloned();
        let client = self.client.clone();
        let permits = Arc::clone(&self.permits);
        debug!(job = %descriptor.id, module = %descriptor.name, "job received");
        self.tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            execute(module, client, descriptor).await;
        });
    }

    async fn drain(&self) {
        self.tasks.close();
        if !self.tasks.is_empty() {
            info!(in_flight = self.tasks.len(), "waiting for in-flight jobs");
        }
        self.tasks.wait().await;
    }
}

/// Run one job and ack its outcome.
async fn execute(module: Option<Arc<dyn Module>>, client: DispatcherClient, descriptor: JobDescriptor) {
    let evidence_id = descriptor
        .evidence
        .as_ref()
        .map(|e| e.id.clone())
        .unwrap_or_default();
    let span = start_job_span(&descriptor.name, &descriptor.id, &evidence_id);

    async move {
        let started = Instant::now();
        let ack = match run_module(module.as_deref(), &client, &descriptor).await {
            Ok(()) => AckRequest::success(&descriptor.id),
            Err(message) => AckRequest::failed(&descriptor.id, message),
        };

        metrics::module_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[
                KeyValue::new("module", descriptor.name.clone()),
                KeyValue::new("status", ack.status.as_str()),
            ],
        );
        record_job_outcome(&Span::current(), ack.status, &ack.error);

        match client.ack(&ack).await {
            Ok(true) => {}
            Ok(false) => warn!("ack ignored, job is no longer running"),
            Err(e) => error!(error = %e, "failed to ack job"),
        }
    }
    .instrument(span)
    .await
}

/// Run the module and register its artifacts. The error string becomes the
/// job's error text.
async fn run_module(
    module: Option<&dyn Module>,
    client: &DispatcherClient,
    descriptor: &JobDescriptor,
) -> std::result::Result<(), String> {
    let module = module.ok_or_else(|| ModuleError::NotConfigured(descriptor.name.clone()).to_string())?;

    let artifacts = AssertUnwindSafe(module.run(descriptor))
        .catch_unwind()
        .await
        .map_err(|_| "module panicked".to_string())?
        .map_err(|e| e.to_string())?;

    for artifact in &artifacts {
        client
            .register_evidence(artifact)
            .await
            .map_err(|e| format!("failed to register artifact {}: {e}", artifact.name))?;
        info!(artifact = %artifact.name, "artifact registered");
    }
    Ok(())
}
