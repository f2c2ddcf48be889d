//! Span helpers for job execution and worker connections.

use tracing::Span;

use crate::model::{JobStatus, WorkerToken};

/// Start a span for one module run on a worker.
///
/// The `job.status` field is declared empty and filled by
/// [`record_job_outcome`].
pub fn start_job_span(module: &str, job_id: &str, evidence_id: &str) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.module" = module,
        "job.id" = job_id,
        "job.evidence" = evidence_id,
        "job.status" = tracing::field::Empty,
    )
}

/// Record a job's final status on its span.
pub fn record_job_outcome(span: &Span, status: JobStatus, error: &str) {
    span.record("job.status", status.as_str());
    span.in_scope(|| {
        if error.is_empty() {
            tracing::info!(status = %status, "job completed");
        } else {
            tracing::warn!(status = %status, error, "job completed");
        }
    });
}

/// Start the span covering one worker's stream on the dispatcher.
pub fn start_connection_span(worker: &WorkerToken, modules: &[String]) -> Span {
    tracing::info_span!(
        "worker.connection",
        "worker.token" = %worker,
        "worker.modules" = ?modules,
    )
}
