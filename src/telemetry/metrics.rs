//! Metric instrument factories for evidence-queue.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"evidence-queue"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};

/// Returns the shared meter for evidence-queue instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("evidence-queue")
}

/// Counter: jobs inserted into the store.
/// Labels: `module`.
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("evq.jobs.enqueued")
        .with_description("Number of jobs enqueued")
        .build()
}

/// Counter: jobs claimed by a worker connection.
/// Labels: `module`.
pub fn jobs_claimed() -> Counter<u64> {
    meter()
        .u64_counter("evq.jobs.claimed")
        .with_description("Number of jobs claimed by workers")
        .build()
}

/// Counter: acks received.
/// Labels: `status`, `result` ("applied" | "ignored").
pub fn jobs_acked() -> Counter<u64> {
    meter()
        .u64_counter("evq.jobs.acked")
        .with_description("Number of job acks received")
        .build()
}

/// Counter: running jobs reverted to scheduled.
/// Labels: `reason` ("disconnect" | "stale_server").
pub fn jobs_released() -> Counter<u64> {
    meter()
        .u64_counter("evq.jobs.released")
        .with_description("Number of orphaned jobs rescheduled")
        .build()
}

/// Up/down counter: currently connected workers.
pub fn workers_connected() -> UpDownCounter<i64> {
    meter()
        .i64_up_down_counter("evq.workers.connected")
        .with_description("Number of connected worker streams")
        .build()
}

/// Histogram: module run duration in milliseconds.
/// Labels: `module`, `status`.
pub fn module_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("evq.module.duration_ms")
        .with_description("Module run duration in milliseconds")
        .with_unit("ms")
        .build()
}
