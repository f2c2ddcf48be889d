//! # evidence-queue
//!
//! Job queue for forensic evidence processing.
//!
//! Analysis modules (timeline generators, parsers, uploaders) are queued
//! against uploaded evidence, streamed to detached worker processes, run
//! out-of-process, and acked back. Jobs held by a vanished worker or a
//! restarted server are rescheduled, so work is neither lost nor handed to
//! two workers at once.

pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod hooks;
pub mod model;
pub mod module;
pub mod server;
pub mod telemetry;
pub mod worker;
