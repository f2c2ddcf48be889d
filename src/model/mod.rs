//! Core data model.
//!
//! A job is one scheduled invocation of a module against a case's evidence
//! item. It is created `Scheduled`, claimed into `Running` by exactly one
//! worker connection, and finishes `Success` or `Failed`. A `Running` job
//! whose owner disappears is reverted to `Scheduled`.

pub mod catalog;
pub mod wire;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

pub use catalog::{Case, Evidence, Hook, HookTrigger};
pub use wire::{AckRequest, ConnectParams, JobDescriptor, ModuleRun, PushJobRequest};

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work tracked by the job store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub case_id: String,
    pub evidence_id: String,

    /// Registry name of the module that processes this job.
    pub module_name: String,

    pub status: JobStatus,

    /// Error text reported by the worker. Empty unless `Failed`.
    pub error: String,

    /// Server process that owns the job while it is `Running`.
    #[serde(rename = "serverInstanceToken")]
    pub server_token: String,

    /// Worker connection that claimed the job. Empty unless `Running`.
    pub worker_token: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Opaque job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting for a worker to claim it.
    Scheduled,
    /// Claimed by a worker connection.
    Running,
    /// The module reported an error. Terminal.
    Failed,
    /// The module finished cleanly. Terminal.
    Success,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Scheduled,
        JobStatus::Running,
        JobStatus::Failed,
        JobStatus::Success,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Success)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Scheduled => "Scheduled",
            JobStatus::Running => "Running",
            JobStatus::Failed => "Failed",
            JobStatus::Success => "Success",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown job status: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// Identifies one worker connection. Generated fresh on every connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerToken(pub String);

impl WorkerToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one server process. Jobs left `Running` under a previous
/// instance's token are orphans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceToken(pub String);

impl InstanceToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Request to enqueue a job. Every enqueue creates a fresh row, even when an
/// identical (evidence, module) job already exists.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) case_id: String,
    pub(crate) evidence_id: String,
    pub(crate) module_name: String,
}

impl NewJob {
    pub fn new(
        case_id: impl Into<String>,
        evidence_id: impl Into<String>,
        module_name: impl Into<String>,
    ) -> Self {
        Self {
            case_id: case_id.into(),
            evidence_id: evidence_id.into(),
            module_name: module_name.into(),
        }
    }
}
