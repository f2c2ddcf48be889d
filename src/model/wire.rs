//! Messages exchanged between the dispatcher, workers and operators.

use serde::{Deserialize, Serialize};

use super::{Case, Evidence, Job, JobStatus, WorkerToken};

/// Module name carried by heartbeat descriptors.
pub const KEEP_ALIVE: &str = "keep-alive";

/// One line of the dispatcher's job stream.
///
/// A descriptor named [`KEEP_ALIVE`] with an empty `id` is a heartbeat and
/// carries no work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    #[serde(default)]
    pub id: String,
    pub worker_token: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case: Option<Case>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
}

impl JobDescriptor {
    pub fn keep_alive(worker: &WorkerToken) -> Self {
        Self {
            id: String::new(),
            worker_token: worker.to_string(),
            name: KEEP_ALIVE.to_string(),
            case: None,
            evidence: None,
        }
    }

    pub fn for_job(job: &Job, worker: &WorkerToken, case: Case, evidence: Evidence) -> Self {
        Self {
            id: job.id.to_string(),
            worker_token: worker.to_string(),
            name: job.module_name.clone(),
            case: Some(case),
            evidence: Some(evidence),
        }
    }

    pub fn is_keep_alive(&self) -> bool {
        self.name == KEEP_ALIVE && self.id.is_empty()
    }
}

/// Worker → dispatcher completion report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRequest {
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub error: String,
}

impl AckRequest {
    pub fn success(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Success,
            error: String::new(),
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Failed,
            error: error.into(),
        }
    }
}

/// Operator request to run a module on an evidence item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushJobRequest {
    pub case_id: String,
    pub evidence_id: String,
    pub module_name: String,
}

/// Query parameters a worker supplies when opening the job stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectParams {
    /// Comma-separated module names.
    #[serde(default)]
    pub modules: String,
    /// Declared job concurrency.
    #[serde(default)]
    pub workers: usize,
}

impl ConnectParams {
    pub fn new(modules: &[String], workers: usize) -> Self {
        Self {
            modules: modules.join(","),
            workers,
        }
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// A module that can run on an evidence item, with the outcome of its most
/// recent job if one exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRun {
    pub name: String,
    pub description: String,
    pub status: Option<JobStatus>,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_serializes_without_payload() {
        let token = WorkerToken("w1".into());
        let line = serde_json::to_string(&JobDescriptor::keep_alive(&token)).unwrap();
        assert_eq!(line, r#"{"id":"","workerToken":"w1","name":"keep-alive"}"#);

        let decoded: JobDescriptor = serde_json::from_str(&line).unwrap();
        assert!(decoded.is_keep_alive());
    }

    #[test]
    fn connect_params_split_module_list() {
        let params = ConnectParams {
            modules: "Hayabusa, Plaso (Windows Preset),,".into(),
            workers: 2,
        };
        assert_eq!(
            params.module_names(),
            vec!["Hayabusa".to_string(), "Plaso (Windows Preset)".to_string()]
        );
    }

    #[test]
    fn ack_error_defaults_to_empty() {
        let ack: AckRequest = serde_json::from_str(r#"{"id":"j1","status":"Success"}"#).unwrap();
        assert_eq!(ack, AckRequest::success("j1"));
    }
}
