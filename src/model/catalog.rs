//! Case, evidence and hook records.
//!
//! These rows belong to the case tracker. The queue only reads them to build
//! job descriptors and to decide which modules apply to a piece of evidence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// An investigation case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Case {
    pub id: String,
    pub name: String,
    /// Timesketch sketch that receives uploaded timelines. Zero when unset.
    #[serde(default)]
    pub sketch_id: i64,
}

/// An uploaded piece of evidence belonging to a case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    pub id: String,
    pub case_id: String,
    /// Free-form category such as "Logs" or "Triage".
    #[serde(rename = "type", default)]
    pub kind: String,
    /// File name, relative to the case's evidence directory.
    pub name: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub hash: String,
    #[serde(default = "Utc::now")]
    pub added_at: DateTime<Utc>,
}

impl Evidence {
    /// Lower-cased file extension without the dot, if any.
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }
}

/// Event that fires a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookTrigger {
    OnEvidenceAdded,
}

impl HookTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            HookTrigger::OnEvidenceAdded => "OnEvidenceAdded",
        }
    }
}

impl std::fmt::Display for HookTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HookTrigger {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OnEvidenceAdded" => Ok(HookTrigger::OnEvidenceAdded),
            _ => Err(Error::Validation(format!("unknown hook trigger: {s}"))),
        }
    }
}

/// Binds a condition over evidence metadata to a module. When the condition
/// holds for newly added evidence, a job for `module` is enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    pub id: String,
    pub trigger: HookTrigger,
    pub name: String,
    pub module: String,
    pub condition: String,
    pub enabled: bool,
}
