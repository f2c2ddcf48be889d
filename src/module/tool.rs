//! Built-in modules that wrap external forensic tools.
//!
//! Each module spawns the configured command with tool-specific arguments
//! appended, waits for it, and reports the files it produced. Input lives at
//! `<evidence_dir>/<case id>/<evidence name>`; outputs are written next to it
//! under the full input name plus a suffix, e.g. `triage.zip.plaso`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::ExposeSecret;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use super::Module;
use crate::config::{TimesketchConfig, ToolsConfig};
use crate::error::ModuleError;
use crate::model::{Evidence, JobDescriptor};

const HAYABUSA_DESCRIPTION: &str = "Hayabusa is a sigma-based threat hunting and fast forensics timeline generator for Windows event logs.";
const PLASO_DESCRIPTION: &str = "Plaso is a Python-based engine used by several tools for automatic creation of timelines.";
const PLASO_MFT_DESCRIPTION: &str = "Run Plaso with the parser for NTFS $MFT metadata files to create a file system timeline.";
const TIMESKETCH_DESCRIPTION: &str = "Upload a timeline to the case's Timesketch sketch for collaborative analysis.";

/// Which tool a [`ToolModule`] drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolKind {
    Hayabusa,
    Plaso {
        parsers: &'static str,
        extension: &'static str,
    },
    TimesketchImporter,
}

impl ToolKind {
    /// Arguments for the prerequisite check.
    fn check_args(&self) -> &'static [&'static str] {
        match self {
            ToolKind::Hayabusa => &["help"],
            ToolKind::Plaso { .. } => &["-V"],
            ToolKind::TimesketchImporter => &["--version"],
        }
    }
}

pub struct ToolModule {
    name: &'static str,
    description: &'static str,
    kind: ToolKind,
    command: Option<Vec<String>>,
    timesketch: Option<Arc<TimesketchConfig>>,
    evidence_dir: PathBuf,
}

impl ToolModule {
    pub fn new(
        name: &'static str,
        description: &'static str,
        kind: ToolKind,
        command: Option<Vec<String>>,
        evidence_dir: &Path,
    ) -> Self {
        Self {
            name,
            description,
            kind,
            command,
            timesketch: None,
            evidence_dir: evidence_dir.to_path_buf(),
        }
    }

    /// Every built-in tool module, in registration order.
    pub fn builtin(tools: ToolsConfig, evidence_dir: &Path) -> Vec<ToolModule> {
        let hayabusa = tools.hayabusa.map(|t| t.command);
        let plaso = tools.plaso.map(|t| t.command);
        let timesketch = tools.timesketch.map(Arc::new);

        let plaso_preset = |name, description, parsers, extension| {
            ToolModule::new(
                name,
                description,
                ToolKind::Plaso { parsers, extension },
                plaso.clone(),
                evidence_dir,
            )
        };

        vec![
            ToolModule::new(
                "Hayabusa",
                HAYABUSA_DESCRIPTION,
                ToolKind::Hayabusa,
                hayabusa,
                evidence_dir,
            ),
            plaso_preset("Plaso (Windows Preset)", PLASO_DESCRIPTION, "win7", ".plaso"),
            plaso_preset("Plaso (Linux Preset)", PLASO_DESCRIPTION, "linux", ".plaso"),
            plaso_preset("Plaso (MacOS Preset)", PLASO_DESCRIPTION, "macos", ".plaso"),
            plaso_preset("Plaso (Filesystem Timeline)", PLASO_MFT_DESCRIPTION, "mft", ".mft.plaso"),
            ToolModule {
                command: timesketch.as_ref().map(|t| t.command.clone()),
                timesketch,
                ..ToolModule::new(
                    "Timesketch Importer",
                    TIMESKETCH_DESCRIPTION,
                    ToolKind::TimesketchImporter,
                    None,
                    evidence_dir,
                )
            },
        ]
    }

    fn command(&self) -> Result<&[String], ModuleError> {
        self.command
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ModuleError::NotConfigured(self.name.to_string()))
    }

    /// Path of an evidence file. Names that would leave the case directory
    /// are refused.
    fn evidence_path(&self, evidence: &Evidence) -> Result<PathBuf, ModuleError> {
        for part in [&evidence.case_id, &evidence.name] {
            if !is_plain_file_name(part) {
                return Err(ModuleError::Failed(format!(
                    "refusing evidence path component {part:?}"
                )));
            }
        }
        Ok(self.evidence_dir.join(&evidence.case_id).join(&evidence.name))
    }

    async fn execute(&self, args: Vec<OsString>) -> Result<(), ModuleError> {
        let command = self.command()?;
        let (program, base) = command
            .split_first()
            .ok_or_else(|| ModuleError::NotConfigured(self.name.to_string()))?;

        debug!(module = self.name, %program, "starting tool");
        let status = Command::new(program)
            .args(base)
            .args(args)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(ModuleError::Spawn)?;
        exit_result(status)
    }

    async fn run_hayabusa(&self, evidence: &Evidence) -> Result<Vec<Evidence>, ModuleError> {
        let src = self.evidence_path(evidence)?;
        let dst = with_suffix(&src, ".jsonl");
        let fresh = fresh_outputs(&[dst.as_path()]).await;

        let mut args: Vec<OsString> = [
            "json-timeline",
            "--JSONL-output",
            "--RFC-3339",
            "--UTC",
            "--no-wizard",
            "--min-level",
            "informational",
            "--profile",
            "timesketch-verbose",
            "--file",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        args.push(src.clone().into_os_string());
        args.push("--output".into());
        args.push(dst.clone().into_os_string());

        if let Err(e) = self.execute(args).await {
            remove_partial(&fresh).await;
            return Err(e);
        }

        Ok(vec![artifact(evidence, &dst, "Logs", "module-hayabusa").await?])
    }

    async fn run_plaso(
        &self,
        evidence: &Evidence,
        parsers: &str,
        extension: &str,
    ) -> Result<Vec<Evidence>, ModuleError> {
        let src = self.evidence_path(evidence)?;
        let storage = with_suffix(&src, extension);
        let csv = with_suffix(&storage, ".csv");
        let fresh = fresh_outputs(&[storage.as_path(), csv.as_path()]).await;

        let args: Vec<OsString> = vec![
            "--unattended".into(),
            "--parsers".into(),
            parsers.into(),
            "--output-format".into(),
            "dynamic".into(),
            "--source".into(),
            src.into_os_string(),
            "--storage-file".into(),
            storage.clone().into_os_string(),
            "--write".into(),
            csv.clone().into_os_string(),
        ];

        if let Err(e) = self.execute(args).await {
            remove_partial(&fresh).await;
            return Err(e);
        }

        Ok(vec![
            artifact(evidence, &storage, "Other", "module-plaso").await?,
            artifact(evidence, &csv, "Other", "module-plaso").await?,
        ])
    }

    async fn run_timesketch(&self, job: &JobDescriptor, evidence: &Evidence) -> Result<Vec<Evidence>, ModuleError> {
        let target = self
            .timesketch
            .as_ref()
            .ok_or_else(|| ModuleError::NotConfigured(self.name.to_string()))?;
        let case = job
            .case
            .as_ref()
            .ok_or_else(|| ModuleError::Failed("case missing from job descriptor".to_string()))?;
        if case.sketch_id == 0 {
            return Err(ModuleError::Failed(format!(
                "case {} has no Timesketch sketch",
                case.id
            )));
        }
        let src = self.evidence_path(evidence)?;

        let args: Vec<OsString> = vec![
            "--quick".into(),
            "--host".into(),
            target.url.as_str().into(),
            "-u".into(),
            target.user.as_str().into(),
            "-p".into(),
            target.password.expose_secret().into(),
            "--sketch_id".into(),
            case.sketch_id.to_string().into(),
            src.into_os_string(),
        ];
        self.execute(args).await?;

        info!(sketch = case.sketch_id, evidence = %evidence.name, "timeline uploaded");
        Ok(Vec::new())
    }
}

#[async_trait]
impl Module for ToolModule {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn supports(&self, evidence: &Evidence) -> bool {
        let Some(ext) = evidence.extension() else {
            return false;
        };
        match self.kind {
            ToolKind::Hayabusa => ext == "evtx",
            ToolKind::Plaso { .. } => ext == "zip",
            ToolKind::TimesketchImporter => ext == "plaso" || ext == "jsonl",
        }
    }

    async fn check(&self) -> Result<(), ModuleError> {
        let command = self.command()?;
        if self.kind == ToolKind::TimesketchImporter && self.timesketch.is_none() {
            return Err(ModuleError::NotConfigured(self.name.to_string()));
        }
        let (program, base) = command
            .split_first()
            .ok_or_else(|| ModuleError::NotConfigured(self.name.to_string()))?;

        let output = Command::new(program)
            .args(base)
            .args(self.kind.check_args())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(ModuleError::Spawn)?;
        if !output.status.success() {
            debug!(
                module = self.name,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "prerequisite check failed"
            );
        }
        exit_result(output.status)
    }

    async fn run(&self, job: &JobDescriptor) -> Result<Vec<Evidence>, ModuleError> {
        let evidence = job.evidence.as_ref().ok_or(ModuleError::MissingEvidence)?;
        match self.kind {
            ToolKind::Hayabusa => self.run_hayabusa(evidence).await,
            ToolKind::Plaso { parsers, extension } => self.run_plaso(evidence, parsers, extension).await,
            ToolKind::TimesketchImporter => self.run_timesketch(job, evidence).await,
        }
    }
}

fn exit_result(status: ExitStatus) -> Result<(), ModuleError> {
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(ModuleError::Exited(code)),
        None => Err(ModuleError::Terminated),
    }
}

fn is_plain_file_name(part: &str) -> bool {
    !part.is_empty() && Path::new(part).file_name().is_some_and(|name| name == part)
}

/// `dir/name.ext` → `dir/name.ext<suffix>`.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Outputs that do not exist yet. Only these may be removed after a failed
/// run; anything already there belongs to someone else.
async fn fresh_outputs(paths: &[&Path]) -> Vec<PathBuf> {
    let mut fresh = Vec::with_capacity(paths.len());
    for path in paths {
        if !tokio::fs::try_exists(path).await.unwrap_or(true) {
            fresh.push(path.to_path_buf());
        }
    }
    fresh
}

async fn remove_partial(paths: &[PathBuf]) {
    for path in paths {
        if tokio::fs::remove_file(path).await.is_ok() {
            debug!(path = %path.display(), "removed partial output");
        }
    }
}

async fn artifact(
    source: &Evidence,
    path: &Path,
    kind: &str,
    notes: &str,
) -> Result<Evidence, ModuleError> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| {
        ModuleError::Failed(format!("tool produced no output at {}: {e}", path.display()))
    })?;

    Ok(Evidence {
        id: Uuid::new_v4().simple().to_string(),
        case_id: source.case_id.clone(),
        kind: kind.to_string(),
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        source: source.source.clone(),
        notes: notes.to_string(),
        size: i64::try_from(metadata.len()).unwrap_or(i64::MAX),
        hash: String::new(),
        added_at: Utc::now(),
    })
}
