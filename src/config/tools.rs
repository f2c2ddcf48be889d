//! External tool locations for the built-in modules.
//!
//! Read by workers from a TOML file:
//!
//! ```toml
//! [hayabusa]
//! command = ["/opt/hayabusa/hayabusa"]
//!
//! [plaso]
//! command = ["docker", "run", "--rm", "-v", "/data:/data", "log2timeline/plaso", "psteal.py"]
//!
//! [timesketch]
//! command = ["timesketch_importer"]
//! url = "https://timesketch.example"
//! user = "importer"
//! password = "..."
//! ```
//!
//! A missing section leaves the matching modules unconfigured; they fail
//! their prerequisite check and the worker does not advertise them.

use std::path::Path;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    #[serde(default)]
    pub hayabusa: Option<ToolCommand>,
    #[serde(default)]
    pub plaso: Option<ToolCommand>,
    #[serde(default)]
    pub timesketch: Option<TimesketchConfig>,
}

/// Program and leading arguments. Module arguments are appended.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCommand {
    pub command: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TimesketchConfig {
    pub command: Vec<String>,
    pub url: String,
    pub user: String,
    pub password: SecretString,
}

impl ToolsConfig {
    /// Load and validate the tools file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read tools config {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: ToolsConfig = toml::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid tools config: {e}")))?;

        let commands = [
            ("hayabusa", config.hayabusa.as_ref().map(|t| &t.command)),
            ("plaso", config.plaso.as_ref().map(|t| &t.command)),
            ("timesketch", config.timesketch.as_ref().map(|t| &t.command)),
        ];
        for (section, command) in commands {
            if command.is_some_and(|c| c.is_empty() || c[0].trim().is_empty()) {
                return Err(Error::Config(format!("[{section}] command must not be empty")));
            }
        }
        Ok(config)
    }
}
