//! Analysis modules and the registry that names them.
//!
//! A module is a named unit of work runnable against one evidence item. The
//! registry is built once at startup and never mutated afterwards; the
//! dispatcher consults it for descriptors and the worker for execution.

pub mod tool;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::ToolsConfig;
use crate::db::validate_module_name;
use crate::error::{Error, ModuleError, Result};
use crate::model::{Evidence, JobDescriptor};

pub use tool::{ToolKind, ToolModule};

/// A runnable analysis module.
#[async_trait]
pub trait Module: Send + Sync {
    /// Unique name, also the job's module name on the wire.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Whether this module applies to the given evidence.
    fn supports(&self, evidence: &Evidence) -> bool;

    /// Verify the host can run this module. Called once at worker start.
    async fn check(&self) -> std::result::Result<(), ModuleError> {
        Ok(())
    }

    /// Run against the descriptor's evidence and return any artifacts
    /// produced, to be registered as new evidence.
    async fn run(&self, job: &JobDescriptor) -> std::result::Result<Vec<Evidence>, ModuleError>;
}

/// Immutable name → module map.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, Arc<dyn Module>>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.modules.keys()).finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module. Names must pass the module-name allow-list and be unique.
    pub fn register(&mut self, module: Arc<dyn Module>) -> Result<()> {
        let name = module.name().to_string();
        validate_module_name(&name)?;
        if self.modules.contains_key(&name) {
            return Err(Error::Validation(format!("module {name:?} registered twice")));
        }
        self.modules.insert(name, module);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, module: Arc<dyn Module>) -> Result<Self> {
        self.register(module)?;
        Ok(self)
    }

    /// The built-in tool modules, wired to the configured commands.
    ///
    /// Tools without a config section are still registered so the catalog
    /// is complete; they fail [`Module::check`].
    pub fn builtin(tools: ToolsConfig, evidence_dir: &Path) -> Result<Self> {
        let mut registry = Self::new();
        for module in ToolModule::builtin(tools, evidence_dir) {
            registry.register(Arc::new(module))?;
        }
        Ok(registry)
    }

    /// The built-in modules with no tools attached. Used by the server,
    /// which only needs names and `supports`.
    pub fn catalog() -> Result<Self> {
        Self::builtin(ToolsConfig::default(), Path::new("."))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Module>> {
        self.modules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Module names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Module>> {
        self.modules.values()
    }

    /// Modules whose `supports` holds for `evidence`.
    pub fn supported<'r, 'e>(
        &'r self,
        evidence: &'e Evidence,
    ) -> impl Iterator<Item = &'r Arc<dyn Module>> + use<'r, 'e> {
        self.modules.values().filter(move |m| m.supports(evidence))
    }

    /// Keep only the modules whose prerequisite check passes.
    pub async fn available(self) -> Self {
        let mut modules = BTreeMap::new();
        for (name, module) in self.modules {
            match module.check().await {
                Ok(()) => {
                    info!(module = %name, "module available");
                    modules.insert(name, module);
                }
                Err(e) => warn!(module = %name, error = %e, "module unavailable, not advertised"),
            }
        }
        Self { modules }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
