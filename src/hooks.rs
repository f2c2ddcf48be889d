//! Hooks: enqueue modules automatically when evidence arrives.
//!
//! A hook pairs a trigger with a module and a condition. Conditions are
//! interpreted by a [`RuleEngine`]; the built-in [`NamePatternRules`] treats
//! them as comma-separated globs over the evidence file name.

use std::sync::Arc;

use regex::Regex;
use tracing::{info, warn};

use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{Evidence, Hook, HookTrigger, Job, NewJob};
use crate::module::ModuleRegistry;

/// Evaluates hook conditions against evidence.
pub trait RuleEngine: Send + Sync {
    /// Reject a condition that can never be evaluated.
    fn validate(&self, condition: &str) -> Result<()>;

    fn evaluate(&self, condition: &str, evidence: &Evidence) -> Result<bool>;
}

/// Glob conditions such as `*.evtx` or `*.plaso, *.jsonl`, matched
/// case-insensitively against the evidence name.
#[derive(Debug, Clone, Copy, Default)]
pub struct NamePatternRules;

impl NamePatternRules {
    fn compile(condition: &str) -> Result<Vec<Regex>> {
        let patterns: Vec<&str> = condition
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if patterns.is_empty() {
            return Err(Error::Validation("hook condition is empty".to_string()));
        }
        patterns.into_iter().map(glob_to_regex).collect()
    }
}

impl RuleEngine for NamePatternRules {
    fn validate(&self, condition: &str) -> Result<()> {
        Self::compile(condition).map(|_| ())
    }

    fn evaluate(&self, condition: &str, evidence: &Evidence) -> Result<bool> {
        Ok(Self::compile(condition)?
            .iter()
            .any(|re| re.is_match(&evidence.name)))
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("(?i)^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| Error::Validation(format!("bad pattern {pattern:?}: {e}")))
}

/// Fires hooks for a trigger and enqueues the resulting jobs.
#[derive(Clone)]
pub struct HookRunner {
    db: Arc<Db>,
    registry: Arc<ModuleRegistry>,
    rules: Arc<dyn RuleEngine>,
}

impl HookRunner {
    pub fn new(db: Arc<Db>, registry: Arc<ModuleRegistry>, rules: Arc<dyn RuleEngine>) -> Self {
        Self { db, registry, rules }
    }

    /// Check a hook before it is stored.
    pub fn validate(&self, hook: &Hook) -> Result<()> {
        if !self.registry.contains(&hook.module) {
            return Err(Error::Validation(format!("unknown module {:?}", hook.module)));
        }
        self.rules.validate(&hook.condition)
    }

    /// Enqueue a job for every enabled `OnEvidenceAdded` hook whose
    /// condition matches. Broken hooks are logged and skipped.
    pub async fn on_evidence_added(&self, evidence: &Evidence) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for hook in self.db.list_hooks().await? {
            if !hook.enabled || hook.trigger != HookTrigger::OnEvidenceAdded {
                continue;
            }
            if !self.registry.contains(&hook.module) {
                warn!(hook = %hook.name, module = %hook.module, "hook names unknown module, skipped");
                continue;
            }
            match self.rules.evaluate(&hook.condition, evidence) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(hook = %hook.name, error = %e, "hook condition failed to evaluate, skipped");
                    continue;
                }
            }

            let job = self
                .db
                .enqueue(NewJob::new(&evidence.case_id, &evidence.id, &hook.module))
                .await?;
            info!(hook = %hook.name, job = %job.id, module = %hook.module, evidence = %evidence.id, "hook fired");
            jobs.push(job);
        }
        Ok(jobs)
    }
}
