//! Pipeline definitions: named, fixed, ordered phase sequences.
//!
//! This module provides:
//! - `PhaseSpec`, one phase with its lock requests, capability rules,
//!   executor tool list, and optional prompt/timeout
//! - `Pipeline`, the ordered phases plus the default revision restart point
//! - `PipelineRegistry`, built-in pipelines merged with `[pipelines.*]`
//!   tables from `orchestrate.toml`

mod builtin;

pub use builtin::{builtin_names, builtin_pipelines};

use crate::errors::OrchestratorError;
use crate::locks::{CapabilityRule, LockMode, LockRequest};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A lock request whose path may reference `{spec}` or `{run_dir}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTemplate {
    pub path: String,
    pub mode: LockMode,
}

impl LockTemplate {
    pub fn new(path: &str, mode: LockMode) -> Self {
        Self {
            path: path.to_string(),
            mode,
        }
    }

    /// Substitute template variables. A `{spec}` template with no spec in
    /// scope yields nothing.
    pub fn render(&self, spec: Option<&str>, run_dir: &str) -> Option<LockRequest> {
        let mut path = self.path.replace("{run_dir}", run_dir);
        if path.contains("{spec}") {
            path = path.replace("{spec}", spec?);
        }
        Some(LockRequest::new(path, self.mode))
    }
}

/// One phase of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Locks acquired for the duration of the phase
    #[serde(default)]
    pub locks: Vec<LockTemplate>,
    /// First-match capability rules evaluated by the guard
    #[serde(default)]
    pub rules: Vec<CapabilityRule>,
    /// Tools the executor may use (empty = executor default)
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Prompt template path, relative to the project directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl PhaseSpec {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            locks: Vec::new(),
            rules: Vec::new(),
            allowed_tools: Vec::new(),
            prompt: None,
            timeout_secs: None,
        }
    }

    pub fn lock(mut self, path: &str, mode: LockMode) -> Self {
        self.locks.push(LockTemplate::new(path, mode));
        self
    }

    pub fn rule(mut self, rule: CapabilityRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn tools(mut self, tools: &[&str]) -> Self {
        self.allowed_tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Render every lock template for one run.
    pub fn lock_requests(&self, spec: Option<&str>, run_dir: &str) -> Vec<LockRequest> {
        self.locks
            .iter()
            .filter_map(|t| t.render(spec, run_dir))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Filled from the table key when loaded from `orchestrate.toml`
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub phases: Vec<PhaseSpec>,
    /// Phase a revision restarts from when the signal names none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_from: Option<String>,
}

impl Pipeline {
    pub fn phase(&self, name: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    pub fn require_phase(&self, name: &str) -> Result<usize, OrchestratorError> {
        self.phase_index(name)
            .ok_or_else(|| OrchestratorError::UnknownPhase {
                pipeline: self.name.clone(),
                phase: name.to_string(),
            })
    }

    /// Where a revision restarts when the signal does not say.
    pub fn default_restart(&self) -> &str {
        self.restart_from
            .as_deref()
            .filter(|r| self.phase(r).is_some())
            .or_else(|| self.phases.first().map(|p| p.name.as_str()))
            .unwrap_or_default()
    }

    pub fn phase_names(&self) -> Vec<&str> {
        self.phases.iter().map(|p| p.name.as_str()).collect()
    }

    /// Structural problems; empty when the pipeline is usable.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.phases.is_empty() {
            problems.push("has no phases".to_string());
        }
        let mut seen = HashSet::new();
        for phase in &self.phases {
            if phase.name.trim().is_empty() {
                problems.push("has a phase with an empty name".to_string());
            }
            if !seen.insert(phase.name.as_str()) {
                problems.push(format!("phase '{}' appears twice", phase.name));
            }
            for rule in &phase.rules {
                if glob::Pattern::new(&rule.pattern).is_err() {
                    problems.push(format!(
                        "phase '{}' has an invalid rule pattern '{}'",
                        phase.name, rule.pattern
                    ));
                }
            }
        }
        if let Some(ref restart) = self.restart_from
            && self.phase(restart).is_none()
        {
            problems.push(format!("restart_from '{}' is not a phase", restart));
        }
        problems
    }
}

/// All pipelines known to this project.
#[derive(Debug, Clone)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<String, Pipeline>,
}

impl PipelineRegistry {
    pub fn builtin() -> Self {
        Self {
            pipelines: builtin_pipelines()
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
        }
    }

    /// Built-ins plus configured pipelines. A configured pipeline with a
    /// built-in's name replaces it.
    pub fn with_configured(configured: &BTreeMap<String, Pipeline>) -> Result<Self, OrchestratorError> {
        let mut registry = Self::builtin();
        for (name, pipeline) in configured {
            let mut pipeline = pipeline.clone();
            pipeline.name = name.clone();
            let problems = pipeline.problems();
            if !problems.is_empty() {
                return Err(OrchestratorError::validation(format!(
                    "pipeline '{}' {}",
                    name,
                    problems.join("; ")
                )));
            }
            registry.pipelines.insert(name.clone(), pipeline);
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Result<&Pipeline, OrchestratorError> {
        self.pipelines
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownPipeline(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pipeline> {
        self.pipelines.values()
    }

    /// Map an interop action onto a phase of `pipeline`. Accepts `phase`
    /// or `pipeline.phase`.
    pub fn resolve_action(
        &self,
        pipeline: &str,
        action: &str,
    ) -> Result<(&Pipeline, &PhaseSpec), OrchestratorError> {
        let target = self.get(pipeline)?;
        let phase_name = match action.split_once('.') {
            Some((prefix, phase)) if prefix == pipeline => phase,
            Some((prefix, _)) => {
                return Err(OrchestratorError::validation(format!(
                    "action '{}' names pipeline '{}' but the request targets '{}'",
                    action, prefix, pipeline
                )));
            }
            None => action,
        };
        let phase = target
            .phase(phase_name)
            .ok_or_else(|| OrchestratorError::UnknownPhase {
                pipeline: pipeline.to_string(),
                phase: phase_name.to_string(),
            })?;
        Ok((target, phase))
    }
}
