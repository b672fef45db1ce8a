//! Project configuration file: `.orchestrate/orchestrate.toml`.
//!
//! # Configuration File Format
//!
//! ```toml
//! [state]
//! dir = ".orchestrate"
//! lock_wait_secs = 0
//! os_permissions = false
//!
//! [budgets]
//! max_revisions = 3
//! max_failures = 2
//! max_program_cycles = 50
//! max_compute_hours = 24.0
//! max_read_bytes = 50000000
//!
//! [executor]
//! command = "claude"
//! args = ["--print", "--output-format", "stream-json", "--verbose"]
//! allowed_tools_flag = "--allowedTools"
//! phase_timeout_secs = 3600
//! sync_command = "rsync -a remote:/results/ results/"
//!
//! [program]
//! pipeline = "math"
//! backlog = "CONSTRUCTIONS.md"
//! handoff_marker = "HANDOFF.md"
//!
//! [phases.overrides."prove*"]
//! timeout_secs = 7200
//!
//! [pipelines.review]
//! restart_from = "draft"
//! [[pipelines.review.phases]]
//! name = "draft"
//! ```

use crate::pipeline::Pipeline;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Name of the config file inside the state directory.
pub const CONFIG_FILE: &str = "orchestrate.toml";

/// Default state directory, relative to the project.
pub const DEFAULT_STATE_DIR: &str = ".orchestrate";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSection {
    /// State directory (relative to the project directory)
    #[serde(default = "default_state_dir")]
    pub dir: String,
    /// Seconds `acquire` keeps retrying a conflicting lock (0 = fail fast)
    #[serde(default)]
    pub lock_wait_secs: u64,
    /// Back read-only locks with OS permission bits
    #[serde(default)]
    pub os_permissions: bool,
}

fn default_state_dir() -> String {
    DEFAULT_STATE_DIR.to_string()
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            lock_wait_secs: 0,
            os_permissions: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetsSection {
    /// Revision cycles allowed per task
    #[serde(default = "default_max_revisions")]
    pub max_revisions: u32,
    /// Retries of recoverable executor failures per task
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Scheduler cycles per program run
    #[serde(default = "default_max_program_cycles")]
    pub max_program_cycles: u32,
    /// Compute hours per program run
    #[serde(default = "default_max_compute_hours")]
    pub max_compute_hours: f64,
    /// Bytes of must-read input per session
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: u64,
}

fn default_max_revisions() -> u32 {
    3
}

fn default_max_failures() -> u32 {
    2
}

fn default_max_program_cycles() -> u32 {
    50
}

fn default_max_compute_hours() -> f64 {
    24.0
}

fn default_max_read_bytes() -> u64 {
    50_000_000
}

impl Default for BudgetsSection {
    fn default() -> Self {
        Self {
            max_revisions: default_max_revisions(),
            max_failures: default_max_failures(),
            max_program_cycles: default_max_program_cycles(),
            max_compute_hours: default_max_compute_hours(),
            max_read_bytes: default_max_read_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    /// Executor command (default: "claude")
    #[serde(default = "default_executor_command")]
    pub command: String,
    /// Arguments placed before the per-phase flags
    #[serde(default = "default_executor_args")]
    pub args: Vec<String>,
    /// Flag used to pass the phase's allowed tools; empty disables it
    #[serde(default = "default_allowed_tools_flag")]
    pub allowed_tools_flag: String,
    /// Watchdog deadline per phase
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    /// Best-effort artifact sync run when the watchdog fires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_command: Option<String>,
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,
}

fn default_executor_command() -> String {
    "claude".to_string()
}

fn default_executor_args() -> Vec<String> {
    vec![
        "--dangerously-skip-permissions".to_string(),
        "--print".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ]
}

fn default_allowed_tools_flag() -> String {
    "--allowedTools".to_string()
}

fn default_phase_timeout_secs() -> u64 {
    3600
}

fn default_sync_timeout_secs() -> u64 {
    120
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            command: default_executor_command(),
            args: default_executor_args(),
            allowed_tools_flag: default_allowed_tools_flag(),
            phase_timeout_secs: default_phase_timeout_secs(),
            sync_command: None,
            sync_timeout_secs: default_sync_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramSection {
    /// Pipeline that drives backlog tasks
    #[serde(default = "default_program_pipeline")]
    pub pipeline: String,
    /// Backlog table (relative to the project directory)
    #[serde(default = "default_backlog")]
    pub backlog: String,
    /// File whose presence halts the scheduler for operator handoff
    #[serde(default = "default_handoff_marker")]
    pub handoff_marker: String,
}

fn default_program_pipeline() -> String {
    "math".to_string()
}

fn default_backlog() -> String {
    "BACKLOG.md".to_string()
}

fn default_handoff_marker() -> String {
    "HANDOFF.md".to_string()
}

impl Default for ProgramSection {
    fn default() -> Self {
        Self {
            pipeline: default_program_pipeline(),
            backlog: default_backlog(),
            handoff_marker: default_handoff_marker(),
        }
    }
}

/// Phase-specific override settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Replaces the phase's allowed tools when set
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhasesSection {
    /// Pattern-based overrides (e.g., "prove*" -> PhaseOverride)
    #[serde(default)]
    pub overrides: HashMap<String, PhaseOverride>,
}

/// The complete orchestrate.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectToml {
    #[serde(default)]
    pub state: StateSection,
    #[serde(default)]
    pub budgets: BudgetsSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub program: ProgramSection,
    #[serde(default)]
    pub phases: PhasesSection,
    /// Additional or replacement pipeline definitions
    #[serde(default)]
    pub pipelines: BTreeMap<String, Pipeline>,
}

impl ProjectToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse orchestrate.toml")
    }

    /// Load `<project>/.orchestrate/orchestrate.toml`, falling back to the
    /// user-level config and then to defaults.
    pub fn load_layered(project_dir: &Path) -> Result<(Self, Option<PathBuf>)> {
        for candidate in Self::candidates(project_dir) {
            if candidate.exists() {
                return Ok((Self::load(&candidate)?, Some(candidate)));
            }
        }
        Ok((Self::default(), None))
    }

    fn candidates(project_dir: &Path) -> Vec<PathBuf> {
        let mut paths = vec![project_dir.join(DEFAULT_STATE_DIR).join(CONFIG_FILE)];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("orchestrate").join(CONFIG_FILE));
        }
        paths
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize orchestrate.toml")
    }

    /// Apply `ORCHESTRATE_*` overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", key, value, e))
        }

        if let Some(v) = lookup("ORCHESTRATE_STATE_DIR") {
            self.state.dir = v;
        }
        if let Some(v) = lookup("ORCHESTRATE_MAX_REVISIONS") {
            self.budgets.max_revisions = parsed("ORCHESTRATE_MAX_REVISIONS", v)?;
        }
        if let Some(v) = lookup("ORCHESTRATE_MAX_FAILURES") {
            self.budgets.max_failures = parsed("ORCHESTRATE_MAX_FAILURES", v)?;
        }
        if let Some(v) = lookup("ORCHESTRATE_MAX_CYCLES") {
            self.budgets.max_program_cycles = parsed("ORCHESTRATE_MAX_CYCLES", v)?;
        }
        if let Some(v) = lookup("ORCHESTRATE_MAX_COMPUTE_HOURS") {
            self.budgets.max_compute_hours = parsed("ORCHESTRATE_MAX_COMPUTE_HOURS", v)?;
        }
        if let Some(v) = lookup("ORCHESTRATE_MAX_READ_BYTES") {
            self.budgets.max_read_bytes = parsed("ORCHESTRATE_MAX_READ_BYTES", v)?;
        }
        if let Some(v) = lookup("ORCHESTRATE_EXECUTOR_CMD") {
            self.executor.command = v;
        }
        if let Some(v) = lookup("ORCHESTRATE_PHASE_TIMEOUT_SECS") {
            self.executor.phase_timeout_secs = parsed("ORCHESTRATE_PHASE_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("ORCHESTRATE_BACKLOG") {
            self.program.backlog = v;
        }
        Ok(())
    }

    /// Effective timeout and tool list for a phase after pattern overrides.
    pub fn phase_settings(&self, phase_name: &str) -> PhaseSettings {
        let mut settings = PhaseSettings::default();

        let mut patterns: Vec<_> = self.phases.overrides.iter().collect();
        patterns.sort_by(|a, b| a.0.cmp(b.0));
        for (pattern, override_cfg) in patterns {
            if pattern_matches(pattern, phase_name) {
                if let Some(timeout) = override_cfg.timeout_secs {
                    settings.timeout_secs = Some(timeout);
                }
                if let Some(ref tools) = override_cfg.allowed_tools {
                    settings.allowed_tools = Some(tools.clone());
                }
            }
        }
        settings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.budgets.max_compute_hours <= 0.0 || !self.budgets.max_compute_hours.is_finite() {
            warnings.push(format!(
                "budgets.max_compute_hours must be a positive number, got {}",
                self.budgets.max_compute_hours
            ));
        }
        if self.budgets.max_program_cycles == 0 {
            warnings.push("budgets.max_program_cycles is 0: program mode will never run a task".into());
        }
        if self.executor.command.trim().is_empty() {
            warnings.push("executor.command is empty".into());
        }
        if self.executor.phase_timeout_secs == 0 {
            warnings.push("executor.phase_timeout_secs is 0: every phase will time out".into());
        }
        if !self.pipelines.contains_key(&self.program.pipeline)
            && !crate::pipeline::builtin_names().contains(&self.program.pipeline.as_str())
        {
            warnings.push(format!(
                "program.pipeline '{}' is not a known pipeline",
                self.program.pipeline
            ));
        }
        for (name, pipeline) in &self.pipelines {
            for problem in pipeline.problems() {
                warnings.push(format!("pipelines.{}: {}", name, problem));
            }
        }
        warnings
    }
}

/// Resolved overrides for one phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseSettings {
    pub timeout_secs: Option<u64>,
    pub allowed_tools: Option<Vec<String>>,
}

/// Check if a pattern matches a phase name.
/// Supports simple glob patterns:
/// - `*` matches any sequence of characters
/// - `?` matches any single character
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();
    wildcard_match(&pattern, &name)
}

fn wildcard_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => (0..=text.len()).any(|i| wildcard_match(rest, &text[i..])),
        Some(('?', rest)) => !text.is_empty() && wildcard_match(rest, &text[1..]),
        Some((c, rest)) => text.first() == Some(c) && wildcard_match(rest, &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ProjectToml::default();
        assert_eq!(config.state.dir, ".orchestrate");
        assert_eq!(config.budgets.max_revisions, 3);
        assert_eq!(config.executor.command, "claude");
        assert_eq!(config.program.handoff_marker, "HANDOFF.md");
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = ProjectToml::parse(
            r#"
            [budgets]
            max_revisions = 5

            [executor]
            command = "sh"
            args = ["-c", "exit 0"]
            allowed_tools_flag = ""
            "#,
        )
        .unwrap();
        assert_eq!(config.budgets.max_revisions, 5);
        assert_eq!(config.budgets.max_failures, 2);
        assert_eq!(config.executor.args, vec!["-c", "exit 0"]);
        assert!(config.executor.allowed_tools_flag.is_empty());
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(ProjectToml::parse("[budgets\nmax_revisions = ").is_err());
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = ProjectToml::parse("[budgets]\nmax_revisions = 5\n").unwrap();
        config
            .apply_env(env(&[
                ("ORCHESTRATE_MAX_REVISIONS", "7"),
                ("ORCHESTRATE_MAX_COMPUTE_HOURS", "1.5"),
                ("ORCHESTRATE_EXECUTOR_CMD", "my-agent"),
                ("ORCHESTRATE_BACKLOG", "QUESTIONS.md"),
            ]))
            .unwrap();
        assert_eq!(config.budgets.max_revisions, 7);
        assert_eq!(config.budgets.max_compute_hours, 1.5);
        assert_eq!(config.executor.command, "my-agent");
        assert_eq!(config.program.backlog, "QUESTIONS.md");
    }

    #[test]
    fn test_env_rejects_garbage_numbers() {
        let mut config = ProjectToml::default();
        let err = config
            .apply_env(env(&[("ORCHESTRATE_MAX_CYCLES", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("ORCHESTRATE_MAX_CYCLES"));
    }

    #[test]
    fn test_phase_overrides_by_pattern() {
        let config = ProjectToml::parse(
            r#"
            [phases.overrides."prove*"]
            timeout_secs = 7200

            [phases.overrides."*"]
            allowed_tools = ["Read"]
            "#,
        )
        .unwrap();
        let prove = config.phase_settings("prove");
        assert_eq!(prove.timeout_secs, Some(7200));
        assert_eq!(prove.allowed_tools, Some(vec!["Read".to_string()]));

        let survey = config.phase_settings("survey");
        assert_eq!(survey.timeout_secs, None);
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let mut config = ProjectToml::default();
        config.budgets.max_compute_hours = -1.0;
        config.program.pipeline = "nope".into();
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("max_compute_hours")));
        assert!(warnings.iter().any(|w| w.contains("nope")));
    }

    #[test]
    fn test_load_layered_prefers_project_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join(DEFAULT_STATE_DIR);
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(state.join(CONFIG_FILE), "[program]\npipeline = \"tdd\"\n").unwrap();

        let (config, source) = ProjectToml::load_layered(dir.path()).unwrap();
        assert_eq!(config.program.pipeline, "tdd");
        assert_eq!(source.unwrap(), state.join(CONFIG_FILE));
    }

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("prove", "prove"));
        assert!(!pattern_matches("prove", "proves"));
        assert!(pattern_matches("pro*", "prove"));
        assert!(pattern_matches("*-setup", "db-setup"));
        assert!(pattern_matches("phase-0?", "phase-01"));
        assert!(!pattern_matches("phase-0?", "phase-10"));
        assert!(pattern_matches("PROVE", "prove"));
    }
}
