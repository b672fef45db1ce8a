use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::settings::{PhaseSettings, ProjectToml};
use crate::util::resolve_path;

/// Ceilings enforced by the resource governor.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetLimits {
    pub max_revisions: u32,
    pub max_failure_retries: u32,
    pub max_program_cycles: u32,
    pub max_compute_hours: f64,
    pub max_read_bytes: u64,
}

/// How the task executor process is launched.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub command: String,
    pub args: Vec<String>,
    pub allowed_tools_flag: Option<String>,
    pub phase_timeout: Duration,
    pub sync_command: Option<String>,
    pub sync_timeout: Duration,
}

/// CLI-level overrides, the last configuration layer.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub state_dir: Option<PathBuf>,
    pub max_cycles: Option<u32>,
    pub verbose: bool,
}

/// Runtime configuration threaded through every component.
///
/// Built from the layered `ProjectToml` (file, then environment) plus CLI
/// overrides. All paths are absolute.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub interop_dir: PathBuf,
    pub revisions_dir: PathBuf,
    pub program_dir: PathBuf,
    pub budgets_file: PathBuf,
    pub backlog_file: PathBuf,
    pub handoff_marker: PathBuf,
    pub program_pipeline: String,
    pub budgets: BudgetLimits,
    pub executor: ExecutorSettings,
    pub lock_wait: Duration,
    pub os_permissions: bool,
    pub verbose: bool,
    /// Where the file layer came from, if a file existed
    pub source: Option<PathBuf>,
    toml: ProjectToml,
}

impl Config {
    /// Resolve configuration for `project_dir` from file, process
    /// environment, and CLI overrides.
    pub fn load(project_dir: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let (mut toml, source) = ProjectToml::load_layered(&project_dir)?;
        toml.apply_env(|key| std::env::var(key).ok())?;
        let mut config = Self::from_toml(project_dir, toml, overrides);
        config.source = source;
        Ok(config)
    }

    /// Build from an already-layered `ProjectToml`. Does not touch the
    /// process environment.
    pub fn from_toml(project_dir: PathBuf, toml: ProjectToml, overrides: ConfigOverrides) -> Self {
        let state_dir = match overrides.state_dir {
            Some(ref dir) if dir.is_absolute() => dir.clone(),
            Some(ref dir) => project_dir.join(dir),
            None => resolve_path(&project_dir, &toml.state.dir),
        };

        let budgets = BudgetLimits {
            max_revisions: toml.budgets.max_revisions,
            max_failure_retries: toml.budgets.max_failures,
            max_program_cycles: overrides
                .max_cycles
                .unwrap_or(toml.budgets.max_program_cycles),
            max_compute_hours: toml.budgets.max_compute_hours,
            max_read_bytes: toml.budgets.max_read_bytes,
        };

        let executor = ExecutorSettings {
            command: toml.executor.command.clone(),
            args: toml.executor.args.clone(),
            allowed_tools_flag: Some(toml.executor.allowed_tools_flag.clone())
                .filter(|f| !f.trim().is_empty()),
            phase_timeout: Duration::from_secs(toml.executor.phase_timeout_secs),
            sync_command: toml
                .executor
                .sync_command
                .clone()
                .filter(|c| !c.trim().is_empty()),
            sync_timeout: Duration::from_secs(toml.executor.sync_timeout_secs),
        };

        Self {
            runs_dir: state_dir.join("runs"),
            interop_dir: state_dir.join("interop"),
            revisions_dir: state_dir.join("revisions"),
            program_dir: state_dir.join("program"),
            budgets_file: state_dir.join("budgets.json"),
            backlog_file: resolve_path(&project_dir, &toml.program.backlog),
            handoff_marker: resolve_path(&project_dir, &toml.program.handoff_marker),
            program_pipeline: toml.program.pipeline.clone(),
            lock_wait: Duration::from_secs(toml.state.lock_wait_secs),
            os_permissions: toml.state.os_permissions,
            verbose: overrides.verbose,
            budgets,
            executor,
            source: None,
            state_dir,
            project_dir,
            toml,
        }
    }

    /// Defaults only, rooted at `project_dir`.
    pub fn for_project(project_dir: &Path) -> Self {
        Self::from_toml(
            project_dir.to_path_buf(),
            ProjectToml::default(),
            ConfigOverrides::default(),
        )
    }

    pub fn toml(&self) -> &ProjectToml {
        &self.toml
    }

    pub fn phase_settings(&self, phase: &str) -> PhaseSettings {
        self.toml.phase_settings(phase)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.runs_dir,
            &self.interop_dir.join("requests"),
            &self.interop_dir.join("responses"),
            &self.interop_dir.join("claims"),
            &self.revisions_dir,
            &self.program_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Load `.env` from the project directory without overriding variables
/// that are already set.
pub fn load_dotenv(project_dir: &Path) {
    let path = project_dir.join(".env");
    if path.exists()
        && let Err(e) = dotenvy::from_path(&path)
    {
        tracing::warn!(path = %path.display(), error = %e, "Failed to load .env");
    }
}
