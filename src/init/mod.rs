//! `orchestrate init`: lay out the state directory for a project.
//!
//! ```text
//! .orchestrate/
//! ├── orchestrate.toml     # commented defaults
//! ├── runs/
//! ├── interop/{requests,responses,claims}/
//! ├── revisions/
//! └── program/
//! BACKLOG.md               # empty backlog table
//! ```
//!
//! Existing files are never overwritten.

use crate::config::Config;
use crate::settings::{CONFIG_FILE, DEFAULT_STATE_DIR};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const CONFIG_TEMPLATE: &str = r#"# orchestrate configuration. Every key is optional.

[state]
# dir = ".orchestrate"
# lock_wait_secs = 0
# os_permissions = false

[budgets]
# max_revisions = 3
# max_failures = 2
# max_program_cycles = 50
# max_compute_hours = 24.0
# max_read_bytes = 50000000

[executor]
# command = "claude"
# args = ["--dangerously-skip-permissions", "--print", "--output-format", "stream-json", "--verbose"]
# allowed_tools_flag = "--allowedTools"
# phase_timeout_secs = 3600
# sync_command = "rsync -a remote:results/ results/"
# sync_timeout_secs = 120

[program]
# pipeline = "math"
# backlog = "BACKLOG.md"
# handoff_marker = "HANDOFF.md"

# [pipelines.review]
# restart_from = "draft"
# [[pipelines.review.phases]]
# name = "draft"
# locks = [{ path = "{spec}", mode = "exclusive-write" }]
"#;

const BACKLOG_TEMPLATE: &str = "# Backlog

| Priority | Construction | Spec File | Status | Depends On | Notes |
|---|---|---|---|---|---|
";

#[derive(Debug)]
pub struct InitResult {
    pub state_dir: PathBuf,
    /// Files written by this call
    pub created: Vec<PathBuf>,
}

/// Create the state layout, a commented config, and an empty backlog.
/// Safe to run repeatedly.
pub fn init_project(config: &Config) -> Result<InitResult> {
    config.ensure_directories()?;

    let mut created = Vec::new();
    let config_file = config.project_dir.join(DEFAULT_STATE_DIR).join(CONFIG_FILE);
    if write_if_missing(&config_file, CONFIG_TEMPLATE)? {
        created.push(config_file);
    }
    if write_if_missing(&config.backlog_file, BACKLOG_TEMPLATE)? {
        created.push(config.backlog_file.clone());
    }

    Ok(InitResult {
        state_dir: config.state_dir.clone(),
        created,
    })
}

pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(DEFAULT_STATE_DIR).join(CONFIG_FILE).exists()
}

fn write_if_missing(path: &Path, content: &str) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}
