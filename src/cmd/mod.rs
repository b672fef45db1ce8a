//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                          |
//! |------------|-------------------------------------------|
//! | `run`      | `<pipeline> [phase] [args...]`            |
//! | `interop`  | `Request`, `Pump`                         |
//! | `program`  | `Program`                                 |
//! | `status`   | `Status`, `Runs`, `Locks`, `Pipelines`    |
//! | `guard`    | `Guard`                                   |
//! | `config`   | `Config`                                  |
//! | `project`  | `Init`                                    |
//!
//! Handlers return the process exit code.

pub mod config;
pub mod guard;
pub mod interop;
pub mod program;
pub mod project;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use guard::cmd_guard;
pub use interop::{cmd_pump, cmd_request};
pub use program::cmd_program;
pub use project::cmd_init;
pub use run::run_pipeline;
pub use status::{cmd_locks, cmd_pipelines, cmd_runs, cmd_status};

use anyhow::{Context, Result};
use orchestrate::config::{Config, ConfigOverrides, load_dotenv};
use orchestrate::context::OrchestrationContext;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::watch;

use super::Cli;

/// `--project-dir`, else the project of the phase we run inside, else cwd.
pub fn project_dir(cli: &Cli) -> Result<PathBuf> {
    if let Some(ref dir) = cli.project_dir {
        return Ok(dir.clone());
    }
    match std::env::var_os("ORCHESTRATE_PROJECT_DIR").filter(|v| !v.is_empty()) {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => std::env::current_dir().context("Failed to get current directory"),
    }
}

/// Resolve configuration: file, `.env`, environment, then CLI flags.
pub fn load_config(cli: &Cli, max_cycles: Option<u32>) -> Result<Config> {
    let project_dir = project_dir(cli)?;
    load_dotenv(&project_dir);
    Config::load(
        &project_dir,
        ConfigOverrides {
            state_dir: cli.state_dir.clone(),
            max_cycles,
            verbose: cli.verbose,
        },
    )
}

pub fn load_context(cli: &Cli, max_cycles: Option<u32>) -> Result<OrchestrationContext> {
    let config = load_config(cli, max_cycles)?;
    config.ensure_directories()?;
    Ok(OrchestrationContext::from_config(config)?)
}

/// Flips to `true` on Ctrl-C. Long-running commands stop at their next
/// safe point.
pub fn interrupt_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; stopping at the next safe point");
            let _ = tx.send(true);
        }
    });
    rx
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}
