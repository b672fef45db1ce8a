//! The task executor boundary.
//!
//! The orchestrator never does a phase's work itself. It hands a prompt, a
//! tool allowlist and a working directory to a `TaskExecutor` and gets
//! back an exit code and a transcript. `CommandExecutor` shells out to an
//! agent CLI; tests substitute `testing::ScriptedExecutor`.

mod command;
pub mod stream;
#[cfg(test)]
pub mod testing;

pub use command::CommandExecutor;

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;

/// Everything an executor receives for one phase.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub run_id: String,
    pub pipeline: String,
    pub phase: String,
    pub prompt: String,
    pub allowed_tools: Vec<String>,
    pub working_dir: PathBuf,
    pub run_dir: PathBuf,
    pub log_path: PathBuf,
    /// Extra environment for the executor process
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub transcript: String,
    /// Files the executor reported reading, as given in its tool calls
    pub read_paths: Vec<String>,
}

impl ExecutionOutcome {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one phase to completion. Dropping the returned future must stop
    /// the underlying work.
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome>;

    /// Human-readable command line for run metadata.
    fn describe(&self) -> String;
}
