//! Per-run artifact records.
//!
//! Every phase invocation is a Run with its own directory:
//!
//! ```text
//! <state>/runs/<run_id>/
//!   summary         # human-readable outcome
//!   metadata.json   # RunMetadata
//!   log             # raw executor output
//!   events.jsonl    # append-only EventRecord stream
//! ```

mod store;

pub use store::{ArtifactStore, NewRun, RunHandle};

use crate::errors::PhaseFailure;
use crate::governor::BudgetName;
use crate::locks::LockMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
    NeedsRevision,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failure => write!(f, "failure"),
            RunStatus::NeedsRevision => write!(f, "needs-revision"),
        }
    }
}

/// Marker an executor writes to ask for a revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionSignal {
    /// Phase to restart from; the pipeline default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_from: Option<String>,
    #[serde(default)]
    pub reason: String,
}

/// Classified result of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum PhaseOutcome {
    Success,
    Failure { failure: PhaseFailure },
    NeedsRevision { signal: RevisionSignal },
}

impl PhaseOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            PhaseOutcome::Success => RunStatus::Success,
            PhaseOutcome::Failure { .. } => RunStatus::Failure,
            PhaseOutcome::NeedsRevision { .. } => RunStatus::NeedsRevision,
        }
    }

    pub fn failure(&self) -> Option<&PhaseFailure> {
        match self {
            PhaseOutcome::Failure { failure } => Some(failure),
            _ => None,
        }
    }
}

impl std::fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseOutcome::Success => write!(f, "success"),
            PhaseOutcome::Failure { failure } => write!(f, "failure ({})", failure),
            PhaseOutcome::NeedsRevision { signal } => match signal.restart_from {
                Some(ref phase) => write!(f, "needs-revision from {}: {}", phase, signal.reason),
                None => write!(f, "needs-revision: {}", signal.reason),
            },
        }
    }
}

/// `metadata.json` of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub pipeline: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    /// Set for interop child runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub revision_cycle: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub outcome: Option<PhaseOutcome>,
    pub host: String,
    pub pid: u32,
    pub cwd: PathBuf,
    pub executor: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub compute_hours: Option<f64>,
    #[serde(default)]
    pub read_bytes: Option<u64>,
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: DateTime<Utc>,
    pub run_id: String,
    #[serde(flatten)]
    pub event: RunEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        pipeline: String,
        phase: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_run_id: Option<String>,
    },
    PhaseStarted {
        phase: String,
    },
    LockAcquired {
        path: String,
        mode: LockMode,
    },
    LockReleased {
        path: String,
    },
    BudgetConsumed {
        scope: String,
        budget: BudgetName,
        amount: f64,
        used: f64,
        ceiling: f64,
        exceeded: bool,
    },
    PhaseFinished {
        phase: String,
        exit_code: Option<i32>,
        outcome: String,
    },
    RunFinished {
        status: RunStatus,
    },
    RequestEnqueued {
        request_id: String,
        request_path: String,
    },
    RequestCompleted {
        request_id: String,
        status: String,
        child_run_id: Option<String>,
        response_path: String,
    },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::PhaseStarted { .. } => "phase_started",
            RunEvent::LockAcquired { .. } => "lock_acquired",
            RunEvent::LockReleased { .. } => "lock_released",
            RunEvent::BudgetConsumed { .. } => "budget_consumed",
            RunEvent::PhaseFinished { .. } => "phase_finished",
            RunEvent::RunFinished { .. } => "run_finished",
            RunEvent::RequestEnqueued { .. } => "request_enqueued",
            RunEvent::RequestCompleted { .. } => "request_completed",
        }
    }
}
