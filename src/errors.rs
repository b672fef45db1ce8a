//! Typed error hierarchy for the orchestrator.
//!
//! Two enums cover the two layers:
//! - `OrchestratorError`: the error taxonomy every component surfaces to
//!   its caller (validation, lock contention, budgets, cycles, executor
//!   failures, handoffs)
//! - `PhaseFailure`: the tag attached to a phase that finished as a
//!   `failure`, persisted in run metadata and revision records

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Process exit code for a successful command.
pub const EXIT_OK: i32 = 0;
/// Process exit code for a phase or validation failure.
pub const EXIT_FAILURE: i32 = 1;
/// Process exit code for a usage error (matches clap).
pub const EXIT_USAGE: i32 = 2;
/// Process exit code when the phase watchdog fired.
pub const EXIT_TIMEOUT: i32 = 124;

/// Errors surfaced by orchestration components.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Lock conflict on {path}: held exclusively by {holder}")]
    LockConflict { path: String, holder: String },

    #[error("Budget '{budget}' exceeded for {scope}: {used} of {ceiling}")]
    BudgetExceeded {
        scope: String,
        budget: String,
        used: f64,
        ceiling: f64,
    },

    #[error("Dependency cycle detected among: {}", nodes.join(", "))]
    DependencyCycle { nodes: Vec<String> },

    #[error("Executor failure ({tag}): {message}")]
    ExecutorFailure { tag: PhaseFailure, message: String },

    #[error("Handoff required: {}", marker.display())]
    HandoffRequired { marker: PathBuf },

    #[error("Unknown pipeline '{0}'")]
    UnknownPipeline(String),

    #[error("Pipeline '{pipeline}' has no phase '{phase}'")]
    UnknownPhase { pipeline: String, phase: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Build a validation error from anything printable.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Map the error onto the CLI exit code table.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ExecutorFailure {
                tag: PhaseFailure::Timeout,
                ..
            } => EXIT_TIMEOUT,
            _ => EXIT_FAILURE,
        }
    }

    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockConflict { .. } | Self::ExecutorFailure { .. })
    }
}

/// Why a phase finished as a `failure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "kebab-case")]
pub enum PhaseFailure {
    /// The watchdog fired before the executor returned.
    Timeout,
    /// A requested lock was held exclusively by another holder.
    LockConflict { path: String, holder: String },
    /// The executor exited with a non-zero code.
    ExitCode { code: i32 },
    /// A budget relevant to the phase was already spent.
    BudgetExceeded { budget: String },
    /// A path locked read-only changed while the phase ran.
    ReadOnlyViolation { path: String },
    /// The executor could not be started or crashed internally.
    ExecutorError { message: String },
}

impl PhaseFailure {
    /// Short kebab-case tag used in logs and reasons.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::LockConflict { .. } => "lock-conflict",
            Self::ExitCode { .. } => "exit-code",
            Self::BudgetExceeded { .. } => "budget-exceeded",
            Self::ReadOnlyViolation { .. } => "read-only-violation",
            Self::ExecutorError { .. } => "executor-error",
        }
    }

    /// Failures the revision loop may retry against the failure budget.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::LockConflict { .. } | Self::ExitCode { .. } | Self::ExecutorError { .. }
        )
    }
}

impl std::fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::LockConflict { path, holder } => {
                write!(f, "lock-conflict on {} (held by {})", path, holder)
            }
            Self::ExitCode { code } => write!(f, "exit-code {}", code),
            Self::BudgetExceeded { budget } => write!(f, "budget-exceeded ({})", budget),
            Self::ReadOnlyViolation { path } => write!(f, "read-only-violation on {}", path),
            Self::ExecutorError { message } => write!(f, "executor-error: {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_conflict_carries_path_and_holder() {
        let err = OrchestratorError::LockConflict {
            path: "spec.md".into(),
            holder: "run-a".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("spec.md"));
        assert!(msg.contains("run-a"));
        assert!(err.is_retryable());
    }

    #[test]
    fn dependency_cycle_names_every_node() {
        let err = OrchestratorError::DependencyCycle {
            nodes: vec!["P1".into(), "P2".into(), "P3".into()],
        };
        let msg = err.to_string();
        for node in ["P1", "P2", "P3"] {
            assert!(msg.contains(node));
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn timeout_maps_to_exit_124() {
        let err = OrchestratorError::ExecutorFailure {
            tag: PhaseFailure::Timeout,
            message: "watchdog".into(),
        };
        assert_eq!(err.exit_code(), EXIT_TIMEOUT);

        let err = OrchestratorError::ExecutorFailure {
            tag: PhaseFailure::ExitCode { code: 3 },
            message: "boom".into(),
        };
        assert_eq!(err.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn phase_failure_serializes_with_kebab_tag() {
        let failure = PhaseFailure::LockConflict {
            path: "spec.md".into(),
            holder: "run-a".into(),
        };
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["tag"], "lock-conflict");
        assert_eq!(json["path"], "spec.md");

        let back: PhaseFailure = serde_json::from_value(json).unwrap();
        assert_eq!(back, failure);
    }

    #[test]
    fn budget_and_violation_failures_are_not_recoverable() {
        assert!(PhaseFailure::Timeout.is_recoverable());
        assert!(PhaseFailure::ExitCode { code: 1 }.is_recoverable());
        assert!(
            !PhaseFailure::BudgetExceeded {
                budget: "compute-hours".into()
            }
            .is_recoverable()
        );
        assert!(
            !PhaseFailure::ReadOnlyViolation {
                path: "spec.md".into()
            }
            .is_recoverable()
        );
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&OrchestratorError::validation("bad row"));
        assert_std_error(&OrchestratorError::HandoffRequired {
            marker: PathBuf::from("HANDOFF.md"),
        });
    }
}
