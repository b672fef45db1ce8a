//! Resource governor: named, ceilinged counters keyed by scope.
//!
//! Scopes are task identifiers (revision and failure counts, read volume)
//! or [`PROGRAM_SCOPE`] for budgets that span a whole program run
//! (compute hours). Counters live in `<state>/budgets.json` and every
//! read-modify-write happens under an advisory flock, so concurrent
//! orchestrator processes never lose an increment.

use crate::config::BudgetLimits;
use crate::errors::OrchestratorError;
use crate::util::{FileLock, read_json, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Scope key for budgets that span the whole program run.
pub const PROGRAM_SCOPE: &str = "__program__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BudgetName {
    Revisions,
    ExecutorFailures,
    ComputeHours,
    ReadBytes,
}

impl BudgetName {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetName::Revisions => "revisions",
            BudgetName::ExecutorFailures => "executor-failures",
            BudgetName::ComputeHours => "compute-hours",
            BudgetName::ReadBytes => "read-bytes",
        }
    }
}

impl std::fmt::Display for BudgetName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetState {
    pub used: f64,
    pub ceiling: f64,
    /// Set once a consumption reached the ceiling. Re-derived when the
    /// configured ceiling changes, otherwise cleared only by reset.
    #[serde(default)]
    pub exhausted: bool,
    pub updated_at: DateTime<Utc>,
}

impl BudgetState {
    fn fresh(ceiling: f64) -> Self {
        Self {
            used: 0.0,
            ceiling,
            exhausted: false,
            updated_at: Utc::now(),
        }
    }

    /// Adopt the configured `ceiling`. Returns whether anything changed.
    fn rebase(&mut self, ceiling: f64) -> bool {
        if self.ceiling == ceiling {
            return false;
        }
        self.ceiling = ceiling;
        self.exhausted = self.used >= ceiling;
        true
    }

    pub fn remaining(&self) -> f64 {
        (self.ceiling - self.used).max(0.0)
    }
}

/// Result of a `consume` call.
#[derive(Debug, Clone, PartialEq)]
pub enum Consumption {
    Ok { used: f64, remaining: f64 },
    Exceeded { used: f64, ceiling: f64 },
}

impl Consumption {
    pub fn is_exceeded(&self) -> bool {
        matches!(self, Consumption::Exceeded { .. })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BudgetFile {
    #[serde(default)]
    scopes: BTreeMap<String, BTreeMap<BudgetName, BudgetState>>,
}

#[derive(Debug, Clone)]
pub struct ResourceGovernor {
    path: PathBuf,
    guard_path: PathBuf,
    limits: BudgetLimits,
}

impl ResourceGovernor {
    pub fn new(state_dir: &Path, limits: BudgetLimits) -> Self {
        Self {
            path: state_dir.join("budgets.json"),
            guard_path: state_dir.join("budgets.lock"),
            limits,
        }
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    /// Configured ceiling for `name`.
    pub fn ceiling(&self, name: BudgetName) -> f64 {
        match name {
            BudgetName::Revisions => f64::from(self.limits.max_revisions),
            BudgetName::ExecutorFailures => f64::from(self.limits.max_failure_retries),
            BudgetName::ComputeHours => self.limits.max_compute_hours,
            BudgetName::ReadBytes => self.limits.max_read_bytes as f64,
        }
    }

    fn with_file<T>(
        &self,
        f: impl FnOnce(&mut BudgetFile) -> Result<(T, bool), OrchestratorError>,
    ) -> Result<T, OrchestratorError> {
        let _guard = FileLock::exclusive(&self.guard_path)?;
        let mut file: BudgetFile = if self.path.exists() {
            read_json(&self.path)?
        } else {
            BudgetFile::default()
        };
        let (value, dirty) = f(&mut file)?;
        if dirty {
            write_json_atomic(&self.path, &file)?;
        }
        Ok(value)
    }

    /// Add `amount` to the `(scope, name)` counter.
    ///
    /// Returns `Exceeded` when the counter reaches its ceiling. After that
    /// the counter is frozen: later calls return `Exceeded` without adding.
    pub fn consume(
        &self,
        scope: &str,
        name: BudgetName,
        amount: f64,
    ) -> Result<Consumption, OrchestratorError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(OrchestratorError::validation(format!(
                "Budget '{}' cannot consume {}",
                name, amount
            )));
        }
        let ceiling = self.ceiling(name);

        self.with_file(|file| {
            let state = file
                .scopes
                .entry(scope.to_string())
                .or_default()
                .entry(name)
                .or_insert_with(|| BudgetState::fresh(ceiling));
            let rebased = state.rebase(ceiling);

            if state.exhausted {
                return Ok((
                    Consumption::Exceeded {
                        used: state.used,
                        ceiling: state.ceiling,
                    },
                    rebased,
                ));
            }

            state.used += amount;
            state.updated_at = Utc::now();
            let outcome = if state.used >= state.ceiling {
                state.exhausted = true;
                warn!(scope, budget = %name, used = state.used, ceiling = state.ceiling, "Budget exceeded");
                Consumption::Exceeded {
                    used: state.used,
                    ceiling: state.ceiling,
                }
            } else {
                debug!(scope, budget = %name, used = state.used, ceiling = state.ceiling, "Budget consumed");
                Consumption::Ok {
                    used: state.used,
                    remaining: state.remaining(),
                }
            };
            Ok((outcome, true))
        })
    }

    /// Current state of one counter (zeroed if it was never consumed),
    /// judged against the configured ceiling.
    pub fn state(&self, scope: &str, name: BudgetName) -> Result<BudgetState, OrchestratorError> {
        let ceiling = self.ceiling(name);
        self.with_file(|file| {
            let mut state = file
                .scopes
                .get(scope)
                .and_then(|m| m.get(&name))
                .cloned()
                .unwrap_or_else(|| BudgetState::fresh(ceiling));
            state.rebase(ceiling);
            Ok((state, false))
        })
    }

    pub fn is_exhausted(&self, scope: &str, name: BudgetName) -> Result<bool, OrchestratorError> {
        Ok(self.state(scope, name)?.exhausted)
    }

    /// Zero one counter.
    pub fn reset(&self, scope: &str, name: BudgetName) -> Result<(), OrchestratorError> {
        self.with_file(|file| {
            let removed = file
                .scopes
                .get_mut(scope)
                .and_then(|m| m.remove(&name))
                .is_some();
            Ok(((), removed))
        })
    }

    /// Zero every counter for a scope.
    pub fn reset_scope(&self, scope: &str) -> Result<(), OrchestratorError> {
        self.with_file(|file| Ok(((), file.scopes.remove(scope).is_some())))
    }

    /// All counters, for status output.
    pub fn snapshot(
        &self,
    ) -> Result<BTreeMap<String, BTreeMap<BudgetName, BudgetState>>, OrchestratorError> {
        self.with_file(|file| Ok((file.scopes.clone(), false)))
    }

    /// `Err(BudgetExceeded)` if the counter is exhausted.
    pub fn ensure_available(&self, scope: &str, name: BudgetName) -> Result<(), OrchestratorError> {
        let state = self.state(scope, name)?;
        if state.exhausted {
            return Err(OrchestratorError::BudgetExceeded {
                scope: scope.to_string(),
                budget: name.to_string(),
                used: state.used,
                ceiling: state.ceiling,
            });
        }
        Ok(())
    }
}
