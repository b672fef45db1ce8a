//! Cross-pipeline interop: typed request/response records and the
//! file-backed queue that dispatches them.
//!
//! Layout under the state directory:
//!
//! ```text
//! interop/
//!   requests/<id>.json     immutable once written
//!   responses/<id>.json    written by the dispatcher, keyed by request ID
//!   claims/<id>.lock       flock held while a dispatch is in flight
//! ```

mod queue;

pub use queue::{InteropQueue, PumpMode};

use crate::errors::OrchestratorError;
use crate::util::short_hex;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static REQUEST_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").unwrap());

/// One pipeline asking another to run a named action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InteropRequest {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub source_pipeline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_phase: Option<String>,
    pub target_pipeline: String,
    /// Target phase, as `phase` or `pipeline.phase`
    pub action: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub must_read: Vec<String>,
    /// Globs bounding what the target may read; empty means unrestricted
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Globs that must each match a file produced by the child run
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub justification: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_read_bytes: Option<u64>,
}

impl InteropRequest {
    pub fn new(source_pipeline: &str, target_pipeline: &str, action: &str) -> Self {
        let created_at = Utc::now();
        Self {
            id: format!("rq-{}-{}", created_at.format("%Y%m%dT%H%M%SZ"), short_hex(6)),
            created_at,
            source_pipeline: source_pipeline.to_string(),
            source_phase: None,
            target_pipeline: target_pipeline.to_string(),
            action: action.to_string(),
            args: Vec::new(),
            must_read: Vec::new(),
            allowed_paths: Vec::new(),
            deliverables: Vec::new(),
            justification: String::new(),
            parent_run_id: None,
            max_read_bytes: None,
        }
    }

    /// Shape checks that need no registry or filesystem.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let mut problems = Vec::new();
        if !REQUEST_ID_REGEX.is_match(&self.id) {
            problems.push(format!("invalid request id '{}'", self.id));
        }
        if self.source_pipeline.trim().is_empty() {
            problems.push("source pipeline is empty".to_string());
        }
        if self.target_pipeline.trim().is_empty() {
            problems.push("target pipeline is empty".to_string());
        }
        if self.action.trim().is_empty() {
            problems.push("action is empty".to_string());
        }
        if self.must_read.iter().any(|p| p.trim().is_empty()) {
            problems.push("empty must-read pointer".to_string());
        }
        for pattern in self.allowed_paths.iter().chain(&self.deliverables) {
            if let Err(e) = glob::Pattern::new(pattern) {
                problems.push(format!("invalid glob '{}': {}", pattern, e));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::validation(format!(
                "request '{}': {}",
                self.id,
                problems.join("; ")
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    /// Refused before running: isolation or read budget
    Blocked,
    /// Ran, but the phase failed or deliverables are missing
    Failed,
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ResponseStatus::Ok => "ok",
            ResponseStatus::Blocked => "blocked",
            ResponseStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteropResponse {
    pub request_id: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_run_dir: Option<String>,
    /// Files in the child run directory
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Files that satisfied the deliverable globs
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub reason: String,
    pub attempt: u32,
    pub completed_at: DateTime<Utc>,
}

impl InteropResponse {
    /// Only a failed dispatch may run again.
    pub fn is_final(&self) -> bool {
        self.status != ResponseStatus::Failed
    }
}
