//! Capability locks over shared resource paths.
//!
//! A lock is a `(path, mode)` grant held by one phase run. Grants live in
//! a file-backed lock table under the state directory so every process on
//! the host sees the same picture. The table is guarded by an advisory
//! `flock` while it is read and rewritten, which makes `acquire`
//! all-or-nothing across processes.
//!
//! ```text
//! <state>/locks.json   # the lock table
//! <state>/locks.lock   # flock guard for read-modify-write
//! ```

mod manager;
pub mod policy;

pub use manager::{LockGuard, LockManager, LockSet};
pub use policy::{CapabilityRule, Operation, PhasePolicy, PolicyDecision};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How a phase may touch a resource while it holds the grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockMode {
    /// Single writer: no other holder may hold the path in any mode.
    ExclusiveWrite,
    /// Nobody writes the path while the grant is live.
    ReadOnly,
    /// No restriction; recorded for the phase policy only.
    Unrestricted,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::ExclusiveWrite => write!(f, "exclusive-write"),
            LockMode::ReadOnly => write!(f, "read-only"),
            LockMode::Unrestricted => write!(f, "unrestricted"),
        }
    }
}

impl std::str::FromStr for LockMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "exclusive-write" | "exclusive" => Ok(LockMode::ExclusiveWrite),
            "read-only" | "readonly" => Ok(LockMode::ReadOnly),
            "unrestricted" => Ok(LockMode::Unrestricted),
            _ => anyhow::bail!(
                "Invalid lock mode '{}'. Valid values: exclusive-write, read-only, unrestricted",
                s
            ),
        }
    }
}

/// One requested grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub path: String,
    pub mode: LockMode,
}

impl LockRequest {
    pub fn new(path: impl Into<String>, mode: LockMode) -> Self {
        Self {
            path: path.into(),
            mode,
        }
    }

    pub fn exclusive(path: impl Into<String>) -> Self {
        Self::new(path, LockMode::ExclusiveWrite)
    }

    pub fn read_only(path: impl Into<String>) -> Self {
        Self::new(path, LockMode::ReadOnly)
    }
}

/// A live grant in the lock table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockEntry {
    pub path: String,
    pub mode: LockMode,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub host: String,
    pub pid: u32,
}

/// The persisted lock table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockTable {
    #[serde(default)]
    pub entries: Vec<LockEntry>,
}

impl LockTable {
    /// Grants on `path` held by anyone other than `holder`.
    pub fn foreign_grants<'a>(
        &'a self,
        path: &'a str,
        holder: &'a str,
    ) -> impl Iterator<Item = &'a LockEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.holder != holder && paths_overlap(&e.path, path))
    }

    /// The exclusive holder of `path`, if any.
    pub fn exclusive_holder(&self, path: &str) -> Option<&LockEntry> {
        self.entries
            .iter()
            .find(|e| e.mode == LockMode::ExclusiveWrite && paths_overlap(&e.path, path))
    }

    /// Paths currently under exclusive-write grants.
    pub fn exclusive_paths(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.mode == LockMode::ExclusiveWrite)
            .map(|e| e.path.as_str())
            .collect()
    }

    pub fn held_by<'a>(&'a self, holder: &'a str) -> impl Iterator<Item = &'a LockEntry> + 'a {
        self.entries.iter().filter(move |e| e.holder == holder)
    }
}

/// Normalize a resource path to the lock-table key form: relative to the
/// project directory when possible, forward slashes, no `./` prefix and no
/// trailing slash.
pub fn normalize_path(project_dir: &Path, raw: &str) -> String {
    let candidate = Path::new(raw);
    let rel = if candidate.is_absolute() {
        candidate
            .strip_prefix(project_dir)
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|_| candidate.to_path_buf())
    } else {
        candidate.to_path_buf()
    };

    let mut parts: Vec<String> = Vec::new();
    for component in rel.to_string_lossy().replace('\\', "/").split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other.to_string()),
        }
    }
    let joined = parts.join("/");
    if candidate.is_absolute() && !rel.is_relative() {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Whether `lock_path` covers `path`: equal, or one is a directory prefix
/// of the other.
pub fn paths_overlap(lock_path: &str, path: &str) -> bool {
    covers(lock_path, path) || covers(path, lock_path)
}

/// Whether a lock on `lock_path` covers `path` (same path or a path below it).
pub fn covers(lock_path: &str, path: &str) -> bool {
    if lock_path == path {
        return true;
    }
    let prefix = lock_path.trim_end_matches('/');
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/'))
}
