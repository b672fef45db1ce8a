//! Capability policy evaluation.
//!
//! A phase's policy is a declarative rule table (path pattern to allowed
//! operations) combined with the live lock table. `check` answers one
//! question for one path and operation and always says why.

use super::{LockMode, LockTable, covers, normalize_path};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

static WRITE_COMMAND_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(>|\btee\b|\bsed\s+-i|\bperl\s+-pi|\brm\b|\bmv\b|\bcp\b|\btouch\b|\bchmod\b|\btruncate\b|\bdd\b)")
        .unwrap()
});

/// Operation a tool invocation performs on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
    Execute,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Read => write!(f, "read"),
            Operation::Write => write!(f, "write"),
            Operation::Execute => write!(f, "execute"),
        }
    }
}

/// `pattern` is a glob over project-relative paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRule {
    pub pattern: String,
    pub allow: Vec<Operation>,
}

impl CapabilityRule {
    pub fn new(pattern: impl Into<String>, allow: &[Operation]) -> Self {
        Self {
            pattern: pattern.into(),
            allow: allow.to_vec(),
        }
    }

    fn matches(&self, path: &str) -> bool {
        glob::Pattern::new(&self.pattern)
            .map(|p| p.matches(path))
            .unwrap_or(false)
            || covers(self.pattern.trim_end_matches("/**"), path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
}

impl PolicyDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Everything needed to judge a tool invocation inside one phase.
#[derive(Debug, Clone, Default)]
pub struct PhasePolicy {
    pub phase: String,
    pub rules: Vec<CapabilityRule>,
    /// Paths under a read-only grant, from any holder.
    pub read_only: Vec<String>,
    /// `(path, holder)` exclusive grants owned by someone else.
    pub foreign_exclusive: Vec<(String, String)>,
    /// Globs the phase may read. Empty means unrestricted.
    pub read_scope: Vec<String>,
}

impl PhasePolicy {
    pub fn new(phase: impl Into<String>, rules: Vec<CapabilityRule>) -> Self {
        Self {
            phase: phase.into(),
            rules,
            ..Default::default()
        }
    }

    /// Fold the live lock table into the policy as seen by `holder`.
    pub fn with_lock_table(mut self, table: &LockTable, holder: Option<&str>) -> Self {
        for entry in &table.entries {
            match entry.mode {
                LockMode::ReadOnly => self.read_only.push(entry.path.clone()),
                LockMode::ExclusiveWrite if Some(entry.holder.as_str()) != holder => self
                    .foreign_exclusive
                    .push((entry.path.clone(), entry.holder.clone())),
                _ => {}
            }
        }
        self
    }

    pub fn with_read_scope(mut self, scope: Vec<String>) -> Self {
        self.read_scope = scope;
        self
    }

    /// Judge `op` on the project-relative `path`.
    pub fn check(&self, path: &str, op: Operation) -> PolicyDecision {
        if op == Operation::Write {
            if let Some(locked) = self.read_only.iter().find(|p| covers(p, path)) {
                return PolicyDecision::deny(format!(
                    "{} is read-only during phase '{}' (locked: {})",
                    path, self.phase, locked
                ));
            }
            if let Some((locked, holder)) =
                self.foreign_exclusive.iter().find(|(p, _)| covers(p, path))
            {
                return PolicyDecision::deny(format!(
                    "{} is held exclusively by {} (locked: {})",
                    path, holder, locked
                ));
            }
        }

        if op == Operation::Read
            && !self.read_scope.is_empty()
            && !self.read_scope.iter().any(|g| glob_or_prefix(g, path))
        {
            return PolicyDecision::deny(format!(
                "{} is outside the allowed read paths for this request",
                path
            ));
        }

        match self.rules.iter().find(|r| r.matches(path)) {
            Some(rule) if rule.allow.contains(&op) => {
                PolicyDecision::allow(format!("rule '{}' allows {}", rule.pattern, op))
            }
            Some(rule) => PolicyDecision::deny(format!(
                "rule '{}' in phase '{}' does not allow {} on {}",
                rule.pattern, self.phase, op, path
            )),
            None => PolicyDecision::allow("no rule matched"),
        }
    }

    /// Judge a shell command: deny when it looks like a write and names a
    /// protected path.
    pub fn check_command(&self, command: &str) -> PolicyDecision {
        if !WRITE_COMMAND_REGEX.is_match(command) {
            return PolicyDecision::allow("command does not write");
        }
        let protected = self
            .read_only
            .iter()
            .chain(self.foreign_exclusive.iter().map(|(p, _)| p));
        for path in protected {
            if command.contains(path.as_str()) {
                return self.check(path, Operation::Write);
            }
        }
        PolicyDecision::allow("command touches no protected path")
    }

    /// Judge an agent tool invocation as delivered to a pre-tool-use hook.
    pub fn check_tool(
        &self,
        tool: &str,
        input: &serde_json::Value,
        project_dir: &Path,
    ) -> PolicyDecision {
        let path_field = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| input.get(*k).and_then(|v| v.as_str()))
                .map(|raw| normalize_path(project_dir, raw))
        };

        match tool {
            "Write" | "Edit" | "MultiEdit" | "NotebookEdit" => {
                match path_field(&["file_path", "notebook_path", "path"]) {
                    Some(path) => self.check(&path, Operation::Write),
                    None => PolicyDecision::allow("tool input names no path"),
                }
            }
            "Read" | "Glob" | "Grep" => match path_field(&["file_path", "path"]) {
                Some(path) if !path.is_empty() => self.check(&path, Operation::Read),
                _ => PolicyDecision::allow("tool input names no path"),
            },
            "Bash" => {
                let command = input
                    .get("command")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                self.check_command(command)
            }
            _ => PolicyDecision::allow(format!("tool '{}' is not path-scoped", tool)),
        }
    }
}

/// Glob match, or the pattern names a directory containing `path`.
pub fn glob_or_prefix(pattern: &str, path: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(path))
        .unwrap_or(false)
        || covers(pattern, path)
}
