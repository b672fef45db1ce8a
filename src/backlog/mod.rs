//! The backlog: a markdown table of tasks with priorities and dependency
//! edges.
//!
//! ```text
//! | Priority | Construction | Spec File | Status | Depends On | Notes |
//! |----------|--------------|-----------|--------|------------|-------|
//! | P1 | Base lemma | docs/P1.md | done | — | |
//! | P2 | Extension | docs/P2.md | not-started | P1 | |
//! ```
//!
//! Only rows whose first cell is a priority label (`P<n>`) are tasks; every
//! other line is preserved verbatim when the file is saved.

mod resolver;

pub use resolver::{DependencyGraph, propagate_blocked};

use crate::errors::OrchestratorError;
use crate::util::{FileLock, atomic_write};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

static PRIORITY_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^P(\d+)$").unwrap());

/// Placeholder cell meaning "no dependencies".
const NO_DEPS: &str = "—";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    NotStarted,
    InProgress,
    Blocked,
    Done,
    NeedsRevision,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::NotStarted => "not-started",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
            TaskStatus::NeedsRevision => "needs-revision",
        }
    }

    /// Eligible for selection once its dependencies are done.
    pub fn is_actionable(&self) -> bool {
        matches!(self, TaskStatus::NotStarted | TaskStatus::NeedsRevision)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = OrchestratorError;

    /// Case-insensitive; spaces and underscores count as hyphens.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '_'], "-");
        match normalized.as_str() {
            "not-started" => Ok(TaskStatus::NotStarted),
            "in-progress" => Ok(TaskStatus::InProgress),
            "blocked" => Ok(TaskStatus::Blocked),
            "done" => Ok(TaskStatus::Done),
            "needs-revision" | "revision" => Ok(TaskStatus::NeedsRevision),
            _ => Err(OrchestratorError::validation(format!(
                "Unknown task status '{}' (expected not-started, in-progress, blocked, done or needs-revision)",
                s.trim()
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Priority label, also the task identifier (`P3`)
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub note: String,
    #[serde(skip)]
    line: usize,
}

impl Task {
    /// Numeric part of the priority label; lower runs first.
    pub fn rank(&self) -> u64 {
        priority_rank(&self.id).unwrap_or(u64::MAX)
    }

    fn render_row(&self) -> String {
        let deps = if self.depends_on.is_empty() {
            NO_DEPS.to_string()
        } else {
            self.depends_on.join(", ")
        };
        format!(
            "| {} | {} | {} | {} | {} | {} |",
            self.id,
            self.name,
            self.spec.as_deref().unwrap_or(""),
            self.status,
            deps,
            self.note
        )
        .replace("|  |", "| |")
    }
}

fn priority_rank(label: &str) -> Option<u64> {
    PRIORITY_REGEX
        .captures(label)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// A parsed backlog file.
#[derive(Debug, Clone, Default)]
pub struct Backlog {
    lines: Vec<String>,
    tasks: Vec<Task>,
}

impl Backlog {
    pub fn parse(content: &str) -> Result<Self, OrchestratorError> {
        let lines: Vec<String> = content.lines().map(String::from).collect();
        let mut tasks: Vec<Task> = Vec::new();

        for (index, line) in lines.iter().enumerate() {
            let Some(task) = parse_row(line, index)? else {
                continue;
            };
            if tasks.iter().any(|t| t.id == task.id) {
                return Err(OrchestratorError::validation(format!(
                    "Backlog line {}: task {} appears twice",
                    index + 1,
                    task.id
                )));
            }
            tasks.push(task);
        }
        Ok(Self { lines, tasks })
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Change a task's status, and its note when one is given. Returns
    /// whether anything changed.
    pub fn set_status(
        &mut self,
        id: &str,
        status: TaskStatus,
        note: Option<&str>,
    ) -> Result<bool, OrchestratorError> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| OrchestratorError::validation(format!("No task {} in backlog", id)))?;

        let mut changed = task.status != status;
        task.status = status;
        if let Some(note) = note
            && task.note != note
        {
            task.note = note.to_string();
            changed = true;
        }
        Ok(changed)
    }

    /// Rewrite task rows in place; every other line is untouched.
    pub fn render(&self) -> String {
        let mut lines = self.lines.clone();
        for task in &self.tasks {
            lines[task.line] = task.render_row();
        }
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

fn parse_row(line: &str, index: usize) -> Result<Option<Task>, OrchestratorError> {
    let trimmed = line.trim();
    if !trimmed.starts_with('|') {
        return Ok(None);
    }
    let cells: Vec<&str> = trimmed
        .trim_matches('|')
        .split('|')
        .map(str::trim)
        .collect();
    let Some(id) = cells.first().filter(|c| PRIORITY_REGEX.is_match(c)) else {
        return Ok(None);
    };
    if cells.len() < 5 {
        return Err(OrchestratorError::validation(format!(
            "Backlog line {}: expected at least 5 columns, found {}",
            index + 1,
            cells.len()
        )));
    }

    let status = cells[3].parse::<TaskStatus>().map_err(|e| {
        OrchestratorError::validation(format!("Backlog line {}: {}", index + 1, e))
    })?;
    let depends_on = cells[4]
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty() && *d != NO_DEPS && *d != "-")
        .map(String::from)
        .collect();
    let spec = Some(cells[2].trim_matches(|c| c == '`' || c == ' '))
        .filter(|s| !s.is_empty() && *s != NO_DEPS && *s != "-")
        .map(String::from);

    Ok(Some(Task {
        id: id.to_string(),
        name: cells[1].trim_matches(|c| c == '_' || c == ' ').to_string(),
        spec,
        status,
        depends_on,
        note: cells.get(5..).map(|rest| rest.join(" | ")).unwrap_or_default(),
        line: index,
    }))
}

/// Write access to task statuses, as used by the revision loop.
pub trait TaskStatusSink: Send + Sync {
    fn set_status(
        &self,
        task: &str,
        status: TaskStatus,
        note: Option<&str>,
    ) -> Result<(), OrchestratorError>;
}

/// The backlog file on disk. Every read-modify-write holds an advisory
/// lock so concurrent orchestrators do not lose status updates.
#[derive(Debug, Clone)]
pub struct BacklogFile {
    path: PathBuf,
    guard_path: PathBuf,
}

impl BacklogFile {
    pub fn new(path: &Path, state_dir: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            guard_path: state_dir.join("backlog.lock"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<Backlog, OrchestratorError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| OrchestratorError::Io {
            path: self.path.clone(),
            source,
        })?;
        Backlog::parse(&content)
    }

    /// Load, apply `f`, and save when the rendered file changed.
    pub fn update<T>(
        &self,
        f: impl FnOnce(&mut Backlog) -> Result<T, OrchestratorError>,
    ) -> Result<T, OrchestratorError> {
        let _guard = FileLock::exclusive(&self.guard_path)?;
        let mut backlog = self.load()?;
        let before = backlog.render();
        let value = f(&mut backlog)?;
        let after = backlog.render();
        if after != before {
            atomic_write(&self.path, after.as_bytes())?;
            debug!(path = %self.path.display(), "Backlog saved");
        }
        Ok(value)
    }
}

impl TaskStatusSink for BacklogFile {
    fn set_status(
        &self,
        task: &str,
        status: TaskStatus,
        note: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        self.update(|backlog| backlog.set_status(task, status, note).map(|_| ()))
    }
}
