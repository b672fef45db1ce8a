use super::{EventRecord, PhaseOutcome, RunEvent, RunMetadata, RunStatus};
use crate::util::{append_jsonl, atomic_write, host_name, read_json, short_hex, write_json_atomic};
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Attribution for a run about to start.
#[derive(Debug, Clone, Default)]
pub struct NewRun {
    pub pipeline: String,
    pub phase: String,
    pub task: Option<String>,
    pub spec: Option<String>,
    pub parent_run_id: Option<String>,
    pub request_id: Option<String>,
    pub revision_cycle: u32,
    pub executor: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    runs_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(runs_dir: &Path) -> Self {
        Self {
            runs_dir: runs_dir.to_path_buf(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    /// Allocate a fresh run ID and directory and record `run_started`.
    pub fn allocate(&self, new: NewRun) -> Result<RunHandle> {
        fs::create_dir_all(&self.runs_dir)
            .with_context(|| format!("Failed to create {}", self.runs_dir.display()))?;

        let (run_id, dir) = loop {
            let run_id = new_run_id(&new.pipeline, &new.phase);
            let dir = self.runs_dir.join(&run_id);
            match fs::create_dir(&dir) {
                Ok(()) => break (run_id, dir),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create run directory {}", dir.display()));
                }
            }
        };

        let metadata = RunMetadata {
            run_id: run_id.clone(),
            pipeline: new.pipeline.clone(),
            phase: new.phase.clone(),
            task: new.task,
            spec: new.spec,
            parent_run_id: new.parent_run_id.clone(),
            request_id: new.request_id,
            revision_cycle: new.revision_cycle,
            started_at: Utc::now(),
            ended_at: None,
            status: RunStatus::Running,
            exit_code: None,
            outcome: None,
            host: host_name(),
            pid: std::process::id(),
            cwd: std::env::current_dir().unwrap_or_default(),
            executor: new.executor,
            args: new.args,
            compute_hours: None,
            read_bytes: None,
        };

        let handle = RunHandle {
            run_id,
            dir,
            metadata,
        };
        handle.save_metadata()?;
        handle.event(RunEvent::RunStarted {
            pipeline: new.pipeline,
            phase: new.phase,
            parent_run_id: new.parent_run_id,
        })?;
        debug!(run_id = %handle.run_id, "Run allocated");
        Ok(handle)
    }

    pub fn load(&self, run_id: &str) -> Result<RunMetadata> {
        read_json(&self.run_dir(run_id).join("metadata.json"))
    }

    pub fn events(&self, run_id: &str) -> Result<Vec<EventRecord>> {
        let path = self.run_dir(run_id).join("events.jsonl");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).with_context(|| format!("Bad event line in {}", path.display())))
            .collect()
    }

    /// Append an event to an existing run's stream (used for interop
    /// lineage on the parent run).
    pub fn append_event(&self, run_id: &str, event: RunEvent) -> Result<()> {
        let dir = self.run_dir(run_id);
        if !dir.is_dir() {
            anyhow::bail!("Run '{}' does not exist", run_id);
        }
        append_event_to(&dir, run_id, event)
    }

    /// Most recent runs first.
    pub fn list(&self, limit: usize) -> Result<Vec<RunMetadata>> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<String> = fs::read_dir(&self.runs_dir)
            .with_context(|| format!("Failed to list {}", self.runs_dir.display()))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join("metadata.json").exists())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.into_iter()
            .take(limit)
            .map(|id| self.load(&id))
            .collect()
    }
}

/// A run in progress. Finishing consumes the handle, after which the
/// run's metadata and summary are not written again.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: String,
    pub dir: PathBuf,
    pub metadata: RunMetadata,
}

impl RunHandle {
    pub fn log_path(&self) -> PathBuf {
        self.dir.join("log")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join("summary")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join("metadata.json")
    }

    pub fn events_path(&self) -> PathBuf {
        self.dir.join("events.jsonl")
    }

    pub fn event(&self, event: RunEvent) -> Result<()> {
        append_event_to(&self.dir, &self.run_id, event)
    }

    pub fn save_metadata(&self) -> Result<()> {
        write_json_atomic(&self.metadata_path(), &self.metadata)
    }

    /// Record the final outcome, summary and `run_finished`.
    pub fn finish(
        mut self,
        outcome: PhaseOutcome,
        exit_code: Option<i32>,
        detail: &str,
    ) -> Result<RunMetadata> {
        let status = outcome.status();
        self.metadata.ended_at = Some(Utc::now());
        self.metadata.status = status;
        self.metadata.exit_code = exit_code;
        self.metadata.outcome = Some(outcome);

        atomic_write(&self.summary_path(), render_summary(&self.metadata, detail).as_bytes())?;
        self.save_metadata()?;
        self.event(RunEvent::RunFinished { status })?;
        Ok(self.metadata)
    }
}

fn append_event_to(dir: &Path, run_id: &str, event: RunEvent) -> Result<()> {
    append_jsonl(
        &dir.join("events.jsonl"),
        &EventRecord {
            ts: Utc::now(),
            run_id: run_id.to_string(),
            event,
        },
    )
}

/// `<UTC timestamp with millis>-<pipeline>-<phase>-<hex>`; sorts by creation.
fn new_run_id(pipeline: &str, phase: &str) -> String {
    format!(
        "{}-{}-{}-{}",
        Utc::now().format("%Y%m%dT%H%M%S%3fZ"),
        slug(pipeline),
        slug(phase),
        short_hex(6)
    )
}

fn slug(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .collect()
}

fn render_summary(meta: &RunMetadata, detail: &str) -> String {
    let mut out = format!("# {} / {}\n\n", meta.pipeline, meta.phase);
    out.push_str(&format!("- run: {}\n", meta.run_id));
    out.push_str(&format!("- status: {}\n", meta.status));
    if let Some(ref outcome) = meta.outcome {
        out.push_str(&format!("- outcome: {}\n", outcome));
    }
    if let Some(code) = meta.exit_code {
        out.push_str(&format!("- exit code: {}\n", code));
    }
    if let Some(ref task) = meta.task {
        out.push_str(&format!("- task: {}\n", task));
    }
    if let Some(ref parent) = meta.parent_run_id {
        out.push_str(&format!("- parent run: {}\n", parent));
    }
    out.push_str(&format!("- started: {}\n", meta.started_at.to_rfc3339()));
    if let Some(ended) = meta.ended_at {
        out.push_str(&format!("- ended: {}\n", ended.to_rfc3339()));
    }
    if !detail.trim().is_empty() {
        out.push_str("\n## Detail\n\n");
        out.push_str(detail.trim_end());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_run(phase: &str) -> NewRun {
        NewRun {
            pipeline: "math".into(),
            phase: phase.into(),
            task: Some("P1".into()),
            executor: "sh".into(),
            ..Default::default()
        }
    }

    #[test]
    fn allocate_creates_layout_and_start_event() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(&dir.path().join("runs"));
        let run = store.allocate(new_run("prove")).unwrap();

        assert!(run.run_id.contains("-math-prove-"));
        assert!(run.metadata_path().exists());
        let events = store.events(&run.run_id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.name(), "run_started");
    }

    #[test]
    fn finish_writes_summary_and_final_status() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(&dir.path().join("runs"));
        let run = store.allocate(new_run("audit")).unwrap();
        let run_id = run.run_id.clone();

        let meta = run.finish(PhaseOutcome::Success, Some(0), "all green").unwrap();
        assert_eq!(meta.status, RunStatus::Success);
        assert!(meta.ended_at.is_some());

        let loaded = store.load(&run_id).unwrap();
        assert_eq!(loaded, meta);
        let summary = fs::read_to_string(store.run_dir(&run_id).join("summary")).unwrap();
        assert!(summary.contains("status: success"));
        assert!(summary.contains("all green"));

        let names: Vec<_> = store
            .events(&run_id)
            .unwrap()
            .iter()
            .map(|e| e.event.name())
            .collect();
        assert_eq!(names, vec!["run_started", "run_finished"]);
    }

    #[test]
    fn run_ids_are_unique_and_sort_by_creation() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(&dir.path().join("runs"));
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.allocate(new_run("survey")).unwrap().run_id);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);

        let listed: Vec<_> = store.list(3).unwrap().into_iter().map(|m| m.run_id).collect();
        assert_eq!(listed, ids.iter().rev().take(3).cloned().collect::<Vec<_>>());
    }

    #[test]
    fn append_event_requires_existing_run() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(&dir.path().join("runs"));
        let err = store
            .append_event(
                "missing",
                RunEvent::RequestEnqueued {
                    request_id: "rq".into(),
                    request_path: "x".into(),
                },
            )
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
