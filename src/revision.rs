//! Revision loop: drives one backlog task through its pipeline, restarting
//! on revision signals and retrying recoverable failures, each bounded by
//! its own per-task budget.
//!
//! ```text
//! <state>/revisions/<task>/
//!   revisions.jsonl          # append-only RevisionRecord stream
//!   NEGATIVE_KNOWLEDGE.md    # why earlier attempts failed; must-read for the next
//!   r1/<run_id>/...          # archived runs of attempt 1
//!   r1/spec/<file>           # spec as it stood when attempt 1 was revised
//! ```

use crate::artifacts::{PhaseOutcome, RevisionSignal};
use crate::backlog::{TaskStatus, TaskStatusSink};
use crate::context::OrchestrationContext;
use crate::errors::{OrchestratorError, PhaseFailure};
use crate::governor::{BudgetName, Consumption};
use crate::machine::{PhaseInput, PhaseMachine, PipelineOutcome, PipelineReport};
use crate::pipeline::Pipeline;
use crate::util::{append_jsonl, rel_to, resolve_path};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Block reason when the revision budget runs out.
pub const REVISION_EXHAUSTED: &str = "revision-exhausted";

/// One restart of a task, appended to `revisions.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub task: String,
    pub cycle: u32,
    pub restart_from: String,
    /// Phase that asked for the revision or failed
    pub failed_phase: String,
    pub run_id: String,
    pub reason: String,
    /// Directory holding the archived attempt, relative to the project
    pub archive: String,
    pub timestamp: DateTime<Utc>,
}

/// The backlog task being driven.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRef {
    pub id: String,
    pub spec: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Done,
    /// The task cannot continue; the reason is also in the backlog note
    Blocked { reason: String },
    /// A program-level budget ran out; resume from `resume_from`
    Halted { reason: String, resume_from: String },
}

#[derive(Debug, Clone)]
pub struct TaskRun {
    pub task: String,
    pub result: TaskResult,
    pub runs: Vec<String>,
    pub revisions: u32,
    pub retries: u32,
    pub compute_hours: f64,
}

pub struct RevisionController<'a> {
    ctx: &'a OrchestrationContext,
    sink: &'a dyn TaskStatusSink,
}

impl<'a> RevisionController<'a> {
    pub fn new(ctx: &'a OrchestrationContext, sink: &'a dyn TaskStatusSink) -> Self {
        Self { ctx, sink }
    }

    pub fn task_dir(&self, task: &str) -> PathBuf {
        self.ctx.config.revisions_dir.join(task)
    }

    fn negative_knowledge_path(&self, task: &str) -> PathBuf {
        self.task_dir(task).join("NEGATIVE_KNOWLEDGE.md")
    }

    /// Revision records for a task, oldest first.
    pub fn history(&self, task: &str) -> Result<Vec<RevisionRecord>, OrchestratorError> {
        let path = self.task_dir(task).join("revisions.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l)
                    .with_context(|| format!("Bad revision record in {}", path.display()))
                    .map_err(OrchestratorError::from)
            })
            .collect()
    }

    /// Drive `task` to done, blocked, or a program halt.
    ///
    /// With `resume_from`, the task continues from that phase and keeps its
    /// per-task budgets; otherwise budgets are reset and the walk starts at
    /// the first phase.
    pub async fn drive(
        &self,
        pipeline: &Pipeline,
        task: &TaskRef,
        resume_from: Option<&str>,
    ) -> Result<TaskRun, OrchestratorError> {
        let governor = &self.ctx.governor;
        if resume_from.is_none() {
            governor.reset_scope(&task.id)?;
        }
        let mut cycle = self.history(&task.id)?.len() as u32;
        let mut from: Option<String> = resume_from
            .filter(|p| pipeline.phase(p).is_some())
            .map(String::from);

        let mut run = TaskRun {
            task: task.id.clone(),
            result: TaskResult::Done,
            runs: Vec::new(),
            revisions: 0,
            retries: 0,
            compute_hours: 0.0,
        };

        self.sink.set_status(&task.id, TaskStatus::InProgress, None)?;
        info!(task = %task.id, pipeline = %pipeline.name, from = from.as_deref().unwrap_or("start"), "Driving task");

        loop {
            let input = self.phase_input(task, cycle);
            let report = PhaseMachine::new(self.ctx)
                .run_pipeline(pipeline, from.as_deref(), &input)
                .await?;
            run.runs.extend(report.phases.iter().map(|p| p.run_id.clone()));
            run.compute_hours += report.compute_hours();

            let PipelineOutcome::Escalated { phase, outcome } = report.outcome.clone() else {
                self.sink.set_status(&task.id, TaskStatus::Done, None)?;
                governor.reset_scope(&task.id)?;
                info!(task = %task.id, revisions = run.revisions, "Task done");
                return Ok(run);
            };

            if report.program_budget_exceeded() {
                run.result = self.halt(task, &phase, "program compute-hour budget exhausted")?;
                return Ok(run);
            }

            match outcome {
                PhaseOutcome::Success => {
                    return Err(OrchestratorError::validation(format!(
                        "phase '{}' escalated with a success outcome",
                        phase
                    )));
                }
                PhaseOutcome::NeedsRevision { signal } => {
                    match governor.consume(&task.id, BudgetName::Revisions, 1.0)? {
                        Consumption::Ok { .. } => {
                            cycle += 1;
                            run.revisions += 1;
                            let restart = restart_phase(pipeline, &signal);
                            self.record_revision(task, cycle, &restart, &phase, &signal.reason, &report)?;
                            self.sink.set_status(
                                &task.id,
                                TaskStatus::NeedsRevision,
                                Some(&format!("revision {}: {}", cycle, one_line(&signal.reason))),
                            )?;
                            self.sink.set_status(&task.id, TaskStatus::InProgress, None)?;
                            info!(task = %task.id, cycle, restart_from = %restart, "Revision restart");
                            from = Some(restart);
                        }
                        Consumption::Exceeded { used, ceiling } => {
                            warn!(task = %task.id, used, ceiling, "Revision budget exhausted");
                            run.result = self.block(task, REVISION_EXHAUSTED)?;
                            return Ok(run);
                        }
                    }
                }
                PhaseOutcome::Failure { failure } => match failure {
                    PhaseFailure::BudgetExceeded { ref budget }
                        if budget == BudgetName::ComputeHours.as_str() =>
                    {
                        run.result = self.halt(task, &phase, "program compute-hour budget exhausted")?;
                        return Ok(run);
                    }
                    ref f if f.is_recoverable() => {
                        match governor.consume(&task.id, BudgetName::ExecutorFailures, 1.0)? {
                            Consumption::Ok { .. } => {
                                run.retries += 1;
                                warn!(task = %task.id, %phase, failure = %f, "Retrying failed phase");
                                from = Some(phase);
                            }
                            Consumption::Exceeded { .. } => {
                                let reason = format!("failure-exhausted: {} in {}", f.tag(), phase);
                                run.result = self.block(task, &reason)?;
                                return Ok(run);
                            }
                        }
                    }
                    f => {
                        let reason = format!("{} in {}", f, phase);
                        run.result = self.block(task, &reason)?;
                        return Ok(run);
                    }
                },
            }
        }
    }

    fn phase_input(&self, task: &TaskRef, cycle: u32) -> PhaseInput {
        let knowledge = self.negative_knowledge_path(&task.id);
        let must_read = if knowledge.exists() {
            vec![rel_to(&self.ctx.config.project_dir, &knowledge)]
        } else {
            Vec::new()
        };
        PhaseInput {
            task: Some(task.id.clone()),
            spec: task.spec.clone(),
            must_read,
            revision_cycle: cycle,
            ..Default::default()
        }
    }

    fn block(&self, task: &TaskRef, reason: &str) -> Result<TaskResult, OrchestratorError> {
        warn!(task = %task.id, reason, "Task blocked");
        self.sink
            .set_status(&task.id, TaskStatus::Blocked, Some(&format!("blocked: {}", reason)))?;
        Ok(TaskResult::Blocked {
            reason: reason.to_string(),
        })
    }

    fn halt(&self, task: &TaskRef, phase: &str, reason: &str) -> Result<TaskResult, OrchestratorError> {
        warn!(task = %task.id, phase, reason, "Task halted");
        Ok(TaskResult::Halted {
            reason: reason.to_string(),
            resume_from: phase.to_string(),
        })
    }

    /// Archive the attempt, then append the record and negative knowledge.
    fn record_revision(
        &self,
        task: &TaskRef,
        cycle: u32,
        restart_from: &str,
        failed_phase: &str,
        reason: &str,
        report: &PipelineReport,
    ) -> Result<(), OrchestratorError> {
        let project_dir = &self.ctx.config.project_dir;
        let task_dir = self.task_dir(&task.id);
        let archive = task_dir.join(format!("r{}", cycle));

        for phase in &report.phases {
            copy_tree(&phase.run_dir, &archive.join(&phase.run_id))?;
        }
        if let Some(ref spec) = task.spec {
            let spec_path = resolve_path(project_dir, spec);
            if let Some(name) = spec_path.file_name()
                && spec_path.is_file()
            {
                copy_tree(&spec_path, &archive.join("spec").join(name))?;
            }
        }

        let run_id = report.last().map(|p| p.run_id.clone()).unwrap_or_default();
        let record = RevisionRecord {
            task: task.id.clone(),
            cycle,
            restart_from: restart_from.to_string(),
            failed_phase: failed_phase.to_string(),
            run_id: run_id.clone(),
            reason: reason.to_string(),
            archive: rel_to(project_dir, &archive),
            timestamp: Utc::now(),
        };
        append_jsonl(&task_dir.join("revisions.jsonl"), &record)?;

        let knowledge = self.negative_knowledge_path(&task.id);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&knowledge)
            .with_context(|| format!("Failed to open {}", knowledge.display()))?;
        let entry = format!(
            "## Revision {} ({})\n\n- failed phase: {}\n- run: {}\n- restart from: {}\n\n{}\n\n",
            cycle,
            record.timestamp.to_rfc3339(),
            failed_phase,
            run_id,
            restart_from,
            reason.trim()
        );
        file.write_all(entry.as_bytes())
            .with_context(|| format!("Failed to append to {}", knowledge.display()))?;
        Ok(())
    }
}

/// The signal's phase when the pipeline has it, else the pipeline default.
fn restart_phase(pipeline: &Pipeline, signal: &RevisionSignal) -> String {
    signal
        .restart_from
        .as_deref()
        .filter(|p| pipeline.phase(p).is_some())
        .unwrap_or_else(|| pipeline.default_restart())
        .to_string()
}

fn one_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().replace('|', "/");
    crate::executor::stream::truncate_str(line.trim(), 80)
}

/// Copy a file or directory tree. Existing destinations are overwritten.
fn copy_tree(src: &Path, dest: &Path) -> Result<(), OrchestratorError> {
    for entry in walkdir::WalkDir::new(src).into_iter().filter_map(|e| e.ok()) {
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = if rel.as_os_str().is_empty() {
            dest.to_path_buf()
        } else {
            dest.join(rel)
        };
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to archive {}", entry.path().display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::executor::testing::ScriptedExecutor;
    use crate::executor::ExecutionOutcome;
    use std::sync::{Arc, Mutex};
    use tempfile::{TempDir, tempdir};

    #[derive(Default)]
    struct RecordingSink {
        updates: Mutex<Vec<(String, TaskStatus, Option<String>)>>,
    }

    impl RecordingSink {
        fn statuses(&self) -> Vec<TaskStatus> {
            self.updates.lock().unwrap().iter().map(|u| u.1).collect()
        }

        fn last_note(&self) -> Option<String> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find_map(|u| u.2.clone())
        }
    }

    impl TaskStatusSink for RecordingSink {
        fn set_status(
            &self,
            task: &str,
            status: TaskStatus,
            note: Option<&str>,
        ) -> Result<(), OrchestratorError> {
            self.updates
                .lock()
                .unwrap()
                .push((task.to_string(), status, note.map(String::from)));
            Ok(())
        }
    }

    fn context(dir: &TempDir, executor: Arc<ScriptedExecutor>) -> OrchestrationContext {
        let config = Config::for_project(dir.path());
        config.ensure_directories().unwrap();
        fs::create_dir_all(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/P1.md"), "# P1\n").unwrap();
        OrchestrationContext::new(config, executor).unwrap()
    }

    fn task() -> TaskRef {
        TaskRef {
            id: "P1".into(),
            spec: Some("docs/P1.md".into()),
        }
    }

    #[tokio::test]
    async fn clean_run_marks_done() {
        let dir = tempdir().unwrap();
        let executor = Arc::new(ScriptedExecutor::new());
        let ctx = context(&dir, executor.clone());
        let sink = RecordingSink::default();
        let pipeline = ctx.pipelines.get("tdd").unwrap().clone();

        let run = RevisionController::new(&ctx, &sink)
            .drive(&pipeline, &task(), None)
            .await
            .unwrap();
        assert_eq!(run.result, TaskResult::Done);
        assert_eq!(run.runs.len(), 4);
        assert_eq!(sink.statuses(), vec![TaskStatus::InProgress, TaskStatus::Done]);
    }

    #[tokio::test]
    async fn revision_restarts_from_signalled_phase_and_archives() {
        let dir = tempdir().unwrap();
        // math: survey specify construct formalize prove -> revise to construct
        let executor = Arc::new(
            ScriptedExecutor::new()
                .succeed()
                .succeed()
                .succeed()
                .succeed()
                .revise(Some("construct"), "lemma 2 is false"),
        );
        let ctx = context(&dir, executor.clone());
        let sink = RecordingSink::default();
        let pipeline = ctx.pipelines.get("math").unwrap().clone();
        let controller = RevisionController::new(&ctx, &sink);

        let run = controller.drive(&pipeline, &task(), None).await.unwrap();
        assert_eq!(run.result, TaskResult::Done);
        assert_eq!(run.revisions, 1);

        let phases = executor.phases_called();
        assert_eq!(&phases[..5], ["survey", "specify", "construct", "formalize", "prove"]);
        assert_eq!(phases[5], "construct");
        assert_eq!(phases.len(), 5 + 5);

        let history = controller.history("P1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].cycle, 1);
        assert_eq!(history[0].restart_from, "construct");
        assert_eq!(history[0].failed_phase, "prove");

        let archive = dir.path().join(&history[0].archive);
        assert!(archive.join("spec/P1.md").exists());
        assert_eq!(
            fs::read_dir(&archive).unwrap().count(),
            6,
            "five runs plus the spec"
        );

        let knowledge = controller.negative_knowledge_path("P1");
        assert!(fs::read_to_string(&knowledge).unwrap().contains("lemma 2 is false"));
        let retry_call = &executor.calls()[5];
        assert!(retry_call.prompt.contains("NEGATIVE_KNOWLEDGE.md"));
    }

    #[tokio::test]
    async fn revision_budget_blocks_after_max_signals() {
        let dir = tempdir().unwrap();
        let mut executor = ScriptedExecutor::new();
        for _ in 0..5 {
            executor = executor.revise(Some("red"), "still wrong");
        }
        let executor = Arc::new(executor);
        let ctx = context(&dir, executor.clone());
        let sink = RecordingSink::default();
        let pipeline = ctx.pipelines.get("tdd").unwrap().clone();
        let controller = RevisionController::new(&ctx, &sink);

        let run = controller.drive(&pipeline, &task(), None).await.unwrap();
        assert_eq!(
            run.result,
            TaskResult::Blocked {
                reason: REVISION_EXHAUSTED.into()
            }
        );
        // Default ceiling is 3: two restarts, the third signal exhausts.
        assert_eq!(run.revisions, 2);
        assert_eq!(executor.call_count(), 3);
        assert_eq!(controller.history("P1").unwrap().len(), 2);
        assert_eq!(sink.statuses().last(), Some(&TaskStatus::Blocked));
        assert_eq!(sink.last_note().as_deref(), Some("blocked: revision-exhausted"));

        let state = ctx.governor.state("P1", BudgetName::Revisions).unwrap();
        assert_eq!(state.used, 3.0);
        assert!(state.exhausted);
    }

    #[tokio::test]
    async fn recoverable_failures_retry_the_same_phase_until_budget() {
        let dir = tempdir().unwrap();
        let executor = Arc::new(ScriptedExecutor::new().succeed().exit(1).exit(1));
        let ctx = context(&dir, executor.clone());
        let sink = RecordingSink::default();
        let pipeline = ctx.pipelines.get("tdd").unwrap().clone();

        let run = RevisionController::new(&ctx, &sink)
            .drive(&pipeline, &task(), None)
            .await
            .unwrap();
        // Default failure ceiling is 2: one retry, the second failure exhausts.
        assert_eq!(executor.phases_called(), vec!["red", "green", "green"]);
        assert_eq!(run.retries, 1);
        match run.result {
            TaskResult::Blocked { reason } => assert!(reason.starts_with("failure-exhausted: exit-code")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_only_violation_blocks_immediately() {
        let dir = tempdir().unwrap();
        let executor = Arc::new(ScriptedExecutor::new().then(|req| {
            fs::write(req.working_dir.join("docs/P1.md"), "rewritten")?;
            Ok(ExecutionOutcome::exited(0))
        }));
        let ctx = context(&dir, executor.clone());
        let sink = RecordingSink::default();
        let pipeline = ctx.pipelines.get("tdd").unwrap().clone();

        let run = RevisionController::new(&ctx, &sink)
            .drive(&pipeline, &task(), None)
            .await
            .unwrap();
        assert_eq!(executor.call_count(), 1);
        assert!(matches!(run.result, TaskResult::Blocked { ref reason } if reason.contains("read-only-violation")));
    }

    #[tokio::test]
    async fn program_budget_halts_with_resume_point() {
        let dir = tempdir().unwrap();
        let executor = Arc::new(ScriptedExecutor::new().then(|req| {
            fs::write(req.run_dir.join("usage.json"), r#"{"compute_hours": 100.0}"#)?;
            Ok(ExecutionOutcome::exited(1))
        }));
        let ctx = context(&dir, executor.clone());
        let sink = RecordingSink::default();
        let pipeline = ctx.pipelines.get("tdd").unwrap().clone();

        let run = RevisionController::new(&ctx, &sink)
            .drive(&pipeline, &task(), None)
            .await
            .unwrap();
        assert_eq!(
            run.result,
            TaskResult::Halted {
                reason: "program compute-hour budget exhausted".into(),
                resume_from: "red".into()
            }
        );
        assert_eq!(executor.call_count(), 1);
        assert_eq!(sink.statuses(), vec![TaskStatus::InProgress]);
    }

    #[tokio::test]
    async fn resume_keeps_budgets_and_starts_at_phase() {
        let dir = tempdir().unwrap();
        let executor = Arc::new(ScriptedExecutor::new());
        let ctx = context(&dir, executor.clone());
        ctx.governor.consume("P1", BudgetName::Revisions, 1.0).unwrap();
        let sink = RecordingSink::default();
        let pipeline = ctx.pipelines.get("tdd").unwrap().clone();

        let controller = RevisionController::new(&ctx, &sink);
        let run = controller.drive(&pipeline, &task(), Some("refactor")).await.unwrap();
        assert_eq!(run.result, TaskResult::Done);
        assert_eq!(executor.phases_called(), vec!["refactor", "ship"]);
        // Finishing the task resets its scope.
        assert_eq!(ctx.governor.state("P1", BudgetName::Revisions).unwrap().used, 0.0);
    }
}
