//! The phase state machine.
//!
//! A pipeline run walks `START -> phase[0] -> ... -> phase[n-1] -> DONE`.
//! Each phase, in order:
//!
//! 1. allocates a Run and records `phase_started`
//! 2. refuses to start if a relevant budget is already exhausted
//! 3. acquires the phase's locks (all or nothing)
//! 4. invokes the executor under a wall-clock watchdog
//! 5. releases every lock, whatever happened in step 4
//! 6. classifies the result and charges usage to the governor
//!
//! Any non-success result stops the walk; what happens next (revision,
//! retry, blocking) is the caller's policy.

mod integrity;
mod prompt;

use crate::artifacts::{NewRun, PhaseOutcome, RevisionSignal, RunEvent, RunHandle};
use crate::context::OrchestrationContext;
use crate::errors::{OrchestratorError, PhaseFailure};
use crate::executor::{ExecutionOutcome, ExecutionRequest};
use crate::governor::{BudgetName, Consumption, PROGRAM_SCOPE};
use crate::locks::LockMode;
use crate::pipeline::{PhaseSpec, Pipeline};
use crate::util::{disk_usage, read_json, rel_to, resolve_path};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

pub use integrity::{digest_paths, first_change};

/// File an executor writes into its run directory to request a revision.
pub const REVISION_MARKER: &str = "needs-revision.json";
/// File an executor writes into its run directory to report usage.
pub const USAGE_FILE: &str = "usage.json";

/// Inline form of the revision marker for executors that cannot write
/// files: `<needs-revision from="construct">reason</needs-revision>`.
static REVISION_TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<needs-revision(?:\s+from="([^"]*)")?\s*>(.*?)</needs-revision>"#).unwrap()
});

/// Inputs shared by every phase of one pipeline walk.
#[derive(Debug, Clone, Default)]
pub struct PhaseInput {
    pub task: Option<String>,
    pub spec: Option<String>,
    pub args: Vec<String>,
    /// Files the executor is told to read first
    pub must_read: Vec<String>,
    /// Read isolation boundary; empty means unrestricted
    pub allowed_paths: Vec<String>,
    pub parent_run_id: Option<String>,
    pub request_id: Option<String>,
    pub revision_cycle: u32,
}

impl PhaseInput {
    /// Governor scope for per-task and per-session budgets.
    pub fn budget_scope(&self) -> &str {
        self.task
            .as_deref()
            .or(self.request_id.as_deref())
            .unwrap_or(PROGRAM_SCOPE)
    }
}

/// What one phase invocation produced.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub pipeline: String,
    pub phase: String,
    pub outcome: PhaseOutcome,
    pub exit_code: Option<i32>,
    pub compute_hours: f64,
    /// The program compute-hour budget hit its ceiling during this phase
    pub program_budget_exceeded: bool,
}

impl PhaseReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, PhaseOutcome::Success)
    }

    /// Exit code for the CLI.
    pub fn process_exit_code(&self) -> i32 {
        match self.outcome {
            PhaseOutcome::Success => crate::errors::EXIT_OK,
            PhaseOutcome::Failure {
                failure: PhaseFailure::Timeout,
            } => crate::errors::EXIT_TIMEOUT,
            _ => crate::errors::EXIT_FAILURE,
        }
    }
}

/// Position in a pipeline walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Start,
    Phase(usize),
    Done,
}

impl MachineState {
    /// Successor after the current state completed successfully.
    pub fn advance(self, phase_count: usize) -> Self {
        match self {
            MachineState::Start if phase_count > 0 => MachineState::Phase(0),
            MachineState::Phase(i) if i + 1 < phase_count => MachineState::Phase(i + 1),
            _ => MachineState::Done,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Completed,
    /// A phase did not succeed; the walk stopped there
    Escalated { phase: String, outcome: PhaseOutcome },
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub pipeline: String,
    pub phases: Vec<PhaseReport>,
    pub outcome: PipelineOutcome,
}

impl PipelineReport {
    pub fn last(&self) -> Option<&PhaseReport> {
        self.phases.last()
    }

    pub fn program_budget_exceeded(&self) -> bool {
        self.phases.iter().any(|p| p.program_budget_exceeded)
    }

    pub fn compute_hours(&self) -> f64 {
        self.phases.iter().map(|p| p.compute_hours).sum()
    }
}

#[derive(Debug, Default, Deserialize)]
struct UsageReport {
    #[serde(default)]
    compute_hours: Option<f64>,
    #[serde(default)]
    read_bytes: Option<u64>,
}

/// Intermediate result before usage is charged.
struct Attempt {
    outcome: PhaseOutcome,
    exit_code: Option<i32>,
    detail: String,
    /// Set when the executor was invoked, with what it reported reading
    executed: Option<Vec<String>>,
}

impl Attempt {
    fn refused(failure: PhaseFailure, detail: String) -> Self {
        Self {
            outcome: PhaseOutcome::Failure { failure },
            exit_code: None,
            detail,
            executed: None,
        }
    }
}

enum Waited {
    Finished(Result<anyhow::Result<ExecutionOutcome>, tokio::time::error::Elapsed>),
    Interrupted,
}

pub struct PhaseMachine<'a> {
    ctx: &'a OrchestrationContext,
    cancel: Option<watch::Receiver<bool>>,
}

impl<'a> PhaseMachine<'a> {
    pub fn new(ctx: &'a OrchestrationContext) -> Self {
        Self { ctx, cancel: None }
    }

    /// Abort the in-flight executor when the flag flips to `true`. Locks
    /// are still released and the run is still finalized.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Run phases from `from_phase` (or the first) until one does not
    /// succeed or the pipeline is done.
    pub async fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        from_phase: Option<&str>,
        input: &PhaseInput,
    ) -> Result<PipelineReport, OrchestratorError> {
        let count = pipeline.phases.len();
        let mut state = match from_phase {
            Some(name) => MachineState::Phase(pipeline.require_phase(name)?),
            None => MachineState::Start.advance(count),
        };
        let mut reports = Vec::new();

        while let MachineState::Phase(index) = state {
            let phase = &pipeline.phases[index];
            let report = self.run_phase(pipeline, &phase.name, input).await?;
            let outcome = report.outcome.clone();
            reports.push(report);

            if outcome != PhaseOutcome::Success {
                return Ok(PipelineReport {
                    pipeline: pipeline.name.clone(),
                    phases: reports,
                    outcome: PipelineOutcome::Escalated {
                        phase: phase.name.clone(),
                        outcome,
                    },
                });
            }
            state = state.advance(count);
        }

        Ok(PipelineReport {
            pipeline: pipeline.name.clone(),
            phases: reports,
            outcome: PipelineOutcome::Completed,
        })
    }

    /// Run one phase end to end and return its classified report.
    pub async fn run_phase(
        &self,
        pipeline: &Pipeline,
        phase_name: &str,
        input: &PhaseInput,
    ) -> Result<PhaseReport, OrchestratorError> {
        let phase = &pipeline.phases[pipeline.require_phase(phase_name)?];
        let mut run = self.ctx.store.allocate(NewRun {
            pipeline: pipeline.name.clone(),
            phase: phase.name.clone(),
            task: input.task.clone(),
            spec: input.spec.clone(),
            parent_run_id: input.parent_run_id.clone(),
            request_id: input.request_id.clone(),
            revision_cycle: input.revision_cycle,
            executor: self.ctx.executor.describe(),
            args: input.args.clone(),
        })?;
        run.event(RunEvent::PhaseStarted {
            phase: phase.name.clone(),
        })?;
        info!(
            run_id = %run.run_id,
            pipeline = %pipeline.name,
            phase = %phase.name,
            task = input.task.as_deref().unwrap_or("-"),
            "Phase started"
        );

        let started = Instant::now();
        let attempt = match self.attempt(pipeline, phase, input, &run).await {
            Ok(attempt) => attempt,
            Err(e) => {
                // Leave a finished run behind, not one stuck in `running`.
                let run_id = run.run_id.clone();
                let failure = PhaseFailure::ExecutorError {
                    message: e.to_string(),
                };
                let detail = format!("Orchestrator error: {}", e);
                if let Err(finish_err) = run.finish(PhaseOutcome::Failure { failure }, None, &detail) {
                    warn!(run_id = %run_id, error = %format!("{:#}", finish_err), "Could not finalize run");
                }
                return Err(e);
            }
        };

        let mut compute_hours = 0.0;
        let mut program_budget_exceeded = false;
        if let Some(ref read_paths) = attempt.executed {
            let usage = self.measure_usage(&run, input, read_paths, started.elapsed());
            compute_hours = usage.compute_hours.unwrap_or_default();
            let read_bytes = usage.read_bytes.unwrap_or_default();

            program_budget_exceeded =
                self.charge(&run, PROGRAM_SCOPE, BudgetName::ComputeHours, compute_hours)?;
            if self.charge(&run, input.budget_scope(), BudgetName::ReadBytes, read_bytes as f64)? {
                warn!(run_id = %run.run_id, scope = input.budget_scope(), "Read budget exhausted");
            }
            run.metadata.compute_hours = Some(compute_hours);
            run.metadata.read_bytes = Some(read_bytes);
        }

        run.event(RunEvent::PhaseFinished {
            phase: phase.name.clone(),
            exit_code: attempt.exit_code,
            outcome: attempt.outcome.to_string(),
        })?;
        let run_id = run.run_id.clone();
        let run_dir = run.dir.clone();
        let metadata = run.finish(attempt.outcome.clone(), attempt.exit_code, &attempt.detail)?;
        info!(
            run_id = %run_id,
            pipeline = %pipeline.name,
            phase = %phase.name,
            outcome = %attempt.outcome,
            "Phase finished"
        );

        Ok(PhaseReport {
            run_id,
            run_dir,
            pipeline: metadata.pipeline,
            phase: metadata.phase,
            outcome: attempt.outcome,
            exit_code: attempt.exit_code,
            compute_hours,
            program_budget_exceeded,
        })
    }

    /// Everything between `phase_started` and classification. Locks taken
    /// here never outlive this call.
    async fn attempt(
        &self,
        pipeline: &Pipeline,
        phase: &PhaseSpec,
        input: &PhaseInput,
        run: &RunHandle,
    ) -> Result<Attempt, OrchestratorError> {
        let project_dir = &self.ctx.config.project_dir;

        if let Some((budget, detail)) = self.exhausted_budget(input)? {
            return Ok(Attempt::refused(PhaseFailure::BudgetExceeded { budget }, detail));
        }

        let run_dir_rel = rel_to(project_dir, &run.dir);
        let requests = phase.lock_requests(input.spec.as_deref(), &run_dir_rel);
        let guard = match self.ctx.locks.acquire(&run.run_id, &requests).await {
            Ok(guard) => guard,
            Err(OrchestratorError::LockConflict { path, holder }) => {
                let detail = format!("Lock on {} is held by {}", path, holder);
                return Ok(Attempt::refused(PhaseFailure::LockConflict { path, holder }, detail));
            }
            Err(e) => return Err(e),
        };
        for grant in &guard.lock_set().grants {
            run.event(RunEvent::LockAcquired {
                path: grant.path.clone(),
                mode: grant.mode,
            })?;
        }

        let read_only: Vec<String> = guard
            .lock_set()
            .paths_in(LockMode::ReadOnly)
            .map(String::from)
            .collect();
        let baseline = digest_paths(project_dir, read_only.iter().map(String::as_str));

        let vars = prompt::PromptVars {
            pipeline,
            phase,
            input,
            run_dir: &run_dir_rel,
            locks: &guard.lock_set().grants,
        };
        let waited = match prompt::render(project_dir, &vars) {
            Ok(text) => {
                crate::util::atomic_write(&run.dir.join("prompt.md"), text.as_bytes())?;
                let request = self.execution_request(pipeline, phase, input, run, text);
                let timeout = self.phase_timeout(phase);
                Some((self.wait(&request, timeout).await, timeout))
            }
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "Prompt rendering failed");
                None
            }
        };

        if let Some((Waited::Finished(Err(_)), _)) = waited
            && let Some(ref command) = self.ctx.config.executor.sync_command
        {
            integrity::run_sync_command(
                command,
                project_dir,
                &run.dir,
                self.ctx.config.executor.sync_timeout,
            )
            .await;
        }

        let released: Vec<String> = guard.lock_set().grants.iter().map(|g| g.path.clone()).collect();
        guard.release()?;
        for path in released {
            run.event(RunEvent::LockReleased { path })?;
        }

        let attempt = match waited {
            None => Attempt::refused(
                PhaseFailure::ExecutorError {
                    message: "prompt template could not be rendered".to_string(),
                },
                format!("Prompt template {} could not be read", phase.prompt.as_deref().unwrap_or("")),
            ),
            Some((Waited::Interrupted, _)) => Attempt {
                outcome: PhaseOutcome::Failure {
                    failure: PhaseFailure::ExecutorError {
                        message: "interrupted".to_string(),
                    },
                },
                exit_code: None,
                detail: "Interrupted while the executor was running".to_string(),
                executed: Some(Vec::new()),
            },
            Some((Waited::Finished(Err(_)), timeout)) => {
                warn!(run_id = %run.run_id, timeout_secs = timeout.as_secs(), "Phase watchdog fired");
                Attempt {
                    outcome: PhaseOutcome::Failure {
                        failure: PhaseFailure::Timeout,
                    },
                    exit_code: None,
                    detail: format!("Executor killed after {}s", timeout.as_secs()),
                    executed: Some(Vec::new()),
                }
            }
            Some((Waited::Finished(Ok(Err(e))), _)) => Attempt {
                outcome: PhaseOutcome::Failure {
                    failure: PhaseFailure::ExecutorError {
                        message: format!("{:#}", e),
                    },
                },
                exit_code: None,
                detail: format!("{:#}", e),
                executed: Some(Vec::new()),
            },
            Some((Waited::Finished(Ok(Ok(outcome))), _)) => {
                let after = digest_paths(project_dir, read_only.iter().map(String::as_str));
                classify(run, outcome, first_change(&baseline, &after))
            }
        };
        Ok(attempt)
    }

    async fn wait(&self, request: &ExecutionRequest, timeout: Duration) -> Waited {
        let execution = tokio::time::timeout(timeout, self.ctx.executor.execute(request));
        match self.cancel.clone() {
            Some(mut cancel) => tokio::select! {
                result = execution => Waited::Finished(result),
                _ = cancelled(&mut cancel) => Waited::Interrupted,
            },
            None => Waited::Finished(execution.await),
        }
    }

    /// A budget that forbids starting the phase, as `(name, explanation)`.
    fn exhausted_budget(
        &self,
        input: &PhaseInput,
    ) -> Result<Option<(String, String)>, OrchestratorError> {
        let checks = [
            (PROGRAM_SCOPE, BudgetName::ComputeHours),
            (input.budget_scope(), BudgetName::ReadBytes),
        ];
        for (scope, name) in checks {
            let state = self.ctx.governor.state(scope, name)?;
            if state.exhausted {
                return Ok(Some((
                    name.to_string(),
                    format!(
                        "Budget {} for {} is exhausted ({} of {})",
                        name, scope, state.used, state.ceiling
                    ),
                )));
            }
        }
        Ok(None)
    }

    fn phase_timeout(&self, phase: &PhaseSpec) -> Duration {
        self.ctx
            .config
            .phase_settings(&phase.name)
            .timeout_secs
            .or(phase.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(self.ctx.config.executor.phase_timeout)
    }

    fn execution_request(
        &self,
        pipeline: &Pipeline,
        phase: &PhaseSpec,
        input: &PhaseInput,
        run: &RunHandle,
        prompt: String,
    ) -> ExecutionRequest {
        let config = &self.ctx.config;
        let allowed_tools = config
            .phase_settings(&phase.name)
            .allowed_tools
            .unwrap_or_else(|| phase.allowed_tools.clone());

        let mut env = vec![
            ("ORCHESTRATE_PIPELINE".to_string(), pipeline.name.clone()),
            ("ORCHESTRATE_PHASE".to_string(), phase.name.clone()),
            ("ORCHESTRATE_RUN_ID".to_string(), run.run_id.clone()),
            ("ORCHESTRATE_RUN_DIR".to_string(), run.dir.display().to_string()),
            ("ORCHESTRATE_PROJECT_DIR".to_string(), config.project_dir.display().to_string()),
            ("ORCHESTRATE_STATE_DIR".to_string(), config.state_dir.display().to_string()),
            ("ORCHESTRATE_ARGS".to_string(), input.args.join(" ")),
        ];
        if let Some(ref task) = input.task {
            env.push(("ORCHESTRATE_TASK".to_string(), task.clone()));
        }
        if let Some(ref spec) = input.spec {
            env.push(("ORCHESTRATE_SPEC".to_string(), spec.clone()));
        }
        if !input.allowed_paths.is_empty() {
            env.push(("ORCHESTRATE_ALLOWED_PATHS".to_string(), input.allowed_paths.join("\n")));
        }

        ExecutionRequest {
            run_id: run.run_id.clone(),
            pipeline: pipeline.name.clone(),
            phase: phase.name.clone(),
            prompt,
            allowed_tools,
            working_dir: config.project_dir.clone(),
            run_dir: run.dir.clone(),
            log_path: run.log_path(),
            env,
        }
    }

    /// Usage the executor reported, or wall-clock hours and the size of
    /// everything it was told to read or reported reading.
    fn measure_usage(
        &self,
        run: &RunHandle,
        input: &PhaseInput,
        read_paths: &[String],
        elapsed: Duration,
    ) -> UsageReport {
        let path = run.dir.join(USAGE_FILE);
        let reported: UsageReport = if path.exists() {
            read_json(&path).unwrap_or_else(|e| {
                warn!(run_id = %run.run_id, error = %format!("{:#}", e), "Ignoring malformed usage report");
                UsageReport::default()
            })
        } else {
            UsageReport::default()
        };

        let project_dir = &self.ctx.config.project_dir;
        let compute_hours = reported
            .compute_hours
            .filter(|h| h.is_finite() && *h >= 0.0)
            .unwrap_or_else(|| elapsed.as_secs_f64() / 3600.0);
        let read_bytes = reported.read_bytes.unwrap_or_else(|| {
            let unique: BTreeSet<&str> = input
                .must_read
                .iter()
                .chain(read_paths)
                .map(String::as_str)
                .collect();
            unique
                .into_iter()
                .map(|p| disk_usage(&resolve_path(project_dir, p)))
                .sum()
        });

        UsageReport {
            compute_hours: Some(compute_hours),
            read_bytes: Some(read_bytes),
        }
    }

    /// Consume and record; true when the budget is now exceeded.
    fn charge(
        &self,
        run: &RunHandle,
        scope: &str,
        name: BudgetName,
        amount: f64,
    ) -> Result<bool, OrchestratorError> {
        let consumption = self.ctx.governor.consume(scope, name, amount)?;
        let (used, exceeded) = match consumption {
            Consumption::Ok { used, .. } => (used, false),
            Consumption::Exceeded { used, .. } => (used, true),
        };
        run.event(RunEvent::BudgetConsumed {
            scope: scope.to_string(),
            budget: name,
            amount,
            used,
            ceiling: self.ctx.governor.ceiling(name),
            exceeded,
        })?;
        Ok(exceeded)
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Classify a completed execution. A read-only violation outranks the
/// exit code, which outranks a revision marker.
fn classify(run: &RunHandle, outcome: ExecutionOutcome, violation: Option<String>) -> Attempt {
    let exit_code = Some(outcome.exit_code);
    let executed = Some(outcome.read_paths.clone());

    let result = if let Some(path) = violation {
        warn!(run_id = %run.run_id, %path, "Read-only path modified during phase");
        PhaseOutcome::Failure {
            failure: PhaseFailure::ReadOnlyViolation { path },
        }
    } else if outcome.exit_code != 0 {
        PhaseOutcome::Failure {
            failure: PhaseFailure::ExitCode {
                code: outcome.exit_code,
            },
        }
    } else if let Some(signal) = revision_signal(run, &outcome.transcript) {
        PhaseOutcome::NeedsRevision { signal }
    } else {
        PhaseOutcome::Success
    };

    Attempt {
        outcome: result,
        exit_code,
        detail: outcome.transcript,
        executed,
    }
}

/// The revision marker file, falling back to an inline transcript tag.
fn revision_signal(run: &RunHandle, transcript: &str) -> Option<RevisionSignal> {
    let marker = run.dir.join(REVISION_MARKER);
    if marker.exists() {
        let content = std::fs::read_to_string(&marker).unwrap_or_default();
        return Some(serde_json::from_str(&content).unwrap_or_else(|_| RevisionSignal {
            restart_from: None,
            reason: content.trim().to_string(),
        }));
    }

    REVISION_TAG_REGEX.captures(transcript).map(|caps| RevisionSignal {
        restart_from: caps
            .get(1)
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty()),
        reason: caps
            .get(2)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default(),
    })
}
