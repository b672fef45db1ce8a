//! Program mode: auto-advance through the backlog in dependency order.
//!
//! Each cycle the scheduler checks its termination conditions, propagates
//! blocking through the backlog, picks the single next actionable task and
//! drives it through the revision loop. State is persisted to
//! `<state>/program/state.json` after every step so `--resume` can pick up
//! where an interrupted or halted program stopped.

use crate::backlog::{Backlog, BacklogFile, DependencyGraph, Task, TaskStatus, propagate_blocked};
use crate::context::OrchestrationContext;
use crate::errors::OrchestratorError;
use crate::governor::{BudgetName, PROGRAM_SCOPE};
use crate::revision::{RevisionController, TaskRef, TaskResult};
use crate::util::{atomic_write, read_json, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, warn};

/// Written when every task is done.
pub const SYNTHESIS_MARKER: &str = "SYNTHESIS_READY";

/// Why the program loop stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum Termination {
    /// No actionable task and nothing blocked
    Converged,
    /// No actionable task; blocked tasks need outside resolution
    Stalled { blocked: Vec<String> },
    MaxCycles { cycles: u32 },
    BudgetExhausted { budget: String },
    /// The handoff marker appeared
    Handoff { marker: PathBuf },
    Interrupted,
}

impl Termination {
    /// Exit code for the CLI: only convergence counts as success.
    pub fn exit_code(&self) -> i32 {
        match self {
            Termination::Converged | Termination::Handoff { .. } => crate::errors::EXIT_OK,
            _ => crate::errors::EXIT_FAILURE,
        }
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Converged => write!(f, "converged"),
            Termination::Stalled { blocked } => {
                write!(f, "stalled: zero actionable tasks, blocked: {}", blocked.join(", "))
            }
            Termination::MaxCycles { cycles } => write!(f, "max cycles reached ({})", cycles),
            Termination::BudgetExhausted { budget } => write!(f, "budget exhausted: {}", budget),
            Termination::Handoff { marker } => write!(f, "handoff required: {}", marker.display()),
            Termination::Interrupted => write!(f, "interrupted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentTask {
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLog {
    pub task: String,
    pub result: String,
    pub runs: usize,
    pub revisions: u32,
    pub compute_hours: f64,
    pub finished_at: DateTime<Utc>,
}

/// `program/state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramState {
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub pipeline: String,
    pub cycles: u32,
    #[serde(default)]
    pub last_task: Option<String>,
    /// Task interrupted by a halt, resumed first with `--resume`
    #[serde(default)]
    pub current: Option<CurrentTask>,
    #[serde(default)]
    pub history: Vec<TaskLog>,
    #[serde(default)]
    pub termination: Option<Termination>,
}

impl ProgramState {
    fn fresh(pipeline: &str) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            updated_at: now,
            pipeline: pipeline.to_string(),
            cycles: 0,
            last_task: None,
            current: None,
            history: Vec::new(),
            termination: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgramOptions {
    pub resume: bool,
}

/// Dry-run view of the backlog.
#[derive(Debug, Clone, Serialize)]
pub struct ProgramPlan {
    pub order: Vec<PlannedTask>,
    pub next: Option<String>,
    /// Tasks the next pass would newly block
    pub would_block: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedTask {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub depends_on: Vec<String>,
    pub actionable: bool,
}

pub struct ProgramScheduler<'a> {
    ctx: &'a OrchestrationContext,
    backlog: BacklogFile,
    cancel: Option<watch::Receiver<bool>>,
}

impl<'a> ProgramScheduler<'a> {
    pub fn new(ctx: &'a OrchestrationContext) -> Self {
        Self {
            backlog: BacklogFile::new(&ctx.config.backlog_file, &ctx.config.state_dir),
            ctx,
            cancel: None,
        }
    }

    /// Stop between tasks once the flag flips to `true`. A task already
    /// running is allowed to finish its current phase walk.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn state_path(&self) -> PathBuf {
        self.ctx.config.program_dir.join("state.json")
    }

    pub fn load_state(&self) -> Result<Option<ProgramState>, OrchestratorError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(read_json(&path)?))
    }

    fn save_state(&self, state: &mut ProgramState) -> Result<(), OrchestratorError> {
        state.updated_at = Utc::now();
        write_json_atomic(&self.state_path(), state)?;
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| *c.borrow())
    }

    /// Order and next pick without running anything or touching files.
    pub fn plan(&self) -> Result<ProgramPlan, OrchestratorError> {
        let mut backlog = self.backlog.load()?;
        let would_block = propagate_blocked(&mut backlog)?;
        let graph = DependencyGraph::build(backlog.tasks())?;
        let actionable: Vec<String> = graph.actionable().iter().map(|t| t.id.clone()).collect();

        let order = graph
            .order()
            .iter()
            .filter_map(|id| graph.task(id))
            .map(|t| PlannedTask {
                id: t.id.clone(),
                name: t.name.clone(),
                status: t.status,
                depends_on: t.depends_on.clone(),
                actionable: actionable.contains(&t.id),
            })
            .collect();

        Ok(ProgramPlan {
            order,
            next: actionable.first().cloned(),
            would_block,
        })
    }

    /// Run the program loop until a termination condition.
    pub async fn run(&self, options: ProgramOptions) -> Result<ProgramState, OrchestratorError> {
        let config = &self.ctx.config;
        let pipeline = self.ctx.pipelines.get(&config.program_pipeline)?.clone();
        let max_cycles = config.budgets.max_program_cycles;

        let mut state = match self.load_state()? {
            Some(previous) if options.resume => {
                info!(cycles = previous.cycles, "Resuming program");
                ProgramState {
                    termination: None,
                    ..previous
                }
            }
            _ => {
                self.ctx.governor.reset_scope(PROGRAM_SCOPE)?;
                let _ = std::fs::remove_file(config.program_dir.join(SYNTHESIS_MARKER));
                ProgramState::fresh(&pipeline.name)
            }
        };
        self.save_state(&mut state)?;

        let termination = loop {
            if self.cancelled() {
                break Termination::Interrupted;
            }
            if config.handoff_marker.exists() {
                warn!(marker = %config.handoff_marker.display(), "Handoff marker present");
                break Termination::Handoff {
                    marker: config.handoff_marker.clone(),
                };
            }
            if state.cycles >= max_cycles {
                break Termination::MaxCycles {
                    cycles: state.cycles,
                };
            }
            if self
                .ctx
                .governor
                .is_exhausted(PROGRAM_SCOPE, BudgetName::ComputeHours)?
            {
                break Termination::BudgetExhausted {
                    budget: BudgetName::ComputeHours.to_string(),
                };
            }

            let (task, resume_from) = match self.select(&state)? {
                Selection::Task(task, resume_from) => (task, resume_from),
                Selection::Converged => break Termination::Converged,
                Selection::Stalled(blocked) => break Termination::Stalled { blocked },
            };

            state.cycles += 1;
            state.last_task = Some(task.id.clone());
            state.current = Some(CurrentTask {
                task: task.id.clone(),
                resume_from: resume_from.clone(),
            });
            self.save_state(&mut state)?;
            info!(cycle = state.cycles, task = %task.id, "Program cycle");

            let controller = RevisionController::new(self.ctx, &self.backlog);
            let run = controller
                .drive(&pipeline, &task, resume_from.as_deref())
                .await?;

            state.history.push(TaskLog {
                task: task.id.clone(),
                result: match run.result {
                    TaskResult::Done => "done".to_string(),
                    TaskResult::Blocked { ref reason } => format!("blocked: {}", reason),
                    TaskResult::Halted { ref reason, .. } => format!("halted: {}", reason),
                },
                runs: run.runs.len(),
                revisions: run.revisions,
                compute_hours: run.compute_hours,
                finished_at: Utc::now(),
            });
            match run.result {
                TaskResult::Halted { resume_from, .. } => {
                    state.current = Some(CurrentTask {
                        task: task.id.clone(),
                        resume_from: Some(resume_from),
                    });
                    self.save_state(&mut state)?;
                    break Termination::BudgetExhausted {
                        budget: BudgetName::ComputeHours.to_string(),
                    };
                }
                TaskResult::Blocked { .. } => {
                    state.current = None;
                    let newly = self.backlog.update(propagate_blocked)?;
                    if !newly.is_empty() {
                        warn!(task = %task.id, downstream = ?newly, "Blocked downstream tasks");
                    }
                }
                TaskResult::Done => state.current = None,
            }
            self.save_state(&mut state)?;
        };

        if termination == Termination::Converged {
            let marker = config.program_dir.join(SYNTHESIS_MARKER);
            let body = format!(
                "converged at {} after {} cycles\n",
                Utc::now().to_rfc3339(),
                state.cycles
            );
            atomic_write(&marker, body.as_bytes())?;
        }
        info!(termination = %termination, cycles = state.cycles, "Program stopped");
        state.termination = Some(termination);
        self.save_state(&mut state)?;
        Ok(state)
    }

    /// Propagate blocking, then pick the interrupted task (on resume) or
    /// the resolver's next actionable task.
    fn select(&self, state: &ProgramState) -> Result<Selection, OrchestratorError> {
        let pending = state.current.clone();
        self.backlog.update(|backlog| {
            let newly = propagate_blocked(backlog)?;
            if !newly.is_empty() {
                info!(tasks = ?newly, "Propagated blocked status");
            }

            if let Some(current) = pending
                && let Some(task) = backlog.task(&current.task)
                && matches!(task.status, TaskStatus::InProgress | TaskStatus::NeedsRevision)
                && dependencies_done(backlog, task)
            {
                return Ok(Selection::Task(
                    TaskRef {
                        id: task.id.clone(),
                        spec: task.spec.clone(),
                    },
                    current.resume_from,
                ));
            }

            let graph = DependencyGraph::build(backlog.tasks())?;
            // A task left in progress by an earlier run goes first, once
            // its dependencies are done.
            let stranded = graph
                .order()
                .iter()
                .filter_map(|id| graph.task(id))
                .find(|t| t.status == TaskStatus::InProgress && dependencies_done(backlog, t));
            if let Some(task) = stranded.or_else(|| graph.next_actionable()) {
                return Ok(Selection::Task(
                    TaskRef {
                        id: task.id.clone(),
                        spec: task.spec.clone(),
                    },
                    None,
                ));
            }

            let blocked: Vec<String> = graph
                .order()
                .iter()
                .filter(|id| graph.task(id).is_some_and(|t| t.status == TaskStatus::Blocked))
                .cloned()
                .collect();
            let unfinished = backlog.tasks().iter().any(|t| t.status != TaskStatus::Done);
            if blocked.is_empty() && !unfinished {
                Ok(Selection::Converged)
            } else if blocked.is_empty() {
                Ok(Selection::Stalled(
                    backlog
                        .tasks()
                        .iter()
                        .filter(|t| t.status != TaskStatus::Done)
                        .map(|t| t.id.clone())
                        .collect(),
                ))
            } else {
                Ok(Selection::Stalled(blocked))
            }
        })
    }
}

/// Every dependency of `task` is `done`.
fn dependencies_done(backlog: &Backlog, task: &Task) -> bool {
    task.depends_on
        .iter()
        .all(|dep| backlog.task(dep).is_some_and(|t| t.status == TaskStatus::Done))
}

enum Selection {
    Task(TaskRef, Option<String>),
    Converged,
    Stalled(Vec<String>),
}
