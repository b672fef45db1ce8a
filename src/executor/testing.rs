//! Scripted executor for driving the orchestration core in unit tests.

use super::{ExecutionOutcome, ExecutionRequest, TaskExecutor};
use crate::artifacts::RevisionSignal;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

type StepFn = Box<dyn Fn(&ExecutionRequest) -> Result<ExecutionOutcome> + Send + Sync>;

enum Step {
    Run(StepFn),
    Hang(Duration),
}

/// Plays back queued steps, one per `execute` call. Succeeds once the
/// queue is empty.
#[derive(Default)]
pub struct ScriptedExecutor {
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<ExecutionRequest>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(
        self,
        f: impl Fn(&ExecutionRequest) -> Result<ExecutionOutcome> + Send + Sync + 'static,
    ) -> Self {
        self.steps.lock().unwrap().push_back(Step::Run(Box::new(f)));
        self
    }

    pub fn succeed(self) -> Self {
        self.then(|_| Ok(ExecutionOutcome::exited(0)))
    }

    pub fn exit(self, code: i32) -> Self {
        self.then(move |_| Ok(ExecutionOutcome::exited(code)))
    }

    /// Exit 0 but leave a revision marker in the run directory.
    pub fn revise(self, restart_from: Option<&str>, reason: &str) -> Self {
        let signal = RevisionSignal {
            restart_from: restart_from.map(String::from),
            reason: reason.to_string(),
        };
        self.then(move |req| {
            crate::util::write_json_atomic(&req.run_dir.join("needs-revision.json"), &signal)?;
            Ok(ExecutionOutcome::exited(0))
        })
    }

    /// Sleep past any reasonable watchdog.
    pub fn hang(self, duration: Duration) -> Self {
        self.steps.lock().unwrap().push_back(Step::Hang(duration));
        self
    }

    pub fn calls(&self) -> Vec<ExecutionRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn phases_called(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.phase).collect()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        self.calls.lock().unwrap().push(request.clone());
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Run(f)) => f(request),
            Some(Step::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(ExecutionOutcome::exited(0))
            }
            None => Ok(ExecutionOutcome::exited(0)),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}
