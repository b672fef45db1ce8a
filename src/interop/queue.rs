use super::{InteropRequest, InteropResponse, ResponseStatus};
use crate::artifacts::{PhaseOutcome, RunEvent};
use crate::context::OrchestrationContext;
use crate::errors::OrchestratorError;
use crate::locks::normalize_path;
use crate::locks::policy::glob_or_prefix;
use crate::machine::{PhaseInput, PhaseMachine};
use crate::util::{FileLock, disk_usage, read_json, rel_to, resolve_path, write_json_atomic};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Which requests `pump` dispatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpMode {
    /// The oldest pending request
    Once,
    /// One named request, even if a previous attempt failed
    Request(String),
    /// Every request pending when the pump started
    Drain,
}

/// File-backed request/response mailbox.
pub struct InteropQueue<'a> {
    ctx: &'a OrchestrationContext,
    requests_dir: PathBuf,
    responses_dir: PathBuf,
    claims_dir: PathBuf,
    cancel: Option<watch::Receiver<bool>>,
}

impl<'a> InteropQueue<'a> {
    pub fn new(ctx: &'a OrchestrationContext) -> Self {
        let root = &ctx.config.interop_dir;
        Self {
            ctx,
            requests_dir: root.join("requests"),
            responses_dir: root.join("responses"),
            claims_dir: root.join("claims"),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn request_path(&self, id: &str) -> PathBuf {
        self.requests_dir.join(format!("{}.json", id))
    }

    pub fn response_path(&self, id: &str) -> PathBuf {
        self.responses_dir.join(format!("{}.json", id))
    }

    /// Validate and persist `request`. Resubmitting an identical request
    /// is a no-op; reusing an ID for different content is rejected.
    pub fn submit(&self, request: &InteropRequest) -> Result<String, OrchestratorError> {
        request.validate()?;
        self.ctx
            .pipelines
            .resolve_action(&request.target_pipeline, &request.action)?;

        let path = self.request_path(&request.id);
        if path.exists() {
            let existing: InteropRequest = read_json(&path)?;
            if existing == *request {
                debug!(request_id = %request.id, "Request already enqueued");
                return Ok(request.id.clone());
            }
            return Err(OrchestratorError::validation(format!(
                "request '{}' already exists with different content",
                request.id
            )));
        }
        write_json_atomic(&path, request)?;
        info!(
            request_id = %request.id,
            from = %request.source_pipeline,
            to = %request.target_pipeline,
            action = %request.action,
            "Request enqueued"
        );

        if let Some(ref parent) = request.parent_run_id {
            self.note_on_parent(
                parent,
                RunEvent::RequestEnqueued {
                    request_id: request.id.clone(),
                    request_path: rel_to(&self.ctx.config.project_dir, &path),
                },
            );
        }
        Ok(request.id.clone())
    }

    pub fn load_request(&self, id: &str) -> Result<InteropRequest, OrchestratorError> {
        let path = self.request_path(id);
        if !path.exists() {
            return Err(OrchestratorError::validation(format!("no request '{}'", id)));
        }
        let request: InteropRequest = read_json(&path)?;
        request.validate()?;
        Ok(request)
    }

    pub fn response(&self, id: &str) -> Result<Option<InteropResponse>, OrchestratorError> {
        let path = self.response_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(read_json(&path)?))
    }

    /// Request IDs without a response, oldest first.
    pub fn pending(&self) -> Result<Vec<String>, OrchestratorError> {
        let mut ids = self.request_ids()?;
        ids.retain(|id| !self.response_path(id).exists());
        Ok(ids)
    }

    fn request_ids(&self) -> Result<Vec<String>, OrchestratorError> {
        if !self.requests_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.requests_dir).map_err(|source| OrchestratorError::Io {
            path: self.requests_dir.clone(),
            source,
        })?;
        let mut requests: Vec<(chrono::DateTime<Utc>, String)> = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match read_json::<InteropRequest>(&path) {
                Ok(req) => requests.push((req.created_at, req.id)),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable request"),
            }
        }
        requests.sort();
        Ok(requests.into_iter().map(|(_, id)| id).collect())
    }

    /// Run `id` in its target pipeline and persist the response.
    ///
    /// A request with a final (`ok` or `blocked`) response is not run
    /// again; its cached response is returned. A concurrent dispatch of the
    /// same request fails with `LockConflict`.
    pub async fn dispatch(&self, id: &str) -> Result<InteropResponse, OrchestratorError> {
        if let Some(cached) = self.response(id)?
            && cached.is_final()
        {
            debug!(request_id = %id, status = %cached.status, "Returning cached response");
            return Ok(cached);
        }
        let request = self.load_request(id)?;

        let claim_path = self.claims_dir.join(format!("{}.lock", id));
        let Some(_claim) = FileLock::try_exclusive(&claim_path)? else {
            return Err(OrchestratorError::LockConflict {
                path: rel_to(&self.ctx.config.project_dir, &self.request_path(id)),
                holder: "another dispatcher".to_string(),
            });
        };
        // Re-check under the claim: another dispatcher may have finished.
        let previous = self.response(id)?;
        if let Some(ref cached) = previous
            && cached.is_final()
        {
            return Ok(cached.clone());
        }
        let attempt = previous.map_or(1, |r| r.attempt + 1);

        let response = match self.isolation_violation(&request) {
            Some(reason) => {
                warn!(request_id = %id, %reason, "Request blocked");
                self.respond(&request, ResponseStatus::Blocked, reason, attempt)
            }
            None => self.run(&request, attempt).await?,
        };

        write_json_atomic(&self.response_path(id), &response)?;
        info!(request_id = %id, status = %response.status, attempt, "Request completed");
        if let Some(ref parent) = request.parent_run_id {
            self.note_on_parent(
                parent,
                RunEvent::RequestCompleted {
                    request_id: id.to_string(),
                    status: response.status.to_string(),
                    child_run_id: response.child_run_id.clone(),
                    response_path: rel_to(&self.ctx.config.project_dir, &self.response_path(id)),
                },
            );
        }
        Ok(response)
    }

    /// Dispatch according to `mode`, stopping early on cancellation.
    pub async fn pump(&self, mode: PumpMode) -> Result<Vec<InteropResponse>, OrchestratorError> {
        let ids = match mode {
            PumpMode::Request(id) => vec![id],
            PumpMode::Once => self.pending()?.into_iter().take(1).collect(),
            PumpMode::Drain => self.pending()?,
        };
        let mut responses = Vec::new();
        for id in ids {
            if self.cancel.as_ref().is_some_and(|c| *c.borrow()) {
                info!("Pump interrupted");
                break;
            }
            responses.push(self.dispatch(&id).await?);
        }
        Ok(responses)
    }

    /// Must-read pointers outside the allowed paths, missing, or over the
    /// request's read ceiling.
    fn isolation_violation(&self, request: &InteropRequest) -> Option<String> {
        let project_dir = &self.ctx.config.project_dir;
        let mut total: u64 = 0;
        for pointer in &request.must_read {
            let key = normalize_path(project_dir, pointer);
            if !request.allowed_paths.is_empty()
                && !request.allowed_paths.iter().any(|g| glob_or_prefix(g, &key))
            {
                return Some(format!("must-read '{}' is outside the allowed paths", pointer));
            }
            let path = resolve_path(project_dir, pointer);
            if !path.exists() {
                return Some(format!("must-read '{}' does not exist", pointer));
            }
            total += disk_usage(&path);
        }
        match request.max_read_bytes {
            Some(limit) if total > limit => Some(format!(
                "must-read pointers total {} bytes, over the request limit of {}",
                total, limit
            )),
            _ => None,
        }
    }

    async fn run(
        &self,
        request: &InteropRequest,
        attempt: u32,
    ) -> Result<InteropResponse, OrchestratorError> {
        let (pipeline, phase) = self
            .ctx
            .pipelines
            .resolve_action(&request.target_pipeline, &request.action)?;
        let input = PhaseInput {
            args: request.args.clone(),
            must_read: request.must_read.clone(),
            allowed_paths: request.allowed_paths.clone(),
            parent_run_id: request.parent_run_id.clone(),
            request_id: Some(request.id.clone()),
            ..Default::default()
        };

        // mtimes are compared at whole-second resolution
        let started = unix_secs(SystemTime::now());
        let mut machine = PhaseMachine::new(self.ctx);
        if let Some(ref cancel) = self.cancel {
            machine = machine.with_cancel(cancel.clone());
        }
        let report = machine.run_phase(pipeline, &phase.name, &input).await?;

        let mut response = match report.outcome {
            PhaseOutcome::Success => {
                let (produced, missing) = self.collect_deliverables(&request.deliverables, started);
                if missing.is_empty() {
                    self.respond(request, ResponseStatus::Ok, String::new(), attempt)
                        .with_deliverables(produced)
                } else {
                    self.respond(
                        request,
                        ResponseStatus::Failed,
                        format!("missing deliverables: {}", missing.join(", ")),
                        attempt,
                    )
                    .with_deliverables(produced)
                }
            }
            ref other => self.respond(request, ResponseStatus::Failed, other.to_string(), attempt),
        };
        response.child_run_id = Some(report.run_id.clone());
        response.child_run_dir = Some(rel_to(&self.ctx.config.project_dir, &report.run_dir));
        response.artifacts = list_files(&report.run_dir, &self.ctx.config.project_dir);
        Ok(response)
    }

    /// Files matching each deliverable glob and modified since `started`.
    /// Returns `(produced, globs with no match)`.
    fn collect_deliverables(&self, globs: &[String], started: u64) -> (Vec<String>, Vec<String>) {
        let project_dir = &self.ctx.config.project_dir;
        let mut produced = Vec::new();
        let mut missing = Vec::new();
        for pattern in globs {
            let full = resolve_path(project_dir, pattern);
            let matches: Vec<PathBuf> = glob::glob(&full.to_string_lossy())
                .map(|paths| {
                    paths
                        .filter_map(|p| p.ok())
                        .filter(|p| p.is_file() && modified_since(p, started))
                        .collect()
                })
                .unwrap_or_default();
            if matches.is_empty() {
                missing.push(pattern.clone());
            }
            produced.extend(matches.iter().map(|p| rel_to(project_dir, p)));
        }
        produced.sort();
        produced.dedup();
        (produced, missing)
    }

    fn respond(
        &self,
        request: &InteropRequest,
        status: ResponseStatus,
        reason: String,
        attempt: u32,
    ) -> InteropResponse {
        InteropResponse {
            request_id: request.id.clone(),
            status,
            child_run_id: None,
            child_run_dir: None,
            artifacts: Vec::new(),
            deliverables: Vec::new(),
            reason,
            attempt,
            completed_at: Utc::now(),
        }
    }

    /// Lineage events on a parent run are best-effort: the parent may
    /// live in another state directory.
    fn note_on_parent(&self, parent: &str, event: RunEvent) {
        if let Err(e) = self.ctx.store.append_event(parent, event) {
            debug!(parent_run_id = %parent, error = %e, "Parent run not recorded");
        }
    }
}

impl InteropResponse {
    fn with_deliverables(mut self, deliverables: Vec<String>) -> Self {
        self.deliverables = deliverables;
        self
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn modified_since(path: &Path, started: u64) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|t| unix_secs(t) >= started)
        .unwrap_or(false)
}

fn list_files(dir: &Path, base: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| rel_to(base, e.path()))
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::executor::ExecutionOutcome;
    use crate::executor::testing::ScriptedExecutor;
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    fn context(dir: &TempDir, executor: Arc<ScriptedExecutor>) -> OrchestrationContext {
        let config = Config::for_project(dir.path());
        config.ensure_directories().unwrap();
        fs::create_dir_all(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/theorem.md"), "statement").unwrap();
        fs::write(dir.path().join("secret.md"), "not for you").unwrap();
        OrchestrationContext::new(config, executor).unwrap()
    }

    fn request() -> InteropRequest {
        let mut req = InteropRequest::new("math", "research", "design");
        req.must_read = vec!["docs/theorem.md".into()];
        req.allowed_paths = vec!["docs/**".into()];
        req.deliverables = vec!["out/*.json".into()];
        req.justification = "need an experiment".into();
        req
    }

    fn writes_deliverable(req: &crate::executor::ExecutionRequest) -> anyhow::Result<ExecutionOutcome> {
        fs::create_dir_all(req.working_dir.join("out"))?;
        fs::write(req.working_dir.join("out/plan.json"), "{}")?;
        Ok(ExecutionOutcome::exited(0))
    }

    #[tokio::test]
    async fn second_dispatch_returns_the_cached_response() {
        let dir = tempdir().unwrap();
        let executor = Arc::new(ScriptedExecutor::new().then(writes_deliverable));
        let ctx = context(&dir, executor.clone());
        let queue = InteropQueue::new(&ctx);
        let id = queue.submit(&request()).unwrap();
        assert_eq!(queue.pending().unwrap(), vec![id.clone()]);

        let first = queue.dispatch(&id).await.unwrap();
        assert_eq!(first.status, ResponseStatus::Ok, "{}", first.reason);
        assert_eq!(first.deliverables, vec!["out/plan.json"]);
        assert!(first.artifacts.iter().any(|a| a.ends_with("metadata.json")));

        let second = queue.dispatch(&id).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(executor.call_count(), 1);
        assert_eq!(ctx.store.list(10).unwrap().len(), 1);
        assert!(queue.pending().unwrap().is_empty());

        let child = ctx.store.load(first.child_run_id.as_deref().unwrap()).unwrap();
        assert_eq!(child.request_id.as_deref(), Some(id.as_str()));
        assert_eq!(child.phase, "design");
    }

    #[tokio::test]
    async fn child_sees_only_the_isolation_boundary() {
        let dir = tempdir().unwrap();
        let executor = Arc::new(ScriptedExecutor::new().then(writes_deliverable));
        let ctx = context(&dir, executor.clone());
        let queue = InteropQueue::new(&ctx);
        let id = queue.submit(&request()).unwrap();
        queue.dispatch(&id).await.unwrap();

        let call = &executor.calls()[0];
        assert!(call.prompt.contains("docs/theorem.md"));
        assert!(call.prompt.contains("docs/**"));
        let allowed = call
            .env
            .iter()
            .find(|(k, _)| k == "ORCHESTRATE_ALLOWED_PATHS")
            .map(|(_, v)| v.as_str());
        assert_eq!(allowed, Some("docs/**"));
        assert!(!call.env.iter().any(|(k, _)| k == "ORCHESTRATE_TASK"));
    }

    #[tokio::test]
    async fn missing_deliverable_fails_and_stays_redispatchable() {
        let dir = tempdir().unwrap();
        let executor = Arc::new(ScriptedExecutor::new().succeed().then(writes_deliverable));
        let ctx = context(&dir, executor.clone());
        let queue = InteropQueue::new(&ctx);
        let id = queue.submit(&request()).unwrap();

        let failed = queue.dispatch(&id).await.unwrap();
        assert_eq!(failed.status, ResponseStatus::Failed);
        assert!(failed.reason.contains("out/*.json"));
        assert_eq!(failed.attempt, 1);
        assert!(failed.child_run_id.is_some());

        let retried = queue.pump(PumpMode::Request(id.clone())).await.unwrap();
        assert_eq!(retried[0].status, ResponseStatus::Ok);
        assert_eq!(retried[0].attempt, 2);
        assert_eq!(executor.call_count(), 2);
    }

    #[tokio::test]
    async fn phase_failure_is_a_failed_response() {
        let dir = tempdir().unwrap();
        let executor = Arc::new(ScriptedExecutor::new().exit(3));
        let ctx = context(&dir, executor);
        let queue = InteropQueue::new(&ctx);
        let id = queue.submit(&request()).unwrap();
        let resp = queue.dispatch(&id).await.unwrap();
        assert_eq!(resp.status, ResponseStatus::Failed);
        assert!(resp.reason.contains("exit-code"), "{}", resp.reason);
    }

    #[tokio::test]
    async fn must_read_outside_allowed_paths_is_blocked_without_running() {
        let dir = tempdir().unwrap();
        let executor = Arc::new(ScriptedExecutor::new());
        let ctx = context(&dir, executor.clone());
        let queue = InteropQueue::new(&ctx);
        let mut req = request();
        req.must_read.push("secret.md".into());
        let id = queue.submit(&req).unwrap();

        let resp = queue.dispatch(&id).await.unwrap();
        assert_eq!(resp.status, ResponseStatus::Blocked);
        assert!(resp.reason.contains("secret.md"));
        assert_eq!(executor.call_count(), 0);
        assert!(resp.child_run_id.is_none());

        let again = queue.dispatch(&id).await.unwrap();
        assert_eq!(again, resp);
    }

    #[tokio::test]
    async fn read_ceiling_blocks_large_must_reads() {
        let dir = tempdir().unwrap();
        let executor = Arc::new(ScriptedExecutor::new());
        let ctx = context(&dir, executor.clone());
        let queue = InteropQueue::new(&ctx);
        let mut req = request();
        req.max_read_bytes = Some(4);
        let id = queue.submit(&req).unwrap();
        let resp = queue.dispatch(&id).await.unwrap();
        assert_eq!(resp.status, ResponseStatus::Blocked);
        assert!(resp.reason.contains("over the request limit"));
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_claim_is_a_lock_conflict() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, Arc::new(ScriptedExecutor::new()));
        let queue = InteropQueue::new(&ctx);
        let id = queue.submit(&request()).unwrap();

        let _held = FileLock::try_exclusive(&ctx.config.interop_dir.join("claims").join(format!("{}.lock", id)))
            .unwrap()
            .unwrap();
        let err = queue.dispatch(&id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::LockConflict { .. }));
        assert!(queue.response(&id).unwrap().is_none());
    }

    #[test]
    fn submit_is_idempotent_and_requests_are_immutable() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, Arc::new(ScriptedExecutor::new()));
        let queue = InteropQueue::new(&ctx);
        let req = request();
        assert_eq!(queue.submit(&req).unwrap(), req.id);
        assert_eq!(queue.submit(&req).unwrap(), req.id);

        let mut changed = req.clone();
        changed.args = vec!["--fast".into()];
        assert!(matches!(queue.submit(&changed), Err(OrchestratorError::Validation(_))));

        let mut unknown = InteropRequest::new("math", "research", "nope");
        unknown.id = "rq-unknown".into();
        assert!(matches!(
            queue.submit(&unknown),
            Err(OrchestratorError::UnknownPhase { .. })
        ));
    }

    #[tokio::test]
    async fn drain_dispatches_in_creation_order_and_records_lineage() {
        let dir = tempdir().unwrap();
        let executor = Arc::new(ScriptedExecutor::new());
        let ctx = context(&dir, executor.clone());
        let parent = ctx
            .store
            .allocate(crate::artifacts::NewRun {
                pipeline: "math".into(),
                phase: "construct".into(),
                task: None,
                spec: None,
                parent_run_id: None,
                request_id: None,
                revision_cycle: 0,
                executor: "test".into(),
                args: vec![],
            })
            .unwrap();
        let queue = InteropQueue::new(&ctx);

        let mut first = InteropRequest::new("math", "tdd", "red");
        first.created_at = Utc::now() - chrono::Duration::seconds(5);
        first.parent_run_id = Some(parent.run_id.clone());
        let second = InteropRequest::new("math", "tdd", "tdd.green");
        queue.submit(&second).unwrap();
        queue.submit(&first).unwrap();

        let responses = queue.pump(PumpMode::Drain).await.unwrap();
        let ids: Vec<_> = responses.iter().map(|r| r.request_id.clone()).collect();
        assert_eq!(ids, vec![first.id.clone(), second.id.clone()]);
        assert_eq!(executor.phases_called(), vec!["red", "green"]);

        let events: Vec<_> = ctx
            .store
            .events(&parent.run_id)
            .unwrap()
            .into_iter()
            .map(|e| e.event.name())
            .collect();
        assert!(events.contains(&"request_enqueued"));
        assert!(events.contains(&"request_completed"));
        assert!(queue.pump(PumpMode::Once).await.unwrap().is_empty());
    }
}
