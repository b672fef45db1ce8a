//! Executor-side capability guard, installed as the agent's pre-tool-use
//! hook.
//!
//! The hook receives the tool call either through `CLAUDE_TOOL_NAME` /
//! `CLAUDE_TOOL_INPUT` or as a JSON payload on stdin, and finds the active
//! phase through the `ORCHESTRATE_*` variables the phase machine exports.
//! Outside a phase every call is allowed.

use crate::context::OrchestrationContext;
use crate::errors::OrchestratorError;
use crate::locks::{PhasePolicy, PolicyDecision};
use serde::Deserialize;
use serde_json::{Value, json};

/// One tool invocation as seen by the hook.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool: String,
    pub input: Value,
}

#[derive(Deserialize)]
struct HookPayload {
    tool_name: String,
    #[serde(default)]
    tool_input: Value,
}

impl ToolCall {
    /// Read from the environment, falling back to a stdin payload.
    /// `None` when neither names a tool.
    pub fn from_sources(
        lookup: impl Fn(&str) -> Option<String>,
        stdin: impl FnOnce() -> std::io::Result<String>,
    ) -> Result<Option<Self>, OrchestratorError> {
        if let Some(tool) = lookup("CLAUDE_TOOL_NAME").filter(|t| !t.trim().is_empty()) {
            let raw = lookup("CLAUDE_TOOL_INPUT").unwrap_or_default();
            let input = if raw.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&raw).unwrap_or_else(|_| json!({ "command": raw }))
            };
            return Ok(Some(Self { tool, input }));
        }

        let payload = stdin().map_err(|source| OrchestratorError::Io {
            path: "<stdin>".into(),
            source,
        })?;
        if payload.trim().is_empty() {
            return Ok(None);
        }
        let parsed: HookPayload = serde_json::from_str(&payload)
            .map_err(|e| OrchestratorError::validation(format!("hook payload: {}", e)))?;
        Ok(Some(Self {
            tool: parsed.tool_name,
            input: parsed.tool_input,
        }))
    }
}

/// The phase a hook invocation belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivePhase {
    pub pipeline: String,
    pub phase: String,
    pub run_id: Option<String>,
    pub allowed_paths: Vec<String>,
}

impl ActivePhase {
    pub fn from_env(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Some(Self {
            pipeline: non_empty("ORCHESTRATE_PIPELINE")?,
            phase: non_empty("ORCHESTRATE_PHASE")?,
            run_id: non_empty("ORCHESTRATE_RUN_ID"),
            allowed_paths: non_empty("ORCHESTRATE_ALLOWED_PATHS")
                .map(|v| v.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
                .unwrap_or_default(),
        })
    }
}

/// Judge `call` against the phase's rules and the live lock table.
pub fn evaluate(
    ctx: &OrchestrationContext,
    active: &ActivePhase,
    call: &ToolCall,
) -> Result<PolicyDecision, OrchestratorError> {
    let pipeline = ctx.pipelines.get(&active.pipeline)?;
    let phase = pipeline
        .phase(&active.phase)
        .ok_or_else(|| OrchestratorError::UnknownPhase {
            pipeline: active.pipeline.clone(),
            phase: active.phase.clone(),
        })?;
    let table = ctx.locks.snapshot()?;
    let policy = PhasePolicy::new(&phase.name, phase.rules.clone())
        .with_lock_table(&table, active.run_id.as_deref())
        .with_read_scope(active.allowed_paths.clone());
    Ok(policy.check_tool(&call.tool, &call.input, &ctx.config.project_dir))
}
