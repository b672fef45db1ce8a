//! `orchestrate guard`: pre-tool-use hook entry point.

use anyhow::Result;
use orchestrate::errors::{EXIT_FAILURE, EXIT_OK};
use orchestrate::guard::{ActivePhase, ToolCall, evaluate};
use std::io::Read;

use super::super::Cli;
use super::load_context;

pub fn cmd_guard(cli: &Cli) -> Result<i32> {
    let lookup = |key: &str| std::env::var(key).ok();
    let Some(active) = ActivePhase::from_env(lookup) else {
        return Ok(EXIT_OK);
    };
    let read_stdin = || -> std::io::Result<String> {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    };
    let Some(call) = ToolCall::from_sources(lookup, read_stdin)? else {
        return Ok(EXIT_OK);
    };

    let ctx = load_context(cli, None)?;
    let decision = evaluate(&ctx, &active, &call)?;
    if decision.allowed {
        tracing::debug!(tool = %call.tool, reason = %decision.reason, "Tool call allowed");
        Ok(EXIT_OK)
    } else {
        eprintln!("BLOCKED: {}", decision.reason);
        Ok(EXIT_FAILURE)
    }
}
