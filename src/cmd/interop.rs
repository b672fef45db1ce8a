//! Interop commands: `orchestrate request` and `orchestrate pump`.

use anyhow::Result;
use console::style;
use orchestrate::errors::{EXIT_FAILURE, EXIT_OK, EXIT_USAGE};
use orchestrate::interop::{InteropQueue, InteropRequest, PumpMode, ResponseStatus};
use orchestrate::ui;

use super::super::{Cli, RequestArgs};
use super::{interrupt_signal, load_context, print_json};

fn env_default(value: &Option<String>, key: &str) -> Option<String> {
    value
        .clone()
        .or_else(|| std::env::var(key).ok())
        .filter(|v| !v.trim().is_empty())
}

pub fn cmd_request(cli: &Cli, args: &RequestArgs) -> Result<i32> {
    let Some(source) = env_default(&args.from, "ORCHESTRATE_PIPELINE") else {
        eprintln!("error: --from is required outside a running phase");
        return Ok(EXIT_USAGE);
    };
    let ctx = load_context(cli, None)?;

    let mut request = InteropRequest::new(&source, &args.to, &args.action);
    if let Some(ref id) = args.id {
        request.id = id.clone();
    }
    request.source_phase = env_default(&args.from_phase, "ORCHESTRATE_PHASE");
    request.parent_run_id = env_default(&args.parent_run, "ORCHESTRATE_RUN_ID");
    request.args = args.args.clone();
    request.must_read = args.must_read.clone();
    request.allowed_paths = args.allowed_path.clone();
    request.deliverables = args.deliverable.clone();
    request.justification = args.justification.clone();
    request.max_read_bytes = args.max_read_bytes;

    let queue = InteropQueue::new(&ctx);
    let id = queue.submit(&request)?;
    if cli.json {
        print_json(&serde_json::json!({
            "request_id": id,
            "request_path": queue.request_path(&id),
            "response_path": queue.response_path(&id),
        }))?;
    } else {
        println!("{}", id);
    }
    Ok(EXIT_OK)
}

pub async fn cmd_pump(cli: &Cli, once: bool, request: Option<String>) -> Result<i32> {
    let ctx = load_context(cli, None)?;
    let queue = InteropQueue::new(&ctx).with_cancel(interrupt_signal());
    let mode = match (request, once) {
        (Some(id), _) => PumpMode::Request(id),
        (None, true) => PumpMode::Once,
        (None, false) => PumpMode::Drain,
    };

    let responses = queue.pump(mode).await?;
    if cli.json {
        print_json(&responses)?;
    } else if responses.is_empty() {
        println!("No pending requests.");
    } else {
        for resp in &responses {
            let icon = match resp.status {
                ResponseStatus::Ok => ui::CHECK,
                ResponseStatus::Blocked => ui::BLOCKER,
                ResponseStatus::Failed => ui::CROSS,
            };
            println!(
                "{}{} {} (attempt {})",
                icon,
                style(&resp.request_id).bold(),
                ui::response_label(resp.status),
                resp.attempt
            );
            if let Some(ref child) = resp.child_run_id {
                println!("   child run {}", style(child).dim());
            }
            if !resp.reason.is_empty() {
                println!("   {}", resp.reason);
            }
        }
    }

    let all_ok = responses.iter().all(|r| r.status == ResponseStatus::Ok);
    Ok(if all_ok { EXIT_OK } else { EXIT_FAILURE })
}
