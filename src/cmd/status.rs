//! Read-only views: status, runs, locks, pipelines.

use anyhow::Result;
use console::style;
use orchestrate::backlog::{BacklogFile, DependencyGraph, TaskStatus};
use orchestrate::errors::{EXIT_FAILURE, EXIT_OK};
use orchestrate::interop::InteropQueue;
use orchestrate::scheduler::ProgramScheduler;
use orchestrate::ui;
use serde_json::json;

use super::super::{Cli, LocksCommands};
use super::{load_context, print_json};

const STATUSES: [TaskStatus; 5] = [
    TaskStatus::NotStarted,
    TaskStatus::InProgress,
    TaskStatus::NeedsRevision,
    TaskStatus::Blocked,
    TaskStatus::Done,
];

pub fn cmd_status(cli: &Cli) -> Result<i32> {
    let ctx = load_context(cli, None)?;
    let config = &ctx.config;
    let backlog_file = BacklogFile::new(&config.backlog_file, &config.state_dir);
    let backlog = if backlog_file.exists() {
        Some(backlog_file.load()?)
    } else {
        None
    };
    let next = match backlog {
        Some(ref b) => DependencyGraph::build(b.tasks())?
            .next_actionable()
            .map(|t| t.id.clone()),
        None => None,
    };
    let locks = ctx.locks.snapshot()?;
    let budgets = ctx.governor.snapshot()?;
    let pending = InteropQueue::new(&ctx).pending()?;
    let program = ProgramScheduler::new(&ctx).load_state()?;
    let handoff = config.handoff_marker.exists();

    if cli.json {
        let counts: serde_json::Map<String, serde_json::Value> = match backlog {
            Some(ref b) => STATUSES
                .iter()
                .map(|s| (s.as_str().to_string(), json!(b.count(*s))))
                .collect(),
            None => serde_json::Map::new(),
        };
        print_json(&json!({
            "backlog": config.backlog_file,
            "tasks": counts,
            "next": next,
            "locks": locks.entries,
            "budgets": budgets,
            "pending_requests": pending,
            "program": program,
            "handoff": handoff.then(|| config.handoff_marker.clone()),
        }))?;
        return Ok(EXIT_OK);
    }

    println!();
    println!("{}", style("Orchestrate Status").bold());
    println!("State: {}", config.state_dir.display());
    println!();

    match backlog {
        Some(ref b) => {
            println!("{}Backlog {}", ui::PROGRESS, config.backlog_file.display());
            for status in STATUSES {
                let count = b.count(status);
                if count > 0 {
                    println!("  {:<16} {}", ui::status_label(status), count);
                }
            }
            match next {
                Some(ref id) => println!("  next: {}", style(id).bold()),
                None => println!("  next: {}", style("none").dim()),
            }
        }
        None => println!("No backlog at {}", config.backlog_file.display()),
    }
    println!();

    if locks.entries.is_empty() {
        println!("{}No locks held", ui::LOCK);
    } else {
        println!("{}{} lock(s) held", ui::LOCK, locks.entries.len());
        for entry in &locks.entries {
            println!("  {:<40} {:<16} {}", entry.path, entry.mode.to_string(), style(&entry.holder).dim());
        }
    }
    println!();

    if !budgets.is_empty() {
        println!("Budgets");
        for (scope, counters) in &budgets {
            for (name, state) in counters {
                let line = format!(
                    "  {:<16} {:<18} {:.2} / {:.2}",
                    scope, name.as_str(), state.used, state.ceiling
                );
                if state.exhausted {
                    println!("{} {}", line, style("exhausted").red());
                } else {
                    println!("{}", line);
                }
            }
        }
        println!();
    }

    println!("Pending requests: {}", pending.len());
    for id in &pending {
        println!("  {}", id);
    }
    if let Some(ref state) = program {
        println!();
        println!("Program: {} cycles, last task {}", state.cycles, state.last_task.as_deref().unwrap_or("-"));
        if let Some(ref termination) = state.termination {
            println!("  stopped: {}", termination);
        }
    }
    if handoff {
        println!();
        println!("{}Handoff required: {}", ui::BLOCKER, config.handoff_marker.display());
    }
    println!();
    Ok(EXIT_OK)
}

pub fn cmd_runs(cli: &Cli, limit: usize) -> Result<i32> {
    let ctx = load_context(cli, None)?;
    let runs = ctx.store.list(limit)?;
    if cli.json {
        print_json(&runs)?;
        return Ok(EXIT_OK);
    }
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(EXIT_OK);
    }
    println!("{:<32} {:<10} {:<12} {:<15} Task", "Run", "Pipeline", "Phase", "Status");
    for run in &runs {
        println!(
            "{:<32} {:<10} {:<12} {:<15} {}",
            run.run_id,
            run.pipeline,
            run.phase,
            run.status.to_string(),
            run.task.as_deref().unwrap_or("-")
        );
        if let Some(ref parent) = run.parent_run_id {
            println!("  {} {}", style("parent").dim(), parent);
        }
    }
    Ok(EXIT_OK)
}

pub fn cmd_locks(cli: &Cli, command: Option<LocksCommands>) -> Result<i32> {
    let ctx = load_context(cli, None)?;
    match command {
        None | Some(LocksCommands::List) => {
            let table = ctx.locks.snapshot()?;
            if cli.json {
                print_json(&table.entries)?;
            } else if table.entries.is_empty() {
                println!("No locks held.");
            } else {
                for entry in &table.entries {
                    println!(
                        "{:<40} {:<16} {} (pid {} on {}, since {})",
                        entry.path,
                        entry.mode.to_string(),
                        entry.holder,
                        entry.pid,
                        entry.host,
                        entry.acquired_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
            Ok(EXIT_OK)
        }
        Some(LocksCommands::Release { holder }) => {
            let removed = ctx.locks.release_holder(&holder)?;
            if cli.json {
                print_json(&json!({ "holder": holder, "released": removed }))?;
            } else {
                println!("Released {} grant(s) held by {}", removed, holder);
            }
            Ok(EXIT_OK)
        }
    }
}

pub fn cmd_pipelines(cli: &Cli) -> Result<i32> {
    let ctx = load_context(cli, None)?;
    if cli.json {
        let pipelines: Vec<_> = ctx.pipelines.iter().collect();
        print_json(&pipelines)?;
        return Ok(EXIT_OK);
    }
    let mut problems = false;
    for pipeline in ctx.pipelines.iter() {
        println!();
        println!(
            "{}  {}  (revisions restart from {})",
            style(&pipeline.name).bold(),
            style(&pipeline.description).dim(),
            pipeline.default_restart()
        );
        for phase in &pipeline.phases {
            let locks: Vec<String> = phase
                .locks
                .iter()
                .map(|l| format!("{}:{}", l.path, l.mode))
                .collect();
            println!("  {:<12} {:<44} {}", phase.name, phase.description, locks.join(" "));
        }
        for problem in pipeline.problems() {
            problems = true;
            println!("  {} {}", style("problem:").red(), problem);
        }
    }
    println!();
    Ok(if problems { EXIT_FAILURE } else { EXIT_OK })
}
