//! Program mode: `orchestrate program`.

use anyhow::Result;
use console::style;
use orchestrate::errors::EXIT_OK;
use orchestrate::scheduler::{ProgramOptions, ProgramScheduler, Termination};
use orchestrate::ui;

use super::super::Cli;
use super::{interrupt_signal, load_context, print_json};

pub async fn cmd_program(
    cli: &Cli,
    max_cycles: Option<u32>,
    resume: bool,
    dry_run: bool,
) -> Result<i32> {
    let ctx = load_context(cli, max_cycles)?;
    let scheduler = ProgramScheduler::new(&ctx);

    if dry_run {
        let plan = scheduler.plan()?;
        if cli.json {
            print_json(&plan)?;
            return Ok(EXIT_OK);
        }
        println!();
        println!("{:<6} {:<12} {:<24} Depends on", "Task", "Status", "Name");
        println!("{:<6} {:<12} {:<24} ----------", "----", "------", "----");
        for task in &plan.order {
            let marker = if Some(&task.id) == plan.next.as_ref() { "→" } else { " " };
            println!(
                "{}{:<5} {:<12} {:<24} {}",
                marker,
                task.id,
                ui::status_label(task.status),
                task.name,
                task.depends_on.join(", ")
            );
        }
        println!();
        match plan.next {
            Some(ref next) => println!("Next: {}", style(next).bold()),
            None => println!("No actionable task."),
        }
        if !plan.would_block.is_empty() {
            println!("Would block: {}", plan.would_block.join(", "));
        }
        return Ok(EXIT_OK);
    }

    let state = scheduler
        .with_cancel(interrupt_signal())
        .run(ProgramOptions { resume })
        .await?;

    if cli.json {
        print_json(&state)?;
    } else {
        println!();
        for entry in &state.history {
            println!(
                "  {:<6} {:<40} runs={} revisions={} hours={:.2}",
                entry.task, entry.result, entry.runs, entry.revisions, entry.compute_hours
            );
        }
        println!();
        let termination = state.termination.clone().unwrap_or(Termination::Interrupted);
        let icon = match termination {
            Termination::Converged => ui::CHECK,
            Termination::Handoff { .. } | Termination::Stalled { .. } => ui::BLOCKER,
            _ => ui::CROSS,
        };
        println!(
            "{}Program stopped after {} cycles: {}",
            icon,
            state.cycles,
            style(&termination).bold()
        );
    }
    Ok(state
        .termination
        .as_ref()
        .map_or(orchestrate::errors::EXIT_FAILURE, Termination::exit_code))
}
