//! `orchestrate <pipeline> [phase] [args...]`.

use anyhow::Result;
use console::style;
use orchestrate::errors::{EXIT_OK, EXIT_USAGE, OrchestratorError};
use orchestrate::machine::{PhaseInput, PhaseMachine, PhaseReport, PipelineOutcome};
use orchestrate::ui;
use serde_json::json;

use super::super::Cli;
use super::{interrupt_signal, load_context, print_json};

pub async fn run_pipeline(cli: &Cli, argv: &[String]) -> Result<i32> {
    let Some((pipeline_name, rest)) = argv.split_first() else {
        eprintln!("usage: orchestrate <pipeline> [phase] [args...]");
        return Ok(EXIT_USAGE);
    };
    let ctx = load_context(cli, None)?;
    let pipeline = match ctx.pipelines.get(pipeline_name) {
        Ok(p) => p.clone(),
        Err(e) => return usage_error(e, ctx.pipelines.iter().map(|p| p.name.clone()).collect()),
    };

    let phase = rest.first().cloned();
    if let Some(ref name) = phase
        && pipeline.phase(name).is_none()
    {
        let err = OrchestratorError::UnknownPhase {
            pipeline: pipeline.name.clone(),
            phase: name.clone(),
        };
        return usage_error(err, pipeline.phase_names().iter().map(|s| s.to_string()).collect());
    }

    let input = PhaseInput {
        task: cli.task.clone(),
        spec: cli.spec.clone(),
        args: rest.iter().skip(1).cloned().collect(),
        parent_run_id: std::env::var("ORCHESTRATE_RUN_ID").ok().filter(|s| !s.is_empty()),
        ..Default::default()
    };
    let machine = PhaseMachine::new(&ctx).with_cancel(interrupt_signal());

    let (reports, completed) = match phase {
        Some(ref name) => (vec![machine.run_phase(&pipeline, name, &input).await?], false),
        None => {
            let report = machine.run_pipeline(&pipeline, None, &input).await?;
            let completed = report.outcome == PipelineOutcome::Completed;
            (report.phases, completed)
        }
    };

    if cli.json {
        let phases: Vec<_> = reports.iter().map(report_json).collect();
        print_json(&json!({ "pipeline": pipeline.name, "phases": phases }))?;
    } else {
        for report in &reports {
            print_report(report);
        }
        if completed {
            println!("{}pipeline {} completed", ui::CHECK, style(&pipeline.name).bold());
        }
    }
    Ok(reports.last().map_or(EXIT_OK, PhaseReport::process_exit_code))
}

fn usage_error(err: OrchestratorError, known: Vec<String>) -> Result<i32> {
    eprintln!("{} {}", style("error:").red().bold(), err);
    eprintln!("known: {}", known.join(", "));
    Ok(EXIT_USAGE)
}

fn print_report(report: &PhaseReport) {
    println!(
        "{}{}/{} {}  {}",
        ui::outcome_icon(&report.outcome),
        report.pipeline,
        style(&report.phase).bold(),
        report.outcome,
        style(&report.run_id).dim()
    );
    println!("   {}", style(report.run_dir.display()).dim());
}

fn report_json(report: &PhaseReport) -> serde_json::Value {
    json!({
        "run_id": report.run_id,
        "run_dir": report.run_dir,
        "phase": report.phase,
        "status": report.outcome.status(),
        "outcome": report.outcome,
        "exit_code": report.exit_code,
        "compute_hours": report.compute_hours,
    })
}
