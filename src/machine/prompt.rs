//! Prompt rendering for one phase.

use super::{PhaseInput, REVISION_MARKER, USAGE_FILE};
use crate::locks::LockRequest;
use crate::pipeline::{PhaseSpec, Pipeline};
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;

/// Variables available to a phase's prompt template.
pub struct PromptVars<'a> {
    pub pipeline: &'a Pipeline,
    pub phase: &'a PhaseSpec,
    pub input: &'a PhaseInput,
    pub run_dir: &'a str,
    pub locks: &'a [LockRequest],
}

impl PromptVars<'_> {
    fn substitute(&self, template: &str) -> String {
        template
            .replace("{pipeline}", &self.pipeline.name)
            .replace("{phase}", &self.phase.name)
            .replace("{task}", self.input.task.as_deref().unwrap_or(""))
            .replace("{spec}", self.input.spec.as_deref().unwrap_or(""))
            .replace("{args}", &self.input.args.join(" "))
            .replace("{run_dir}", self.run_dir)
            .replace("{must_read}", &self.input.must_read.join("\n"))
            .replace("{allowed_paths}", &self.input.allowed_paths.join("\n"))
    }
}

/// Render from the phase's template file when it declares one, otherwise
/// from the built-in layout.
pub fn render(project_dir: &Path, vars: &PromptVars<'_>) -> Result<String> {
    match vars.phase.prompt {
        Some(ref template) => {
            let path = crate::util::resolve_path(project_dir, template);
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prompt template {}", path.display()))?;
            Ok(vars.substitute(&content))
        }
        None => Ok(default_prompt(vars)),
    }
}

fn default_prompt(vars: &PromptVars<'_>) -> String {
    let input = vars.input;
    let mut out = format!("# {} / {}\n\n", vars.pipeline.name, vars.phase.name);
    if !vars.phase.description.is_empty() {
        let _ = writeln!(out, "{}\n", vars.phase.description);
    }

    out.push_str("## Task\n\n");
    match (&input.task, &input.spec) {
        (Some(task), Some(spec)) => {
            let _ = writeln!(out, "Task {} (spec: {})", task, spec);
        }
        (Some(task), None) => {
            let _ = writeln!(out, "Task {}", task);
        }
        (None, Some(spec)) => {
            let _ = writeln!(out, "Spec: {}", spec);
        }
        (None, None) => out.push_str("No backlog task; work from the arguments below.\n"),
    }
    if !input.args.is_empty() {
        let _ = writeln!(out, "Arguments: {}", input.args.join(" "));
    }
    if input.revision_cycle > 0 {
        let _ = writeln!(
            out,
            "This is revision attempt {}. Read the negative knowledge file before starting.",
            input.revision_cycle
        );
    }

    if !input.must_read.is_empty() {
        out.push_str("\n## Must read\n\n");
        for path in &input.must_read {
            let _ = writeln!(out, "- {}", path);
        }
    }

    if !input.allowed_paths.is_empty() {
        out.push_str("\n## Allowed paths\n\nRead nothing outside these globs:\n\n");
        for glob in &input.allowed_paths {
            let _ = writeln!(out, "- {}", glob);
        }
    }

    if !vars.locks.is_empty() {
        out.push_str("\n## Locks held for this phase\n\n");
        for lock in vars.locks {
            let _ = writeln!(out, "- {} ({})", lock.path, lock.mode);
        }
        out.push_str("\nWrites to read-only paths are blocked and fail the phase.\n");
    }

    let _ = write!(
        out,
        "\n## Signals\n\n\
         Run directory: {run_dir}\n\n\
         If the work cannot be completed as specified, write `{run_dir}/{marker}` \
         containing {{\"restart_from\": \"<phase>\", \"reason\": \"<why>\"}} and exit 0. \
         Phases of this pipeline: {phases}.\n\n\
         To report GPU hours or read volume, write `{run_dir}/{usage}` containing \
         {{\"compute_hours\": <float>, \"read_bytes\": <int>}}.\n",
        run_dir = vars.run_dir,
        marker = REVISION_MARKER,
        usage = USAGE_FILE,
        phases = vars.pipeline.phase_names().join(", "),
    );
    out
}
