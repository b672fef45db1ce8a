use super::{PhaseSpec, Pipeline};
use crate::locks::{CapabilityRule, LockMode, Operation};

const READ_TOOLS: &[&str] = &["Read", "Glob", "Grep", "WebSearch", "WebFetch"];
const WRITE_TOOLS: &[&str] = &["Read", "Glob", "Grep", "Write", "Edit", "Bash"];
const AUDIT_TOOLS: &[&str] = &["Read", "Glob", "Grep", "Bash"];

pub fn builtin_names() -> [&'static str; 3] {
    ["tdd", "research", "math"]
}

pub fn builtin_pipelines() -> Vec<Pipeline> {
    vec![tdd(), research(), math()]
}

fn tdd() -> Pipeline {
    Pipeline {
        name: "tdd".into(),
        description: "Test-first feature delivery".into(),
        restart_from: Some("green".into()),
        phases: vec![
            PhaseSpec::new("red", "Write failing tests that pin the behavior")
                .lock("{spec}", LockMode::ReadOnly)
                .lock("tests", LockMode::ExclusiveWrite)
                .rule(CapabilityRule::new("src/**", &[Operation::Read]))
                .tools(WRITE_TOOLS),
            PhaseSpec::new("green", "Make the tests pass without touching them")
                .lock("{spec}", LockMode::ReadOnly)
                .lock("tests", LockMode::ReadOnly)
                .lock("src", LockMode::ExclusiveWrite)
                .tools(WRITE_TOOLS),
            PhaseSpec::new("refactor", "Improve structure with tests frozen")
                .lock("tests", LockMode::ReadOnly)
                .lock("src", LockMode::ExclusiveWrite)
                .tools(WRITE_TOOLS),
            PhaseSpec::new("ship", "Final checks and hand-off")
                .tools(WRITE_TOOLS),
        ],
    }
}

fn research() -> Pipeline {
    Pipeline {
        name: "research".into(),
        description: "Question-driven experiment loop".into(),
        restart_from: Some("design".into()),
        phases: vec![
            PhaseSpec::new("survey", "Read prior work and the question")
                .lock("{spec}", LockMode::ReadOnly)
                .tools(READ_TOOLS),
            PhaseSpec::new("frame", "State hypotheses and success criteria")
                .lock("{spec}", LockMode::ExclusiveWrite)
                .tools(WRITE_TOOLS),
            PhaseSpec::new("design", "Design the experiment")
                .lock("{spec}", LockMode::ExclusiveWrite)
                .lock("experiments", LockMode::ExclusiveWrite)
                .tools(WRITE_TOOLS),
            PhaseSpec::new("run", "Execute the experiment as designed")
                .lock("{spec}", LockMode::ReadOnly)
                .lock("experiments", LockMode::ReadOnly)
                .lock("results", LockMode::ExclusiveWrite)
                .tools(WRITE_TOOLS)
                .timeout(4 * 3600),
            PhaseSpec::new("analyze", "Analyze results against the criteria")
                .lock("results", LockMode::ReadOnly)
                .lock("analysis", LockMode::ExclusiveWrite)
                .rule(CapabilityRule::new("results/**", &[Operation::Read]))
                .tools(WRITE_TOOLS),
            PhaseSpec::new("log", "Record the outcome")
                .lock("RESEARCH_LOG.md", LockMode::ExclusiveWrite)
                .tools(WRITE_TOOLS),
        ],
    }
}

fn math() -> Pipeline {
    Pipeline {
        name: "math".into(),
        description: "Construction, formalization and proof".into(),
        restart_from: Some("construct".into()),
        phases: vec![
            PhaseSpec::new("survey", "Read the literature and the target statement")
                .lock("{spec}", LockMode::ReadOnly)
                .tools(READ_TOOLS),
            PhaseSpec::new("specify", "Fix the precise statement to construct")
                .lock("{spec}", LockMode::ExclusiveWrite)
                .tools(WRITE_TOOLS),
            PhaseSpec::new("construct", "Build the construction informally")
                .lock("{spec}", LockMode::ExclusiveWrite)
                .tools(WRITE_TOOLS),
            PhaseSpec::new("formalize", "State the construction in the proof assistant")
                .lock("{spec}", LockMode::ReadOnly)
                .lock("lean", LockMode::ExclusiveWrite)
                .tools(WRITE_TOOLS),
            PhaseSpec::new("prove", "Discharge the formal obligations")
                .lock("{spec}", LockMode::ReadOnly)
                .lock("lean", LockMode::ExclusiveWrite)
                .tools(WRITE_TOOLS)
                .timeout(2 * 3600),
            PhaseSpec::new("audit", "Check proofs build with no gaps")
                .lock("{spec}", LockMode::ReadOnly)
                .lock("lean", LockMode::ReadOnly)
                .rule(CapabilityRule::new(
                    "lean/**",
                    &[Operation::Read, Operation::Execute],
                ))
                .tools(AUDIT_TOOLS),
            PhaseSpec::new("log", "Record the construction")
                .lock("CONSTRUCTION_LOG.md", LockMode::ExclusiveWrite)
                .tools(WRITE_TOOLS),
        ],
    }
}
