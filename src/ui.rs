//! Icons and styled labels for operator-facing output.

use crate::artifacts::PhaseOutcome;
use crate::backlog::TaskStatus;
use crate::interop::ResponseStatus;
use console::{Emoji, StyledObject, style};

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static BLOCKER: Emoji<'_, '_> = Emoji("🚧 ", "[BLOCK]");
pub static PIVOT: Emoji<'_, '_> = Emoji("🔄 ", "[REV]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
pub static LOCK: Emoji<'_, '_> = Emoji("🔒 ", "[L]");
pub static PROGRESS: Emoji<'_, '_> = Emoji("📊 ", "[PROG]");

pub fn outcome_icon(outcome: &PhaseOutcome) -> Emoji<'static, 'static> {
    match outcome {
        PhaseOutcome::Success => CHECK,
        PhaseOutcome::NeedsRevision { .. } => PIVOT,
        PhaseOutcome::Failure { failure } if failure.tag() == "timeout" => CLOCK,
        PhaseOutcome::Failure { .. } => CROSS,
    }
}

pub fn status_label(status: TaskStatus) -> StyledObject<&'static str> {
    let label = style(status.as_str());
    match status {
        TaskStatus::Done => label.green(),
        TaskStatus::InProgress => label.cyan(),
        TaskStatus::Blocked => label.red(),
        TaskStatus::NeedsRevision => label.yellow(),
        TaskStatus::NotStarted => label.dim(),
    }
}

pub fn response_label(status: ResponseStatus) -> StyledObject<String> {
    let label = style(status.to_string());
    match status {
        ResponseStatus::Ok => label.green(),
        ResponseStatus::Blocked => label.yellow(),
        ResponseStatus::Failed => label.red(),
    }
}
