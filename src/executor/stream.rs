//! Agent CLI `stream-json` output parsing.

use serde::Deserialize;
use serde_json::Value;

/// Events from the agent CLI's stream-json output format
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(rename = "system")]
    System {},
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// Path a tool call reads, if it is a read.
pub fn read_path(name: &str, input: &Value) -> Option<String> {
    match name {
        "Read" => input.get("file_path").and_then(|v| v.as_str()).map(String::from),
        "NotebookRead" => input
            .get("notebook_path")
            .and_then(|v| v.as_str())
            .map(String::from),
        _ => None,
    }
}

/// Short description of a tool call for diagnostics.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str()).unwrap_or("?");
    match name {
        "Read" => format!("Reading: {}", field("file_path")),
        "Write" => format!("Creating: {}", field("file_path")),
        "Edit" | "MultiEdit" => format!("Editing: {}", field("file_path")),
        "Bash" => format!("Running: {}", truncate_str(field("command"), 60)),
        "Glob" | "Grep" => format!("{}: {}", name, truncate_str(field("pattern"), 40)),
        other => other.to_string(),
    }
}

pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
