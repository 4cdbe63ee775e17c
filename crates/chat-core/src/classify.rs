//! Content heuristics for message kind.
//!
//! Rules are tried in order and the first hit wins. Detection is pure, so
//! re-running it on a growing stream is idempotent.

use chat_types::message::MessageKind;

const CODE_FENCE: &str = "```";

const TOOL_USE_MARKERS: &[&str] = &[
    "<tool_use>",
    "<function_calls>",
    "[Tool: ",
    "Using tool:",
    "\"type\":\"tool_use\"",
];

const ERROR_PREFIXES: &[&str] = &["error:", "error -", "[error]", "fatal:"];

const THINKING_MARKERS: &[&str] = &["<thinking>", "<think>"];

const FILE_OPERATION_PREFIXES: &[&str] = &[
    "created file",
    "modified file",
    "deleted file",
    "wrote to ",
    "reading file",
];

/// Classify accumulated content.
pub fn detect_kind(content: &str) -> MessageKind {
    if content.contains(CODE_FENCE) {
        return MessageKind::Code;
    }
    if TOOL_USE_MARKERS.iter().any(|m| content.contains(m)) {
        return MessageKind::ToolUse;
    }

    let head = content.trim_start();
    let head_lower = head
        .chars()
        .take(32)
        .collect::<String>()
        .to_ascii_lowercase();

    if ERROR_PREFIXES.iter().any(|p| head_lower.starts_with(p)) {
        return MessageKind::Error;
    }
    if THINKING_MARKERS.iter().any(|m| head.starts_with(m)) {
        return MessageKind::Thinking;
    }
    if let Some(command) = head.strip_prefix("$ ") {
        return if command.trim_start().starts_with("git ") {
            MessageKind::GitOperation
        } else {
            MessageKind::TerminalCommand
        };
    }
    if FILE_OPERATION_PREFIXES.iter().any(|p| head_lower.starts_with(p)) {
        return MessageKind::FileOperation;
    }
    MessageKind::Text
}

/// Language named on the first code fence, e.g. "rust" for ```` ```rust ````.
pub fn code_language(content: &str) -> Option<String> {
    let start = content.find(CODE_FENCE)? + CODE_FENCE.len();
    let info = content[start..].lines().next()?.trim();
    let language = info.split_whitespace().next()?;
    if language.is_empty() || language.starts_with('`') {
        None
    } else {
        Some(language.to_string())
    }
}
