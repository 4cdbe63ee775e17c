//! Plain-text rendering of the transcript and engine events.

use chat_types::{
    event::ChatEvent,
    message::{Direction, Message, MessageKind, MessageStatus},
};
use chat_core::projection::TranscriptProjection;

pub fn render_message(message: &Message) -> String {
    let who = match (message.direction, message.kind) {
        (Direction::Outbound, _) => "you".to_string(),
        (Direction::Inbound, MessageKind::System) => "system".to_string(),
        (Direction::Inbound, MessageKind::Text) => "assistant".to_string(),
        (Direction::Inbound, kind) => format!("assistant/{}", kind_label(kind)),
    };
    let status = if message.streaming {
        "streaming"
    } else {
        status_label(message.status)
    };
    format!(
        "{} {:<20} [{}] {}",
        message.timestamp.format("%H:%M:%S"),
        who,
        status,
        message.content
    )
}

pub fn render_transcript(view: &TranscriptProjection) -> String {
    let mut out = String::new();
    if let Some(session) = &view.session_id {
        out.push_str(&format!("session {}\n", session));
    }
    for message in &view.messages {
        out.push_str(&render_message(message));
        out.push('\n');
    }
    out.push_str(&format!("status: {}\n", view.status_text));
    out
}

/// One line per event worth showing live. Content updates of streams are
/// collapsed to the final message.
pub fn describe_event(event: &ChatEvent) -> Option<String> {
    match event {
        ChatEvent::MessageAdded { message } => Some(format!("+ {}", render_message(message))),
        ChatEvent::MessageUpdated { message } if !message.streaming => {
            Some(format!("~ {}", render_message(message)))
        }
        ChatEvent::MessageUpdated { .. } => None,
        ChatEvent::MessageRemoved { id } => Some(format!("- {}", id)),
        ChatEvent::StatusChanged { id, from, to } => Some(format!(
            "  {} {} -> {}",
            id,
            status_label(*from),
            status_label(*to)
        )),
        ChatEvent::HistoryLoaded {
            session_id,
            messages,
            has_more,
        } => Some(format!(
            "history {}: {} older message(s){}",
            session_id,
            messages.len(),
            if *has_more { ", more available" } else { "" }
        )),
        ChatEvent::HistoryFailed { session_id, error } => {
            Some(format!("history {} unavailable: {}", session_id, error))
        }
        ChatEvent::SessionChanged { session_id } => Some(format!(
            "session {}",
            session_id.as_deref().unwrap_or("(new)")
        )),
        ChatEvent::TranscriptReset { session_id } => Some(format!(
            "switched to {}",
            session_id.as_deref().unwrap_or("a new chat")
        )),
        ChatEvent::ConnectionChanged { from, to } => {
            Some(format!("connection {:?} -> {:?}", from, to))
        }
    }
}

fn status_label(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Sending => "sending",
        MessageStatus::Sent => "sent",
        MessageStatus::Delivered => "delivered",
        MessageStatus::Read => "read",
        MessageStatus::Failed => "failed",
    }
}

fn kind_label(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::ToolUse => "tool-use",
        MessageKind::ToolResult => "tool-result",
        MessageKind::Code => "code",
        MessageKind::Error => "error",
        MessageKind::System => "system",
        MessageKind::Thinking => "thinking",
        MessageKind::FileOperation => "file",
        MessageKind::GitOperation => "git",
        MessageKind::TerminalCommand => "terminal",
    }
}
