//! Read-only projection of the chat state for rendering.
//! Rebuilt from drained `ChatEvent`s; never writes back to the core.

use chat_types::{
    connection::ConnectionState,
    event::ChatEvent,
    message::{Message, MessageStatus},
};

/// State visible to a renderer
pub struct TranscriptProjection {
    /// Messages in display order
    pub messages: Vec<Message>,
    pub session_id: Option<String>,
    pub connection: ConnectionState,
    /// More history can be loaded above the first message
    pub has_more_history: bool,
    /// Status line text
    pub status_text: String,
}

impl TranscriptProjection {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            session_id: None,
            connection: ConnectionState::Disconnected,
            has_more_history: false,
            status_text: "Disconnected".to_string(),
        }
    }

    /// Apply events in the order they were emitted
    pub fn process_events(&mut self, events: Vec<ChatEvent>) {
        for event in events {
            self.apply(event);
        }
    }

    pub fn apply(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::MessageAdded { message } => {
                if self.find(&message.id).is_none() {
                    self.messages.push(message);
                }
            }
            ChatEvent::MessageUpdated { message } => match self.find(&message.id) {
                Some(idx) => self.messages[idx] = message,
                None => self.messages.push(message),
            },
            ChatEvent::MessageRemoved { id } => {
                self.messages.retain(|m| m.id != id);
            }
            ChatEvent::StatusChanged { id, to, .. } => {
                if let Some(idx) = self.find(&id) {
                    self.messages[idx].status = to;
                }
            }
            ChatEvent::HistoryLoaded {
                session_id,
                messages,
                has_more,
            } => {
                if self.session_id.as_deref() == Some(session_id.as_str()) {
                    let mut merged = messages;
                    merged.append(&mut self.messages);
                    self.messages = merged;
                    self.has_more_history = has_more;
                }
            }
            ChatEvent::HistoryFailed { error, .. } => {
                self.status_text = format!("History unavailable: {}", error);
            }
            ChatEvent::SessionChanged { session_id } => {
                self.session_id = session_id;
            }
            ChatEvent::TranscriptReset { session_id } => {
                self.messages.clear();
                self.session_id = session_id;
                self.has_more_history = false;
            }
            ChatEvent::ConnectionChanged { to, .. } => {
                self.connection = to;
                self.status_text = match to {
                    ConnectionState::Disconnected => "Disconnected".to_string(),
                    ConnectionState::Connecting => "Connecting...".to_string(),
                    ConnectionState::Connected => "Connected".to_string(),
                    ConnectionState::Reconnecting => "Reconnecting...".to_string(),
                    ConnectionState::Failed => "Connection failed".to_string(),
                };
            }
        }
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.find(id).map(|idx| &self.messages[idx])
    }

    /// An inbound stream is still being written
    pub fn is_streaming(&self) -> bool {
        self.messages.iter().any(|m| m.streaming)
    }

    /// Outbound messages the user can retry
    pub fn failed(&self) -> Vec<&Message> {
        self.messages
            .iter()
            .filter(|m| m.is_outbound() && m.status == MessageStatus::Failed)
            .collect()
    }

    fn find(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }
}

impl Default for TranscriptProjection {
    fn default() -> Self {
        Self::new()
    }
}
