use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::connection::ConnectionState;
use crate::message::{Message, MessageId, MessageStatus};
use crate::{ChatError, Result};

/// Discriminant of an inbound wire event.
/// The `claude-*` aliases are the backend's native names for the same frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireEventKind {
    SessionCreated,
    #[serde(alias = "claude-response")]
    CompleteResponse,
    #[serde(alias = "claude-output")]
    PartialOutput,
    StreamStart,
    StreamChunk,
    #[serde(alias = "claude-complete")]
    StreamEnd,
    ToolUse,
    ToolResult,
    #[serde(alias = "claude-error")]
    Error,
    SessionAborted,
    #[serde(other)]
    Unknown,
}

/// An event received from the backend socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub kind: WireEventKind,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<Value>,
    /// Fields sent next to `type` instead of inside `payload`
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WireEvent {
    pub fn new(kind: WireEventKind) -> Self {
        Self {
            kind,
            session_id: None,
            payload: None,
            extra: Map::new(),
        }
    }

    /// Decode a raw text frame. Undecodable frames are `MalformedPayload`.
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| ChatError::MalformedPayload(e.to_string()))
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// The content-bearing body: `payload` when present, otherwise the
    /// top-level fields that accompanied `type`.
    pub fn body(&self) -> Value {
        match &self.payload {
            Some(payload) => payload.clone(),
            None => Value::Object(self.extra.clone()),
        }
    }

    /// Look up a string field in the body
    pub fn body_str(&self, key: &str) -> Option<String> {
        self.body()
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Stream correlation id, if the backend supplied one
    pub fn stream_id(&self) -> Option<String> {
        ["streamId", "messageId", "id"]
            .iter()
            .find_map(|key| self.body_str(key))
            .filter(|id| !id.is_empty())
    }
}

/// Commands sent to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum OutboundCommand {
    Command {
        content: String,
        project_path: String,
        session_id: Option<String>,
    },
    AbortSession {
        session_id: String,
    },
    ResumeSession {
        session_id: String,
    },
}

/// Notifications emitted by the engine.
/// UI subscribes to these to refresh its read-only projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChatEvent {
    /// A message was appended to the list
    MessageAdded { message: Message },

    /// Content, kind or streaming flag of an existing message changed
    MessageUpdated { message: Message },

    /// A message was dropped from the list
    MessageRemoved { id: MessageId },

    /// Exactly one per actual status transition
    StatusChanged {
        id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
    },

    /// Older messages were prepended from history
    HistoryLoaded {
        session_id: String,
        messages: Vec<Message>,
        has_more: bool,
    },

    /// History could not be loaded; the caller may retry
    HistoryFailed { session_id: String, error: String },

    /// The backend assigned a session id to the current conversation
    SessionChanged { session_id: Option<String> },

    /// The list was cleared to show another session
    TranscriptReset { session_id: Option<String> },

    ConnectionChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
}
