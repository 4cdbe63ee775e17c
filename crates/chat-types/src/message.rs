use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Globally unique message identifier
pub type MessageId = String;

/// Which side of the conversation produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Content classification, from explicit wire tags or content heuristics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Text,
    ToolUse,
    ToolResult,
    Code,
    Error,
    System,
    Thinking,
    FileOperation,
    GitOperation,
    TerminalCommand,
}

impl MessageKind {
    /// Parse an explicit wire tag. Accepts camelCase, snake_case and kebab-case.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let normalized: String = tag
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "text" | "assistant" => Some(MessageKind::Text),
            "tooluse" => Some(MessageKind::ToolUse),
            "toolresult" => Some(MessageKind::ToolResult),
            "code" => Some(MessageKind::Code),
            "error" => Some(MessageKind::Error),
            "system" => Some(MessageKind::System),
            "thinking" => Some(MessageKind::Thinking),
            "fileoperation" => Some(MessageKind::FileOperation),
            "gitoperation" => Some(MessageKind::GitOperation),
            "terminalcommand" | "terminal" => Some(MessageKind::TerminalCommand),
            _ => None,
        }
    }
}

/// Delivery status of a message.
///
/// Legal edges: `Sending → {Sent, Failed}`, `Sent → {Delivered, Failed}`,
/// `Delivered → {Read}`. `Read` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Read | MessageStatus::Failed)
    }

    /// Awaiting confirmation from the backend
    pub fn is_pending(self) -> bool {
        matches!(self, MessageStatus::Sending | MessageStatus::Sent)
    }

    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Sending, Sent) | (Sending, Failed) | (Sent, Delivered) | (Sent, Failed) | (Delivered, Read)
        )
    }

    /// Next legal step on the success pipeline toward `target`, if any.
    pub fn step_toward(self, target: MessageStatus) -> Option<MessageStatus> {
        use MessageStatus::*;
        if self == target || self.is_terminal() {
            return None;
        }
        if self.can_transition_to(target) {
            return Some(target);
        }
        let next = match self {
            Sending => Sent,
            Sent => Delivered,
            Delivered => Read,
            Read | Failed => return None,
        };
        // Only walk forward if the target lies further down the pipeline
        if target == Failed || next.rank() > target.rank() {
            None
        } else {
            Some(next)
        }
    }

    fn rank(self) -> u8 {
        match self {
            MessageStatus::Sending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 4,
        }
    }
}

/// Kind-specific data attached to a message. Opaque to the status machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StructuredPayload {
    ToolUse {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        id: Option<String>,
        name: String,
        parameters: Value,
    },
    ToolResult {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        tool_use_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        name: Option<String>,
        result: Value,
        #[serde(default)]
        is_error: bool,
    },
    Code {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        language: Option<String>,
    },
    Error {
        detail: String,
    },
}

/// A single chat turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub direction: Direction,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub structured: Option<StructuredPayload>,
    /// True while this message is the placeholder of an open stream
    #[serde(default)]
    pub streaming: bool,
}

impl Message {
    /// A user message about to be sent. Gets a fresh client-side id.
    pub fn outbound(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: text.into(),
            direction: Direction::Outbound,
            kind: MessageKind::Text,
            status: MessageStatus::Sending,
            timestamp: Utc::now(),
            structured: None,
            streaming: false,
        }
    }

    /// A message from the backend. Inbound messages are delivered on creation.
    pub fn inbound(id: impl Into<String>, text: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: id.into(),
            content: text.into(),
            direction: Direction::Inbound,
            kind,
            status: MessageStatus::Delivered,
            timestamp: Utc::now(),
            structured: None,
            streaming: false,
        }
    }

    /// A client-generated notice shown inline (errors, transport problems)
    pub fn system(text: impl Into<String>) -> Self {
        Self::inbound(uuid::Uuid::new_v4().to_string(), text, MessageKind::System)
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_structured(mut self, payload: StructuredPayload) -> Self {
        self.structured = Some(payload);
        self
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::Outbound
    }
}
