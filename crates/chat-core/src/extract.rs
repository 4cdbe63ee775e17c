//! Payload extraction: normalizes the many shapes the backend uses for the
//! same logical content into `(text, structured data)`.
//!
//! Each shape is a pure strategy tried in priority order; the first one that
//! yields a non-empty string wins. The result is then filtered: blank text and
//! bare session identifiers are bookkeeping frames, not content.

use chat_types::message::{MessageKind, StructuredPayload};
use serde_json::Value;

use crate::classify;

/// Literal prefix of the session identifiers the backend interleaves with content
pub const SESSION_ID_PREFIX: &str = "session_";

/// The payload shapes, in the order they are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// `content`
    Content,
    /// `data.content`
    DataContent,
    /// `data.message` as a string
    DataMessage,
    /// `data.message.content` as typed fragments
    DataMessageFragments,
    /// `message`
    Message,
    /// `text`
    Text,
    /// The whole payload serialized, for otherwise-unparseable responses
    Diagnostic,
}

impl PayloadShape {
    pub const PRIORITY: [PayloadShape; 6] = [
        PayloadShape::Content,
        PayloadShape::DataContent,
        PayloadShape::DataMessage,
        PayloadShape::DataMessageFragments,
        PayloadShape::Message,
        PayloadShape::Text,
    ];

    /// Apply this strategy. `None` unless it yields a non-empty string.
    pub fn extract(self, payload: &Value) -> Option<String> {
        let text = match self {
            PayloadShape::Content => payload.get("content").and_then(text_or_fragments),
            PayloadShape::DataContent => payload
                .get("data")
                .and_then(|d| d.get("content"))
                .and_then(text_or_fragments),
            PayloadShape::DataMessage => payload
                .get("data")
                .and_then(|d| d.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string),
            PayloadShape::DataMessageFragments => payload
                .get("data")
                .and_then(|d| d.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(text_or_fragments),
            PayloadShape::Message => payload
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            PayloadShape::Text => payload
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string),
            PayloadShape::Diagnostic => diagnostic(payload),
        };
        text.filter(|t| !t.is_empty())
    }
}

/// Outcome of a successful extraction
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub text: String,
    pub shape: PayloadShape,
    pub structured: Option<StructuredPayload>,
    /// Explicit kind tag carried by the payload, when recognised
    pub kind_tag: Option<MessageKind>,
}

impl Extraction {
    /// Explicit tag if present, otherwise content heuristics
    pub fn kind(&self) -> MessageKind {
        self.kind_tag
            .unwrap_or_else(|| classify::detect_kind(&self.text))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PayloadExtractor {
    /// Fall back to the serialized payload when no shape matches
    pub diagnostic_fallback: bool,
}

impl PayloadExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_diagnostic_fallback() -> Self {
        Self {
            diagnostic_fallback: true,
        }
    }

    /// Extract usable content. `None` means "no content": callers must not
    /// create a message for it.
    pub fn extract(&self, payload: &Value) -> Option<Extraction> {
        let (text, shape) = self.first_match(payload)?;
        if is_noise(&text) {
            log::debug!("Dropping bookkeeping payload ({:?})", shape);
            return None;
        }
        let kind_tag = kind_tag(payload);
        let kind = kind_tag.unwrap_or_else(|| classify::detect_kind(&text));
        let structured = structured_data(payload, kind, &text);
        Some(Extraction {
            text,
            shape,
            structured,
            kind_tag,
        })
    }

    /// Raw chunk text for streaming: first matching shape, unfiltered, no
    /// diagnostic fallback. Whitespace-only chunks are meaningful here.
    pub fn chunk_text(&self, payload: &Value) -> String {
        if let Some(text) = payload.as_str() {
            return text.to_string();
        }
        PayloadShape::PRIORITY
            .iter()
            .find_map(|shape| shape.extract(payload))
            .unwrap_or_default()
    }

    fn first_match(&self, payload: &Value) -> Option<(String, PayloadShape)> {
        if let Some(text) = payload.as_str() {
            return Some((text.to_string(), PayloadShape::Content)).filter(|(t, _)| !t.is_empty());
        }
        let found = PayloadShape::PRIORITY
            .iter()
            .find_map(|shape| shape.extract(payload).map(|text| (text, *shape)));
        match found {
            Some(hit) => Some(hit),
            None if self.diagnostic_fallback => PayloadShape::Diagnostic
                .extract(payload)
                .map(|text| (text, PayloadShape::Diagnostic)),
            None => None,
        }
    }
}

/// Blank after trimming, or a bare session identifier.
pub fn is_noise(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty() || is_session_identifier(trimmed)
}

/// `session_` followed by a canonical hyphenated UUID and nothing else.
pub fn is_session_identifier(text: &str) -> bool {
    match text.strip_prefix(SESSION_ID_PREFIX) {
        Some(rest) => rest.len() == 36 && uuid::Uuid::try_parse(rest).is_ok(),
        None => false,
    }
}

/// Join the textual parts of typed fragments with newlines, or pass a plain
/// string through.
pub fn text_or_fragments(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        _ => None,
    }
}

fn diagnostic(payload: &Value) -> Option<String> {
    match payload {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        other => serde_json::to_string(other).ok(),
    }
}

fn kind_tag(payload: &Value) -> Option<MessageKind> {
    ["kind", "messageType"]
        .iter()
        .find_map(|key| {
            payload
                .get(key)
                .or_else(|| payload.get("data").and_then(|d| d.get(key)))
                .and_then(Value::as_str)
        })
        .and_then(MessageKind::from_tag)
}

/// First string value among `keys`, looked up on the payload then on `data`
pub fn field_str(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        payload
            .get(key)
            .or_else(|| payload.get("data").and_then(|d| d.get(key)))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// First non-null value among `keys`, looked up on the payload then on `data`
pub fn field_value(payload: &Value, keys: &[&str]) -> Option<Value> {
    keys.iter().find_map(|key| {
        payload
            .get(key)
            .or_else(|| payload.get("data").and_then(|d| d.get(key)))
            .filter(|v| !v.is_null())
            .cloned()
    })
}

/// Kind-specific structured data carried alongside the text
pub fn structured_data(payload: &Value, kind: MessageKind, text: &str) -> Option<StructuredPayload> {
    match kind {
        MessageKind::ToolUse => {
            let name = field_str(payload, &["name", "toolName"])?;
            Some(StructuredPayload::ToolUse {
                id: field_str(payload, &["toolUseId", "tool_use_id", "id"]),
                name,
                parameters: field_value(payload, &["parameters", "input"]).unwrap_or(Value::Null),
            })
        }
        MessageKind::ToolResult => Some(StructuredPayload::ToolResult {
            tool_use_id: field_str(payload, &["toolUseId", "tool_use_id"]),
            name: field_str(payload, &["name", "toolName"]),
            result: field_value(payload, &["result", "output", "content"]).unwrap_or(Value::Null),
            is_error: field_value(payload, &["isError", "is_error"])
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        }),
        MessageKind::Code => Some(StructuredPayload::Code {
            language: field_str(payload, &["language"]).or_else(|| classify::code_language(text)),
        }),
        MessageKind::Error => Some(StructuredPayload::Error {
            detail: error_detail(payload).unwrap_or_else(|| text.to_string()),
        }),
        _ => None,
    }
}

/// Error text from `error` (string or `{message}`), if present
pub fn error_detail(payload: &Value) -> Option<String> {
    let error = payload
        .get("error")
        .or_else(|| payload.get("data").and_then(|d| d.get("error")))?;
    match error {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(_) => error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}
