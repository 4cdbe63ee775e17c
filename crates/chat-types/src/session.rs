use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Message;

/// State of the conversation the client is attached to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Assigned by the backend via `session-created`; `None` for a fresh chat
    pub session_id: Option<String>,
    pub project_path: String,
    /// Set by `session-aborted`, cleared by the next send
    pub aborted: bool,
}

impl SessionContext {
    pub fn new(project_path: impl Into<String>) -> Self {
        Self {
            session_id: None,
            project_path: project_path.into(),
            aborted: false,
        }
    }
}

/// Per-session paging position into history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationCursor {
    pub offset: usize,
    pub page_size: usize,
    pub has_more: bool,
}

impl PaginationCursor {
    pub fn new(page_size: usize) -> Self {
        Self {
            offset: 0,
            page_size,
            has_more: true,
        }
    }

    /// Move past a page of `returned` items. Never moves backwards.
    pub fn advance(&mut self, returned: usize) {
        self.offset += returned;
        self.has_more = returned == self.page_size;
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.page_size);
    }
}

/// One entry of the remote history listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub role: String,
    /// Usually a string; some backends send typed fragments
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Where a history page was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSource {
    Cache,
    Remote,
    /// Nothing available (not found, or a degraded failure)
    Empty,
}

/// One page of history, oldest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub source: PageSource,
}

impl Page {
    pub fn empty() -> Self {
        Self {
            messages: Vec::new(),
            has_more: false,
            source: PageSource::Empty,
        }
    }
}
