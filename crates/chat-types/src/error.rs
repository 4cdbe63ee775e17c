use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChatError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out waiting for {id} after {after_ms}ms")]
    Timeout { id: String, after_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Network error: {0}")]
    Network(String),

    /// The server answered, but not with a listing
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl ChatError {
    /// Errors the caller can recover from by retrying once connectivity returns
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ChatError::Network(_) | ChatError::Transport(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ChatError::NotFound(_))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Serialization(e.to_string())
    }
}
