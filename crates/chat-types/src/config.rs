use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub transport: TransportConfig,
    pub timeouts: TimeoutConfig,
    pub history: HistoryConfig,
    pub storage: StorageConfig,
    pub reconnect: ReconnectConfig,
    /// Substring that marks the end of a stream inside a chunk
    pub stream_end_marker: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            timeouts: TimeoutConfig::default(),
            history: HistoryConfig::default(),
            storage: StorageConfig::default(),
            reconnect: ReconnectConfig::default(),
            stream_end_marker: DEFAULT_STREAM_END_MARKER.to_string(),
        }
    }
}

pub const DEFAULT_STREAM_END_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub url: String,
    pub project_path: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3001/ws".to_string(),
            project_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time a message may stay `sending`
    pub send_ms: u64,
    /// Time a message may stay `sent` without a response
    pub delivery_ms: u64,
    /// Idle window after which an open stream is discarded
    pub stream_stale_ms: u64,
    /// Period of the timer tick driving expiry and stream sweeps
    pub tick_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            send_ms: 30_000,
            delivery_ms: 120_000,
            stream_stale_ms: 300_000,
            tick_ms: 1_000,
        }
    }
}

impl TimeoutConfig {
    pub fn send(&self) -> Duration {
        Duration::from_millis(self.send_ms)
    }

    pub fn delivery(&self) -> Duration {
        Duration::from_millis(self.delivery_ms)
    }

    pub fn stream_stale(&self) -> Duration {
        Duration::from_millis(self.stream_stale_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub page_size: usize,
    pub base_url: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            base_url: "http://localhost:3001".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackendType,
    /// Directory for the file backend
    pub dir: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendType::Auto,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageBackendType {
    /// Auto-detect best available backend
    Auto,
    Memory,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 250,
            max_delay_ms: 8_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Exponential backoff for the given 1-based attempt, capped at `max_delay_ms`
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let exponent = (attempt - 1).min(16);
        self.base_delay_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_delay_ms)
    }
}
