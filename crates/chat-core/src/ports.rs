//! Port traits: the hexagonal architecture boundary.
//!
//! These traits are defined here in `chat-core` (pure Rust).
//! Implementations live in `chat-platform` (storage, HTTP, channel adapters).
//! The core never imports platform code; it only depends on these traits.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use chat_types::{
    event::OutboundCommand,
    message::Message,
    session::HistoryRecord,
    Result,
};
use chrono::{DateTime, Utc};

// ─── Transport Port ──────────────────────────────────────────

/// Send side of the backend socket. Inbound frames are pumped into the
/// engine queue by the composition root.
#[async_trait(?Send)]
pub trait TransportPort {
    /// Open (or re-open) the connection
    async fn connect(&self) -> Result<()>;

    /// Write one command to the socket
    async fn send(&self, command: &OutboundCommand) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

// ─── History Port ────────────────────────────────────────────

#[async_trait(?Send)]
pub trait HistoryPort {
    /// Paged read of a session's history, oldest first within the page.
    /// `offset` counts back from the newest message.
    async fn fetch(
        &self,
        project: &str,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<HistoryRecord>>;
}

// ─── Message Cache Port ──────────────────────────────────────

/// Local per-session copy of the message list
#[async_trait(?Send)]
pub trait MessageCachePort {
    async fn load(&self, session_id: &str) -> Result<Option<Vec<Message>>>;

    async fn save(&self, messages: &[Message], session_id: &str) -> Result<()>;
}

// ─── Storage Port ────────────────────────────────────────────

#[async_trait(?Send)]
pub trait StoragePort {
    /// Get a value by key
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a value
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete a value
    async fn delete(&self, key: &str) -> Result<()>;

    /// List keys with a given prefix
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Check if a key exists
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Name of this backend (for logging/debug)
    fn backend_name(&self) -> &str;
}

// ─── Clock ───────────────────────────────────────────────────

/// Source of wall-clock time for timers and staleness sweeps
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used for simulated time.
#[derive(Clone)]
pub struct ManualClock {
    now: Rc<Cell<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(add_duration(self.now.get(), by));
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.now.set(to);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

/// `at + by`, saturating at one year for out-of-range durations
pub fn add_duration(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::days(365));
    at.checked_add_signed(delta).unwrap_or(at)
}
