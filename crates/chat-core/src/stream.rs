//! Stream reconstruction: accumulates chunks under a stream id until the
//! stream is completed, then hands back the finished body.
//!
//! Tolerates chunk-before-start ordering: appending to an unknown id opens
//! the stream implicitly.

use std::collections::HashMap;
use std::time::Duration;

use chat_types::{config::ChatConfig, message::MessageKind, ChatError, Result};
use chrono::{DateTime, Utc};

use crate::classify;
use crate::ports::add_duration;

/// An in-progress inbound stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSession {
    pub stream_id: String,
    pub accumulated: String,
    pub is_complete: bool,
    /// Kind re-evaluated after every append; may change mid-stream
    pub kind: MessageKind,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl StreamSession {
    fn new(stream_id: String, now: DateTime<Utc>) -> Self {
        Self {
            stream_id,
            accumulated: String::new(),
            is_complete: false,
            kind: MessageKind::Text,
            started_at: now,
            last_updated_at: now,
        }
    }
}

pub struct StreamReconstructor {
    sessions: HashMap<String, StreamSession>,
    end_marker: String,
    stale_after: Duration,
}

impl StreamReconstructor {
    pub fn new(end_marker: impl Into<String>, stale_after: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            end_marker: end_marker.into(),
            stale_after,
        }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(config.stream_end_marker.clone(), config.timeouts.stream_stale())
    }

    /// Open a stream. Returns false if it was already open (duplicate start).
    pub fn begin_stream(&mut self, stream_id: &str, now: DateTime<Utc>) -> bool {
        if self.sessions.contains_key(stream_id) {
            log::debug!("Stream {} already open", stream_id);
            return false;
        }
        self.sessions
            .insert(stream_id.to_string(), StreamSession::new(stream_id.to_string(), now));
        true
    }

    /// Append a chunk and return the content accumulated so far.
    ///
    /// A chunk containing the end marker completes the stream; text before the
    /// marker is kept, the marker and anything after it are dropped. Chunks for
    /// an already-complete stream are ignored.
    pub fn append_chunk(&mut self, stream_id: &str, text: &str, now: DateTime<Utc>) -> &str {
        let end_marker = self.end_marker.as_str();
        let session = self
            .sessions
            .entry(stream_id.to_string())
            .or_insert_with(|| StreamSession::new(stream_id.to_string(), now));
        session.last_updated_at = now;

        if session.is_complete {
            log::debug!("Ignoring chunk for completed stream {}", stream_id);
            return &session.accumulated;
        }
        if text.is_empty() {
            return &session.accumulated;
        }

        let previous_len = session.accumulated.len();
        session.accumulated.push_str(text);

        if !end_marker.is_empty() {
            // The marker may straddle two chunks, so search a little before the new text
            let mut from = previous_len.saturating_sub(end_marker.len());
            while !session.accumulated.is_char_boundary(from) {
                from -= 1;
            }
            if let Some(pos) = session.accumulated[from..].find(end_marker) {
                session.accumulated.truncate(from + pos);
                session.is_complete = true;
            }
        }

        session.kind = classify::detect_kind(&session.accumulated);
        &session.accumulated
    }

    pub fn is_complete(&self, stream_id: &str) -> bool {
        self.sessions
            .get(stream_id)
            .map(|s| s.is_complete)
            .unwrap_or(false)
    }

    /// Record an out-of-band end signal
    pub fn mark_complete(&mut self, stream_id: &str) -> Result<()> {
        let session = self
            .sessions
            .get_mut(stream_id)
            .ok_or_else(|| ChatError::NotFound(format!("stream {}", stream_id)))?;
        session.is_complete = true;
        Ok(())
    }

    /// Remove the stream and return its content
    pub fn finalize(&mut self, stream_id: &str) -> Result<String> {
        self.sessions
            .remove(stream_id)
            .map(|s| s.accumulated)
            .ok_or_else(|| ChatError::NotFound(format!("stream {}", stream_id)))
    }

    pub fn get(&self, stream_id: &str) -> Option<&StreamSession> {
        self.sessions.get(stream_id)
    }

    pub fn kind(&self, stream_id: &str) -> Option<MessageKind> {
        self.sessions.get(stream_id).map(|s| s.kind)
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.sessions.contains_key(stream_id)
    }

    pub fn open_count(&self) -> usize {
        self.sessions.len()
    }

    /// Remove streams idle for longer than the staleness window
    pub fn sweep_stale(&mut self, now: DateTime<Utc>) -> Vec<StreamSession> {
        let stale_after = self.stale_after;
        let stale_ids: Vec<String> = self
            .sessions
            .values()
            .filter(|s| add_duration(s.last_updated_at, stale_after) <= now)
            .map(|s| s.stream_id.clone())
            .collect();

        let mut removed: Vec<StreamSession> = stale_ids
            .iter()
            .filter_map(|id| self.sessions.remove(id))
            .collect();
        removed.sort_by_key(|s| s.started_at);
        for session in &removed {
            log::warn!(
                "Discarding stale stream {} ({} bytes)",
                session.stream_id,
                session.accumulated.len()
            );
        }
        removed
    }

    /// Drop every open stream, e.g. when the session is aborted
    pub fn discard_all(&mut self) -> Vec<StreamSession> {
        let mut removed: Vec<StreamSession> = self.sessions.drain().map(|(_, s)| s).collect();
        removed.sort_by_key(|s| s.started_at);
        removed
    }
}
