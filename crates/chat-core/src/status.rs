//! Message status machine.
//!
//! Owns the canonical status of every outbound message and its timer.
//! Timers are deadlines checked by `expire_due`, which the engine calls from
//! its tick on the same serialized context as every other status update.
//!
//! Invariant: a message has exactly one timer while `Sending` or `Sent`, and
//! none once `Delivered`, `Read` or `Failed`.

use std::collections::HashMap;
use std::time::Duration;

use chat_types::{
    config::ChatConfig,
    message::{Message, MessageId, MessageStatus},
    ChatError, Result,
};
use chrono::{DateTime, Utc};

use crate::ports::add_duration;

/// A live timeout for one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    pub deadline: DateTime<Utc>,
    pub duration: Duration,
    /// Distinguishes re-armed timers for the same id
    pub generation: u64,
}

/// One applied status change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub id: MessageId,
    pub from: MessageStatus,
    pub to: MessageStatus,
}

pub struct StatusMachine {
    statuses: HashMap<MessageId, MessageStatus>,
    timers: HashMap<MessageId, TimerHandle>,
    send_timeout: Duration,
    delivery_timeout: Duration,
    generation: u64,
}

impl StatusMachine {
    pub fn new(send_timeout: Duration, delivery_timeout: Duration) -> Self {
        Self {
            statuses: HashMap::new(),
            timers: HashMap::new(),
            send_timeout,
            delivery_timeout,
            generation: 0,
        }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(config.timeouts.send(), config.timeouts.delivery())
    }

    /// Track a new outbound message as `Sending` and arm its send timeout.
    pub fn submit(&mut self, message: &Message, now: DateTime<Utc>) -> MessageId {
        let id = message.id.clone();
        self.statuses.insert(id.clone(), MessageStatus::Sending);
        self.arm(&id, self.send_timeout, now);
        id
    }

    pub fn status(&self, id: &str) -> Option<MessageStatus> {
        self.statuses.get(id).copied()
    }

    /// Apply one transition.
    ///
    /// Same-state and illegal transitions (including any from a terminal
    /// state) are no-ops that return `Ok(None)`. Unknown ids are `NotFound`.
    pub fn mark_status(
        &mut self,
        id: &str,
        next: MessageStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusTransition>> {
        let current = self
            .status(id)
            .ok_or_else(|| ChatError::NotFound(format!("message {}", id)))?;

        if current == next {
            return Ok(None);
        }
        if !current.can_transition_to(next) {
            log::debug!("Rejected transition {:?} -> {:?} for {}", current, next, id);
            return Ok(None);
        }

        self.statuses.insert(id.to_string(), next);
        self.cancel_timeout(id);
        match next {
            MessageStatus::Sending => self.arm(id, self.send_timeout, now),
            MessageStatus::Sent => self.arm(id, self.delivery_timeout, now),
            MessageStatus::Delivered | MessageStatus::Read | MessageStatus::Failed => {}
        }

        Ok(Some(StatusTransition {
            id: id.to_string(),
            from: current,
            to: next,
        }))
    }

    /// Walk the success pipeline toward `target`, one legal step at a time
    /// (`Sending → Sent → Delivered`). Returns every step applied.
    pub fn advance(
        &mut self,
        id: &str,
        target: MessageStatus,
        now: DateTime<Utc>,
    ) -> Result<Vec<StatusTransition>> {
        let mut applied = Vec::new();
        loop {
            let current = self
                .status(id)
                .ok_or_else(|| ChatError::NotFound(format!("message {}", id)))?;
            let Some(next) = current.step_toward(target) else {
                break;
            };
            match self.mark_status(id, next, now)? {
                Some(transition) => applied.push(transition),
                None => break,
            }
        }
        Ok(applied)
    }

    /// Arm a timeout, replacing any prior one for the same id.
    pub fn start_timeout(&mut self, id: &str, duration: Duration, now: DateTime<Utc>) -> Result<()> {
        if !self.statuses.contains_key(id) {
            return Err(ChatError::NotFound(format!("message {}", id)));
        }
        self.arm(id, duration, now);
        Ok(())
    }

    pub fn cancel_timeout(&mut self, id: &str) -> Option<TimerHandle> {
        self.timers.remove(id)
    }

    pub fn timer(&self, id: &str) -> Option<&TimerHandle> {
        self.timers.get(id)
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Fail every message whose timer is due. Each timer fires once and is removed.
    pub fn expire_due(&mut self, now: DateTime<Utc>) -> Vec<StatusTransition> {
        let mut due: Vec<(MessageId, TimerHandle)> = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(id, t)| (id.clone(), *t))
            .collect();
        due.sort_by_key(|(_, t)| (t.deadline, t.generation));

        let mut failed = Vec::new();
        for (id, timer) in due {
            self.timers.remove(&id);
            let Some(current) = self.status(&id) else {
                continue;
            };
            if !current.is_pending() {
                continue;
            }
            let err = ChatError::Timeout {
                id: id.clone(),
                after_ms: timer.duration.as_millis() as u64,
            };
            log::warn!("{}", err);
            self.statuses.insert(id.clone(), MessageStatus::Failed);
            failed.push(StatusTransition {
                id,
                from: current,
                to: MessageStatus::Failed,
            });
        }
        failed
    }

    /// Ids currently awaiting confirmation
    pub fn pending(&self) -> Vec<MessageId> {
        self.statuses
            .iter()
            .filter(|(_, s)| s.is_pending())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Stop tracking a message (removed from the list)
    pub fn forget(&mut self, id: &str) {
        self.statuses.remove(id);
        self.timers.remove(id);
    }

    pub fn clear(&mut self) {
        self.statuses.clear();
        self.timers.clear();
    }

    fn arm(&mut self, id: &str, duration: Duration, now: DateTime<Utc>) {
        self.generation += 1;
        self.timers.insert(
            id.to_string(),
            TimerHandle {
                deadline: add_duration(now, duration),
                duration,
                generation: self.generation,
            },
        );
    }
}
