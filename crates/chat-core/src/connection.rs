//! Connection supervisor: owns the connection state machine and the
//! reconnect backoff. It never touches the socket itself: it tells the
//! engine what to do next through `SupervisorSignal`.

use chat_types::{
    config::ReconnectConfig,
    connection::ConnectionState,
    event::ChatEvent,
    ChatError,
};

use crate::event_bus::EventBus;

/// What the caller should do after a lifecycle change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorSignal {
    /// Nothing to do
    Idle,
    /// Open the transport now
    Connect,
    /// Connection is up; `resume` is set after a reconnect
    Connected { resume: bool },
    /// Try again after `delay_ms`
    ScheduleReconnect { attempt: u32, delay_ms: u64 },
    /// Retries exhausted or the error was not recoverable
    GaveUp,
}

/// Counters kept across the supervisor's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleSnapshot {
    pub connect_attempts: u32,
    pub reconnect_attempts: u32,
    pub recovered_sessions: u32,
    pub last_backoff_ms: u64,
}

pub struct ConnectionSupervisor {
    state: ConnectionState,
    policy: ReconnectConfig,
    /// Consecutive failed attempts in the current retry loop
    attempts: u32,
    snapshot: LifecycleSnapshot,
    event_bus: EventBus,
}

impl ConnectionSupervisor {
    pub fn new(policy: ReconnectConfig, event_bus: EventBus) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            attempts: 0,
            snapshot: LifecycleSnapshot::default(),
            event_bus,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        self.snapshot
    }

    /// User- or startup-initiated connect. Only valid from `Disconnected`/`Failed`.
    pub fn connect(&mut self) -> SupervisorSignal {
        if !self.transition(ConnectionState::Connecting) {
            return SupervisorSignal::Idle;
        }
        self.attempts = 0;
        self.snapshot.connect_attempts += 1;
        SupervisorSignal::Connect
    }

    /// The transport reports it is open
    pub fn on_connected(&mut self) -> SupervisorSignal {
        let resume = self.state == ConnectionState::Reconnecting;
        if !self.transition(ConnectionState::Connected) {
            return SupervisorSignal::Idle;
        }
        if resume {
            self.snapshot.recovered_sessions += 1;
        }
        self.attempts = 0;
        SupervisorSignal::Connected { resume }
    }

    /// The connection dropped or an attempt failed with a recoverable error
    pub fn on_transient_loss(&mut self) -> SupervisorSignal {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                if !self.transition(ConnectionState::Reconnecting) {
                    return SupervisorSignal::Idle;
                }
                self.attempts = 0;
            }
            ConnectionState::Reconnecting => {}
            ConnectionState::Disconnected | ConnectionState::Failed => {
                log::debug!("Ignoring connection loss while {:?}", self.state);
                return SupervisorSignal::Idle;
            }
        }

        self.attempts += 1;
        if self.attempts > self.policy.max_attempts {
            log::warn!("Giving up after {} reconnect attempts", self.policy.max_attempts);
            self.transition(ConnectionState::Failed);
            return SupervisorSignal::GaveUp;
        }

        let delay_ms = self.policy.delay_ms(self.attempts);
        self.snapshot.reconnect_attempts += 1;
        self.snapshot.last_backoff_ms = delay_ms;
        log::info!("Reconnect attempt {} in {}ms", self.attempts, delay_ms);
        SupervisorSignal::ScheduleReconnect {
            attempt: self.attempts,
            delay_ms,
        }
    }

    /// Route a transport error: connectivity problems retry, the rest fail
    pub fn on_error(&mut self, error: &ChatError) -> SupervisorSignal {
        if error.is_connectivity() {
            self.on_transient_loss()
        } else {
            self.on_fatal(error)
        }
    }

    pub fn on_fatal(&mut self, error: &ChatError) -> SupervisorSignal {
        log::warn!("Connection failed: {}", error);
        if self.transition(ConnectionState::Failed) {
            SupervisorSignal::GaveUp
        } else {
            SupervisorSignal::Idle
        }
    }

    /// Deliberate close
    pub fn disconnect(&mut self) -> bool {
        self.attempts = 0;
        self.transition(ConnectionState::Disconnected)
    }

    fn transition(&mut self, next: ConnectionState) -> bool {
        let from = self.state;
        if !from.can_transition_to(next) {
            log::debug!("Rejected connection transition {:?} -> {:?}", from, next);
            return false;
        }
        self.state = next;
        log::info!("Connection {:?} -> {:?}", from, next);
        self.event_bus
            .emit(ChatEvent::ConnectionChanged { from, to: next });
        true
    }
}
