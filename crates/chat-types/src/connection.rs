use serde::{Deserialize, Serialize};

/// Socket connection lifecycle. Mutated only by the connection supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Failed) => self != Failed,
            (Disconnected | Failed, Connecting) => true,
            (Connecting | Reconnecting, Connected) => true,
            (Connected, Reconnecting) => true,
            // a reconnect attempt that fails transiently stays in the retry loop
            (Connecting, Reconnecting) => true,
            (Connecting | Connected | Reconnecting, Disconnected) => true,
            _ => false,
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}
