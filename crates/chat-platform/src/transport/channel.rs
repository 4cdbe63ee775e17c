//! In-process transport. Outbound commands are serialized to JSON text
//! frames and pushed down a channel to a `RemoteEnd`, which plays the
//! backend: it reads what the client sent and controls reachability.
//!
//! Inbound frames are not carried here; the composition root feeds them
//! into the engine queue directly.

use std::cell::Cell;
use std::rc::Rc;

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;

use chat_core::ports::TransportPort;
use chat_types::{event::OutboundCommand, ChatError, Result};

#[derive(Default)]
struct LinkState {
    open: Cell<bool>,
    unreachable: Cell<bool>,
    connects: Cell<u32>,
}

pub struct ChannelTransport {
    outbound: UnboundedSender<String>,
    link: Rc<LinkState>,
}

/// The backend side of a `ChannelTransport`
pub struct RemoteEnd {
    frames: UnboundedReceiver<String>,
    link: Rc<LinkState>,
}

impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, RemoteEnd) {
        let (tx, rx) = mpsc::unbounded();
        let link = Rc::new(LinkState::default());
        (
            ChannelTransport {
                outbound: tx,
                link: link.clone(),
            },
            RemoteEnd { frames: rx, link },
        )
    }
}

#[async_trait(?Send)]
impl TransportPort for ChannelTransport {
    async fn connect(&self) -> Result<()> {
        if self.link.unreachable.get() || self.outbound.is_closed() {
            return Err(ChatError::Network("remote unreachable".to_string()));
        }
        self.link.open.set(true);
        self.link.connects.set(self.link.connects.get() + 1);
        log::debug!("Channel transport open");
        Ok(())
    }

    async fn send(&self, command: &OutboundCommand) -> Result<()> {
        if !self.link.open.get() {
            return Err(ChatError::Transport("channel not open".to_string()));
        }
        let frame = serde_json::to_string(command)?;
        self.outbound.unbounded_send(frame).map_err(|_| {
            self.link.open.set(false);
            ChatError::Network("remote end dropped".to_string())
        })
    }

    async fn close(&self) -> Result<()> {
        self.link.open.set(false);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.link.open.get()
    }
}

impl RemoteEnd {
    /// Sever the link. Later sends fail until the client reconnects.
    pub fn drop_connection(&self) {
        self.link.open.set(false);
    }

    /// While unreachable, connect attempts fail with a network error
    pub fn set_reachable(&self, reachable: bool) {
        self.link.unreachable.set(!reachable);
    }

    pub fn is_open(&self) -> bool {
        self.link.open.get()
    }

    /// Successful connects so far
    pub fn connects(&self) -> u32 {
        self.link.connects.get()
    }

    /// Next frame already sent by the client, without waiting
    pub fn try_next_frame(&mut self) -> Option<String> {
        self.frames.try_next().ok().flatten()
    }

    /// Wait for the next frame; `None` once the client side is gone
    pub async fn next_frame(&mut self) -> Option<String> {
        self.frames.next().await
    }

    /// Every frame sent so far, decoded. Undecodable frames are skipped.
    pub fn drain_commands(&mut self) -> Vec<OutboundCommand> {
        let mut commands = Vec::new();
        while let Some(frame) = self.try_next_frame() {
            match serde_json::from_str(&frame) {
                Ok(command) => commands.push(command),
                Err(e) => log::debug!("Skipping undecodable frame: {}", e),
            }
        }
        commands
    }
}
