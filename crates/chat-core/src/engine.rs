//! Engine actor: the single serialized context the core runs on.
//!
//! Everything that mutates chat state arrives as an `EngineInput` on one
//! unbounded queue and is handled in order. Port I/O (transmitting,
//! connecting, loading history, persisting) runs as local futures whose
//! results come back as further inputs, so state is never touched from two
//! places at once.

use std::rc::Rc;

use chat_types::{
    config::ChatConfig,
    connection::ConnectionState,
    event::{ChatEvent, OutboundCommand, WireEvent},
    message::MessageId,
    session::Page,
    ChatError, Result,
};
use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};

use crate::connection::{ConnectionSupervisor, SupervisorSignal};
use crate::event_bus::EventBus;
use crate::history::HistoryPaginator;
use crate::ports::{add_duration, Clock, HistoryPort, MessageCachePort, TransportPort};
use crate::router::MessageRouter;

/// Inputs processed by the engine, in arrival order
#[derive(Debug)]
pub enum EngineInput {
    /// Raw text frame from the socket
    Frame(String),
    /// Already-decoded wire event
    Event(WireEvent),
    Send(String),
    Abort,
    Retry(MessageId),
    Remove(MessageId),
    MarkRead(MessageId),
    /// Drives timeouts, stream sweeps, scheduled reconnects and persistence
    Tick,
    LoadOlder,
    RefreshHistory,
    SwitchSession(Option<String>),
    Connect,
    Disconnect,
    TransportOpened,
    TransportLost,
    TransportFailed(ChatError),
    Shutdown,

    // Completions of port I/O started by the engine
    Transmitted {
        id: Option<MessageId>,
        result: Result<()>,
    },
    PageLoaded {
        session_id: String,
        result: Result<Page>,
    },
}

/// The ports the engine drives
#[derive(Clone)]
pub struct EnginePorts {
    pub transport: Rc<dyn TransportPort>,
    pub history: Rc<dyn HistoryPort>,
    pub cache: Rc<dyn MessageCachePort>,
}

/// Producer side of the engine queue. Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineInput>,
}

impl EngineHandle {
    pub fn submit(&self, input: EngineInput) -> Result<()> {
        self.tx
            .unbounded_send(input)
            .map_err(|_| ChatError::Other("engine stopped".to_string()))
    }

    pub fn frame(&self, raw: impl Into<String>) -> Result<()> {
        self.submit(EngineInput::Frame(raw.into()))
    }

    pub fn send_message(&self, text: impl Into<String>) -> Result<()> {
        self.submit(EngineInput::Send(text.into()))
    }

    pub fn tick(&self) -> Result<()> {
        self.submit(EngineInput::Tick)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.submit(EngineInput::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

type Completion = LocalBoxFuture<'static, Option<EngineInput>>;

enum Next {
    Input(Option<EngineInput>),
    Completed(Option<EngineInput>),
    Closed,
}

pub struct ChatEngine {
    router: MessageRouter,
    paginator: HistoryPaginator,
    supervisor: ConnectionSupervisor,
    transport: Rc<dyn TransportPort>,
    event_bus: EventBus,
    clock: Rc<dyn Clock>,
    inbox: mpsc::UnboundedReceiver<EngineInput>,
    in_flight: FuturesUnordered<Completion>,
    reconnect_at: Option<DateTime<Utc>>,
    persisted_revision: u64,
    loading_history: bool,
}

impl ChatEngine {
    pub fn new(
        config: &ChatConfig,
        ports: EnginePorts,
        event_bus: EventBus,
        clock: Rc<dyn Clock>,
    ) -> (Self, EngineHandle) {
        let (tx, inbox) = mpsc::unbounded();
        let engine = Self {
            router: MessageRouter::new(config, event_bus.clone(), clock.clone()),
            paginator: HistoryPaginator::new(
                ports.history,
                ports.cache,
                config.transport.project_path.clone(),
                config.history.page_size,
            ),
            supervisor: ConnectionSupervisor::new(config.reconnect.clone(), event_bus.clone()),
            transport: ports.transport,
            event_bus,
            clock,
            inbox,
            in_flight: FuturesUnordered::new(),
            reconnect_at: None,
            persisted_revision: 0,
            loading_history: false,
        };
        (engine, EngineHandle { tx })
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn paginator(&self) -> &HistoryPaginator {
        &self.paginator
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn reconnect_at(&self) -> Option<DateTime<Utc>> {
        self.reconnect_at
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Process inputs until `Shutdown` or until every handle is dropped
    pub async fn run(mut self) {
        log::info!("Chat engine started");
        loop {
            let next = {
                // finished I/O is applied before newer inputs
                futures::select_biased! {
                    done = self.in_flight.select_next_some() => Next::Completed(done),
                    input = self.inbox.next() => Next::Input(input),
                    complete => Next::Closed,
                }
            };
            match next {
                Next::Input(Some(input)) => {
                    if !self.handle(input) {
                        break;
                    }
                }
                Next::Completed(Some(input)) => {
                    self.handle(input);
                }
                Next::Completed(None) => {}
                Next::Input(None) | Next::Closed => break,
            }
        }
        self.finish().await;
        log::info!("Chat engine stopped");
    }

    /// Handle queued inputs one at a time, settling the I/O each one starts
    /// before taking the next. Returns false if a `Shutdown` was processed.
    pub async fn run_until_idle(&mut self) -> bool {
        loop {
            while let Some(done) = self.in_flight.next().await {
                if let Some(input) = done {
                    self.handle(input);
                }
            }
            match self.inbox.try_next() {
                Ok(Some(input)) => {
                    if !self.handle(input) {
                        self.finish().await;
                        return false;
                    }
                }
                _ => return true,
            }
        }
    }

    /// Handle one input. Returns false on `Shutdown`.
    pub fn handle(&mut self, input: EngineInput) -> bool {
        match input {
            EngineInput::Frame(raw) => self.router.handle_raw(&raw),
            EngineInput::Event(event) => self.router.handle(event),
            EngineInput::Send(text) => {
                if let Some((id, command)) = self.router.send_message(&text) {
                    self.dispatch(id, command);
                }
            }
            EngineInput::Abort => match self.router.abort_session() {
                Some(command) if self.supervisor.state().is_connected() => {
                    self.transmit(None, command)
                }
                Some(_) => log::warn!("Cannot abort while {:?}", self.supervisor.state()),
                None => log::debug!("No session to abort"),
            },
            EngineInput::Retry(id) => match self.router.retry(&id) {
                Ok((new_id, command)) => self.dispatch(new_id, command),
                Err(e) => log::warn!("Retry of {} refused: {}", id, e),
            },
            EngineInput::Remove(id) => {
                if let Err(e) = self.router.remove_message(&id) {
                    log::debug!("{}", e);
                }
            }
            EngineInput::MarkRead(id) => {
                if let Err(e) = self.router.mark_read(&id) {
                    log::debug!("{}", e);
                }
            }
            EngineInput::Tick => self.tick(),
            EngineInput::LoadOlder => self.load_history(false),
            EngineInput::RefreshHistory => self.load_history(true),
            EngineInput::SwitchSession(session_id) => self.switch_session(session_id),
            EngineInput::Connect => {
                let signal = self.supervisor.connect();
                self.apply_signal(signal);
            }
            EngineInput::Disconnect => {
                self.reconnect_at = None;
                if self.supervisor.disconnect() {
                    let transport = self.transport.clone();
                    self.spawn(async move {
                        if let Err(e) = transport.close().await {
                            log::debug!("Close failed: {}", e);
                        }
                        None
                    });
                }
                self.sync_connection();
            }
            EngineInput::TransportOpened => {
                let signal = self.supervisor.on_connected();
                self.apply_signal(signal);
            }
            EngineInput::TransportLost => {
                let signal = self.supervisor.on_transient_loss();
                self.apply_signal(signal);
            }
            EngineInput::TransportFailed(error) => {
                let signal = self.supervisor.on_error(&error);
                self.apply_signal(signal);
            }
            EngineInput::Transmitted { id, result } => self.on_transmitted(id, result),
            EngineInput::PageLoaded { session_id, result } => {
                self.loading_history = false;
                match result {
                    Ok(page) => self.router.merge_history(&session_id, page),
                    Err(e) => {
                        log::warn!("History for {} failed: {}", session_id, e);
                        self.event_bus.emit(ChatEvent::HistoryFailed {
                            session_id,
                            error: e.to_string(),
                        });
                    }
                }
            }
            EngineInput::Shutdown => return false,
        }
        true
    }

    // ─── Outbound ────────────────────────────────────────────

    fn dispatch(&mut self, id: MessageId, command: OutboundCommand) {
        if self.supervisor.state().is_connected() {
            self.transmit(Some(id), command);
        } else {
            let error = ChatError::Transport(format!("not connected ({:?})", self.supervisor.state()));
            self.router.mark_transmit_failed(&id, &error);
        }
    }

    fn transmit(&mut self, id: Option<MessageId>, command: OutboundCommand) {
        let transport = self.transport.clone();
        self.spawn(async move {
            let result = transport.send(&command).await;
            Some(EngineInput::Transmitted { id, result })
        });
    }

    fn on_transmitted(&mut self, id: Option<MessageId>, result: Result<()>) {
        match (id, result) {
            (Some(id), Ok(())) => self.router.mark_transmitted(&id),
            (None, Ok(())) => {}
            (id, Err(e)) => {
                log::warn!("Transmit failed: {}", e);
                if let Some(id) = id {
                    self.router.mark_transmit_failed(&id, &e);
                }
                if e.is_connectivity() {
                    let signal = self.supervisor.on_transient_loss();
                    self.apply_signal(signal);
                }
            }
        }
    }

    // ─── Connection ──────────────────────────────────────────

    fn apply_signal(&mut self, signal: SupervisorSignal) {
        match signal {
            SupervisorSignal::Idle => {}
            SupervisorSignal::Connect => self.open_transport(),
            SupervisorSignal::Connected { resume } => {
                self.reconnect_at = None;
                if resume {
                    match self.router.resume_command() {
                        Some(command) => {
                            log::info!("Resuming session after reconnect");
                            self.transmit(None, command);
                        }
                        None => log::debug!("Reconnected without a session to resume"),
                    }
                }
            }
            SupervisorSignal::ScheduleReconnect { delay_ms, .. } => {
                let delay = std::time::Duration::from_millis(delay_ms);
                self.reconnect_at = Some(add_duration(self.clock.now(), delay));
            }
            SupervisorSignal::GaveUp => {
                self.reconnect_at = None;
            }
        }
        self.sync_connection();
    }

    fn sync_connection(&mut self) {
        let state = self.supervisor.state();
        if self.router.connection() != state {
            self.router.set_connection(state);
        }
    }

    fn open_transport(&mut self) {
        let transport = self.transport.clone();
        self.spawn(async move {
            match transport.connect().await {
                Ok(()) => Some(EngineInput::TransportOpened),
                Err(e) => Some(EngineInput::TransportFailed(e)),
            }
        });
    }

    // ─── Timers ──────────────────────────────────────────────

    fn tick(&mut self) {
        let now = self.clock.now();
        if let Some(at) = self.reconnect_at {
            if at <= now && self.supervisor.state() == ConnectionState::Reconnecting {
                self.reconnect_at = None;
                self.open_transport();
            }
        }
        self.router.expire_timers();
        self.router.sweep_streams();
        self.persist_if_dirty();
    }

    // ─── History ─────────────────────────────────────────────

    fn load_history(&mut self, refresh: bool) {
        let Some(session_id) = self.router.session().session_id.clone() else {
            log::debug!("No session to load history for");
            return;
        };
        if self.loading_history {
            log::debug!("History load already in flight");
            return;
        }
        self.loading_history = true;
        let paginator = self.paginator.clone();
        self.spawn(async move {
            let result = if refresh {
                paginator.refresh(&session_id).await
            } else {
                paginator.load_next(&session_id).await
            };
            Some(EngineInput::PageLoaded { session_id, result })
        });
    }

    fn switch_session(&mut self, session_id: Option<String>) {
        if self.router.session().session_id == session_id {
            return;
        }
        self.persist_if_dirty();
        if let Some(id) = &session_id {
            self.paginator.reset(id);
        }
        self.router.switch_session(session_id);
        self.persisted_revision = self.router.revision();
        self.loading_history = false;
        self.load_history(false);
    }

    fn persist_if_dirty(&mut self) {
        let revision = self.router.revision();
        if revision == self.persisted_revision {
            return;
        }
        let Some(session_id) = self.router.session().session_id.clone() else {
            return;
        };
        self.persisted_revision = revision;
        let paginator = self.paginator.clone();
        let messages = self.router.messages().to_vec();
        self.spawn(async move {
            paginator.persist(&session_id, &messages).await;
            None
        });
    }

    async fn finish(&mut self) {
        while let Some(done) = self.in_flight.next().await {
            // only transmit results are applied once stopping
            if let Some(EngineInput::Transmitted { id, result }) = done {
                self.on_transmitted(id, result);
            }
        }
        if self.router.revision() != self.persisted_revision {
            if let Some(session_id) = self.router.session().session_id.clone() {
                self.paginator.persist(&session_id, self.router.messages()).await;
                self.persisted_revision = self.router.revision();
            }
        }
        if self.transport.is_open() {
            if let Err(e) = self.transport.close().await {
                log::debug!("Close failed: {}", e);
            }
        }
    }

    fn spawn(&mut self, future: impl std::future::Future<Output = Option<EngineInput>> + 'static) {
        self.in_flight.push(future.boxed_local());
    }
}
