//! Message router: the single owner of the message list.
//!
//! Every inbound wire event and every outbound user action goes through here.
//! Inbound content is normalized by the payload extractor and the stream
//! reconstructor; outbound delivery state lives in the status machine and is
//! mirrored onto the listed messages. Every mutation emits a `ChatEvent`.
//!
//! The router is not thread-safe and does not need to be: the engine calls it
//! from one serialized context, in arrival order.

use std::collections::HashSet;
use std::rc::Rc;

use chat_types::{
    config::ChatConfig,
    connection::ConnectionState,
    event::{ChatEvent, OutboundCommand, WireEvent, WireEventKind},
    message::{Message, MessageId, MessageKind, MessageStatus, StructuredPayload},
    session::{Page, SessionContext},
    ChatError, Result,
};
use serde_json::Value;

use crate::classify;
use crate::event_bus::EventBus;
use crate::extract::{self, PayloadExtractor};
use crate::ports::Clock;
use crate::status::{StatusMachine, StatusTransition};
use crate::stream::StreamReconstructor;

pub struct MessageRouter {
    messages: Vec<Message>,
    status: StatusMachine,
    streams: StreamReconstructor,
    /// For complete responses: falls back to a diagnostic dump
    responses: PayloadExtractor,
    /// For chunks, tool frames and errors: no fallback
    fragments: PayloadExtractor,
    session: SessionContext,
    connection: ConnectionState,
    active_stream: Option<String>,
    revision: u64,
    event_bus: EventBus,
    clock: Rc<dyn Clock>,
}

impl MessageRouter {
    pub fn new(config: &ChatConfig, event_bus: EventBus, clock: Rc<dyn Clock>) -> Self {
        Self {
            messages: Vec::new(),
            status: StatusMachine::from_config(config),
            streams: StreamReconstructor::from_config(config),
            responses: PayloadExtractor::with_diagnostic_fallback(),
            fragments: PayloadExtractor::new(),
            session: SessionContext::new(config.transport.project_path.clone()),
            connection: ConnectionState::Disconnected,
            active_stream: None,
            revision: 0,
            event_bus,
            clock,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn status_machine(&self) -> &StatusMachine {
        &self.status
    }

    pub fn streams(&self) -> &StreamReconstructor {
        &self.streams
    }

    pub fn active_stream(&self) -> Option<&str> {
        self.active_stream.as_deref()
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    /// Bumped on every mutation of the list; used to decide when to persist
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Mirror of the supervisor's state. While reconnecting, timeouts are
    /// held so in-flight messages can reconcile after resume.
    pub fn set_connection(&mut self, state: ConnectionState) {
        self.connection = state;
    }

    // ─── Inbound ─────────────────────────────────────────────

    /// Decode and handle a raw text frame. Undecodable frames are dropped.
    pub fn handle_raw(&mut self, raw: &str) {
        match WireEvent::parse(raw) {
            Ok(event) => self.handle(event),
            Err(e) => log::debug!("Dropping frame: {}", e),
        }
    }

    pub fn handle(&mut self, event: WireEvent) {
        if !self.accepts_session(&event) {
            log::debug!(
                "Ignoring {:?} for session {:?}",
                event.kind,
                event.session_id
            );
            return;
        }

        match event.kind {
            WireEventKind::SessionCreated => self.on_session_created(&event),
            WireEventKind::CompleteResponse => self.on_complete_response(&event),
            WireEventKind::PartialOutput | WireEventKind::StreamChunk => self.on_chunk(&event),
            WireEventKind::StreamStart => self.on_stream_start(&event),
            WireEventKind::StreamEnd => self.on_stream_end(&event),
            WireEventKind::ToolUse => self.on_tool_use(&event),
            WireEventKind::ToolResult => self.on_tool_result(&event),
            WireEventKind::Error => self.on_error(&event),
            WireEventKind::SessionAborted => self.on_session_aborted(&event),
            WireEventKind::Unknown => log::debug!("Ignoring unknown event type"),
        }
    }

    /// Frames tagged with another session belong to a different conversation
    fn accepts_session(&self, event: &WireEvent) -> bool {
        if event.kind == WireEventKind::SessionCreated {
            return true;
        }
        match (&self.session.session_id, &event.session_id) {
            (Some(current), Some(incoming)) => current == incoming,
            _ => true,
        }
    }

    fn on_session_created(&mut self, event: &WireEvent) {
        let Some(session_id) = event
            .session_id
            .clone()
            .or_else(|| event.body_str("sessionId"))
        else {
            log::debug!("session-created without an id");
            return;
        };
        if self.session.session_id.as_deref() == Some(session_id.as_str()) {
            return;
        }
        log::info!("Session created: {}", session_id);
        self.session.session_id = Some(session_id.clone());
        self.session.aborted = false;
        self.revision += 1;
        self.event_bus.emit(ChatEvent::SessionChanged {
            session_id: Some(session_id),
        });
    }

    fn on_complete_response(&mut self, event: &WireEvent) {
        let body = event.body();
        let Some(extraction) = self.responses.extract(&body) else {
            log::debug!("Complete response carried no content");
            return;
        };
        let kind = extraction.kind();
        let stream_id = event.stream_id();
        // without an id the response completes whatever stream is open
        let target = stream_id.clone().or_else(|| self.active_stream.clone());

        if let Some(idx) = target.as_deref().and_then(|id| self.position(id)) {
            let id = self.messages[idx].id.clone();
            if self.messages[idx].streaming {
                // the complete body supersedes whatever partial content arrived
                let _ = self.streams.finalize(&id);
                if self.active_stream.as_deref() == Some(id.as_str()) {
                    self.active_stream = None;
                }
            } else if self.messages[idx].content == extraction.text {
                log::debug!("Duplicate response {}", id);
                return;
            }
            let message = &mut self.messages[idx];
            message.content = extraction.text;
            message.kind = kind;
            message.structured = extraction.structured;
            message.streaming = false;
            let snapshot = message.clone();
            self.updated(snapshot);
        } else {
            let id = stream_id.unwrap_or_else(new_id);
            let mut message = Message::inbound(id, extraction.text, kind).at(self.clock.now());
            message.structured = extraction.structured;
            self.push(message);
        }
        self.deliver_latest_pending();
    }

    fn on_stream_start(&mut self, event: &WireEvent) {
        let id = event.stream_id().unwrap_or_else(new_id);
        let now = self.clock.now();
        match self.position(&id) {
            Some(idx) if !self.messages[idx].streaming => {
                log::debug!("Ignoring stream-start for finalized message {}", id);
                return;
            }
            Some(_) => {
                self.streams.begin_stream(&id, now);
            }
            None => {
                self.streams.begin_stream(&id, now);
                self.push(placeholder(&id, now));
            }
        }
        self.active_stream = Some(id);
        // the backend only starts producing output once it has the request
        self.deliver_latest_pending();
    }

    fn on_chunk(&mut self, event: &WireEvent) {
        let id = event
            .stream_id()
            .or_else(|| self.active_stream.clone())
            .unwrap_or_else(new_id);
        let text = self.fragments.chunk_text(&event.body());
        self.append(&id, &text);
    }

    fn append(&mut self, id: &str, text: &str) {
        let now = self.clock.now();
        match self.position(id) {
            Some(idx) if !self.messages[idx].streaming => {
                log::debug!("Dropping late chunk for finalized message {}", id);
                return;
            }
            Some(_) => {}
            None => {
                // chunk before start: open the stream implicitly
                self.push(placeholder(id, now));
                self.deliver_latest_pending();
            }
        }

        let so_far = self.streams.append_chunk(id, text, now).to_string();
        let kind = self.streams.kind(id).unwrap_or(MessageKind::Text);
        self.active_stream = Some(id.to_string());

        if let Some(idx) = self.position(id) {
            let message = &mut self.messages[idx];
            if message.content != so_far || message.kind != kind {
                message.content = so_far;
                message.kind = kind;
                let snapshot = message.clone();
                self.updated(snapshot);
            }
        }

        if self.streams.is_complete(id) {
            self.finalize_stream(id, None);
        }
    }

    fn on_stream_end(&mut self, event: &WireEvent) {
        let Some(id) = event.stream_id().or_else(|| self.active_stream.clone()) else {
            log::debug!("stream-end with no open stream");
            return;
        };
        let fallback = self.fragments.extract(&event.body()).map(|e| e.text);
        if let Err(e) = self.streams.mark_complete(&id) {
            log::debug!("{}", e);
        }
        self.finalize_stream(&id, fallback);
    }

    fn finalize_stream(&mut self, id: &str, fallback: Option<String>) {
        let accumulated = match self.streams.finalize(id) {
            Ok(content) => content,
            Err(_) => match self.position(id) {
                Some(idx) if self.messages[idx].streaming => self.messages[idx].content.clone(),
                Some(_) => {
                    log::debug!("Stream {} already finalized", id);
                    return;
                }
                None => {
                    // end without any start or chunk: the end frame is the whole response
                    if let Some(text) = fallback.filter(|t| !extract::is_noise(t)) {
                        let kind = classify::detect_kind(&text);
                        self.push(Message::inbound(id, text, kind).at(self.clock.now()));
                        self.deliver_latest_pending();
                    }
                    return;
                }
            },
        };
        if self.active_stream.as_deref() == Some(id) {
            self.active_stream = None;
        }
        let content = if accumulated.trim().is_empty() {
            fallback.unwrap_or(accumulated)
        } else {
            accumulated
        };
        self.settle_stream_message(id, content);
        self.deliver_latest_pending();
    }

    /// Turn a placeholder into a finished message, or drop it if the stream
    /// produced nothing worth showing.
    fn settle_stream_message(&mut self, id: &str, content: String) {
        let Some(idx) = self.position(id) else {
            return;
        };
        if !self.messages[idx].streaming {
            log::debug!("Message {} already settled", id);
            return;
        }
        if extract::is_noise(&content) {
            log::debug!("Stream {} produced no content", id);
            self.remove_at(idx);
            return;
        }
        let kind = classify::detect_kind(&content);
        let structured = extract::structured_data(&Value::Null, kind, &content);
        let message = &mut self.messages[idx];
        message.content = content;
        message.kind = kind;
        message.streaming = false;
        message.status = MessageStatus::Delivered;
        if structured.is_some() {
            message.structured = structured;
        }
        let snapshot = message.clone();
        self.updated(snapshot);
    }

    fn on_tool_use(&mut self, event: &WireEvent) {
        let body = event.body();
        let Some(name) = extract::field_str(&body, &["name", "toolName"]) else {
            log::debug!("tool-use without a tool name");
            return;
        };
        let tool_id = extract::field_str(&body, &["toolUseId", "tool_use_id", "id"]);
        if let Some(existing) = tool_id.as_deref() {
            if self.position(existing).is_some() {
                log::debug!("Duplicate tool-use {}", existing);
                return;
            }
        }
        let parameters = extract::field_value(&body, &["parameters", "input"]).unwrap_or(Value::Null);
        let content = self
            .fragments
            .extract(&body)
            .map(|e| e.text)
            .unwrap_or_else(|| format!("Using tool: {}", name));

        let message = Message::inbound(tool_id.clone().unwrap_or_else(new_id), content, MessageKind::ToolUse)
            .at(self.clock.now())
            .with_structured(StructuredPayload::ToolUse {
                id: tool_id,
                name,
                parameters,
            });
        self.push(message);
    }

    fn on_tool_result(&mut self, event: &WireEvent) {
        let body = event.body();
        let tool_use_id = extract::field_str(&body, &["toolUseId", "tool_use_id"]);
        let id = match &tool_use_id {
            Some(tool_id) => format!("{}:result", tool_id),
            None => new_id(),
        };
        if self.position(&id).is_some() {
            log::debug!("Duplicate tool-result {}", id);
            return;
        }
        let result = extract::field_value(&body, &["result", "output", "content"]).unwrap_or(Value::Null);
        let is_error = extract::field_value(&body, &["isError", "is_error"])
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let content = match &result {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => extract::text_or_fragments(other).unwrap_or_else(|| other.to_string()),
        };

        let message = Message::inbound(id, content, MessageKind::ToolResult)
            .at(self.clock.now())
            .with_structured(StructuredPayload::ToolResult {
                tool_use_id,
                name: extract::field_str(&body, &["name", "toolName"]),
                result,
                is_error,
            });
        self.push(message);
    }

    fn on_error(&mut self, event: &WireEvent) {
        let body = event.body();
        let text = extract::error_detail(&body)
            .or_else(|| self.fragments.extract(&body).map(|e| e.text))
            .unwrap_or_else(|| "Unknown error".to_string());
        log::warn!("Backend error: {}", text);
        let message = Message::system(text.clone())
            .at(self.clock.now())
            .with_structured(StructuredPayload::Error { detail: text });
        self.push(message);
        if let Some(id) = self.latest_pending_outbound() {
            self.force_fail(&id);
        }
    }

    fn on_session_aborted(&mut self, _event: &WireEvent) {
        log::info!("Session aborted: {:?}", self.session.session_id);
        self.session.aborted = true;
        let pending: Vec<MessageId> = self
            .messages
            .iter()
            .filter(|m| m.is_outbound() && m.status.is_pending())
            .map(|m| m.id.clone())
            .collect();
        for id in pending {
            self.force_fail(&id);
        }
        self.stop_streams();
    }

    fn stop_streams(&mut self) {
        for session in self.streams.discard_all() {
            self.settle_stream_message(&session.stream_id, session.accumulated);
        }
        self.active_stream = None;
    }

    // ─── Outbound ────────────────────────────────────────────

    /// Append a user message, start tracking its delivery and build the
    /// command to transmit. Blank input is ignored.
    pub fn send_message(&mut self, text: &str) -> Option<(MessageId, OutboundCommand)> {
        if text.trim().is_empty() {
            return None;
        }
        let now = self.clock.now();
        let message = Message::outbound(text).at(now);
        let id = self.status.submit(&message, now);
        self.session.aborted = false;
        self.push(message);
        let command = OutboundCommand::Command {
            content: text.to_string(),
            project_path: self.session.project_path.clone(),
            session_id: self.session.session_id.clone(),
        };
        Some((id, command))
    }

    pub fn abort_session(&self) -> Option<OutboundCommand> {
        self.session
            .session_id
            .clone()
            .map(|session_id| OutboundCommand::AbortSession { session_id })
    }

    /// Command replaying the current session id after a reconnect
    pub fn resume_command(&self) -> Option<OutboundCommand> {
        self.session
            .session_id
            .clone()
            .map(|session_id| OutboundCommand::ResumeSession { session_id })
    }

    /// The transport accepted the command
    pub fn mark_transmitted(&mut self, id: &str) {
        self.advance(id, MessageStatus::Sent);
    }

    /// The transport could not write the command
    pub fn mark_transmit_failed(&mut self, id: &str, error: &ChatError) {
        self.force_fail(id);
        let notice = Message::system(format!("Message not sent: {}", error)).at(self.clock.now());
        self.push(notice);
    }

    /// Resubmit a failed message's text as a new message. The failed one is removed.
    pub fn retry(&mut self, id: &str) -> Result<(MessageId, OutboundCommand)> {
        let message = self
            .message(id)
            .ok_or_else(|| ChatError::NotFound(format!("message {}", id)))?;
        if !message.is_outbound() || message.status != MessageStatus::Failed {
            return Err(ChatError::Other(format!(
                "message {} is not a failed outbound message",
                id
            )));
        }
        let content = message.content.clone();
        self.remove_message(id)?;
        self.send_message(&content)
            .ok_or_else(|| ChatError::Other("nothing to resend".to_string()))
    }

    pub fn remove_message(&mut self, id: &str) -> Result<()> {
        let idx = self
            .position(id)
            .ok_or_else(|| ChatError::NotFound(format!("message {}", id)))?;
        if self.streams.contains(id) {
            let _ = self.streams.finalize(id);
        }
        if self.active_stream.as_deref() == Some(id) {
            self.active_stream = None;
        }
        self.remove_at(idx);
        Ok(())
    }

    pub fn mark_read(&mut self, id: &str) -> Result<()> {
        let idx = self
            .position(id)
            .ok_or_else(|| ChatError::NotFound(format!("message {}", id)))?;
        if self.messages[idx].is_outbound() {
            let transition = self
                .status
                .mark_status(id, MessageStatus::Read, self.clock.now())?;
            self.apply(transition.into_iter().collect());
        } else if self.messages[idx].status == MessageStatus::Delivered && !self.messages[idx].streaming {
            // inbound messages are not tracked by the status machine
            self.messages[idx].status = MessageStatus::Read;
            self.apply_view(StatusTransition {
                id: id.to_string(),
                from: MessageStatus::Delivered,
                to: MessageStatus::Read,
            });
        }
        Ok(())
    }

    // ─── Timers ──────────────────────────────────────────────

    /// Fail messages whose timers are due. Held while reconnecting.
    pub fn expire_timers(&mut self) -> Vec<MessageId> {
        if self.connection == ConnectionState::Reconnecting {
            return Vec::new();
        }
        let transitions = self.status.expire_due(self.clock.now());
        let ids = transitions.iter().map(|t| t.id.clone()).collect();
        self.apply(transitions);
        ids
    }

    /// Finalize streams that went quiet past the staleness window
    pub fn sweep_streams(&mut self) -> usize {
        let stale = self.streams.sweep_stale(self.clock.now());
        let count = stale.len();
        for session in stale {
            if self.active_stream.as_deref() == Some(session.stream_id.as_str()) {
                self.active_stream = None;
            }
            self.settle_stream_message(&session.stream_id, session.accumulated);
        }
        count
    }

    // ─── Sessions & history ──────────────────────────────────

    /// Clear the list to show another session
    pub fn switch_session(&mut self, session_id: Option<String>) {
        if self.session.session_id == session_id {
            return;
        }
        log::info!("Switching to session {:?}", session_id);
        self.streams.discard_all();
        self.status.clear();
        self.messages.clear();
        self.active_stream = None;
        self.session.session_id = session_id.clone();
        self.session.aborted = false;
        self.revision += 1;
        self.event_bus.emit(ChatEvent::TranscriptReset { session_id });
    }

    /// Prepend an older page. Messages already listed are kept as they are.
    pub fn merge_history(&mut self, session_id: &str, page: Page) {
        if self.session.session_id.as_deref() != Some(session_id) {
            log::debug!("Discarding history page for inactive session {}", session_id);
            return;
        }
        let known: HashSet<&str> = self.messages.iter().map(|m| m.id.as_str()).collect();
        let older: Vec<Message> = page
            .messages
            .into_iter()
            .filter(|m| !known.contains(m.id.as_str()))
            .collect();

        let mut merged = older.clone();
        merged.append(&mut self.messages);
        self.messages = merged;
        self.revision += 1;
        self.event_bus.emit(ChatEvent::HistoryLoaded {
            session_id: session_id.to_string(),
            messages: older,
            has_more: page.has_more,
        });
    }

    // ─── Helpers ─────────────────────────────────────────────

    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().rposition(|m| m.id == id)
    }

    fn latest_pending_outbound(&self) -> Option<MessageId> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_outbound() && m.status.is_pending())
            .map(|m| m.id.clone())
    }

    fn deliver_latest_pending(&mut self) {
        if let Some(id) = self.latest_pending_outbound() {
            self.advance(&id, MessageStatus::Delivered);
        }
    }

    fn advance(&mut self, id: &str, target: MessageStatus) {
        match self.status.advance(id, target, self.clock.now()) {
            Ok(transitions) => self.apply(transitions),
            Err(e) => log::debug!("{}", e),
        }
    }

    fn force_fail(&mut self, id: &str) {
        match self.status.mark_status(id, MessageStatus::Failed, self.clock.now()) {
            Ok(transition) => self.apply(transition.into_iter().collect()),
            Err(e) => log::debug!("{}", e),
        }
    }

    /// Mirror applied transitions onto the list and notify, once each
    fn apply(&mut self, transitions: Vec<StatusTransition>) {
        for transition in transitions {
            if let Some(message) = self.messages.iter_mut().find(|m| m.id == transition.id) {
                message.status = transition.to;
            }
            self.apply_view(transition);
        }
    }

    fn apply_view(&mut self, transition: StatusTransition) {
        self.revision += 1;
        self.event_bus.emit(ChatEvent::StatusChanged {
            id: transition.id,
            from: transition.from,
            to: transition.to,
        });
    }

    fn push(&mut self, message: Message) {
        self.revision += 1;
        self.event_bus.emit(ChatEvent::MessageAdded {
            message: message.clone(),
        });
        self.messages.push(message);
    }

    fn updated(&mut self, snapshot: Message) {
        self.revision += 1;
        self.event_bus.emit(ChatEvent::MessageUpdated { message: snapshot });
    }

    fn remove_at(&mut self, idx: usize) {
        let message = self.messages.remove(idx);
        self.status.forget(&message.id);
        self.revision += 1;
        self.event_bus.emit(ChatEvent::MessageRemoved { id: message.id });
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn placeholder(id: &str, now: chrono::DateTime<chrono::Utc>) -> Message {
    let mut message = Message::inbound(id, "", MessageKind::Text).at(now);
    message.streaming = true;
    message
}
