#[cfg(test)]
mod tests {
    use crate::classify::{code_language, detect_kind};
    use crate::connection::{ConnectionSupervisor, SupervisorSignal};
    use crate::event_bus::EventBus;
    use crate::extract::*;
    use crate::history::{record_to_message, HistoryPaginator};
    use crate::ports::*;
    use crate::projection::TranscriptProjection;
    use crate::router::MessageRouter;
    use crate::status::StatusMachine;
    use crate::stream::StreamReconstructor;
    use async_trait::async_trait;
    use chat_types::config::*;
    use chat_types::connection::ConnectionState;
    use chat_types::event::*;
    use chat_types::message::*;
    use chat_types::session::*;
    use chat_types::{ChatError, Result};
    use chrono::{DateTime, TimeZone, Utc};
    use futures::executor::block_on;
    use serde_json::{json, Value};
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::rc::Rc;
    use std::time::Duration;

    const SESSION_UUID: &str = "session_123e4567-e89b-12d3-a456-426614174000";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn event(value: Value) -> WireEvent {
        serde_json::from_value(value).unwrap()
    }

    fn router() -> (MessageRouter, EventBus, ManualClock) {
        let bus = EventBus::new();
        let clock = ManualClock::new(t0());
        let router = MessageRouter::new(&ChatConfig::default(), bus.clone(), Rc::new(clock.clone()));
        (router, bus, clock)
    }

    fn status_changes(events: &[ChatEvent]) -> Vec<(MessageStatus, MessageStatus)> {
        events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::StatusChanged { from, to, .. } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    // ─── EventBus Tests ──────────────────────────────────────

    #[test]
    fn test_event_bus_new_is_empty() {
        let bus = EventBus::new();
        assert!(!bus.has_pending());
        assert!(bus.drain().is_empty());
    }

    #[test]
    fn test_event_bus_emit_and_drain() {
        let bus = EventBus::new();
        bus.emit(ChatEvent::MessageRemoved { id: "a".into() });
        bus.emit(ChatEvent::SessionChanged { session_id: None });
        assert_eq!(bus.pending_len(), 2);

        let events = bus.drain();
        assert_eq!(events.len(), 2);
        assert!(!bus.has_pending());
    }

    #[test]
    fn test_event_bus_clone_shares_state() {
        let bus1 = EventBus::new();
        let bus2 = bus1.clone();
        bus1.emit(ChatEvent::MessageRemoved { id: "a".into() });
        assert!(bus2.has_pending());
        assert_eq!(bus2.drain().len(), 1);
        assert!(!bus1.has_pending());
    }

    #[test]
    fn test_event_bus_subscribe_sees_every_event() {
        let bus = EventBus::new();
        let seen = Rc::new(Cell::new(0));
        let counter = seen.clone();
        bus.subscribe(move |_| counter.set(counter.get() + 1));

        bus.emit(ChatEvent::MessageRemoved { id: "a".into() });
        bus.emit(ChatEvent::MessageRemoved { id: "b".into() });
        assert_eq!(seen.get(), 2);
        // still buffered for pollers
        assert_eq!(bus.pending_len(), 2);
    }

    // ─── Kind Detection Tests ────────────────────────────────

    #[test]
    fn test_detect_kind_rules_in_order() {
        assert_eq!(detect_kind("```rust\nfn main() {}\n```"), MessageKind::Code);
        assert_eq!(detect_kind("Using tool: Read"), MessageKind::ToolUse);
        assert_eq!(detect_kind("Error: file missing"), MessageKind::Error);
        assert_eq!(detect_kind("  fatal: not a git repository"), MessageKind::Error);
        assert_eq!(detect_kind("<thinking>hmm</thinking>"), MessageKind::Thinking);
        assert_eq!(detect_kind("$ git status"), MessageKind::GitOperation);
        assert_eq!(detect_kind("$ cargo build"), MessageKind::TerminalCommand);
        assert_eq!(detect_kind("Created file src/main.rs"), MessageKind::FileOperation);
        assert_eq!(detect_kind("Hello there"), MessageKind::Text);
    }

    #[test]
    fn test_detect_kind_code_wins_over_error_prefix() {
        assert_eq!(detect_kind("error: see\n```\ntrace\n```"), MessageKind::Code);
    }

    #[test]
    fn test_detect_kind_error_only_as_prefix() {
        assert_eq!(detect_kind("No error: all good"), MessageKind::Text);
    }

    #[test]
    fn test_code_language() {
        assert_eq!(code_language("```python\nprint(1)\n```").as_deref(), Some("python"));
        assert_eq!(code_language("```\nplain\n```"), None);
        assert_eq!(code_language("no fence"), None);
    }

    // ─── Payload Extractor Tests ─────────────────────────────

    #[test]
    fn test_extract_top_level_content_wins() {
        let e = PayloadExtractor::new()
            .extract(&json!({"content": "X", "data": {"content": "Y"}}))
            .unwrap();
        assert_eq!(e.text, "X");
        assert_eq!(e.shape, PayloadShape::Content);
    }

    #[test]
    fn test_extract_message_fragments() {
        let payload = json!({"data": {"message": {"content": [
            {"type": "text", "text": "Z"}
        ]}}});
        let e = PayloadExtractor::new().extract(&payload).unwrap();
        assert_eq!(e.text, "Z");
        assert_eq!(e.shape, PayloadShape::DataMessageFragments);
    }

    #[test]
    fn test_extract_fragments_join_with_newline_and_skip_non_text() {
        let payload = json!({"content": [
            {"type": "text", "text": "one"},
            {"type": "tool_use", "name": "Read"},
            {"type": "text", "text": "two"}
        ]});
        let e = PayloadExtractor::new().extract(&payload).unwrap();
        assert_eq!(e.text, "one\ntwo");
    }

    #[test]
    fn test_extract_priority_order() {
        let x = PayloadExtractor::new();
        assert_eq!(x.extract(&json!({"data": {"content": "dc"}, "text": "t"})).unwrap().text, "dc");
        assert_eq!(x.extract(&json!({"data": {"message": "dm"}, "message": "m"})).unwrap().text, "dm");
        assert_eq!(x.extract(&json!({"message": "m", "text": "t"})).unwrap().text, "m");
        assert_eq!(x.extract(&json!({"text": "t"})).unwrap().text, "t");
    }

    #[test]
    fn test_extract_empty_shape_falls_through() {
        let e = PayloadExtractor::new()
            .extract(&json!({"content": "", "text": "fallback"}))
            .unwrap();
        assert_eq!(e.text, "fallback");
    }

    #[test]
    fn test_extract_session_identifier_is_no_content() {
        let x = PayloadExtractor::new();
        assert!(x.extract(&json!({"content": SESSION_UUID})).is_none());
        assert!(x.extract(&json!(SESSION_UUID)).is_none());
    }

    #[test]
    fn test_extract_short_strings_kept() {
        let e = PayloadExtractor::new().extract(&json!({"content": "ok"})).unwrap();
        assert_eq!(e.text, "ok");
    }

    #[test]
    fn test_extract_blank_is_no_content() {
        assert!(PayloadExtractor::new().extract(&json!({"content": "   \n"})).is_none());
    }

    #[test]
    fn test_session_identifier_pattern_is_exact() {
        assert!(is_session_identifier(SESSION_UUID));
        assert!(!is_session_identifier("session_abc"));
        assert!(!is_session_identifier(&format!("{} trailing", SESSION_UUID)));
        assert!(!is_session_identifier("123e4567-e89b-12d3-a456-426614174000"));
    }

    #[test]
    fn test_extract_diagnostic_only_when_opted_in() {
        let payload = json!({"weird": 1});
        assert!(PayloadExtractor::new().extract(&payload).is_none());

        let e = PayloadExtractor::with_diagnostic_fallback().extract(&payload).unwrap();
        assert_eq!(e.shape, PayloadShape::Diagnostic);
        assert!(e.text.contains("weird"));
    }

    #[test]
    fn test_extract_diagnostic_skips_empty_payload() {
        assert!(PayloadExtractor::with_diagnostic_fallback().extract(&json!({})).is_none());
    }

    #[test]
    fn test_extract_kind_tag_and_tool_structure() {
        let payload = json!({
            "content": "reading",
            "kind": "tool_use",
            "name": "Read",
            "input": {"path": "a.rs"}
        });
        let e = PayloadExtractor::new().extract(&payload).unwrap();
        assert_eq!(e.kind(), MessageKind::ToolUse);
        match e.structured {
            Some(StructuredPayload::ToolUse { name, parameters, .. }) => {
                assert_eq!(name, "Read");
                assert_eq!(parameters["path"], "a.rs");
            }
            other => panic!("unexpected structure {:?}", other),
        }
    }

    #[test]
    fn test_extract_code_language() {
        let e = PayloadExtractor::new()
            .extract(&json!({"content": "```go\nfunc main() {}\n```"}))
            .unwrap();
        assert_eq!(
            e.structured,
            Some(StructuredPayload::Code { language: Some("go".into()) })
        );
    }

    #[test]
    fn test_chunk_text_keeps_whitespace() {
        let x = PayloadExtractor::new();
        assert_eq!(x.chunk_text(&json!({"content": " "})), " ");
        assert_eq!(x.chunk_text(&json!("\n")), "\n");
        assert_eq!(x.chunk_text(&json!({})), "");
    }

    #[test]
    fn test_error_detail_shapes() {
        assert_eq!(error_detail(&json!({"error": "boom"})).as_deref(), Some("boom"));
        assert_eq!(
            error_detail(&json!({"error": {"message": "nested"}})).as_deref(),
            Some("nested")
        );
        assert_eq!(error_detail(&json!({"message": "x"})), None);
    }

    // ─── Stream Reconstructor Tests ──────────────────────────

    fn streams() -> StreamReconstructor {
        StreamReconstructor::new("[DONE]", secs(300))
    }

    #[test]
    fn test_stream_accumulates_in_order() {
        let mut s = streams();
        assert!(s.begin_stream("a", t0()));
        s.append_chunk("a", "Hello", t0());
        assert_eq!(s.append_chunk("a", " world", t0()), "Hello world");
        assert!(!s.is_complete("a"));
        assert_eq!(s.finalize("a").unwrap(), "Hello world");
        assert!(!s.contains("a"));
    }

    #[test]
    fn test_stream_duplicate_begin() {
        let mut s = streams();
        assert!(s.begin_stream("a", t0()));
        assert!(!s.begin_stream("a", t0()));
        assert_eq!(s.open_count(), 1);
    }

    #[test]
    fn test_stream_chunk_before_start_creates_session() {
        let mut s = streams();
        assert_eq!(s.append_chunk("late", "x", t0()), "x");
        assert!(s.contains("late"));
    }

    #[test]
    fn test_stream_empty_chunk_is_noop() {
        let mut s = streams();
        s.append_chunk("a", "abc", t0());
        assert_eq!(s.append_chunk("a", "", t0()), "abc");
    }

    #[test]
    fn test_stream_end_marker_strips_and_completes() {
        let mut s = streams();
        assert_eq!(s.append_chunk("a", "final words[DONE]ignored", t0()), "final words");
        assert!(s.is_complete("a"));
    }

    #[test]
    fn test_stream_end_marker_across_chunks() {
        let mut s = streams();
        s.append_chunk("a", "Hi [DO", t0());
        assert!(!s.is_complete("a"));
        assert_eq!(s.append_chunk("a", "NE] tail", t0()), "Hi ");
        assert!(s.is_complete("a"));
    }

    #[test]
    fn test_stream_ignores_chunks_after_complete() {
        let mut s = streams();
        s.append_chunk("a", "done[DONE]", t0());
        assert_eq!(s.append_chunk("a", "more", t0()), "done");
    }

    #[test]
    fn test_stream_kind_changes_mid_stream() {
        let mut s = streams();
        s.append_chunk("a", "Here is code:\n", t0());
        assert_eq!(s.kind("a"), Some(MessageKind::Text));
        s.append_chunk("a", "```rust\n", t0());
        assert_eq!(s.kind("a"), Some(MessageKind::Code));
    }

    #[test]
    fn test_stream_mark_complete_unknown() {
        let mut s = streams();
        assert!(s.mark_complete("nope").unwrap_err().is_not_found());
        assert!(s.finalize("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_stream_sweep_stale() {
        let mut s = streams();
        s.append_chunk("old", "partial", t0());
        let later = add_duration(t0(), secs(200));
        s.append_chunk("fresh", "new", later);

        let swept = s.sweep_stale(add_duration(t0(), secs(301)));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].stream_id, "old");
        assert_eq!(swept[0].accumulated, "partial");
        assert!(s.contains("fresh"));
    }

    #[test]
    fn test_stream_discard_all() {
        let mut s = streams();
        s.append_chunk("a", "1", t0());
        s.append_chunk("b", "2", t0());
        assert_eq!(s.discard_all().len(), 2);
        assert_eq!(s.open_count(), 0);
    }

    // ─── Status Machine Tests ────────────────────────────────

    fn machine() -> StatusMachine {
        StatusMachine::new(secs(30), secs(120))
    }

    #[test]
    fn test_status_submit_arms_send_timer() {
        let mut m = machine();
        let msg = Message::outbound("hi");
        let id = m.submit(&msg, t0());
        assert_eq!(m.status(&id), Some(MessageStatus::Sending));
        let timer = m.timer(&id).unwrap();
        assert_eq!(timer.deadline, add_duration(t0(), secs(30)));
    }

    #[test]
    fn test_status_legal_pipeline() {
        let mut m = machine();
        let id = m.submit(&Message::outbound("hi"), t0());

        let t = m.mark_status(&id, MessageStatus::Sent, t0()).unwrap().unwrap();
        assert_eq!((t.from, t.to), (MessageStatus::Sending, MessageStatus::Sent));
        assert_eq!(m.timer(&id).unwrap().duration, secs(120));

        m.mark_status(&id, MessageStatus::Delivered, t0()).unwrap().unwrap();
        assert!(m.timer(&id).is_none());
        m.mark_status(&id, MessageStatus::Read, t0()).unwrap().unwrap();
        assert_eq!(m.status(&id), Some(MessageStatus::Read));
    }

    #[test]
    fn test_status_illegal_transitions_are_noops() {
        let mut m = machine();
        let id = m.submit(&Message::outbound("hi"), t0());
        assert!(m.mark_status(&id, MessageStatus::Read, t0()).unwrap().is_none());
        assert!(m.mark_status(&id, MessageStatus::Delivered, t0()).unwrap().is_none());
        assert_eq!(m.status(&id), Some(MessageStatus::Sending));
        // the send timer is untouched
        assert!(m.timer(&id).is_some());
    }

    #[test]
    fn test_status_terminal_states_reject_everything() {
        let mut m = machine();
        let id = m.submit(&Message::outbound("hi"), t0());
        m.mark_status(&id, MessageStatus::Failed, t0()).unwrap().unwrap();
        for next in [MessageStatus::Sending, MessageStatus::Sent, MessageStatus::Delivered, MessageStatus::Read] {
            assert!(m.mark_status(&id, next, t0()).unwrap().is_none());
        }
        assert_eq!(m.status(&id), Some(MessageStatus::Failed));
        assert_eq!(m.timer_count(), 0);
    }

    #[test]
    fn test_status_same_state_is_idempotent() {
        let mut m = machine();
        let id = m.submit(&Message::outbound("hi"), t0());
        m.mark_status(&id, MessageStatus::Sent, t0()).unwrap();
        assert!(m.mark_status(&id, MessageStatus::Sent, t0()).unwrap().is_none());
    }

    #[test]
    fn test_status_unknown_id_not_found() {
        let mut m = machine();
        let err = m.mark_status("missing", MessageStatus::Sent, t0()).unwrap_err();
        assert!(err.is_not_found());
        assert!(m.start_timeout("missing", secs(1), t0()).is_err());
    }

    #[test]
    fn test_status_send_timeout_fails_exactly_once() {
        let mut m = machine();
        let id = m.submit(&Message::outbound("hi"), t0());

        assert!(m.expire_due(add_duration(t0(), secs(29))).is_empty());

        let fired = m.expire_due(add_duration(t0(), secs(31)));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, id);
        assert_eq!(fired[0].to, MessageStatus::Failed);
        assert_eq!(m.status(&id), Some(MessageStatus::Failed));
        assert_eq!(m.timer_count(), 0);

        assert!(m.expire_due(add_duration(t0(), secs(60))).is_empty());
    }

    #[test]
    fn test_status_delivery_timeout() {
        let mut m = machine();
        let id = m.submit(&Message::outbound("hi"), t0());
        m.mark_status(&id, MessageStatus::Sent, t0()).unwrap();
        // the send timeout no longer applies
        assert!(m.expire_due(add_duration(t0(), secs(31))).is_empty());
        let fired = m.expire_due(add_duration(t0(), secs(121)));
        assert_eq!(fired[0].from, MessageStatus::Sent);
    }

    #[test]
    fn test_status_advance_walks_pipeline() {
        let mut m = machine();
        let id = m.submit(&Message::outbound("hi"), t0());
        let steps = m.advance(&id, MessageStatus::Delivered, t0()).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].to, MessageStatus::Sent);
        assert_eq!(steps[1].to, MessageStatus::Delivered);
        assert!(m.advance(&id, MessageStatus::Delivered, t0()).unwrap().is_empty());
        assert_eq!(m.timer_count(), 0);
    }

    #[test]
    fn test_status_start_timeout_replaces_prior() {
        let mut m = machine();
        let id = m.submit(&Message::outbound("hi"), t0());
        m.start_timeout(&id, secs(5), t0()).unwrap();
        assert_eq!(m.timer_count(), 1);
        assert_eq!(m.expire_due(add_duration(t0(), secs(6))).len(), 1);
    }

    #[test]
    fn test_status_pending_and_forget() {
        let mut m = machine();
        let a = m.submit(&Message::outbound("a"), t0());
        let b = m.submit(&Message::outbound("b"), t0());
        m.advance(&b, MessageStatus::Delivered, t0()).unwrap();
        assert_eq!(m.pending(), vec![a.clone()]);

        m.forget(&a);
        assert!(m.status(&a).is_none());
        assert_eq!(m.timer_count(), 0);
    }

    // ─── Router: responses ───────────────────────────────────

    #[test]
    fn test_router_complete_response_delivers_pending() {
        let (mut r, bus, _) = router();
        let (id, _) = r.send_message("hello").unwrap();
        bus.drain();

        r.handle(event(json!({"type": "complete-response", "payload": {"content": "Hi!"}})));

        assert_eq!(r.messages().len(), 2);
        assert_eq!(r.messages()[1].content, "Hi!");
        assert_eq!(r.messages()[1].direction, Direction::Inbound);
        assert_eq!(r.message(&id).unwrap().status, MessageStatus::Delivered);
        assert_eq!(r.status_machine().timer_count(), 0);

        let events = bus.drain();
        assert_eq!(
            status_changes(&events),
            vec![
                (MessageStatus::Sending, MessageStatus::Sent),
                (MessageStatus::Sent, MessageStatus::Delivered),
            ]
        );
    }

    #[test]
    fn test_router_complete_response_filtered_creates_nothing() {
        let (mut r, bus, _) = router();
        let (id, _) = r.send_message("hello").unwrap();
        bus.drain();
        r.handle(event(json!({"type": "claude-response", "payload": {"content": SESSION_UUID}})));
        assert_eq!(r.messages().len(), 1);
        assert_eq!(r.message(&id).unwrap().status, MessageStatus::Sending);
        assert!(bus.drain().is_empty());
    }

    #[test]
    fn test_router_complete_response_diagnostic_fallback() {
        let (mut r, _, _) = router();
        r.handle(event(json!({"type": "complete-response", "payload": {"unexpected": [1, 2]}})));
        assert_eq!(r.messages().len(), 1);
        assert!(r.messages()[0].content.contains("unexpected"));
    }

    #[test]
    fn test_router_top_level_fields_are_the_body() {
        let (mut r, _, _) = router();
        r.handle_raw(r#"{"type":"claude-response","content":"flat"}"#);
        assert_eq!(r.messages()[0].content, "flat");
    }

    #[test]
    fn test_router_unknown_and_malformed_frames_dropped() {
        let (mut r, bus, _) = router();
        r.handle_raw(r#"{"type":"something-new","content":"x"}"#);
        r.handle_raw("not json at all");
        assert!(r.messages().is_empty());
        assert!(bus.drain().is_empty());
    }

    // ─── Router: streams ─────────────────────────────────────

    #[test]
    fn test_router_stream_flow() {
        let (mut r, bus, _) = router();
        let (id, _) = r.send_message("write a poem").unwrap();
        r.mark_transmitted(&id);
        bus.drain();

        r.handle(event(json!({"type": "stream-start", "payload": {"streamId": "s1"}})));
        assert_eq!(r.message(&id).unwrap().status, MessageStatus::Delivered);
        let placeholder = r.message("s1").unwrap();
        assert!(placeholder.streaming);
        assert_eq!(placeholder.content, "");

        r.handle(event(json!({"type": "stream-chunk", "payload": {"streamId": "s1", "content": "Roses"}})));
        r.handle(event(json!({"type": "stream-chunk", "payload": {"streamId": "s1", "content": " are red"}})));
        assert_eq!(r.message("s1").unwrap().content, "Roses are red");

        r.handle(event(json!({"type": "stream-end", "payload": {"streamId": "s1"}})));
        let done = r.message("s1").unwrap();
        assert!(!done.streaming);
        assert_eq!(done.content, "Roses are red");
        assert_eq!(done.status, MessageStatus::Delivered);
        assert_eq!(r.streams().open_count(), 0);
        assert!(r.active_stream().is_none());

        // delivered once, at stream start
        let events = bus.drain();
        assert_eq!(status_changes(&events), vec![(MessageStatus::Sent, MessageStatus::Delivered)]);
    }

    #[test]
    fn test_router_partial_output_joins_active_stream() {
        let (mut r, _, _) = router();
        r.handle(event(json!({"type": "stream-start", "payload": {"streamId": "s1"}})));
        r.handle(event(json!({"type": "claude-output", "content": "abc"})));
        r.handle(event(json!({"type": "claude-output", "content": "def"})));
        r.handle(event(json!({"type": "claude-complete"})));

        assert_eq!(r.messages().len(), 1);
        assert_eq!(r.message("s1").unwrap().content, "abcdef");
        assert!(!r.message("s1").unwrap().streaming);
    }

    #[test]
    fn test_router_chunk_before_start() {
        let (mut r, _, _) = router();
        let (id, _) = r.send_message("q").unwrap();
        r.handle(event(json!({"type": "stream-chunk", "payload": {"streamId": "s9", "content": "early"}})));
        assert_eq!(r.message("s9").unwrap().content, "early");
        assert!(r.message("s9").unwrap().streaming);
        assert_eq!(r.message(&id).unwrap().status, MessageStatus::Delivered);

        // the late start does not duplicate the placeholder
        r.handle(event(json!({"type": "stream-start", "payload": {"streamId": "s9"}})));
        assert_eq!(r.messages().iter().filter(|m| m.id == "s9").count(), 1);
    }

    #[test]
    fn test_router_end_marker_in_chunk_finalizes() {
        let (mut r, _, _) = router();
        r.handle(event(json!({"type": "stream-chunk", "payload": {"streamId": "s1", "content": "all done[DONE]"}})));
        let message = r.message("s1").unwrap();
        assert_eq!(message.content, "all done");
        assert!(!message.streaming);
        assert_eq!(r.streams().open_count(), 0);
    }

    #[test]
    fn test_router_empty_stream_removes_placeholder() {
        let (mut r, bus, _) = router();
        r.handle(event(json!({"type": "stream-start", "payload": {"streamId": "s1"}})));
        r.handle(event(json!({"type": "stream-chunk", "payload": {"streamId": "s1", "content": "  "}})));
        r.handle(event(json!({"type": "stream-end", "payload": {"streamId": "s1"}})));
        assert!(r.messages().is_empty());
        assert!(bus
            .drain()
            .iter()
            .any(|e| matches!(e, ChatEvent::MessageRemoved { id } if id == "s1")));
    }

    #[test]
    fn test_router_stream_end_content_used_when_nothing_accumulated() {
        let (mut r, _, _) = router();
        r.handle(event(json!({"type": "stream-start", "payload": {"streamId": "s1"}})));
        r.handle(event(json!({"type": "stream-end", "payload": {"streamId": "s1", "content": "whole"}})));
        assert_eq!(r.message("s1").unwrap().content, "whole");
    }

    #[test]
    fn test_router_stream_kind_updates() {
        let (mut r, _, _) = router();
        r.handle(event(json!({"type": "stream-chunk", "payload": {"streamId": "s1", "content": "See:\n"}})));
        assert_eq!(r.message("s1").unwrap().kind, MessageKind::Text);
        r.handle(event(json!({"type": "stream-chunk", "payload": {"streamId": "s1", "content": "```sh\nls\n```"}})));
        assert_eq!(r.message("s1").unwrap().kind, MessageKind::Code);
        r.handle(event(json!({"type": "stream-end", "payload": {"streamId": "s1"}})));
        assert_eq!(
            r.message("s1").unwrap().structured,
            Some(StructuredPayload::Code { language: Some("sh".into()) })
        );
    }

    #[test]
    fn test_router_late_chunk_after_finalize_dropped() {
        let (mut r, _, _) = router();
        r.handle(event(json!({"type": "stream-chunk", "payload": {"streamId": "s1", "content": "x"}})));
        r.handle(event(json!({"type": "stream-end", "payload": {"streamId": "s1"}})));
        r.handle(event(json!({"type": "stream-chunk", "payload": {"streamId": "s1", "content": "y"}})));
        assert_eq!(r.message("s1").unwrap().content, "x");
        assert_eq!(r.streams().open_count(), 0);
    }

    #[test]
    fn test_router_complete_response_finalizes_placeholder() {
        let (mut r, _, _) = router();
        r.handle(event(json!({"type": "stream-chunk", "payload": {"streamId": "s1", "content": "par"}})));
        r.handle(event(json!({"type": "complete-response", "payload": {"id": "s1", "content": "partial then full"}})));
        assert_eq!(r.messages().len(), 1);
        assert_eq!(r.message("s1").unwrap().content, "partial then full");
        assert!(!r.message("s1").unwrap().streaming);
        assert_eq!(r.streams().open_count(), 0);
    }

    #[test]
    fn test_router_sweep_finalizes_stale_stream() {
        let (mut r, _, clock) = router();
        r.handle(event(json!({"type": "stream-chunk", "payload": {"streamId": "s1", "content": "partial"}})));
        clock.advance(secs(299));
        assert_eq!(r.sweep_streams(), 0);
        clock.advance(secs(2));
        assert_eq!(r.sweep_streams(), 1);
        let message = r.message("s1").unwrap();
        assert!(!message.streaming);
        assert_eq!(message.content, "partial");
        assert!(r.active_stream().is_none());
    }

    #[test]
    fn test_router_replayed_stream_keeps_finalized_message() {
        let (mut r, bus, _) = router();
        r.handle(event(json!({"type": "stream-start", "payload": {"streamId": "s1"}})));
        r.handle(event(json!({"type": "stream-chunk", "payload": {"streamId": "s1", "content": "Hello"}})));
        r.handle(event(json!({"type": "stream-end", "payload": {"streamId": "s1"}})));
        bus.drain();

        r.handle(event(json!({"type": "stream-start", "payload": {"streamId": "s1"}})));
        r.handle(event(json!({"type": "stream-end", "payload": {"streamId": "s1"}})));

        let message = r.message("s1").unwrap();
        assert_eq!(message.content, "Hello");
        assert!(!message.streaming);
        assert_eq!(r.streams().open_count(), 0);
        assert!(r.active_stream().is_none());
        assert!(!bus
            .drain()
            .iter()
            .any(|e| matches!(e, ChatEvent::MessageRemoved { .. })));
    }

    #[test]
    fn test_router_untagged_complete_response_finishes_open_stream() {
        let (mut r, _, _) = router();
        let (id, _) = r.send_message("hi").unwrap();
        r.mark_transmitted(&id);
        r.handle(event(json!({"type": "stream-start", "payload": {"streamId": "s1"}})));
        r.handle(event(json!({"type": "stream-chunk", "payload": {"content": "Hello"}})));
        r.handle(event(json!({"type": "complete-response", "payload": {"content": "Hello world"}})));

        assert_eq!(r.messages().len(), 2);
        let answer = r.message("s1").unwrap();
        assert_eq!(answer.content, "Hello world");
        assert!(!answer.streaming);
        assert!(r.active_stream().is_none());
        assert_eq!(r.streams().open_count(), 0);
        assert_eq!(r.message(&id).unwrap().status, MessageStatus::Delivered);
    }

    // ─── Router: tools, errors, sessions ─────────────────────

    #[test]
    fn test_router_tool_use_and_result() {
        let (mut r, _, _) = router();
        r.handle(event(json!({"type": "tool-use", "payload": {
            "id": "tu1", "name": "Bash", "input": {"command": "ls"}
        }})));
        r.handle(event(json!({"type": "tool-result", "payload": {
            "toolUseId": "tu1", "result": "a.rs\nb.rs", "isError": false
        }})));

        assert_eq!(r.messages().len(), 2);
        let tool = &r.messages()[0];
        assert_eq!(tool.kind, MessageKind::ToolUse);
        assert_eq!(tool.content, "Using tool: Bash");
        match &tool.structured {
            Some(StructuredPayload::ToolUse { id, name, parameters }) => {
                assert_eq!(id.as_deref(), Some("tu1"));
                assert_eq!(name, "Bash");
                assert_eq!(parameters["command"], "ls");
            }
            other => panic!("unexpected structure {:?}", other),
        }

        let result = &r.messages()[1];
        assert_eq!(result.kind, MessageKind::ToolResult);
        assert_eq!(result.content, "a.rs\nb.rs");
        assert!(matches!(
            &result.structured,
            Some(StructuredPayload::ToolResult { tool_use_id: Some(t), is_error: false, .. }) if t == "tu1"
        ));
    }

    #[test]
    fn test_router_tool_frames_never_merge_into_stream() {
        let (mut r, _, _) = router();
        r.handle(event(json!({"type": "stream-chunk", "payload": {"streamId": "s1", "content": "text"}})));
        r.handle(event(json!({"type": "tool-use", "payload": {"name": "Read"}})));
        assert_eq!(r.messages().len(), 2);
        assert_eq!(r.message("s1").unwrap().content, "text");
    }

    #[test]
    fn test_router_duplicate_tool_frames_dropped() {
        let (mut r, _, _) = router();
        let use_frame = json!({"type": "tool-use", "payload": {"id": "tu1", "name": "Read"}});
        let result_frame = json!({"type": "tool-result", "payload": {"toolUseId": "tu1", "result": "ok"}});
        r.handle(event(use_frame.clone()));
        r.handle(event(use_frame));
        r.handle(event(result_frame.clone()));
        r.handle(event(result_frame));
        assert_eq!(r.messages().len(), 2);
    }

    #[test]
    fn test_router_tool_use_without_name_ignored() {
        let (mut r, _, _) = router();
        r.handle(event(json!({"type": "tool-use", "payload": {"input": {}}})));
        assert!(r.messages().is_empty());
    }

    #[test]
    fn test_router_error_fails_latest_pending() {
        let (mut r, bus, _) = router();
        let (first, _) = r.send_message("one").unwrap();
        let (second, _) = r.send_message("two").unwrap();
        bus.drain();

        r.handle(event(json!({"type": "claude-error", "error": "rate limited"})));

        let system = r.messages().last().unwrap();
        assert_eq!(system.kind, MessageKind::System);
        assert_eq!(system.content, "rate limited");
        assert_eq!(
            system.structured,
            Some(StructuredPayload::Error { detail: "rate limited".into() })
        );
        assert_eq!(r.message(&second).unwrap().status, MessageStatus::Failed);
        assert_eq!(r.message(&first).unwrap().status, MessageStatus::Sending);
        assert_eq!(status_changes(&bus.drain()), vec![(MessageStatus::Sending, MessageStatus::Failed)]);
    }

    #[test]
    fn test_router_session_created() {
        let (mut r, bus, _) = router();
        r.handle(event(json!({"type": "session-created", "sessionId": "abc"})));
        assert_eq!(r.session().session_id.as_deref(), Some("abc"));
        assert_eq!(
            bus.drain(),
            vec![ChatEvent::SessionChanged { session_id: Some("abc".into()) }]
        );

        // repeated announcement is silent
        r.handle(event(json!({"type": "session-created", "sessionId": "abc"})));
        assert!(bus.drain().is_empty());
    }

    #[test]
    fn test_router_ignores_other_sessions() {
        let (mut r, _, _) = router();
        r.handle(event(json!({"type": "session-created", "sessionId": "mine"})));
        r.handle(event(json!({"type": "complete-response", "sessionId": "theirs", "content": "x"})));
        r.handle(event(json!({"type": "complete-response", "sessionId": "mine", "content": "y"})));
        r.handle(event(json!({"type": "complete-response", "content": "untagged"})));
        let contents: Vec<&str> = r.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["y", "untagged"]);
    }

    #[test]
    fn test_router_session_aborted() {
        let (mut r, bus, _) = router();
        r.handle(event(json!({"type": "session-created", "sessionId": "s"})));
        r.handle(event(json!({"type": "stream-start", "payload": {"streamId": "partial"}})));
        r.handle(event(json!({"type": "stream-chunk", "payload": {"streamId": "partial", "content": "half"}})));
        r.handle(event(json!({"type": "stream-start", "payload": {"streamId": "empty"}})));
        let (sent, _) = r.send_message("one").unwrap();
        r.mark_transmitted(&sent);
        let (sending, _) = r.send_message("two").unwrap();
        bus.drain();

        r.handle(event(json!({"type": "session-aborted", "sessionId": "s"})));

        assert!(r.session().aborted);
        assert_eq!(r.message(&sent).unwrap().status, MessageStatus::Failed);
        assert_eq!(r.message(&sending).unwrap().status, MessageStatus::Failed);
        assert_eq!(r.status_machine().timer_count(), 0);
        assert_eq!(r.streams().open_count(), 0);
        assert!(r.active_stream().is_none());
        assert!(!r.message("partial").unwrap().streaming);
        assert!(r.message("empty").is_none());
        assert_eq!(status_changes(&bus.drain()).len(), 2);
    }

    // ─── Router: outbound operations ─────────────────────────

    #[test]
    fn test_router_send_builds_command() {
        let mut config = ChatConfig::default();
        config.transport.project_path = "/work/app".into();
        let bus = EventBus::new();
        let mut r = MessageRouter::new(&config, bus.clone(), Rc::new(ManualClock::new(t0())));

        let (_, command) = r.send_message("hi").unwrap();
        assert_eq!(
            command,
            OutboundCommand::Command {
                content: "hi".into(),
                project_path: "/work/app".into(),
                session_id: None,
            }
        );

        r.handle(event(json!({"type": "session-created", "sessionId": "s1"})));
        let (id, command) = r.send_message("again").unwrap();
        assert!(matches!(command, OutboundCommand::Command { session_id: Some(ref s), .. } if s == "s1"));
        assert_eq!(r.message(&id).unwrap().timestamp, t0());
        assert!(matches!(bus.drain()[0], ChatEvent::MessageAdded { .. }));
    }

    #[test]
    fn test_router_blank_send_ignored() {
        let (mut r, bus, _) = router();
        assert!(r.send_message("   ").is_none());
        assert!(r.messages().is_empty());
        assert!(bus.drain().is_empty());
    }

    #[test]
    fn test_router_abort_and_resume_need_session() {
        let (mut r, _, _) = router();
        assert!(r.abort_session().is_none());
        assert!(r.resume_command().is_none());
        r.handle(event(json!({"type": "session-created", "sessionId": "s1"})));
        assert_eq!(
            r.abort_session(),
            Some(OutboundCommand::AbortSession { session_id: "s1".into() })
        );
        assert_eq!(
            r.resume_command(),
            Some(OutboundCommand::ResumeSession { session_id: "s1".into() })
        );
    }

    #[test]
    fn test_router_transmit_failure_adds_notice() {
        let (mut r, _, _) = router();
        let (id, _) = r.send_message("hi").unwrap();
        r.mark_transmit_failed(&id, &ChatError::Transport("socket closed".into()));
        assert_eq!(r.message(&id).unwrap().status, MessageStatus::Failed);
        let notice = r.messages().last().unwrap();
        assert_eq!(notice.kind, MessageKind::System);
        assert!(notice.content.contains("socket closed"));
    }

    #[test]
    fn test_router_retry_replaces_failed_message() {
        let (mut r, _, _) = router();
        let (id, _) = r.send_message("again please").unwrap();
        r.mark_transmit_failed(&id, &ChatError::Transport("down".into()));

        let (new_id, command) = r.retry(&id).unwrap();
        assert_ne!(new_id, id);
        assert!(r.message(&id).is_none());
        assert_eq!(r.message(&new_id).unwrap().status, MessageStatus::Sending);
        assert!(matches!(command, OutboundCommand::Command { ref content, .. } if content == "again please"));
    }

    #[test]
    fn test_router_retry_rejects_non_failed() {
        let (mut r, _, _) = router();
        let (id, _) = r.send_message("hi").unwrap();
        assert!(r.retry(&id).is_err());
        assert!(r.retry("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_router_remove_message() {
        let (mut r, bus, _) = router();
        let (id, _) = r.send_message("hi").unwrap();
        bus.drain();
        r.remove_message(&id).unwrap();
        assert!(r.messages().is_empty());
        assert!(r.status_machine().status(&id).is_none());
        assert_eq!(bus.drain(), vec![ChatEvent::MessageRemoved { id: id.clone() }]);
        assert!(r.remove_message(&id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_router_mark_read() {
        let (mut r, _, _) = router();
        let (id, _) = r.send_message("hi").unwrap();
        r.handle(event(json!({"type": "complete-response", "payload": {"id": "in1", "content": "yo"}})));

        r.mark_read(&id).unwrap();
        r.mark_read("in1").unwrap();
        assert_eq!(r.message(&id).unwrap().status, MessageStatus::Read);
        assert_eq!(r.message("in1").unwrap().status, MessageStatus::Read);
        assert!(r.mark_read("missing").is_err());
    }

    #[test]
    fn test_router_mark_read_before_delivery_is_noop() {
        let (mut r, bus, _) = router();
        let (id, _) = r.send_message("hi").unwrap();
        bus.drain();
        r.mark_read(&id).unwrap();
        assert_eq!(r.message(&id).unwrap().status, MessageStatus::Sending);
        assert!(bus.drain().is_empty());
    }

    // ─── Router: timers ──────────────────────────────────────

    #[test]
    fn test_router_expire_timers() {
        let (mut r, bus, clock) = router();
        let (id, _) = r.send_message("hi").unwrap();
        bus.drain();

        clock.advance(secs(31));
        assert_eq!(r.expire_timers(), vec![id.clone()]);
        assert_eq!(r.message(&id).unwrap().status, MessageStatus::Failed);
        assert_eq!(status_changes(&bus.drain()), vec![(MessageStatus::Sending, MessageStatus::Failed)]);

        clock.advance(secs(31));
        assert!(r.expire_timers().is_empty());
        assert!(bus.drain().is_empty());
    }

    #[test]
    fn test_router_expiry_held_while_reconnecting() {
        let (mut r, _, clock) = router();
        let (id, _) = r.send_message("hi").unwrap();
        r.set_connection(ConnectionState::Reconnecting);
        clock.advance(secs(45));
        assert!(r.expire_timers().is_empty());
        assert_eq!(r.message(&id).unwrap().status, MessageStatus::Sending);

        r.set_connection(ConnectionState::Connected);
        assert_eq!(r.expire_timers(), vec![id]);
    }

    #[test]
    fn test_router_late_response_after_timeout_keeps_failed() {
        let (mut r, _, clock) = router();
        let (id, _) = r.send_message("hi").unwrap();
        clock.advance(secs(31));
        r.expire_timers();
        r.handle(event(json!({"type": "complete-response", "content": "late"})));
        assert_eq!(r.message(&id).unwrap().status, MessageStatus::Failed);
        assert_eq!(r.messages().len(), 2);
    }

    // ─── Router: history & sessions ──────────────────────────

    #[test]
    fn test_router_merge_history_prepends_and_dedupes() {
        let (mut r, bus, _) = router();
        r.handle(event(json!({"type": "session-created", "sessionId": "s1"})));
        r.handle(event(json!({"type": "complete-response", "payload": {"id": "live", "content": "now"}})));
        bus.drain();

        let page = Page {
            messages: vec![
                Message::inbound("h1", "first", MessageKind::Text),
                Message::inbound("h2", "second", MessageKind::Text),
                Message::inbound("live", "stale copy", MessageKind::Text),
            ],
            has_more: true,
            source: PageSource::Remote,
        };
        r.merge_history("s1", page);

        let ids: Vec<&str> = r.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["h1", "h2", "live"]);
        assert_eq!(r.message("live").unwrap().content, "now");
        match &bus.drain()[0] {
            ChatEvent::HistoryLoaded { messages, has_more, .. } => {
                assert_eq!(messages.len(), 2);
                assert!(has_more);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_router_merge_history_for_inactive_session_dropped() {
        let (mut r, _, _) = router();
        r.handle(event(json!({"type": "session-created", "sessionId": "s1"})));
        let page = Page {
            messages: vec![Message::inbound("h1", "x", MessageKind::Text)],
            has_more: false,
            source: PageSource::Remote,
        };
        r.merge_history("other", page);
        assert!(r.messages().is_empty());
    }

    #[test]
    fn test_router_switch_session_clears() {
        let (mut r, bus, _) = router();
        r.handle(event(json!({"type": "session-created", "sessionId": "s1"})));
        r.send_message("hi").unwrap();
        r.handle(event(json!({"type": "stream-chunk", "payload": {"streamId": "x", "content": "y"}})));
        bus.drain();

        r.switch_session(Some("s2".into()));
        assert!(r.messages().is_empty());
        assert_eq!(r.status_machine().timer_count(), 0);
        assert_eq!(r.streams().open_count(), 0);
        assert_eq!(r.session().session_id.as_deref(), Some("s2"));
        assert_eq!(
            bus.drain(),
            vec![ChatEvent::TranscriptReset { session_id: Some("s2".into()) }]
        );

        r.switch_session(Some("s2".into()));
        assert!(bus.drain().is_empty());
    }

    #[test]
    fn test_router_revision_moves_on_mutation() {
        let (mut r, _, _) = router();
        let before = r.revision();
        r.send_message("hi").unwrap();
        assert!(r.revision() > before);
        let after_send = r.revision();
        r.handle_raw("garbage");
        assert_eq!(r.revision(), after_send);
    }

    // ─── History Paginator Tests ─────────────────────────────

    struct MockHistory {
        records: Vec<HistoryRecord>,
        error: RefCell<Option<ChatError>>,
        calls: RefCell<Vec<(usize, usize)>>,
    }

    impl MockHistory {
        fn with_records(count: usize) -> Self {
            let records = (0..count)
                .map(|i| HistoryRecord {
                    id: format!("r{}", i),
                    role: if i % 2 == 0 { "user".into() } else { "assistant".into() },
                    content: json!(format!("message {}", i)),
                    timestamp: None,
                })
                .collect();
            Self {
                records,
                error: RefCell::new(None),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn failing(error: ChatError) -> Self {
            let mock = Self::with_records(0);
            *mock.error.borrow_mut() = Some(error);
            mock
        }
    }

    #[async_trait(?Send)]
    impl HistoryPort for MockHistory {
        async fn fetch(
            &self,
            _project: &str,
            _session_id: &str,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<HistoryRecord>> {
            self.calls.borrow_mut().push((limit, offset));
            if let Some(e) = self.error.borrow().clone() {
                return Err(e);
            }
            Ok(self.records.iter().skip(offset).take(limit).cloned().collect())
        }
    }

    #[derive(Default)]
    struct MockCache {
        entries: RefCell<HashMap<String, Vec<Message>>>,
        fail: Cell<bool>,
    }

    #[async_trait(?Send)]
    impl MessageCachePort for MockCache {
        async fn load(&self, session_id: &str) -> Result<Option<Vec<Message>>> {
            if self.fail.get() {
                return Err(ChatError::Persistence("disk gone".into()));
            }
            Ok(self.entries.borrow().get(session_id).cloned())
        }

        async fn save(&self, messages: &[Message], session_id: &str) -> Result<()> {
            if self.fail.get() {
                return Err(ChatError::Persistence("disk gone".into()));
            }
            self.entries
                .borrow_mut()
                .insert(session_id.to_string(), messages.to_vec());
            Ok(())
        }
    }

    fn paginator(history: MockHistory) -> (HistoryPaginator, Rc<MockHistory>, Rc<MockCache>) {
        let history = Rc::new(history);
        let cache = Rc::new(MockCache::default());
        let pager = HistoryPaginator::new(history.clone(), cache.clone(), "proj", 50);
        (pager, history, cache)
    }

    #[test]
    fn test_paginator_has_more_follows_page_size() {
        let (pager, _, _) = paginator(MockHistory::with_records(62));
        let first = block_on(pager.load_page("s", 0, 50)).unwrap();
        assert_eq!(first.messages.len(), 50);
        assert!(first.has_more);
        assert_eq!(first.source, PageSource::Remote);

        let second = block_on(pager.load_page("s", 50, 50)).unwrap();
        assert_eq!(second.messages.len(), 12);
        assert!(!second.has_more);
    }

    #[test]
    fn test_paginator_first_page_is_cache_first() {
        let (pager, history, cache) = paginator(MockHistory::with_records(10));
        cache
            .entries
            .borrow_mut()
            .insert("s".into(), vec![Message::inbound("c1", "cached", MessageKind::Text)]);

        let page = block_on(pager.load_page("s", 0, 50)).unwrap();
        assert_eq!(page.source, PageSource::Cache);
        assert_eq!(page.messages[0].id, "c1");
        assert!(!page.has_more);
        assert!(history.calls.borrow().is_empty());
    }

    #[test]
    fn test_paginator_remote_refreshes_cache() {
        let (pager, _, cache) = paginator(MockHistory::with_records(3));
        block_on(pager.load_page("s", 0, 50)).unwrap();
        assert_eq!(cache.entries.borrow().get("s").unwrap().len(), 3);
    }

    #[test]
    fn test_paginator_older_page_merges_into_cache() {
        let (pager, _, cache) = paginator(MockHistory::with_records(60));
        cache
            .entries
            .borrow_mut()
            .insert("s".into(), vec![Message::inbound("newest", "n", MessageKind::Text)]);
        block_on(pager.load_page("s", 50, 50)).unwrap();
        let cached = cache.entries.borrow().get("s").cloned().unwrap();
        assert_eq!(cached.len(), 11);
        assert_eq!(cached.last().unwrap().id, "newest");
    }

    #[test]
    fn test_paginator_not_found_is_empty() {
        let (pager, _, _) = paginator(MockHistory::failing(ChatError::NotFound("session".into())));
        let page = block_on(pager.load_page("s", 0, 50)).unwrap();
        assert!(page.messages.is_empty());
        assert!(!page.has_more);
    }

    #[test]
    fn test_paginator_connectivity_is_recoverable_error() {
        let (pager, _, _) = paginator(MockHistory::failing(ChatError::Network("refused".into())));
        let err = block_on(pager.load_page("s", 0, 50)).unwrap_err();
        assert!(err.is_connectivity());
    }

    #[test]
    fn test_paginator_other_errors_degrade_to_empty() {
        let (pager, _, _) = paginator(MockHistory::failing(ChatError::Serialization("bad".into())));
        let page = block_on(pager.load_page("s", 0, 50)).unwrap();
        assert_eq!(page.source, PageSource::Empty);
    }

    #[test]
    fn test_paginator_cache_failure_falls_through() {
        let (pager, history, cache) = paginator(MockHistory::with_records(2));
        cache.fail.set(true);
        let page = block_on(pager.load_page("s", 0, 50)).unwrap();
        assert_eq!(page.messages.len(), 2);
        assert_eq!(history.calls.borrow().len(), 1);
    }

    #[test]
    fn test_paginator_load_next_advances_cursor() {
        let (pager, history, _) = paginator(MockHistory::with_records(62));
        block_on(pager.load_next("s")).unwrap();
        assert_eq!(pager.cursor("s").offset, 50);
        assert!(pager.cursor("s").has_more);

        let second = block_on(pager.load_next("s")).unwrap();
        assert_eq!(second.messages.len(), 12);
        assert!(!pager.cursor("s").has_more);

        // exhausted: no further fetch
        let third = block_on(pager.load_next("s")).unwrap();
        assert!(third.messages.is_empty());
        assert_eq!(history.calls.borrow().len(), 2);

        pager.reset("s");
        assert_eq!(pager.cursor("s"), PaginationCursor::new(50));
    }

    #[test]
    fn test_paginator_cursor_counts_filtered_records() {
        let mut history = MockHistory::with_records(50);
        history.records[3].content = json!(SESSION_UUID);
        let (pager, _, _) = paginator(history);
        let page = block_on(pager.load_next("s")).unwrap();
        assert_eq!(page.messages.len(), 49);
        assert_eq!(pager.cursor("s").offset, 50);
        assert!(pager.cursor("s").has_more);
    }

    #[test]
    fn test_paginator_refresh_bypasses_cache() {
        let (pager, history, cache) = paginator(MockHistory::with_records(5));
        cache
            .entries
            .borrow_mut()
            .insert("s".into(), vec![Message::inbound("c1", "cached", MessageKind::Text)]);
        let page = block_on(pager.refresh("s")).unwrap();
        assert_eq!(page.source, PageSource::Remote);
        assert_eq!(page.messages.len(), 5);
        assert_eq!(history.calls.borrow().len(), 1);
    }

    #[test]
    fn test_paginator_persist_skips_streaming_and_swallows_errors() {
        let (pager, _, cache) = paginator(MockHistory::with_records(0));
        let mut open = Message::inbound("s1", "partial", MessageKind::Text);
        open.streaming = true;
        let done = Message::inbound("m1", "done", MessageKind::Text);

        block_on(pager.persist("s", &[done, open]));
        assert_eq!(cache.entries.borrow().get("s").unwrap().len(), 1);

        cache.fail.set(true);
        block_on(pager.persist("s", &[]));
    }

    #[test]
    fn test_paginator_cached_pending_messages_become_failed() {
        let (pager, _, cache) = paginator(MockHistory::with_records(0));
        cache
            .entries
            .borrow_mut()
            .insert("s".into(), vec![Message::outbound("never confirmed")]);
        let page = block_on(pager.load_page("s", 0, 50)).unwrap();
        assert_eq!(page.messages[0].status, MessageStatus::Failed);
    }

    #[test]
    fn test_record_to_message() {
        let user = record_to_message(&HistoryRecord {
            id: "u1".into(),
            role: "user".into(),
            content: json!("question"),
            timestamp: Some(t0()),
        })
        .unwrap();
        assert!(user.is_outbound());
        assert_eq!(user.id, "u1");
        assert_eq!(user.status, MessageStatus::Delivered);
        assert_eq!(user.timestamp, t0());

        let assistant = record_to_message(&HistoryRecord {
            id: "a1".into(),
            role: "assistant".into(),
            content: json!([{"type": "text", "text": "```js\nx\n```"}]),
            timestamp: None,
        })
        .unwrap();
        assert_eq!(assistant.direction, Direction::Inbound);
        assert_eq!(assistant.kind, MessageKind::Code);

        assert!(record_to_message(&HistoryRecord {
            id: "n".into(),
            role: "assistant".into(),
            content: json!(SESSION_UUID),
            timestamp: None,
        })
        .is_none());
    }

    // ─── Connection Supervisor Tests ─────────────────────────

    fn supervisor() -> (ConnectionSupervisor, EventBus) {
        let bus = EventBus::new();
        (ConnectionSupervisor::new(ReconnectConfig::default(), bus.clone()), bus)
    }

    #[test]
    fn test_supervisor_connect_flow() {
        let (mut s, bus) = supervisor();
        assert_eq!(s.connect(), SupervisorSignal::Connect);
        assert_eq!(s.state(), ConnectionState::Connecting);
        assert_eq!(s.on_connected(), SupervisorSignal::Connected { resume: false });
        assert_eq!(
            bus.drain(),
            vec![
                ChatEvent::ConnectionChanged {
                    from: ConnectionState::Disconnected,
                    to: ConnectionState::Connecting
                },
                ChatEvent::ConnectionChanged {
                    from: ConnectionState::Connecting,
                    to: ConnectionState::Connected
                },
            ]
        );
    }

    #[test]
    fn test_supervisor_reconnect_signals_resume() {
        let (mut s, _) = supervisor();
        s.connect();
        s.on_connected();

        assert_eq!(
            s.on_transient_loss(),
            SupervisorSignal::ScheduleReconnect { attempt: 1, delay_ms: 250 }
        );
        assert_eq!(s.state(), ConnectionState::Reconnecting);
        assert_eq!(
            s.on_transient_loss(),
            SupervisorSignal::ScheduleReconnect { attempt: 2, delay_ms: 500 }
        );
        assert_eq!(s.on_connected(), SupervisorSignal::Connected { resume: true });
        assert_eq!(s.attempts(), 0);
        assert_eq!(s.snapshot().recovered_sessions, 1);
    }

    #[test]
    fn test_supervisor_gives_up_after_max_attempts() {
        let bus = EventBus::new();
        let policy = ReconnectConfig {
            max_attempts: 3,
            ..ReconnectConfig::default()
        };
        let mut s = ConnectionSupervisor::new(policy, bus);
        s.connect();
        s.on_connected();
        for _ in 0..3 {
            assert!(matches!(s.on_transient_loss(), SupervisorSignal::ScheduleReconnect { .. }));
        }
        assert_eq!(s.on_transient_loss(), SupervisorSignal::GaveUp);
        assert_eq!(s.state(), ConnectionState::Failed);

        // retry from failed is allowed
        assert_eq!(s.connect(), SupervisorSignal::Connect);
    }

    #[test]
    fn test_supervisor_backoff_is_capped() {
        let policy = ReconnectConfig::default();
        let delays: Vec<u64> = (1..=8).map(|a| policy.delay_ms(a)).collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 8000, 8000, 8000]);
    }

    #[test]
    fn test_supervisor_rejects_illegal_transitions() {
        let (mut s, bus) = supervisor();
        assert_eq!(s.on_connected(), SupervisorSignal::Idle);
        assert_eq!(s.on_transient_loss(), SupervisorSignal::Idle);
        assert!(!s.disconnect());
        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert!(bus.drain().is_empty());

        s.connect();
        assert_eq!(s.connect(), SupervisorSignal::Idle);
    }

    #[test]
    fn test_supervisor_error_routing() {
        let (mut s, _) = supervisor();
        s.connect();
        assert!(matches!(
            s.on_error(&ChatError::Network("reset".into())),
            SupervisorSignal::ScheduleReconnect { attempt: 1, .. }
        ));
        assert_eq!(s.on_error(&ChatError::Config("bad url".into())), SupervisorSignal::GaveUp);
        assert_eq!(s.state(), ConnectionState::Failed);
    }

    // ─── Projection Tests ────────────────────────────────────

    #[test]
    fn test_projection_mirrors_router() {
        let (mut r, bus, _) = router();
        let mut view = TranscriptProjection::new();

        r.handle(event(json!({"type": "session-created", "sessionId": "s1"})));
        let (id, _) = r.send_message("hi").unwrap();
        r.handle(event(json!({"type": "stream-chunk", "payload": {"streamId": "a", "content": "he"}})));
        r.handle(event(json!({"type": "stream-chunk", "payload": {"streamId": "a", "content": "llo"}})));
        view.process_events(bus.drain());
        assert!(view.is_streaming());

        r.handle(event(json!({"type": "stream-end", "payload": {"streamId": "a"}})));
        r.handle(event(json!({"type": "tool-use", "payload": {"name": "Read"}})));
        view.process_events(bus.drain());

        assert_eq!(view.messages, r.messages().to_vec());
        assert_eq!(view.session_id.as_deref(), Some("s1"));
        assert_eq!(view.message(&id).unwrap().status, MessageStatus::Delivered);
        assert!(!view.is_streaming());
    }

    #[test]
    fn test_projection_reset_and_history() {
        let (mut r, bus, _) = router();
        let mut view = TranscriptProjection::new();
        r.handle(event(json!({"type": "session-created", "sessionId": "s1"})));
        r.send_message("hi").unwrap();
        r.switch_session(Some("s2".into()));
        r.merge_history(
            "s2",
            Page {
                messages: vec![Message::inbound("old", "earlier", MessageKind::Text)],
                has_more: true,
                source: PageSource::Cache,
            },
        );
        view.process_events(bus.drain());

        assert_eq!(view.messages, r.messages().to_vec());
        assert!(view.has_more_history);
        assert_eq!(view.session_id.as_deref(), Some("s2"));
    }

    #[test]
    fn test_projection_failed_and_connection() {
        let (mut r, bus, clock) = router();
        let mut view = TranscriptProjection::new();
        r.send_message("hi").unwrap();
        clock.advance(secs(31));
        r.expire_timers();
        bus.emit(ChatEvent::ConnectionChanged {
            from: ConnectionState::Connected,
            to: ConnectionState::Reconnecting,
        });
        view.process_events(bus.drain());

        assert_eq!(view.failed().len(), 1);
        assert_eq!(view.connection, ConnectionState::Reconnecting);
        assert_eq!(view.status_text, "Reconnecting...");
    }
}
