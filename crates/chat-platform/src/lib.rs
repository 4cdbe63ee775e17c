//! Platform adapters for the chat engine.
//!
//! Each module implements one of the `chat-core` port traits on top of a
//! concrete runtime facility (tokio file I/O, reqwest, in-process channels).
//! Nothing here holds chat state; the engine owns all of it.

pub mod storage;
pub mod cache;
pub mod history;
pub mod transport;
