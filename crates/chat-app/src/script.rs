//! Line-oriented driver scripts for replay and live mode.
//!
//! ```text
//! # comment
//! > user text to send
//! {"type":"claude-response","content":"raw wire frame"}
//! !tick 1500
//! !drop
//! ```

use std::time::Duration;

use chat_types::{ChatError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Send user text
    Send(String),
    /// Deliver a raw frame as if the backend sent it
    Frame(String),
    /// Let time pass, then run a timer tick
    Tick(Duration),
    /// The backend connection drops
    Drop,
    /// Backend refuses (`false`) or accepts (`true`) new connections
    Reachable(bool),
    /// Manual connect, e.g. after the supervisor gave up
    Reconnect,
    Abort,
    /// Retry the most recent failed message
    Retry,
    /// Load the page above the first message
    Older,
    Switch(Option<String>),
}

/// Parse a whole script. Blank lines and `#` comments are skipped.
pub fn parse_script(source: &str) -> Result<Vec<Directive>> {
    let mut directives = Vec::new();
    for (idx, line) in source.lines().enumerate() {
        if let Some(directive) =
            parse_line(line).map_err(|e| ChatError::Config(format!("line {}: {}", idx + 1, e)))?
        {
            directives.push(directive);
        }
    }
    Ok(directives)
}

pub fn parse_line(line: &str) -> Result<Option<Directive>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    if let Some(text) = line.strip_prefix('>') {
        return Ok(Some(Directive::Send(text.trim_start().to_string())));
    }

    if line.starts_with('{') {
        // Checked here so a typo points at the script line, not a dropped frame
        serde_json::from_str::<serde_json::Value>(line)?;
        return Ok(Some(Directive::Frame(line.to_string())));
    }

    let Some(command) = line.strip_prefix('!') else {
        return Err(ChatError::Config(format!("unrecognized line: {}", line)));
    };
    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let arg = parts.next();

    let directive = match (name, arg) {
        ("tick", None) => Directive::Tick(Duration::ZERO),
        ("tick", Some(ms)) => {
            let ms: u64 = ms
                .parse()
                .map_err(|_| ChatError::Config(format!("bad tick duration: {}", ms)))?;
            Directive::Tick(Duration::from_millis(ms))
        }
        ("drop", None) => Directive::Drop,
        ("offline", None) => Directive::Reachable(false),
        ("online", None) => Directive::Reachable(true),
        ("reconnect", None) => Directive::Reconnect,
        ("abort", None) => Directive::Abort,
        ("retry", None) => Directive::Retry,
        ("older", None) => Directive::Older,
        ("switch", session) => Directive::Switch(session.map(str::to_string)),
        _ => return Err(ChatError::Config(format!("unknown directive: !{}", command))),
    };
    Ok(Some(directive))
}
