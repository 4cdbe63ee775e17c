//! Composition root: builds the adapters, hands them to the engine and
//! drives it for each CLI mode.

use std::path::Path;
use std::rc::Rc;

use chrono::Utc;
use tokio::io::AsyncBufReadExt;

use chat_core::connection::LifecycleSnapshot;
use chat_core::engine::{ChatEngine, EngineHandle, EngineInput, EnginePorts};
use chat_core::event_bus::EventBus;
use chat_core::history::HistoryPaginator;
use chat_core::ports::{
    Clock, HistoryPort, ManualClock, MessageCachePort, StoragePort, SystemClock,
};
use chat_core::projection::TranscriptProjection;
use chat_platform::cache::KvMessageCache;
use chat_platform::storage::auto_detect_storage;
use chat_platform::transport::{ChannelTransport, RemoteEnd};
use chat_types::{
    config::ChatConfig, connection::ConnectionState, event::OutboundCommand, ChatError, Result,
};

use crate::render::{describe_event, render_message};
use crate::script::{parse_line, Directive};

pub const CONFIG_STORAGE_KEY: &str = "chat:config";

/// Read a JSON config file
pub async fn load_config_file(path: &Path) -> Result<ChatConfig> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))
}

/// Config saved in storage, if any. Unreadable entries are ignored.
pub async fn restore_config(storage: &dyn StoragePort) -> Option<ChatConfig> {
    match storage.get(CONFIG_STORAGE_KEY).await {
        Ok(Some(data)) => match serde_json::from_slice::<ChatConfig>(&data) {
            Ok(config) => {
                log::info!("Config restored from storage");
                Some(config)
            }
            Err(e) => {
                log::warn!("Ignoring stored config: {}", e);
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            log::warn!("Could not read stored config: {}", e);
            None
        }
    }
}

pub async fn save_config(storage: &dyn StoragePort, config: &ChatConfig) -> Result<()> {
    let json = serde_json::to_vec(config)?;
    storage.set(CONFIG_STORAGE_KEY, &json).await?;
    log::info!("Config saved to storage");
    Ok(())
}

/// Resolve config and storage together: an explicit file wins, otherwise
/// the config stored in the opened backend, otherwise defaults.
pub async fn bootstrap(
    config_path: Option<&Path>,
    data_dir: Option<&str>,
) -> Result<(ChatConfig, Rc<dyn StoragePort>)> {
    let explicit = match config_path {
        Some(path) => Some(load_config_file(path).await?),
        None => None,
    };
    let mut config = explicit.clone().unwrap_or_default();
    if let Some(dir) = data_dir {
        config.storage.dir = Some(dir.to_string());
    }

    let storage = auto_detect_storage(&config.storage).await?;
    if explicit.is_some() {
        save_config(storage.as_ref(), &config).await?;
    } else if let Some(mut stored) = restore_config(storage.as_ref()).await {
        stored.storage = config.storage.clone();
        config = stored;
    }
    Ok((config, storage))
}

// ─── Engine wiring ───────────────────────────────────────────

struct Wired {
    engine: ChatEngine,
    handle: EngineHandle,
    remote: RemoteEnd,
    bus: EventBus,
}

fn wire(
    config: &ChatConfig,
    history: Rc<dyn HistoryPort>,
    storage: Rc<dyn StoragePort>,
    clock: Rc<dyn Clock>,
) -> Wired {
    let (transport, remote) = ChannelTransport::pair();
    let bus = EventBus::new();
    let ports = EnginePorts {
        transport: Rc::new(transport),
        history,
        cache: Rc::new(KvMessageCache::new(storage)),
    };
    let (engine, handle) = ChatEngine::new(config, ports, bus.clone(), clock);
    Wired {
        engine,
        handle,
        remote,
        bus,
    }
}

/// Engine inputs for one directive. Time is advanced by the caller.
fn inputs_for(
    directive: Directive,
    remote: &RemoteEnd,
    view: &TranscriptProjection,
) -> Vec<EngineInput> {
    match directive {
        Directive::Send(text) => vec![EngineInput::Send(text)],
        Directive::Frame(raw) => vec![EngineInput::Frame(raw)],
        Directive::Tick(_) => vec![EngineInput::Tick],
        Directive::Drop => {
            remote.drop_connection();
            vec![EngineInput::TransportLost]
        }
        Directive::Reachable(reachable) => {
            remote.set_reachable(reachable);
            Vec::new()
        }
        Directive::Reconnect => vec![EngineInput::Connect],
        Directive::Abort => vec![EngineInput::Abort],
        Directive::Retry => match view.failed().last() {
            Some(message) => vec![EngineInput::Retry(message.id.clone())],
            None => {
                log::info!("Nothing to retry");
                Vec::new()
            }
        },
        Directive::Older => vec![EngineInput::LoadOlder],
        Directive::Switch(session) => vec![EngineInput::SwitchSession(session)],
    }
}

// ─── Replay ──────────────────────────────────────────────────

pub struct ReplayReport {
    pub transcript: TranscriptProjection,
    /// Every command the client put on the wire, in order
    pub sent: Vec<OutboundCommand>,
    pub connection: ConnectionState,
    pub lifecycle: LifecycleSnapshot,
}

/// Run a script against the engine on simulated time. Each directive is
/// fully processed, including the I/O it starts, before the next one.
pub async fn replay(
    config: &ChatConfig,
    directives: Vec<Directive>,
    history: Rc<dyn HistoryPort>,
    storage: Rc<dyn StoragePort>,
) -> Result<ReplayReport> {
    let clock = ManualClock::new(Utc::now());
    let Wired {
        mut engine,
        handle,
        mut remote,
        bus,
    } = wire(config, history, storage, Rc::new(clock.clone()));

    let mut transcript = TranscriptProjection::new();
    let mut sent = Vec::new();

    handle.submit(EngineInput::Connect)?;
    settle(&mut engine, &bus, &mut remote, &mut transcript, &mut sent).await;

    for directive in directives {
        log::debug!("Replaying {:?}", directive);
        if let Directive::Tick(by) = &directive {
            clock.advance(*by);
        }
        for input in inputs_for(directive, &remote, &transcript) {
            handle.submit(input)?;
        }
        settle(&mut engine, &bus, &mut remote, &mut transcript, &mut sent).await;
    }

    let connection = engine.supervisor().state();
    let lifecycle = engine.supervisor().snapshot();

    handle.shutdown()?;
    settle(&mut engine, &bus, &mut remote, &mut transcript, &mut sent).await;

    Ok(ReplayReport {
        transcript,
        sent,
        connection,
        lifecycle,
    })
}

async fn settle(
    engine: &mut ChatEngine,
    bus: &EventBus,
    remote: &mut RemoteEnd,
    transcript: &mut TranscriptProjection,
    sent: &mut Vec<OutboundCommand>,
) {
    engine.run_until_idle().await;
    transcript.process_events(bus.drain());
    sent.extend(remote.drain_commands());
}

// ─── Live ────────────────────────────────────────────────────

/// Drive the engine from stdin on wall-clock time until EOF.
/// Must run inside a `LocalSet`; the engine is spawned as a local task.
pub async fn live(
    config: &ChatConfig,
    history: Rc<dyn HistoryPort>,
    storage: Rc<dyn StoragePort>,
) -> Result<()> {
    let Wired {
        engine,
        handle,
        mut remote,
        bus,
    } = wire(config, history, storage, Rc::new(SystemClock));

    let engine_task = tokio::task::spawn_local(engine.run());
    let mut view = TranscriptProjection::new();
    let mut ticker = tokio::time::interval(config.timeouts.tick());
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    handle.submit(EngineInput::Connect)?;
    loop {
        let mut directive = None;
        tokio::select! {
            line = lines.next_line() => {
                let line = line.map_err(|e| ChatError::Other(format!("stdin: {}", e)))?;
                let Some(line) = line else { break };
                match parse_line(&line) {
                    Ok(parsed) => directive = parsed,
                    Err(e) => eprintln!("{}", e),
                }
            }
            frame = remote.next_frame() => {
                if let Some(frame) = frame {
                    println!("-> {}", frame);
                }
            }
            _ = ticker.tick() => {
                handle.tick()?;
            }
        }

        if let Some(directive) = directive {
            for input in inputs_for(directive, &remote, &view) {
                handle.submit(input)?;
            }
        }
        for event in bus.drain() {
            if let Some(line) = describe_event(&event) {
                println!("{}", line);
            }
            view.apply(event);
        }
    }

    handle.shutdown()?;
    engine_task
        .await
        .map_err(|e| ChatError::Other(format!("engine task: {}", e)))?;
    for frame in std::iter::from_fn(|| remote.try_next_frame()) {
        println!("-> {}", frame);
    }
    Ok(())
}

// ─── History ─────────────────────────────────────────────────

/// Walk back `pages` pages of a session's history and print them
pub async fn browse_history(
    config: &ChatConfig,
    history: Rc<dyn HistoryPort>,
    storage: Rc<dyn StoragePort>,
    session_id: &str,
    pages: usize,
    refresh: bool,
) -> Result<()> {
    let paginator = HistoryPaginator::new(
        history,
        Rc::new(KvMessageCache::new(storage)),
        config.transport.project_path.clone(),
        config.history.page_size,
    );

    for n in 0..pages.max(1) {
        let page = if n == 0 && refresh {
            paginator.refresh(session_id).await?
        } else {
            paginator.load_next(session_id).await?
        };
        println!(
            "page {} ({:?}, {} message(s))",
            n + 1,
            page.source,
            page.messages.len()
        );
        for message in &page.messages {
            println!("{}", render_message(message));
        }
        if !page.has_more {
            println!("(start of history)");
            break;
        }
    }
    Ok(())
}

// ─── Cache ───────────────────────────────────────────────────

/// Cached sessions with the number of messages each holds
pub async fn cached_sessions(cache: &KvMessageCache) -> Result<Vec<(String, usize)>> {
    let mut listing = Vec::new();
    for session in cache.sessions().await? {
        let count = cache.load(&session).await?.map_or(0, |m| m.len());
        listing.push((session, count));
    }
    Ok(listing)
}

/// Drop one session's cached list. Returns false when nothing was cached.
pub async fn evict_cached(cache: &KvMessageCache, session_id: &str) -> Result<bool> {
    if !cache.sessions().await?.iter().any(|s| s == session_id) {
        return Ok(false);
    }
    cache.evict(session_id).await?;
    log::info!("Evicted cached history for {}", session_id);
    Ok(true)
}
