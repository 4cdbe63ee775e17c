//! chat: composition root binary.
//!
//! Wires the engine to the native adapters and exposes three modes:
//! scripted replay on simulated time, a live stdin driver, and a history
//! browser.

mod app;
mod cli;
mod render;
mod script;


use std::rc::Rc;

use clap::Parser;

use chat_core::ports::HistoryPort;
use chat_platform::cache::KvMessageCache;
use chat_platform::history::HttpHistoryClient;
use chat_types::{ChatError, Result};

use cli::{Cli, Commands};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    // Ports are Rc-based, so everything runs on one thread inside a LocalSet
    let local = tokio::task::LocalSet::new();
    if let Err(e) = local.block_on(&runtime, run(cli)) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let (config, storage) = app::bootstrap(cli.config.as_deref(), cli.data_dir.as_deref()).await?;
    log::info!(
        "Using {} storage, history at {}",
        storage.backend_name(),
        config.history.base_url
    );
    let history: Rc<dyn HistoryPort> = Rc::new(HttpHistoryClient::new(&config.history)?);

    match cli.command {
        Commands::Replay { script: path, json } => {
            let source = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))?;
            let directives = script::parse_script(&source)?;
            let report = app::replay(&config, directives, history, storage).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report.transcript.messages)?);
            } else {
                print!("{}", render::render_transcript(&report.transcript));
                for command in &report.sent {
                    println!("-> {}", serde_json::to_string(command)?);
                }
                println!(
                    "connection: {:?} (reconnects {}, resumed {})",
                    report.connection,
                    report.lifecycle.reconnect_attempts,
                    report.lifecycle.recovered_sessions
                );
            }
            Ok(())
        }
        Commands::Live => app::live(&config, history, storage).await,
        Commands::History {
            session,
            pages,
            refresh,
        } => app::browse_history(&config, history, storage, &session, pages, refresh).await,
        Commands::Cache { evict } => {
            let cache = KvMessageCache::new(storage);
            if let Some(session) = evict {
                let removed = app::evict_cached(&cache, &session).await?;
                println!("{}: {}", session, if removed { "evicted" } else { "not cached" });
            }
            for (session, count) in app::cached_sessions(&cache).await? {
                println!("{}\t{} message(s)", session, count);
            }
            Ok(())
        }
    }
}
