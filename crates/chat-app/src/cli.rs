//! CLI parser.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chat")]
#[command(about = "Chat delivery engine: replay scripted backends, browse history", long_about = None)]
#[command(version)]
pub struct Cli {
    /// JSON config file. Without it the config is read from storage key `chat:config`.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for file-backed storage (overrides `storage.dir`)
    #[arg(long, global = true)]
    pub data_dir: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay a scripted backend conversation on simulated time and print the transcript.
    Replay {
        /// Script file: `> text` sends, `!tick <ms>` advances time, other lines are wire frames.
        #[arg(short, long)]
        script: PathBuf,
        /// Print the final message list as JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Drive the engine from stdin on real time. Same syntax as replay scripts.
    Live,
    /// Fetch history pages for a session through the cache.
    History {
        #[arg(short, long)]
        session: String,
        /// Number of pages to walk back
        #[arg(short, long, default_value = "1")]
        pages: usize,
        /// Skip the cache for the first page
        #[arg(long)]
        refresh: bool,
    },
    /// List sessions with cached history, or drop one session's cache.
    Cache {
        /// Session whose cached list is removed
        #[arg(long)]
        evict: Option<String>,
    },
}
