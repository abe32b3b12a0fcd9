//! CUEpoint host server
//!
//! Owns the event loop, one session per open track and their auto-save
//! debouncers. GUI and CLI clients talk to it over newline-delimited JSON.

mod config;
mod server;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Mutex;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use config::Config;
use cuepoint_core::Config as EngineConfig;

#[derive(Parser)]
#[command(name = "cuepoint-server")]
#[command(about = "Cue and metadata persistence engine for DJ libraries")]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:7878")]
    bind: String,

    /// Engine configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Worker threads for batch reads
    #[arg(long, default_value = "4")]
    max_workers: usize,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("CUEpoint server starting");

    let engine = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            EngineConfig::load(path)?
        }
        None => EngineConfig::default(),
    };
    engine.validate()?;

    if cli.max_workers == 0 {
        anyhow::bail!("--max-workers must be at least 1");
    }

    let config = Config {
        bind_addr: cli.bind,
        max_workers: cli.max_workers,
        engine,
    };
    info!(
        "Auto-save {} ({} ms debounce), conflict resolution {:?}",
        if config.engine.auto_save { "on" } else { "off" },
        config.engine.auto_save_debounce_ms,
        config.engine.conflict_resolution
    );

    let state = Arc::new(Mutex::new(server::ServerState::new(config)));

    tokio::select! {
        result = server::run(Arc::clone(&state)) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down, flushing open tracks");
            server::close_all(&state).await;
        }
    }

    Ok(())
}
