//! # Telecast
//!
//! Scheduled message delivery engine: scans stored schedules for due
//! (message, destination, instant) triples and delivers each exactly once
//! through a rate-limited worker pool.
//!
//! Usage:
//!   telecast run                 # Scan loop + delivery workers
//!   telecast scan                # One scan cycle, deliver due work, exit
//!   telecast send --id <id>      # Force-process one message, ignore window
//!   telecast status              # Operational snapshot as JSON
//!   telecast reconcile           # Finalize claims left by crashed workers

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use telecast_channels::TelegramGateway;
use telecast_core::TelecastConfig;
use telecast_db::Database;
use telecast_scheduler::{Engine, Reconciler};

#[derive(Parser)]
#[command(
    name = "telecast",
    version,
    about = "Telecast — scheduled message delivery engine"
)]
struct Cli {
    /// Config file path (default: ~/.telecast/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scan loop and delivery workers until stopped
    Run,
    /// Run one scan cycle, deliver the due work, and exit
    Scan,
    /// Force-process one message, bypassing the time window
    Send {
        /// Message id
        #[arg(long)]
        id: String,
    },
    /// Print an operational snapshot as JSON
    Status,
    /// Finalize claims abandoned by crashed workers
    Reconcile,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "telecast=debug"
    } else {
        "telecast=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => TelecastConfig::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => TelecastConfig::load().context("loading config")?,
    };

    let db = Arc::new(Database::open(&expand_path(&config.storage.db_path))?);

    match cli.command {
        Command::Run => {
            let engine = build_engine(db, config)?;
            engine.run().await;
            Ok(())
        }
        Command::Scan => {
            let engine = build_engine(db, config)?;
            let report = engine.scanner().run().await?;
            let delivered = engine.drain().await;
            tracing::info!(
                "Scan {:?}: {} emitted, {} processed",
                report.outcome,
                report.items_emitted,
                delivered
            );
            Ok(())
        }
        Command::Send { id } => {
            let engine = build_engine(db, config)?;
            let emitted = engine.scanner().force_message(&id).await?;
            let delivered = engine.drain().await;
            tracing::info!("Forced message {id}: {emitted} emitted, {delivered} processed");
            Ok(())
        }
        Command::Status => {
            // Lane state lives inside a running engine process; from here the
            // snapshot reports the store-derived fields.
            let engine = build_engine_unchecked(db, config);
            let snapshot = engine.monitor().snapshot().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Command::Reconcile => {
            let swept = Reconciler::new(db, config.delivery.stale_claim_secs).sweep()?;
            tracing::info!("Reconciled {swept} stale claims");
            Ok(())
        }
    }
}

fn build_engine(db: Arc<Database>, config: TelecastConfig) -> Result<Engine> {
    if !config.telegram.enabled {
        bail!("telegram gateway is disabled in config");
    }
    if config.telegram.bot_token.is_empty() {
        bail!("telegram.bot_token is not configured");
    }
    Ok(build_engine_unchecked(db, config))
}

fn build_engine_unchecked(db: Arc<Database>, config: TelecastConfig) -> Engine {
    let gateway = Arc::new(TelegramGateway::new(config.telegram.clone()));
    Engine::new(db, config, gateway)
}
