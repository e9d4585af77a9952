//! Deep Tree Echo - headless binary
//!
//! Thin shell around the library: parse flags, wire the composition root,
//! run until a shutdown signal, snapshot on the way out. Transports for
//! incoming and outgoing messages are external; this binary simply logs
//! outgoing traffic.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use deep_tree_echo::config::CoreConfig;
use deep_tree_echo::core::CognitiveCore;
use deep_tree_echo::error::CoreError;
use deep_tree_echo::llm::ScriptedModel;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Deep Tree Echo - autonomous cognitive core
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// TOML configuration file; defaults apply when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// Snapshot file path (overrides configuration)
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Fail startup when no restorable snapshot exists
    #[arg(long)]
    require_restore: bool,

    /// Seed for deterministic runs
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    color_eyre::install().map_err(|e| anyhow::anyhow!("{e}"))?;
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_new(&args.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            CoreConfig::from_toml(&text)?
        }
        None => CoreConfig::default(),
    };
    if let Some(path) = args.snapshot {
        config.persistence.snapshot_path = path;
    }
    if args.require_restore {
        config.persistence.require_restore = true;
    }
    if let Some(seed) = args.seed {
        config.rng_seed = Some(seed);
    }

    info!("Deep Tree Echo waking up");

    let runtime = tokio::runtime::Runtime::new()?;
    let exit = runtime.block_on(run(config));
    match exit {
        Ok(()) => {
            info!("Deep Tree Echo shut down cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "lifecycle failure");
            std::process::exit(1);
        }
    }
}

async fn run(config: CoreConfig) -> Result<(), CoreError> {
    // externally-provided LLM transports attach through the library API;
    // standalone operation uses the deterministic offline voice
    let model = Arc::new(ScriptedModel::offline());
    let core = CognitiveCore::bootstrap(config, model)?;

    let mut outgoing = core
        .take_outgoing()
        .ok_or_else(|| CoreError::Fatal("outgoing channel already taken".to_string()))?;
    let outgoing_logger = tokio::spawn(async move {
        while let Some(message) = outgoing.recv().await {
            info!(to = %message.to, kind = ?message.kind, "outgoing: {}", message.content);
        }
    });

    core.start();

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| CoreError::Transient(format!("signal wait: {e}")))?;
    info!("shutdown signal received");

    core.stop().await?;
    outgoing_logger.abort();
    Ok(())
}
