//! Operator CLI for the offline engine's persisted state.
//!
//! Runs the same engine the app embeds against the on-disk store, so pending
//! queues can be inspected and replayed and generations installed from a
//! terminal.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docket_common::{init_logging, EngineConfig, LogConfig};
use docket_sw::{EngineBuilder, QueueKind};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "docket-sw")]
#[command(about = "Inspect and drive the Docket offline cache and sync queues")]
struct Args {
    /// JSON config file (defaults to $DOCKET_CONFIG, then built-in defaults)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print entry counts per partition and pending items per queue
    Status,
    /// Precache essential resources and activate the configured version
    Install,
    /// Replay a sync queue against the server
    Drain {
        /// uploads or annotations
        queue: String,
    },
    /// Refetch popular searches into the search partition
    Prewarm,
    /// Delete every partition
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(LogConfig::from_verbosity(args.verbose, args.json))
        .context("initialising logging")?;

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path),
        None => EngineConfig::load(),
    }
    .context("loading configuration")?;

    let (engine, _events) = EngineBuilder::new(config)
        .build()
        .await
        .context("starting engine")?;

    match args.command {
        Command::Status => {
            let status = engine.cache_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Install => {
            engine.install().await.context("install failed")?;
            info!(version = %engine.config().version, "Installed and activated");
            println!("activated {}", engine.config().version);
        }
        Command::Drain { queue } => {
            let kind: QueueKind = queue.parse()?;
            let report = engine
                .handle_sync(kind.sync_tag())
                .await?
                .unwrap_or_default();
            println!(
                "{}: delivered {}, still pending {}",
                kind.name(),
                report.delivered.len(),
                report.failed.len()
            );
        }
        Command::Prewarm => {
            let stored = engine.prewarm_search().await;
            println!("stored {stored} of {} searches", engine.config().popular_searches.len());
        }
        Command::Clear => {
            let cleared = engine.clear_cache().await?;
            println!("cleared {cleared} partitions");
        }
    }

    Ok(())
}
