//! vmgridd: the vmgrid node daemon.
//!
//! Single binary run on every cluster node:
//! - Shared store (redb)
//! - Distributed locks + stale lock sweeper
//! - Per-node work queues
//! - Scheduler capacity summaries
//!
//! # Usage
//!
//! ```text
//! vmgridd --config /etc/vmgrid/vmgrid.toml run
//! vmgridd summarize
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vmgrid_coord::{LockManager, StateCache};
use vmgrid_core::GridConfig;
use vmgrid_scheduler::Scheduler;
use vmgrid_store::KvStore;

const DEFAULT_LOG_FILTER: &str = "info,vmgridd=debug,vmgrid=debug";

#[derive(Parser)]
#[command(name = "vmgridd", about = "vmgrid node daemon")]
struct Cli {
    /// TOML configuration file. `VMGRID_*` environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run this node's queue workers until interrupted.
    Run,
    /// Print the spare capacity of every active node as JSON.
    Summarize,
    /// Print the effective configuration as TOML.
    Config,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = GridConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Summarize => summarize(config).await,
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config: GridConfig) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut node = tokio::spawn(vmgridd::run_node(config, vmgridd::logging_handler(), shutdown_rx));

    // Graceful shutdown on Ctrl-C, unless startup failed first.
    tokio::select! {
        result = &mut node => return result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown signal received");
        }
    }
    let _ = shutdown_tx.send(true);

    node.await?
}

async fn summarize(config: GridConfig) -> anyhow::Result<()> {
    let store = KvStore::open(&config.store_path())?;
    let cache = StateCache::new(LockManager::from_config(store.clone(), &config));
    let mut scheduler = Scheduler::new(store, cache, &config);

    let summary = scheduler.summarize_resources().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
