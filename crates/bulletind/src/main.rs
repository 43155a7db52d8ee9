//! bulletind: the bulletin daemon.
//!
//! Opens the board, keeps expired TTL keys swept, and runs convergence
//! while holding the converge lock. Several daemons may share one store;
//! only the lock holder converges.
//!
//! # Usage
//!
//! ```text
//! bulletind run --config /etc/bulletin/bulletin.toml
//! bulletind print-config > bulletin.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bulletin_board::Bbs;
use bulletin_converger::{Converger, HttpCellClient};
use bulletin_core::BulletinConfig;
use bulletin_lease::KvSessionStore;
use bulletin_store::{RedbStore, RetryPolicy};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::{oneshot, watch};
use tracing::info;

mod sweeper;

#[derive(Parser)]
#[command(name = "bulletind", about = "Bulletin board daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sweep TTL keys and converge the board while holding the converge lock.
    Run {
        /// Path to bulletin.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the default configuration as TOML.
    PrintConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config } => {
            let config = match config {
                Some(path) => BulletinConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => BulletinConfig::default(),
            };
            run(config).await
        }
        Command::PrintConfig => {
            print!("{}", BulletinConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,bulletind=debug,bulletin=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(config: BulletinConfig) -> anyhow::Result<()> {
    info!("bulletin daemon starting");

    // ── Store ──────────────────────────────────────────────────

    let store = match &config.store.path {
        Some(path) => RedbStore::open(path)
            .with_context(|| format!("opening store at {}", path.display()))?,
        None => RedbStore::open_in_memory()?,
    };
    info!(path = ?config.store.path, "kv store opened");

    let bbs = Bbs::new(store.clone())
        .with_retry_policy(RetryPolicy::new(config.store.retry_interval));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────

    let sweeper_handle = tokio::spawn(sweeper::run(
        store.clone(),
        config.sweeper.interval,
        shutdown_rx.clone(),
    ));

    let sessions = KvSessionStore::new(store).with_poll_interval(config.lock.poll_interval);
    let lock = bbs.new_converge_lock(
        sessions,
        &config.lock.owner_id,
        config.lock.ttl,
        config.lock.retry_interval,
    );
    let (ready_tx, ready_rx) = oneshot::channel();
    let mut lock_handle = tokio::spawn(lock.run(shutdown_rx.clone(), ready_tx));

    let cell_client = Arc::new(HttpCellClient::new(config.converger.cell_request_timeout));
    let converger = Converger::new(bbs, cell_client, config.converger.clone());
    let converger_shutdown = shutdown_rx.clone();
    let converger_handle = tokio::spawn(async move {
        // The sender is dropped without signalling when the lock runner
        // exits before acquiring.
        if ready_rx.await.is_ok() {
            info!(owner_id = %config.lock.owner_id, "converge lock acquired");
            converger.run(converger_shutdown).await;
        }
    });

    // ── Wait for Ctrl-C or lock loss ───────────────────────────

    let finished = tokio::select! {
        res = &mut lock_handle => Some(res),
        res = tokio::signal::ctrl_c() => {
            res.context("installing ctrl-c handler")?;
            info!("shutdown signal received");
            None
        }
    };
    let _ = shutdown_tx.send(true);

    let lock_result = match finished {
        Some(res) => res,
        None => lock_handle.await,
    };
    let _ = converger_handle.await;
    let _ = sweeper_handle.await;

    lock_result
        .context("lock runner panicked")?
        .context("converge lock")?;
    info!("bulletin daemon stopped");
    Ok(())
}
