//! foremand, the Foreman coordinator daemon.
//!
//! Loads configuration, restores the last state snapshot, and serves the
//! RPC surface until SIGINT/SIGTERM, dumping state on the way out. Two
//! background timers drive everything time-based: the pruner applies
//! retry/disable/liveness transitions, and the dumper snapshots state.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use foreman_core::SystemClock;
use foreman_server::http::create_router;
use foreman_server::{Config, JsonlHistory, NopHistory, Scheduler, TaskHistory};

#[derive(Debug, Parser)]
#[command(name = "foremand", about = "Foreman task coordinator daemon", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the bind address, e.g. 0.0.0.0:8082.
    #[arg(long)]
    bind: Option<String>,

    /// Override the state snapshot path.
    #[arg(long)]
    state_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if let Some(state_path) = args.state_path {
        config.scheduler.state_path = state_path;
    }

    let history: Arc<dyn TaskHistory> = match &config.scheduler.history_path {
        Some(path) => {
            info!(path = %path.display(), "task history enabled");
            Arc::new(JsonlHistory::spawn(path.clone()))
        }
        None => Arc::new(NopHistory),
    };

    let scheduler = Arc::new(Scheduler::new(
        config.scheduler.clone(),
        config.resources.clone(),
        Arc::new(SystemClock),
        history,
    ));
    scheduler.load();

    // The first tick fires immediately, applying any time-based transitions
    // that came due while the coordinator was down.
    let pruner = scheduler.clone();
    let prune_interval = std::time::Duration::from_secs(config.scheduler.prune_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(prune_interval);
        loop {
            ticker.tick().await;
            pruner.prune();
        }
    });

    // Skip the immediate first tick; state was just loaded.
    let dumper = scheduler.clone();
    let dump_interval = std::time::Duration::from_secs(config.scheduler.dump_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(dump_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            dumper.dump();
        }
    });

    let listener = TcpListener::bind(&config.server.bind_addr).await?;
    info!(addr = %config.server.bind_addr, "foreman coordinator listening");

    axum::serve(listener, create_router(scheduler.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down; dumping state");
    scheduler.dump();
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");

    tokio::select! {
        _ = interrupt.recv() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to register ctrl-c handler");
    info!("received ctrl-c");
}
