#![forbid(unsafe_code)]

//! **aegis-service** – Service binary for the Aegis kernel.
//!
//! Loads the validated runtime configuration from environment flags
//! (honouring a `.env` file), assembles the kernel with its lease sweeper,
//! and serves the HTTP surface until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aegis_runtime::{Runtime, RuntimeConfig, StorageConfig};
use aegis_service::{router, AppState};

#[derive(Parser)]
#[command(name = "aegis-service")]
#[command(about = "Aegis kernel service - approvals, runs, leases, and the event stream")]
#[command(version)]
struct Cli {
    /// Database path (overrides AEGIS_DB_PATH; ":memory:" for ephemeral)
    #[arg(long)]
    db_path: Option<String>,

    /// Bind address for the HTTP surface
    #[arg(long, env = "AEGIS_BIND_ADDR", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Log filter (tracing env-filter syntax)
    #[arg(long, env = "AEGIS_LOG", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&cli.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = RuntimeConfig::from_env().context("invalid environment configuration")?;
    if let Some(db_path) = cli.db_path {
        config.storage = if db_path == ":memory:" {
            StorageConfig::InMemory
        } else {
            StorageConfig::File(db_path)
        };
    }

    let runtime = Runtime::new(config).await.context("failed to assemble the kernel")?;
    let state = AppState { kernel: Arc::clone(runtime.kernel()) };

    let listener = tokio::net::TcpListener::bind(&cli.bind)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind))?;
    info!(addr = %cli.bind, "aegis service listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    runtime.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
