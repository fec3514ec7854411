//! `parleyd` — the Parley network node server binary.
//!
//! Loads configuration, builds and starts a [`parley::Network`], serves the
//! ambient HTTP health/status endpoint alongside it, and shuts both down
//! gracefully on `SIGINT`/`SIGTERM`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parley::config::{LogFormat, NetworkConfig};
use parley::mods::ModHost;
use parley::orchestrator::Network;
use parley::snapshot;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command-line options for the `parleyd` server.
#[derive(Debug, Parser)]
#[command(name = "parleyd", version, about = "Parley multi-agent network node")]
struct Args {
    /// Path to a YAML configuration file. Falls back to a development
    /// configuration if omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_tracing(config: &NetworkConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.observability.log_filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("parley=info"));
    match config.observability.log_format {
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => NetworkConfig::load_from_file(path).context("failed to load configuration")?,
        None => NetworkConfig::development(),
    };

    init_tracing(&config)?;
    info!(network_name = %config.network.name, mode = ?config.network.mode, "starting parleyd");

    let snapshot_path = config.snapshot.path.clone();
    if config.snapshot.enabled {
        match snapshot::load_snapshot(&snapshot_path).await {
            Ok(Some(snapshot)) => {
                info!(agent_count = snapshot.agents.len(), "found prior snapshot (directory rehydration is not yet wired into registration)");
            }
            Ok(None) => {}
            Err(err) => warn!(%err, "failed to load snapshot, starting with an empty directory"),
        }
    }

    let mod_host = Arc::new(ModHost::build(&config));
    let network = Arc::new(Network::new(config.clone(), mod_host).context("failed to build network")?);
    network.start().await.context("failed to start network")?;
    info!(node_id = %network.node_id(), "parleyd is ready");

    let shutdown_token = CancellationToken::new();
    let http_addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], config.network.port.saturating_add(1000)));
    let router = parley::server::create_router(Arc::clone(&network));
    let http_handle = match parley::server::bind(http_addr).await {
        Ok((listener, actual_addr)) => {
            info!(%actual_addr, "health/status endpoint listening");
            let token = shutdown_token.clone();
            Some(tokio::spawn(async move {
                if let Err(err) = parley::server::serve_with_graceful_shutdown(listener, router, token).await {
                    warn!(%err, "health/status server exited with an error");
                }
            }))
        }
        Err(err) => {
            warn!(%err, "could not bind health/status endpoint; continuing without it");
            None
        }
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    shutdown_token.cancel();
    if let Some(handle) = http_handle {
        let _ = handle.await;
    }
    network.shutdown().await;

    if config.snapshot.enabled {
        if let Err(err) = snapshot::write_snapshot(&network, &snapshot_path).await {
            warn!(%err, "failed to write final snapshot");
        }
    }

    info!("parleyd shut down cleanly");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
