//! Media Relay Application
//!
//! Receives a live stream and relays it to one or more egress peers.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use media_relay::{
    config::{init_logging, RelayConfig},
    net::SystemWanResolver,
    relay::{Backends, Relay},
};

#[derive(Parser, Debug)]
#[command(name = "media-relay", version, about = "Low-latency live stream relay")]
struct Cli {
    /// Configuration file (JSON, or TOML by extension)
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli.config.unwrap_or_else(RelayConfig::default_path);
    let config = RelayConfig::load(&path).with_context(|| format!("loading {}", path.display()))?;

    init_logging(&config.logging, cli.log_level.as_deref())?;
    tracing::info!("Starting Media Relay with {}", path.display());

    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let loop_token = shutdown.clone();
    let worker = tokio::task::spawn_blocking(move || -> Result<()> {
        let mut relay = Relay::from_config(&config, Backends::system()?, &SystemWanResolver, &loop_token)?;
        relay.run(&loop_token)?;
        Ok(())
    });

    let result = worker.await.context("relay task panicked")?;
    shutdown.cancel();
    result?;

    tracing::info!("Media Relay stopped");
    Ok(())
}

/// Resolve on Ctrl-C, or on SIGTERM where available
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for interrupt: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => tracing::info!("Received interrupt, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
