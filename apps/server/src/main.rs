//! SyncStream Server - the transmitter host.
//!
//! Runs the whole transmitter side of the control plane: the rolling
//! reference buffer and its HTTP service, the message broker with its
//! WebSocket endpoint, and the group synchronization controller. Designed
//! for headless deployments next to the audio source.

mod config;
mod source;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use syncstream_core::bootstrap_transmitter;
use tokio::signal;

use crate::config::ServerConfig;
use crate::source::{spawn_source, SourceKind};

/// SyncStream Server - drift-synchronized multi-room audio transmitter.
#[derive(Parser, Debug)]
#[command(name = "syncstream-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "SYNCSTREAM_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "SYNCSTREAM_BIND_PORT")]
    port: Option<u16>,

    /// Audio source: `silence` or `tone:<hz>` (overrides config file).
    #[arg(short, long)]
    source: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("SyncStream Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(source) = args.source {
        config.source = source;
    }

    let source_kind = SourceKind::from_str(&config.source)
        .map_err(anyhow::Error::msg)
        .context("Invalid audio source")?;

    log::info!(
        "Configuration: bind={}:{}, source={}, ring={}Hz/{:.0}s",
        config.bind_address,
        config.bind_port,
        config.source,
        config.audio.sample_rate,
        config.audio.buffer_seconds
    );

    // Bootstrap the transmitter services
    let runtime = bootstrap_transmitter(
        config.audio.clone(),
        config.controller.clone(),
        config.bus.clone(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("{}", e))
    .context("Failed to bootstrap services")?;

    log::info!("Services bootstrapped successfully");

    // Feed the reference ring
    spawn_source(
        Arc::clone(&runtime.ring),
        source_kind,
        runtime.cancel_token.clone(),
    );

    // Idle sync_status broadcasts, so dashboards see state between passes
    {
        let controller = Arc::clone(&runtime.controller);
        let cancel = runtime.cancel_token.clone();
        let interval =
            std::time::Duration::from_secs_f32(config.status_broadcast_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => controller.broadcast_sync_status().await,
                }
            }
        });
    }

    // Serve the reference API and the bus WebSocket endpoint
    let app = runtime.router();
    let bind = format!("{}:{}", config.bind_address, config.bind_port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    log::info!("HTTP server listening on {}", bind);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    runtime.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
