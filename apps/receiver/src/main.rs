//! SyncStream Receiver - the playback node agent.
//!
//! Connects to a transmitter, registers itself, measures playback drift
//! against the reference audio and forwards offset assignments to the
//! configured output stage. Without capture hardware it runs with a
//! simulated microphone that replays reference audio at a fixed latency,
//! which exercises the full closed loop.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use syncstream_core::agent::capture::SimulatedMicCapture;
use syncstream_core::{
    bootstrap_receiver, create_output, ChunkQueue, DeviceIdentity, HttpReferenceClient,
    MicCapture, QueueMicCapture, ReferenceSource,
};
use tokio::signal;

use crate::config::ReceiverConfig;

/// SyncStream Receiver - drift-measuring playback node.
#[derive(Parser, Debug)]
#[command(name = "syncstream-receiver")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "SYNCSTREAM_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Transmitter base URL (overrides config file).
    #[arg(short, long, env = "SYNCSTREAM_TRANSMITTER_URL")]
    transmitter: Option<String>,

    /// Device id (overrides config file; defaults to the hostname).
    #[arg(short, long)]
    device_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("SyncStream Receiver v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ReceiverConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(transmitter) = args.transmitter {
        config.transmitter_url = transmitter;
    }
    if let Some(device_id) = args.device_id {
        config.device_name = device_id.clone();
        config.device_id = device_id;
    }

    log::info!(
        "Configuration: device_id={}, group={}, transmitter={}",
        config.device_id,
        config.sync_group,
        config.transmitter_url
    );

    let identity = DeviceIdentity {
        device_id: config.device_id.clone(),
        device_name: config.device_name.clone(),
        device_type: config.device_type(),
        location: config.location.clone(),
        base_latency_ms: config.base_latency_ms,
        sync_group: config.sync_group.clone(),
        capabilities: vec!["set_delay".to_string(), "set_volume".to_string()],
        ip_address: local_ip_address::local_ip().ok().map(|ip| ip.to_string()),
    };

    // Reference audio comes over HTTP from the transmitter.
    let reference = Arc::new(
        HttpReferenceClient::new(config.transmitter_url.clone())
            .map_err(|e| anyhow::anyhow!("{}", e))?,
    );
    if let Err(e) = reference.health_check().await {
        log::warn!("Transmitter not reachable yet: {}", e);
    }

    // Microphone: simulated against the reference, or a chunk queue an
    // external capture producer feeds.
    let capture: Arc<dyn MicCapture> = match config.simulated_latency_ms {
        Some(latency_ms) => {
            log::info!("Using simulated microphone ({}ms latency)", latency_ms);
            Arc::new(SimulatedMicCapture::new(
                Arc::clone(&reference) as Arc<dyn ReferenceSource>,
                config.sample_rate,
                latency_ms,
            ))
        }
        None => {
            log::info!("Using capture queue (external producer expected)");
            Arc::new(QueueMicCapture::new(ChunkQueue::new(config.sample_rate, 64)))
        }
    };

    let output = create_output(&config.output);

    let runtime = bootstrap_receiver(
        identity,
        config.agent.clone(),
        config.bus.clone(),
        &config.bus_url(),
        reference,
        capture,
        output,
    )
    .await
    .map_err(|e| anyhow::anyhow!("{}", e))
    .context("Failed to bootstrap receiver")?;

    log::info!("Receiver running; press Ctrl+C to stop");

    // Wait for shutdown signal or a remote shutdown command
    let cancel = runtime.cancel_token.clone();
    tokio::select! {
        () = shutdown_signal() => {
            log::info!("Shutdown signal received, cleaning up...");
            runtime.shutdown().await;
        }
        () = cancel.cancelled() => {
            log::info!("Shutdown command received, cleaning up...");
        }
    }

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
