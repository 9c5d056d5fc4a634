//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use syncstream_core::{BusConfig, ControllerConfig, RingConfig};

/// Transmitter configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP/WS server to.
    /// Override: `SYNCSTREAM_BIND_ADDRESS`
    pub bind_address: String,

    /// Port to bind the HTTP/WS server to.
    /// Override: `SYNCSTREAM_BIND_PORT`
    pub bind_port: u16,

    /// Audio source feeding the reference ring: `silence` or `tone:<hz>`.
    /// Override: `SYNCSTREAM_SOURCE`
    pub source: String,

    /// Seconds between idle `sync_status` broadcasts.
    pub status_broadcast_interval_seconds: f32,

    /// Rolling reference buffer.
    pub audio: RingConfig,

    /// Group synchronization tunables.
    pub controller: ControllerConfig,

    /// Bus queue and reconnect tunables.
    pub bus: BusConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 8080,
            source: "silence".to_string(),
            status_broadcast_interval_seconds: 10.0,
            audio: RingConfig::default(),
            controller: ControllerConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SYNCSTREAM_BIND_ADDRESS") {
            self.bind_address = val;
        }

        if let Ok(val) = std::env::var("SYNCSTREAM_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }

        if let Ok(val) = std::env::var("SYNCSTREAM_SOURCE") {
            self.source = val;
        }
    }
}
