//! Receiver configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use syncstream_core::{AgentConfig, BusConfig, DeviceType, OutputConfig};

/// Receiver configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Base URL of the transmitter's HTTP service.
    /// Override: `SYNCSTREAM_TRANSMITTER_URL`
    pub transmitter_url: String,

    /// Unique device id; defaults to the hostname when empty.
    /// Override: `SYNCSTREAM_DEVICE_ID`
    pub device_id: String,

    /// Human-readable device name; defaults to the device id when empty.
    pub device_name: String,

    /// Where this receiver sits (free-form, e.g. "kitchen").
    pub location: Option<String>,

    /// Static output latency calibration (milliseconds).
    pub base_latency_ms: f32,

    /// Sync group this receiver plays in.
    pub sync_group: String,

    /// Output stage to drive.
    pub output: OutputConfig,

    /// Capture sample rate; must match the transmitter's ring.
    pub sample_rate: u32,

    /// When set, no real microphone is used: the "mic" replays reference
    /// audio delayed by this many milliseconds, exercising the full
    /// closed loop without hardware.
    pub simulated_latency_ms: Option<f32>,

    /// Agent loop tunables.
    pub agent: AgentConfig,

    /// Bus reconnect tunables.
    pub bus: BusConfig,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            transmitter_url: "http://localhost:8080".to_string(),
            device_id: String::new(),
            device_name: String::new(),
            location: None,
            base_latency_ms: 0.0,
            sync_group: "default".to_string(),
            output: OutputConfig::Alsa { device_name: None },
            sample_rate: 44_100,
            simulated_latency_ms: Some(120.0),
            agent: AgentConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

impl ReceiverConfig {
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
        config.fill_identity_defaults();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SYNCSTREAM_TRANSMITTER_URL") {
            self.transmitter_url = val;
        }
        if let Ok(val) = std::env::var("SYNCSTREAM_DEVICE_ID") {
            self.device_id = val;
        }
    }

    /// Fills the device id and name from the host when not configured.
    fn fill_identity_defaults(&mut self) {
        if self.device_id.is_empty() {
            self.device_id = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "syncstream-receiver".to_string());
        }
        if self.device_name.is_empty() {
            self.device_name = self.device_id.clone();
        }
    }

    /// The transmitter's bus WebSocket endpoint, derived from the HTTP URL.
    pub fn bus_url(&self) -> String {
        let base = self.transmitter_url.trim_end_matches('/');
        let ws = base
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/ws", ws)
    }

    /// The protocol device type of the configured output.
    pub fn device_type(&self) -> DeviceType {
        self.output.device_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ReceiverConfig::default();
        assert!(config.agent.validate().is_ok());
        assert!(config.bus.validate().is_ok());
    }

    #[test]
    fn bus_url_is_derived_from_http_url() {
        let mut config = ReceiverConfig::default();
        config.transmitter_url = "http://transmitter:8080/".to_string();
        assert_eq!(config.bus_url(), "ws://transmitter:8080/ws");

        config.transmitter_url = "https://transmitter".to_string();
        assert_eq!(config.bus_url(), "wss://transmitter/ws");
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let mut config: ReceiverConfig =
            serde_yaml::from_str("device_id: kitchen\nsync_group: main_floor\n").unwrap();
        config.fill_identity_defaults();
        assert_eq!(config.device_id, "kitchen");
        assert_eq!(config.device_name, "kitchen");
        assert_eq!(config.sync_group, "main_floor");
        assert_eq!(config.transmitter_url, "http://localhost:8080");
    }
}
