//! Configuration types for the synchronization control plane.
//!
//! All tunables are plain values handed to components at construction.
//! Nothing in the core reads configuration from globals; changes arrive by
//! rebuilding a component or through [`SyncController::reconfigure`]
//! (see `sync::controller`).

use serde::{Deserialize, Serialize};

/// Configuration for the transmitter's rolling audio buffer.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RingConfig {
    /// Audio sample rate in Hz.
    pub sample_rate: u32,

    /// Number of audio channels stored in the ring.
    pub channels: u16,

    /// Seconds of audio retained for historical reads.
    pub buffer_seconds: f32,
}

impl RingConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate == 0 {
            return Err("sample_rate must be >= 1".to_string());
        }
        if self.channels == 0 || self.channels > 2 {
            return Err("channels must be 1 or 2".to_string());
        }
        if self.buffer_seconds <= 0.0 {
            return Err("buffer_seconds must be > 0".to_string());
        }
        Ok(())
    }

    /// Ring capacity in frames.
    #[must_use]
    pub fn capacity_frames(&self) -> usize {
        (self.sample_rate as f32 * self.buffer_seconds) as usize
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            buffer_seconds: 10.0,
        }
    }
}

/// Configuration for the drift estimator running on each receiver.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EstimatorConfig {
    /// Duration of audio used for each correlation (seconds).
    pub correlation_window_s: f32,

    /// Minimum normalized correlation for a valid measurement.
    pub min_correlation: f32,

    /// Maximum plausible drift magnitude (milliseconds).
    pub max_drift_ms: f32,

    /// Maximum allowed change between consecutive accepted drifts (ms).
    /// Larger steps are treated as transients and rejected.
    pub max_jump_ms: f32,

    /// High-pass cutoff applied before correlation (Hz).
    pub highpass_hz: f32,
}

impl EstimatorConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.correlation_window_s <= 0.0 {
            return Err("correlation_window_s must be > 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_correlation) {
            return Err("min_correlation must be within [0, 1]".to_string());
        }
        if self.max_drift_ms <= 0.0 {
            return Err("max_drift_ms must be > 0".to_string());
        }
        if self.max_jump_ms <= 0.0 {
            return Err("max_jump_ms must be > 0".to_string());
        }
        if self.highpass_hz <= 0.0 {
            return Err("highpass_hz must be > 0".to_string());
        }
        Ok(())
    }
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            correlation_window_s: 2.0,
            min_correlation: 0.7,
            max_drift_ms: 1000.0,
            max_jump_ms: 100.0,
            highpass_hz: 100.0,
        }
    }
}

/// Configuration for the group synchronization controller.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ControllerConfig {
    /// Offset deadband: target changes smaller than this are ignored (ms).
    pub sync_tolerance_ms: f32,

    /// Closed-loop gain in [0, 1]. Each pass moves the applied offset this
    /// fraction of the way toward the target.
    pub adjustment_rate: f32,

    /// Minimum seconds between sync passes for any one group.
    pub min_sync_interval_seconds: f32,

    /// Capacity of each device's drift history.
    pub drift_history_maxlen: usize,

    /// Number of recent samples averaged for smoothing.
    pub recent_drifts_window: usize,

    /// Seconds without an update before a device is marked offline.
    pub online_timeout_seconds: f32,

    /// Interval between offline sweeps (seconds).
    pub sweep_interval_seconds: f32,

    /// Maximum drift variance for a device to count as stable (ms²).
    pub stability_max_variance: f32,

    /// Minimum history length for a device to count as stable.
    pub stability_min_measurements: usize,

    /// Minimum connection quality for a device to count as stable.
    pub stability_min_connection_quality: f32,
}

impl ControllerConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.sync_tolerance_ms < 0.0 {
            return Err("sync_tolerance_ms must be >= 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.adjustment_rate) {
            return Err("adjustment_rate must be within [0, 1]".to_string());
        }
        if self.min_sync_interval_seconds <= 0.0 {
            return Err("min_sync_interval_seconds must be > 0".to_string());
        }
        if self.drift_history_maxlen == 0 {
            return Err("drift_history_maxlen must be >= 1".to_string());
        }
        if self.recent_drifts_window == 0 {
            return Err("recent_drifts_window must be >= 1".to_string());
        }
        if self.online_timeout_seconds <= 0.0 {
            return Err("online_timeout_seconds must be > 0".to_string());
        }
        if self.sweep_interval_seconds <= 0.0 {
            return Err("sweep_interval_seconds must be > 0".to_string());
        }
        if self.stability_min_measurements == 0 {
            return Err("stability_min_measurements must be >= 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.stability_min_connection_quality) {
            return Err("stability_min_connection_quality must be within [0, 1]".to_string());
        }
        Ok(())
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sync_tolerance_ms: 10.0,
            adjustment_rate: 0.1,
            min_sync_interval_seconds: 1.0,
            drift_history_maxlen: 50,
            recent_drifts_window: 10,
            online_timeout_seconds: 30.0,
            sweep_interval_seconds: 5.0,
            stability_max_variance: 25.0,
            stability_min_measurements: 5,
            stability_min_connection_quality: 0.5,
        }
    }
}

/// Configuration for a receiver agent.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentConfig {
    /// Seconds between drift measurements.
    pub drift_interval_seconds: f32,

    /// Seconds between heartbeats.
    pub heartbeat_interval_seconds: f32,

    /// Seconds between periodic status publications.
    pub status_interval_seconds: f32,

    /// Offset into the past when fetching the reference window (seconds).
    /// Negative values reach back to account for network and encode lag.
    pub reference_offset_seconds: f32,

    /// Watchdog: seconds without any successful transmitter contact
    /// before the agent re-announces itself.
    pub device_timeout_seconds: f32,

    /// Estimator tunables.
    #[serde(default)]
    pub estimator: EstimatorConfig,
}

impl AgentConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.drift_interval_seconds <= 0.0 {
            return Err("drift_interval_seconds must be > 0".to_string());
        }
        if self.heartbeat_interval_seconds <= 0.0 {
            return Err("heartbeat_interval_seconds must be > 0".to_string());
        }
        if self.status_interval_seconds <= 0.0 {
            return Err("status_interval_seconds must be > 0".to_string());
        }
        if self.device_timeout_seconds <= 0.0 {
            return Err("device_timeout_seconds must be > 0".to_string());
        }
        self.estimator.validate()
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            drift_interval_seconds: 5.0,
            heartbeat_interval_seconds: 30.0,
            status_interval_seconds: 30.0,
            reference_offset_seconds: -0.5,
            device_timeout_seconds: 90.0,
            estimator: EstimatorConfig::default(),
        }
    }
}

/// Reconnect behavior for bus clients.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BusConfig {
    /// Initial reconnect delay (milliseconds).
    pub reconnect_initial_ms: u64,

    /// Reconnect delay cap (milliseconds).
    pub reconnect_max_ms: u64,

    /// Multiplier applied to the delay after each failed attempt.
    pub reconnect_backoff: f32,

    /// Capacity of each session's outbound queue.
    pub session_queue_capacity: usize,
}

impl BusConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.reconnect_initial_ms == 0 {
            return Err("reconnect_initial_ms must be >= 1".to_string());
        }
        if self.reconnect_max_ms < self.reconnect_initial_ms {
            return Err("reconnect_max_ms must be >= reconnect_initial_ms".to_string());
        }
        if self.reconnect_backoff < 1.0 {
            return Err("reconnect_backoff must be >= 1".to_string());
        }
        if self.session_queue_capacity == 0 {
            return Err("session_queue_capacity must be >= 1".to_string());
        }
        Ok(())
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            reconnect_backoff: 2.0,
            session_queue_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(RingConfig::default().validate().is_ok());
        assert!(EstimatorConfig::default().validate().is_ok());
        assert!(ControllerConfig::default().validate().is_ok());
        assert!(AgentConfig::default().validate().is_ok());
        assert!(BusConfig::default().validate().is_ok());
    }

    #[test]
    fn defaults_match_protocol_values() {
        let c = ControllerConfig::default();
        assert_eq!(c.sync_tolerance_ms, 10.0);
        assert_eq!(c.adjustment_rate, 0.1);
        assert_eq!(c.drift_history_maxlen, 50);
        assert_eq!(c.recent_drifts_window, 10);
        assert_eq!(c.online_timeout_seconds, 30.0);

        let e = EstimatorConfig::default();
        assert_eq!(e.correlation_window_s, 2.0);
        assert_eq!(e.min_correlation, 0.7);
        assert_eq!(e.max_drift_ms, 1000.0);
    }

    #[test]
    fn ring_config_rejects_bad_values() {
        let mut c = RingConfig::default();
        c.sample_rate = 0;
        assert!(c.validate().is_err());

        let mut c = RingConfig::default();
        c.channels = 3;
        assert!(c.validate().is_err());

        let mut c = RingConfig::default();
        c.buffer_seconds = 0.0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn controller_config_rejects_out_of_range_gain() {
        let mut c = ControllerConfig::default();
        c.adjustment_rate = 1.5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn ring_capacity_frames() {
        let c = RingConfig {
            sample_rate: 44_100,
            channels: 2,
            buffer_seconds: 10.0,
        };
        assert_eq!(c.capacity_frames(), 441_000);
    }
}
