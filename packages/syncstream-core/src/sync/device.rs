//! Per-receiver synchronization state.
//!
//! A [`DeviceState`] tracks one receiver's drift history and derives the
//! smoothed figures the group controller works with: windowed average,
//! variance, connection quality and the stability predicate.

use std::collections::VecDeque;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::ControllerConfig;
use crate::utils::{mean, sample_variance};

/// Minimum history length before smoothed statistics are trusted.
const MIN_SAMPLES_FOR_STATS: usize = 3;

/// One accepted drift measurement as the controller stores it.
#[derive(Debug, Clone, Copy)]
pub struct DriftSample {
    pub drift_ms: f32,
    /// Estimator's correlation coefficient in [0, 1].
    pub correlation: f32,
    /// Signal strength in dBm (−80 … −50 useful range).
    pub signal_strength_dbm: f32,
    pub captured_at: Instant,
}

/// Synchronization state of a single receiver.
#[derive(Debug, Clone)]
pub struct DeviceState {
    device_id: String,
    base_latency_ms: f32,
    sync_group: String,

    history: VecDeque<DriftSample>,
    last_drift_ms: f32,
    last_correlation: f32,
    avg_drift_ms: f32,
    drift_variance: f32,
    connection_quality: f32,

    current_offset_ms: f32,
    target_offset_ms: f32,

    is_online: bool,
    last_seen: Option<Instant>,
}

/// Copied-out status of a device, safe to hand to readers.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub sync_group: String,
    pub base_latency_ms: f32,
    pub is_online: bool,
    pub is_stable: bool,
    pub last_drift_ms: f32,
    pub avg_drift_ms: f32,
    pub drift_variance: f32,
    pub connection_quality: f32,
    pub correlation_quality: f32,
    pub current_offset_ms: f32,
    pub target_offset_ms: f32,
    pub drift_measurements: usize,
    /// Seconds since the last update, if any update ever arrived.
    pub last_seen_seconds_ago: Option<f64>,
}

impl DeviceState {
    /// Creates state for a freshly registered device.
    #[must_use]
    pub fn new(device_id: impl Into<String>, base_latency_ms: f32, sync_group: impl Into<String>) -> Self {
        let device_id = device_id.into();
        log::info!(
            "[DeviceState] created for {} with base latency {}ms",
            device_id,
            base_latency_ms
        );
        Self {
            device_id,
            base_latency_ms,
            sync_group: sync_group.into(),
            history: VecDeque::new(),
            last_drift_ms: 0.0,
            last_correlation: 0.0,
            avg_drift_ms: 0.0,
            drift_variance: 0.0,
            connection_quality: 1.0,
            current_offset_ms: 0.0,
            target_offset_ms: 0.0,
            is_online: false,
            last_seen: None,
        }
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub fn sync_group(&self) -> &str {
        &self.sync_group
    }

    /// Moves the device to another group (re-registration).
    pub fn set_sync_group(&mut self, group: impl Into<String>) {
        self.sync_group = group.into();
    }

    /// Updates the calibration constant (re-registration).
    pub fn set_base_latency_ms(&mut self, base_latency_ms: f32) {
        self.base_latency_ms = base_latency_ms;
    }

    #[must_use]
    pub fn current_offset_ms(&self) -> f32 {
        self.current_offset_ms
    }

    #[must_use]
    pub fn target_offset_ms(&self) -> f32 {
        self.target_offset_ms
    }

    #[must_use]
    pub fn avg_drift_ms(&self) -> f32 {
        self.avg_drift_ms
    }

    #[must_use]
    pub fn last_drift_ms(&self) -> f32 {
        self.last_drift_ms
    }

    #[must_use]
    pub fn drift_variance(&self) -> f32 {
        self.drift_variance
    }

    #[must_use]
    pub fn connection_quality(&self) -> f32 {
        self.connection_quality
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.is_online
    }

    #[must_use]
    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    /// Resets the applied offset (the `resync` command).
    pub fn reset_offset(&mut self) {
        self.current_offset_ms = 0.0;
        self.target_offset_ms = 0.0;
    }

    /// Marks the device alive without recording a measurement (heartbeat
    /// or status traffic).
    pub fn touch(&mut self, now: Instant) {
        self.is_online = true;
        self.last_seen = Some(now);
    }

    /// Marks the device offline (sweep timeout or last-will).
    pub fn mark_offline(&mut self) {
        self.is_online = false;
    }

    /// Folds an accepted drift measurement into the history.
    ///
    /// The oldest sample is evicted once the history holds
    /// `config.drift_history_maxlen` entries. Smoothed statistics and the
    /// connection quality only update once three samples exist; until then
    /// they keep their previous values.
    pub fn update_drift(&mut self, sample: DriftSample, config: &ControllerConfig) {
        if self.history.len() >= config.drift_history_maxlen {
            self.history.pop_front();
        }
        self.history.push_back(sample);

        self.last_drift_ms = sample.drift_ms;
        self.last_correlation = sample.correlation;
        self.is_online = true;
        self.last_seen = Some(sample.captured_at);

        if self.history.len() >= MIN_SAMPLES_FOR_STATS {
            let recent: Vec<f32> = self
                .history
                .iter()
                .rev()
                .take(config.recent_drifts_window)
                .map(|s| s.drift_ms)
                .collect();
            self.avg_drift_ms = mean(&recent);
            self.drift_variance = sample_variance(&recent);

            // Quality mixes radio health (dBm mapped over −80…−50) with
            // drift stability (variance mapped over 0…100 ms²).
            let signal_quality = ((sample.signal_strength_dbm + 80.0) / 30.0).clamp(0.0, 1.0);
            let drift_stability = (1.0 - self.drift_variance / 100.0).clamp(0.0, 1.0);
            self.connection_quality = (signal_quality + drift_stability) / 2.0;
        }

        log::debug!(
            "[DeviceState] {}: drift={:.1}ms, avg={:.1}ms, quality={:.2}",
            self.device_id,
            sample.drift_ms,
            self.avg_drift_ms,
            self.connection_quality
        );
    }

    /// Computes the offset that would align this device with the group's
    /// reference drift.
    #[must_use]
    pub fn calculate_target_offset(&self, reference_drift_ms: f32) -> f32 {
        if self.history.is_empty() {
            return self.base_latency_ms;
        }
        let smoothed = if self.history.len() >= MIN_SAMPLES_FOR_STATS {
            self.avg_drift_ms
        } else {
            self.last_drift_ms
        };
        self.base_latency_ms + (reference_drift_ms - smoothed)
    }

    /// Nudges the applied offset toward `target` by the loop gain and
    /// records the new target. Returns the applied offset.
    pub fn apply_adjustment(&mut self, target: f32, adjustment_rate: f32) -> f32 {
        self.current_offset_ms += (target - self.current_offset_ms) * adjustment_rate;
        self.target_offset_ms = target;
        self.current_offset_ms
    }

    /// Whether the device is trustworthy enough to contribute to (and
    /// receive) group corrections.
    #[must_use]
    pub fn is_stable(&self, config: &ControllerConfig) -> bool {
        self.is_online
            && self.history.len() >= config.stability_min_measurements
            && self.drift_variance <= config.stability_max_variance
            && self.connection_quality >= config.stability_min_connection_quality
    }

    /// Number of retained measurements.
    #[must_use]
    pub fn measurement_count(&self) -> usize {
        self.history.len()
    }

    /// Copies out the current status.
    #[must_use]
    pub fn snapshot(&self, config: &ControllerConfig, now: Instant) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: self.device_id.clone(),
            sync_group: self.sync_group.clone(),
            base_latency_ms: self.base_latency_ms,
            is_online: self.is_online,
            is_stable: self.is_stable(config),
            last_drift_ms: self.last_drift_ms,
            avg_drift_ms: self.avg_drift_ms,
            drift_variance: self.drift_variance,
            connection_quality: self.connection_quality,
            correlation_quality: self.last_correlation,
            current_offset_ms: self.current_offset_ms,
            target_offset_ms: self.target_offset_ms,
            drift_measurements: self.history.len(),
            last_seen_seconds_ago: self
                .last_seen
                .map(|seen| now.saturating_duration_since(seen).as_secs_f64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(drift: f32) -> DriftSample {
        DriftSample {
            drift_ms: drift,
            correlation: 0.9,
            signal_strength_dbm: -50.0,
            captured_at: Instant::now(),
        }
    }

    fn config() -> ControllerConfig {
        ControllerConfig::default()
    }

    #[test]
    fn history_is_bounded() {
        let mut device = DeviceState::new("a", 0.0, "default");
        let cfg = config();
        for i in 0..(cfg.drift_history_maxlen + 20) {
            device.update_drift(sample(i as f32 * 0.01), &cfg);
        }
        assert_eq!(device.measurement_count(), cfg.drift_history_maxlen);
    }

    #[test]
    fn statistics_wait_for_three_samples() {
        let mut device = DeviceState::new("a", 0.0, "default");
        let cfg = config();

        device.update_drift(sample(10.0), &cfg);
        device.update_drift(sample(20.0), &cfg);
        assert_eq!(device.avg_drift_ms(), 0.0);

        device.update_drift(sample(30.0), &cfg);
        assert!((device.avg_drift_ms() - 20.0).abs() < 1e-4);
    }

    #[test]
    fn variance_over_recent_window() {
        let mut device = DeviceState::new("a", 0.0, "default");
        let cfg = config();
        for drift in [10.0, 12.0, 11.0, 10.0, 12.0] {
            device.update_drift(sample(drift), &cfg);
        }
        assert!((device.avg_drift_ms() - 11.0).abs() < 1e-4);
        assert!((device.drift_variance() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn connection_quality_from_signal_and_stability() {
        let mut device = DeviceState::new("a", 0.0, "default");
        let cfg = config();
        // Steady drift at a strong −50 dBm: both terms saturate at 1.
        for _ in 0..5 {
            device.update_drift(sample(5.0), &cfg);
        }
        assert!((device.connection_quality() - 1.0).abs() < 1e-4);

        // Weak signal pulls the mean down to ~0.5.
        let mut weak = DeviceState::new("b", 0.0, "default");
        for _ in 0..5 {
            weak.update_drift(
                DriftSample {
                    signal_strength_dbm: -80.0,
                    ..sample(5.0)
                },
                &cfg,
            );
        }
        assert!((weak.connection_quality() - 0.5).abs() < 1e-4);
    }

    #[test]
    fn target_offset_uses_smoothed_drift() {
        let mut device = DeviceState::new("a", 50.0, "default");
        let cfg = config();
        for drift in [10.0, 12.0, 11.0, 10.0, 12.0] {
            device.update_drift(sample(drift), &cfg);
        }
        // base 50 + (reference 1 − avg 11) = 40.
        assert!((device.calculate_target_offset(1.0) - 40.0).abs() < 1e-4);
    }

    #[test]
    fn target_offset_before_history_is_base_latency() {
        let device = DeviceState::new("a", 75.0, "default");
        assert_eq!(device.calculate_target_offset(5.0), 75.0);
    }

    #[test]
    fn stability_requires_history_variance_and_quality() {
        let cfg = config();
        let mut device = DeviceState::new("a", 0.0, "default");
        assert!(!device.is_stable(&cfg));

        for drift in [10.0, 12.0, 11.0, 10.0, 12.0] {
            device.update_drift(sample(drift), &cfg);
        }
        assert!(device.is_stable(&cfg));

        device.mark_offline();
        assert!(!device.is_stable(&cfg));
    }

    #[test]
    fn outlier_burst_cannot_flip_stability_on() {
        // Adding a far-out sample can only raise variance, never turn an
        // unstable device stable.
        let cfg = config();
        let mut device = DeviceState::new("a", 0.0, "default");
        for drift in [0.0, 0.0, 40.0, 0.0, 40.0] {
            device.update_drift(sample(drift), &cfg);
        }
        assert!(!device.is_stable(&cfg), "variance {}", device.drift_variance());

        device.update_drift(sample(200.0), &cfg);
        assert!(!device.is_stable(&cfg));
    }

    #[test]
    fn adjustment_moves_fraction_of_the_way() {
        let mut device = DeviceState::new("a", 0.0, "default");
        let applied = device.apply_adjustment(40.0, 0.1);
        assert!((applied - 4.0).abs() < 1e-4);
        assert_eq!(device.target_offset_ms(), 40.0);

        let applied = device.apply_adjustment(40.0, 0.1);
        assert!((applied - 7.6).abs() < 1e-4);
    }

    #[test]
    fn reset_offset_zeroes_both_offsets() {
        let mut device = DeviceState::new("a", 0.0, "default");
        device.apply_adjustment(40.0, 0.5);
        device.reset_offset();
        assert_eq!(device.current_offset_ms(), 0.0);
        assert_eq!(device.target_offset_ms(), 0.0);
    }

    #[test]
    fn snapshot_copies_state_out() {
        let cfg = config();
        let mut device = DeviceState::new("a", 10.0, "patio");
        for drift in [1.0, 2.0, 3.0, 2.0, 1.0] {
            device.update_drift(sample(drift), &cfg);
        }
        let snap = device.snapshot(&cfg, Instant::now());
        assert_eq!(snap.device_id, "a");
        assert_eq!(snap.sync_group, "patio");
        assert_eq!(snap.drift_measurements, 5);
        assert!(snap.is_online);
        assert!(snap.last_seen_seconds_ago.is_some());
    }
}
