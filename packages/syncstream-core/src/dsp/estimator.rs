//! Drift estimation from microphone and reference audio.
//!
//! The estimator cross-correlates a captured microphone window against a
//! reference window fetched from the transmitter and turns the correlation
//! peak into a signed drift measurement. Measurements survive only if the
//! normalized correlation is strong enough, the drift magnitude is
//! plausible, and the value does not jump implausibly far from the last
//! accepted one.

use std::collections::VecDeque;

use serde::Serialize;
use thiserror::Error;

use super::filter::HighPass;
use super::xcorr::{peak_index, xcorr_full};
use crate::audio::PcmWindow;
use crate::config::EstimatorConfig;
use crate::utils::{mean, now_secs, sample_variance};

/// Entries of raw history retained for statistics.
const HISTORY_MAXLEN: usize = 100;

/// Window of recent measurements used for the smoothed average.
const RECENT_WINDOW: usize = 10;

/// Reasons a measurement was rejected.
#[derive(Debug, Error)]
pub enum MeasurementError {
    #[error("sample rate mismatch: mic {mic} Hz vs reference {reference} Hz")]
    SampleRateMismatch { mic: u32, reference: u32 },

    #[error("window is empty")]
    EmptyWindow,

    #[error("no signal energy to correlate")]
    NoSignal,

    #[error("correlation too low: {correlation:.3} < {min:.3}")]
    LowCorrelation { correlation: f32, min: f32 },

    #[error("drift too large: {drift_ms:.1}ms exceeds {max:.1}ms")]
    DriftOutOfRange { drift_ms: f32, max: f32 },

    #[error("drift change too large: {delta_ms:.1}ms exceeds {max:.1}ms")]
    JumpGuard { delta_ms: f32, max: f32 },
}

/// One accepted drift measurement.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DriftMeasurement {
    pub drift_ms: f32,
    /// Peak normalized correlation in [0, 1].
    pub correlation: f32,
    /// Mean over the recent measurement window.
    pub avg_drift_ms: f32,
    pub drift_variance: f32,
    pub measurement_time: f64,
    pub measurement_count: u32,
}

/// Running estimator statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EstimatorStats {
    pub measurement_count: u32,
    pub failed_measurements: u32,
    pub last_drift_ms: f32,
    pub last_correlation: f32,
    pub last_measurement_time: f64,
    pub history_length: usize,
    pub avg_drift_ms: f32,
    pub drift_std_ms: f32,
    pub min_drift_ms: f32,
    pub max_drift_ms: f32,
    pub avg_correlation: f32,
    pub min_correlation: f32,
}

/// Cross-correlation drift estimator.
pub struct DriftEstimator {
    config: EstimatorConfig,
    drift_history: VecDeque<f32>,
    correlation_history: VecDeque<f32>,
    last_accepted_drift_ms: Option<f32>,
    last_correlation: f32,
    last_measurement_time: f64,
    measurement_count: u32,
    failed_measurements: u32,
}

impl DriftEstimator {
    /// Creates an estimator with the given tunables.
    #[must_use]
    pub fn new(config: EstimatorConfig) -> Self {
        log::info!(
            "[DriftEstimator] initialized: window={}s, min_corr={}, max_drift={}ms",
            config.correlation_window_s,
            config.min_correlation,
            config.max_drift_ms
        );
        Self {
            config,
            drift_history: VecDeque::with_capacity(HISTORY_MAXLEN),
            correlation_history: VecDeque::with_capacity(HISTORY_MAXLEN),
            last_accepted_drift_ms: None,
            last_correlation: 0.0,
            last_measurement_time: 0.0,
            measurement_count: 0,
            failed_measurements: 0,
        }
    }

    /// The configured correlation window length in seconds.
    #[must_use]
    pub fn correlation_window_s(&self) -> f32 {
        self.config.correlation_window_s
    }

    /// The last accepted drift, if any measurement succeeded yet.
    #[must_use]
    pub fn last_accepted_drift_ms(&self) -> Option<f32> {
        self.last_accepted_drift_ms
    }

    /// Conditions a signal for correlation: high-pass (zero phase), peak
    /// normalize, Hann window.
    fn preprocess(&self, samples: &mut Vec<f32>, sample_rate: u32) {
        let filter = HighPass::butterworth(self.config.highpass_hz, sample_rate);
        filter.apply_zero_phase(samples);

        let peak = crate::audio::peak(samples);
        if peak > 0.0 {
            for s in samples.iter_mut() {
                *s /= peak;
            }
        }

        let n = samples.len();
        if n > 1 {
            let step = 2.0 * std::f32::consts::PI / (n as f32 - 1.0);
            for (i, s) in samples.iter_mut().enumerate() {
                *s *= 0.5 * (1.0 - (step * i as f32).cos());
            }
        }
    }

    /// Estimates drift from a mic window and a reference window.
    ///
    /// Both windows must share a sample rate; channel layouts may differ
    /// (each is downmixed to mono first).
    ///
    /// # Errors
    ///
    /// Returns a [`MeasurementError`] describing why the measurement was
    /// rejected. Rejections increment the failed-measurement counter and
    /// leave all other state untouched.
    pub fn measure(
        &mut self,
        mic: &PcmWindow,
        reference: &PcmWindow,
    ) -> Result<DriftMeasurement, MeasurementError> {
        let result = self.measure_inner(mic, reference);
        if result.is_err() {
            self.failed_measurements += 1;
        }
        result
    }

    fn measure_inner(
        &mut self,
        mic: &PcmWindow,
        reference: &PcmWindow,
    ) -> Result<DriftMeasurement, MeasurementError> {
        if mic.sample_rate() != reference.sample_rate() {
            return Err(MeasurementError::SampleRateMismatch {
                mic: mic.sample_rate(),
                reference: reference.sample_rate(),
            });
        }
        let sample_rate = mic.sample_rate();

        let mut mic_mono = mic.to_mono();
        let mut ref_mono = reference.to_mono();
        if mic_mono.is_empty() || ref_mono.is_empty() {
            return Err(MeasurementError::EmptyWindow);
        }

        self.preprocess(&mut mic_mono, sample_rate);
        self.preprocess(&mut ref_mono, sample_rate);

        // Correlate over the common length.
        let n = mic_mono.len().min(ref_mono.len());
        mic_mono.truncate(n);
        ref_mono.truncate(n);

        let correlation = xcorr_full(&mic_mono, &ref_mono);
        let (peak_idx, peak_value) =
            peak_index(&correlation).ok_or(MeasurementError::EmptyWindow)?;

        let norm = (mic_mono.iter().map(|s| s * s).sum::<f32>()
            * ref_mono.iter().map(|s| s * s).sum::<f32>())
        .sqrt();
        if norm <= 0.0 {
            return Err(MeasurementError::NoSignal);
        }
        let coefficient = (peak_value.abs() / norm).min(1.0);

        let lag_samples = peak_idx as i64 - (n as i64 - 1);
        let drift_ms = (lag_samples as f64 / sample_rate as f64 * 1000.0) as f32;

        log::debug!(
            "[DriftEstimator] correlation: offset={:.1}ms, coeff={:.3}",
            drift_ms,
            coefficient
        );

        self.validate(drift_ms, coefficient)?;

        // Accepted: fold into state.
        self.last_accepted_drift_ms = Some(drift_ms);
        self.last_correlation = coefficient;
        self.last_measurement_time = now_secs();
        self.measurement_count += 1;

        if self.drift_history.len() == HISTORY_MAXLEN {
            self.drift_history.pop_front();
            self.correlation_history.pop_front();
        }
        self.drift_history.push_back(drift_ms);
        self.correlation_history.push_back(coefficient);

        let recent: Vec<f32> = self
            .drift_history
            .iter()
            .rev()
            .take(RECENT_WINDOW)
            .copied()
            .collect();
        let avg_drift_ms = mean(&recent);
        let drift_variance = sample_variance(&recent);

        log::info!(
            "[DriftEstimator] drift measured: {:.1}ms (corr={:.3}, avg={:.1}ms)",
            drift_ms,
            coefficient,
            avg_drift_ms
        );

        Ok(DriftMeasurement {
            drift_ms,
            correlation: coefficient,
            avg_drift_ms,
            drift_variance,
            measurement_time: self.last_measurement_time,
            measurement_count: self.measurement_count,
        })
    }

    /// Applies the correlation threshold, range check and jump guard.
    fn validate(&self, drift_ms: f32, correlation: f32) -> Result<(), MeasurementError> {
        if correlation < self.config.min_correlation {
            return Err(MeasurementError::LowCorrelation {
                correlation,
                min: self.config.min_correlation,
            });
        }
        if drift_ms.abs() > self.config.max_drift_ms {
            return Err(MeasurementError::DriftOutOfRange {
                drift_ms,
                max: self.config.max_drift_ms,
            });
        }
        if let Some(last) = self.last_accepted_drift_ms {
            let delta = (drift_ms - last).abs();
            if delta > self.config.max_jump_ms {
                return Err(MeasurementError::JumpGuard {
                    delta_ms: delta,
                    max: self.config.max_jump_ms,
                });
            }
        }
        Ok(())
    }

    /// Running statistics over the retained history.
    #[must_use]
    pub fn statistics(&self) -> EstimatorStats {
        let drifts: Vec<f32> = self.drift_history.iter().copied().collect();
        let correlations: Vec<f32> = self.correlation_history.iter().copied().collect();
        let fold_min = |v: &[f32]| v.iter().copied().fold(f32::INFINITY, f32::min);
        let fold_max = |v: &[f32]| v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        EstimatorStats {
            measurement_count: self.measurement_count,
            failed_measurements: self.failed_measurements,
            last_drift_ms: self.last_accepted_drift_ms.unwrap_or(0.0),
            last_correlation: self.last_correlation,
            last_measurement_time: self.last_measurement_time,
            history_length: drifts.len(),
            avg_drift_ms: mean(&drifts),
            drift_std_ms: sample_variance(&drifts).sqrt(),
            min_drift_ms: if drifts.is_empty() { 0.0 } else { fold_min(&drifts) },
            max_drift_ms: if drifts.is_empty() { 0.0 } else { fold_max(&drifts) },
            avg_correlation: mean(&correlations),
            min_correlation: if correlations.is_empty() {
                0.0
            } else {
                fold_min(&correlations)
            },
        }
    }

    /// Clears history and counters (the `calibrate` command).
    pub fn reset_statistics(&mut self) {
        self.drift_history.clear();
        self.correlation_history.clear();
        self.last_accepted_drift_ms = None;
        self.last_correlation = 0.0;
        self.measurement_count = 0;
        self.failed_measurements = 0;
        log::info!("[DriftEstimator] statistics reset");
    }

    /// Number of rejected measurements since the last reset.
    #[must_use]
    pub fn failed_measurements(&self) -> u32 {
        self.failed_measurements
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const RATE: u32 = 44_100;

    /// Deterministic broadband test signal (sum of incommensurate sines).
    fn program(frames: usize) -> Vec<f32> {
        (0..frames)
            .map(|i| {
                let t = i as f32 / RATE as f32;
                0.4 * (2.0 * std::f32::consts::PI * 311.0 * t).sin()
                    + 0.3 * (2.0 * std::f32::consts::PI * 977.0 * t).sin()
                    + 0.2 * (2.0 * std::f32::consts::PI * 2203.0 * t).sin()
            })
            .collect()
    }

    /// Builds mic/reference windows where the mic lags by `shift` frames.
    fn shifted_pair(window: usize, shift: usize) -> (PcmWindow, PcmWindow) {
        let base = program(window + shift);
        let mic = PcmWindow::mono(base[..window].to_vec(), RATE);
        let reference = PcmWindow::mono(base[shift..].to_vec(), RATE);
        (mic, reference)
    }

    #[test]
    fn zero_shift_measures_zero_drift() {
        let mut est = DriftEstimator::new(EstimatorConfig::default());
        let (mic, reference) = shifted_pair(RATE as usize / 2, 0);
        let m = est.measure(&mic, &reference).unwrap();
        assert_relative_eq!(m.drift_ms, 0.0, epsilon = 0.1);
        assert!(m.correlation > 0.9);
        assert_eq!(m.measurement_count, 1);
    }

    #[test]
    fn known_shift_is_recovered() {
        let mut est = DriftEstimator::new(EstimatorConfig::default());
        // 441 frames = exactly 10 ms at 44.1 kHz.
        let (mic, reference) = shifted_pair(RATE as usize / 2, 441);
        let m = est.measure(&mic, &reference).unwrap();
        assert_relative_eq!(m.drift_ms, 10.0, epsilon = 0.5);
        assert!(m.correlation > 0.7);
    }

    #[test]
    fn uncorrelated_signals_are_rejected() {
        let mut est = DriftEstimator::new(EstimatorConfig::default());
        let mic = PcmWindow::mono(
            (0..22_050)
                .map(|i| if i % 97 < 48 { 0.5 } else { -0.5 })
                .collect(),
            RATE,
        );
        let reference = PcmWindow::mono(program(22_050), RATE);
        let err = est.measure(&mic, &reference).unwrap_err();
        assert!(matches!(err, MeasurementError::LowCorrelation { .. }));
        assert_eq!(est.failed_measurements(), 1);
        assert!(est.last_accepted_drift_ms().is_none());
    }

    #[test]
    fn jump_guard_rejects_sudden_changes() {
        let mut est = DriftEstimator::new(EstimatorConfig::default());

        // Establish history near 5 ms.
        let (mic, reference) = shifted_pair(RATE as usize / 2, 220);
        est.measure(&mic, &reference).unwrap();
        let before = est.last_accepted_drift_ms().unwrap();

        // A 120 ms estimate differs by more than the 100 ms step limit.
        let (mic, reference) = shifted_pair(RATE as usize, 5292);
        let err = est.measure(&mic, &reference).unwrap_err();
        assert!(matches!(err, MeasurementError::JumpGuard { .. }));
        assert_eq!(est.failed_measurements(), 1);
        assert_eq!(est.last_accepted_drift_ms(), Some(before));
    }

    #[test]
    fn silence_is_rejected_not_crashed() {
        let mut est = DriftEstimator::new(EstimatorConfig::default());
        let mic = PcmWindow::mono(vec![0.0; 22_050], RATE);
        let reference = PcmWindow::mono(vec![0.0; 22_050], RATE);
        let err = est.measure(&mic, &reference).unwrap_err();
        assert!(matches!(err, MeasurementError::NoSignal));
    }

    #[test]
    fn sample_rate_mismatch_is_rejected() {
        let mut est = DriftEstimator::new(EstimatorConfig::default());
        let mic = PcmWindow::mono(program(1000), RATE);
        let reference = PcmWindow::mono(program(1000), 48_000);
        assert!(matches!(
            est.measure(&mic, &reference),
            Err(MeasurementError::SampleRateMismatch { .. })
        ));
    }

    #[test]
    fn statistics_accumulate_and_reset() {
        let mut est = DriftEstimator::new(EstimatorConfig::default());
        let (mic, reference) = shifted_pair(RATE as usize / 2, 441);
        est.measure(&mic, &reference).unwrap();
        let (mic, reference) = shifted_pair(RATE as usize / 2, 441);
        est.measure(&mic, &reference).unwrap();

        let stats = est.statistics();
        assert_eq!(stats.measurement_count, 2);
        assert_eq!(stats.history_length, 2);
        assert!(stats.avg_drift_ms > 9.0 && stats.avg_drift_ms < 11.0);
        assert!(stats.avg_correlation > 0.7);

        est.reset_statistics();
        let stats = est.statistics();
        assert_eq!(stats.measurement_count, 0);
        assert_eq!(stats.history_length, 0);
    }

    #[test]
    fn stereo_windows_are_downmixed() {
        let mut est = DriftEstimator::new(EstimatorConfig::default());
        let mono = program(22_050);
        let stereo: Vec<f32> = mono.iter().flat_map(|&s| [s, s]).collect();
        let mic = PcmWindow::new(stereo, 2, RATE).unwrap();
        let reference = PcmWindow::mono(mono, RATE);
        let m = est.measure(&mic, &reference).unwrap();
        assert_relative_eq!(m.drift_ms, 0.0, epsilon = 0.1);
    }
}
