//! General utilities shared across the library.

use std::time::{SystemTime, UNIX_EPOCH};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns the current Unix timestamp as fractional seconds.
///
/// This is the timestamp format carried by protocol messages.
#[must_use]
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Arithmetic mean. Returns 0.0 for an empty slice.
#[must_use]
pub fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

/// Sample variance (n − 1 denominator). Returns 0.0 for fewer than 2 values.
#[must_use]
pub fn sample_variance(values: &[f32]) -> f32 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m) * (v - m)).sum::<f32>() / (values.len() - 1) as f32
}

/// Median of a set of values. Returns 0.0 for an empty slice.
///
/// For an even count this is the mean of the two middle values, matching
/// the convention of the drift consensus calculation.
#[must_use]
pub fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_empty_is_zero() {
        assert_eq!(mean(&[]), 0.0);
    }

    #[test]
    fn mean_of_values() {
        assert_eq!(mean(&[1.0, 2.0, 3.0]), 2.0);
    }

    #[test]
    fn variance_needs_two_values() {
        assert_eq!(sample_variance(&[]), 0.0);
        assert_eq!(sample_variance(&[5.0]), 0.0);
    }

    #[test]
    fn variance_matches_sample_formula() {
        // statistics.variance([10, 12, 11, 10, 12]) == 1.0
        let v = sample_variance(&[10.0, 12.0, 11.0, 10.0, 12.0]);
        assert!((v - 1.0).abs() < 1e-6);
    }

    #[test]
    fn median_odd_count() {
        assert_eq!(median(&[500.0, 0.0, 1.0, 0.0, 1.0]), 1.0);
    }

    #[test]
    fn median_even_count() {
        assert_eq!(median(&[11.0, -9.0]), 1.0);
    }

    #[test]
    fn now_secs_is_positive() {
        assert!(now_secs() > 0.0);
        assert!(now_millis() > 0);
    }
}
