//! Signal processing for drift measurement.
//!
//! - [`filter`]: zero-phase Butterworth high-pass conditioning
//! - [`xcorr`]: FFT-based full linear cross-correlation
//! - [`estimator`]: the drift estimation pipeline and its validation

pub mod estimator;
pub mod filter;
pub mod xcorr;

pub use estimator::{DriftEstimator, DriftMeasurement, EstimatorStats, MeasurementError};
pub use filter::HighPass;
pub use xcorr::{peak_index, xcorr_full};
