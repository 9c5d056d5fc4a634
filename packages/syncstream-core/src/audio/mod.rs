//! PCM primitives shared by the ring buffer, the DSP pipeline and the
//! receiver agent.

pub mod ring;

pub use ring::{AudioRing, RingInfo, RingRead};

/// An ordered block of float32 samples, interleaved `frames × channels`.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmWindow {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

impl PcmWindow {
    /// Wraps interleaved samples in a window.
    ///
    /// # Errors
    ///
    /// Returns an error message if `channels` is zero or the sample count
    /// is not a whole number of frames.
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Result<Self, String> {
        if channels == 0 {
            return Err("channels must be >= 1".to_string());
        }
        if sample_rate == 0 {
            return Err("sample_rate must be >= 1".to_string());
        }
        if samples.len() % channels as usize != 0 {
            return Err(format!(
                "{} samples is not a whole number of {}-channel frames",
                samples.len(),
                channels
            ));
        }
        Ok(Self {
            samples,
            channels,
            sample_rate,
        })
    }

    /// Convenience constructor for single-channel audio.
    #[must_use]
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            channels: 1,
            sample_rate,
        }
    }

    /// Interleaved samples.
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Consumes the window, returning its samples.
    #[must_use]
    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    #[must_use]
    pub fn channels(&self) -> u16 {
        self.channels
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of frames (samples per channel).
    #[must_use]
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Window duration in seconds.
    #[must_use]
    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Returns a mono rendition of this window, averaging channels.
    #[must_use]
    pub fn to_mono(&self) -> Vec<f32> {
        downmix_mono(&self.samples, self.channels)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Channel Remixing
// ─────────────────────────────────────────────────────────────────────────────

/// Averages interleaved multi-channel samples down to mono.
#[must_use]
pub fn downmix_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Duplicates mono samples into interleaved stereo.
#[must_use]
pub fn upmix_stereo(samples: &[f32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.push(s);
        out.push(s);
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Levels
// ─────────────────────────────────────────────────────────────────────────────

/// Peak absolute amplitude.
#[must_use]
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}

/// Root-mean-square level.
#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Synthesizes a mono sine tone.
///
/// Used by the `test_tone` command and the transmitter's built-in source.
#[must_use]
pub fn sine_tone(frequency: f32, duration_secs: f32, sample_rate: u32, amplitude: f32) -> Vec<f32> {
    let frames = (duration_secs * sample_rate as f32) as usize;
    let step = 2.0 * std::f32::consts::PI * frequency / sample_rate as f32;
    (0..frames).map(|i| amplitude * (step * i as f32).sin()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn window_rejects_ragged_frames() {
        assert!(PcmWindow::new(vec![0.0; 3], 2, 44_100).is_err());
        assert!(PcmWindow::new(vec![0.0; 4], 2, 44_100).is_ok());
        assert!(PcmWindow::new(vec![0.0; 4], 0, 44_100).is_err());
    }

    #[test]
    fn window_frame_math() {
        let w = PcmWindow::new(vec![0.0; 88_200], 2, 44_100).unwrap();
        assert_eq!(w.frames(), 44_100);
        assert_relative_eq!(w.duration_secs(), 1.0);
    }

    #[test]
    fn downmix_averages_channels() {
        let mono = downmix_mono(&[1.0, 0.0, 0.5, 0.5], 2);
        assert_eq!(mono, vec![0.5, 0.5]);
    }

    #[test]
    fn downmix_of_mono_is_identity() {
        assert_eq!(downmix_mono(&[0.1, 0.2], 1), vec![0.1, 0.2]);
    }

    #[test]
    fn upmix_duplicates() {
        assert_eq!(upmix_stereo(&[0.25, -0.5]), vec![0.25, 0.25, -0.5, -0.5]);
    }

    #[test]
    fn peak_and_rms() {
        let samples = [0.0, 0.5, -1.0, 0.5];
        assert_eq!(peak(&samples), 1.0);
        assert_relative_eq!(rms(&samples), (1.5f32 / 4.0).sqrt(), epsilon = 1e-6);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn tone_has_requested_length_and_amplitude() {
        let tone = sine_tone(440.0, 0.5, 44_100, 0.8);
        assert_eq!(tone.len(), 22_050);
        assert!(peak(&tone) <= 0.8 + 1e-6);
        assert!(peak(&tone) > 0.7);
    }
}
