//! Rolling audio buffer on the transmitter.
//!
//! The ring retains the last `buffer_seconds` of program audio so receivers
//! can fetch historical windows for drift correlation. One logical writer
//! (the audio source pump) appends; any number of readers take windows
//! addressed by `(duration, offset)` relative to the newest sample.

use parking_lot::RwLock;
use serde::Serialize;
use std::time::Instant;

use super::{downmix_mono, upmix_stereo, PcmWindow};
use crate::config::RingConfig;
use crate::error::SyncError;
use crate::utils::now_secs;

/// Result of a ring read.
#[derive(Debug, Clone)]
pub struct RingRead {
    /// The returned window, in the ring's channel layout.
    pub window: PcmWindow,
    /// Stream time of the first returned frame, in seconds since the first
    /// sample ever written.
    pub start_time_s: f64,
    /// True when fewer frames than requested were available.
    pub short: bool,
}

/// Snapshot of ring state for the `/api/audio/info` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RingInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer_seconds: f32,
    pub capacity_frames: usize,
    pub samples_written: u64,
    /// Retained fraction of capacity, in [0, 1].
    pub fill_ratio: f32,
    pub uptime_seconds: f64,
    pub last_write_unix: f64,
    pub seconds_since_last_write: f64,
}

struct RingInner {
    /// Interleaved frame storage, `capacity_frames × channels` long.
    buffer: Vec<f32>,
    /// Next frame slot to write (in frames, not samples).
    write_index: usize,
    /// Monotone count of frames ever written.
    samples_written: u64,
    last_write_unix: f64,
}

/// Thread-safe rolling PCM store.
///
/// Writes take the write lock for the duration of the copy only, so the
/// producer never blocks longer than one memcpy; readers share the read
/// lock and can never observe a torn frame.
pub struct AudioRing {
    config: RingConfig,
    capacity: usize,
    inner: RwLock<RingInner>,
    started_at: Instant,
}

impl AudioRing {
    /// Allocates a ring per `config`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Fatal`] when the configuration is invalid; a
    /// ring that cannot allocate is unrecoverable for the transmitter.
    pub fn new(config: RingConfig) -> Result<Self, SyncError> {
        config.validate().map_err(SyncError::Fatal)?;
        let capacity = config.capacity_frames();
        if capacity == 0 {
            return Err(SyncError::Fatal("ring capacity is zero frames".to_string()));
        }
        let buffer = vec![0.0f32; capacity * config.channels as usize];
        log::info!(
            "[AudioRing] initialized: {} Hz, {:.1}s, {} channel(s), {} frames",
            config.sample_rate,
            config.buffer_seconds,
            config.channels,
            capacity
        );
        Ok(Self {
            config,
            capacity,
            inner: RwLock::new(RingInner {
                buffer,
                write_index: 0,
                samples_written: 0,
                last_write_unix: 0.0,
            }),
            started_at: Instant::now(),
        })
    }

    /// The ring's sample rate in Hz.
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// The ring's channel count.
    #[must_use]
    pub fn channels(&self) -> u16 {
        self.config.channels
    }

    /// Seconds of audio the ring retains.
    #[must_use]
    pub fn buffer_seconds(&self) -> f32 {
        self.config.buffer_seconds
    }

    /// Appends a window of frames.
    ///
    /// Input with a different channel count is remixed: mono input is
    /// duplicated up to stereo, stereo input is averaged down to mono.
    pub fn write(&self, window: &PcmWindow) {
        let remixed;
        let samples: &[f32] = match (window.channels(), self.config.channels) {
            (a, b) if a == b => window.samples(),
            (1, 2) => {
                remixed = upmix_stereo(window.samples());
                &remixed
            }
            (_, 1) => {
                remixed = downmix_mono(window.samples(), window.channels());
                &remixed
            }
            (_, 2) => {
                // Arbitrary layouts fold through mono on the way to stereo.
                remixed = upmix_stereo(&downmix_mono(window.samples(), window.channels()));
                &remixed
            }
            _ => window.samples(),
        };

        let ch = self.config.channels as usize;
        let frames = samples.len() / ch;
        if frames == 0 {
            return;
        }

        let mut inner = self.inner.write();

        // A write longer than the ring stores only its tail, but stream
        // time still advances by the full frame count so that positions
        // stay aligned with the source.
        let total_frames = frames;
        let (samples, frames) = if frames > self.capacity {
            let skip = frames - self.capacity;
            inner.write_index = (inner.write_index + skip) % self.capacity;
            (&samples[skip * ch..], self.capacity)
        } else {
            (samples, frames)
        };

        let start = inner.write_index;
        let first = (self.capacity - start).min(frames);
        let first_samples = first * ch;
        inner.buffer[start * ch..start * ch + first_samples]
            .copy_from_slice(&samples[..first_samples]);
        if first < frames {
            let rest = (frames - first) * ch;
            inner.buffer[..rest].copy_from_slice(&samples[first_samples..first_samples + rest]);
        }

        inner.write_index = (start + frames) % self.capacity;
        inner.samples_written += total_frames as u64;
        inner.last_write_unix = now_secs();

        log::trace!(
            "[AudioRing] wrote {} frames, total written: {}",
            total_frames,
            inner.samples_written
        );
    }

    /// Reads a window of `duration_s` seconds ending at
    /// `samples_written + offset_s * sample_rate`.
    ///
    /// Negative offsets reach into the past. When the addressed window is
    /// not wholly retained the result is clamped to what is available and
    /// flagged [`RingRead::short`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidRequest`] for non-positive or
    /// over-capacity durations and [`SyncError::ServiceUnavailable`] when
    /// nothing has been written yet.
    pub fn read(&self, duration_s: f32, offset_s: f32) -> Result<RingRead, SyncError> {
        if duration_s <= 0.0 {
            return Err(SyncError::InvalidRequest(
                "duration must be > 0".to_string(),
            ));
        }
        if duration_s > self.config.buffer_seconds {
            return Err(SyncError::InvalidRequest(format!(
                "duration {:.2}s exceeds the {:.2}s buffer",
                duration_s, self.config.buffer_seconds
            )));
        }

        let rate = self.config.sample_rate as f64;
        let requested = (duration_s as f64 * rate).ceil() as u64;
        let offset_frames = (offset_s as f64 * rate).round() as i64;

        let ch = self.config.channels as usize;
        let inner = self.inner.read();

        if inner.samples_written == 0 {
            return Err(SyncError::ServiceUnavailable(
                "no audio has been written yet".to_string(),
            ));
        }

        let written = inner.samples_written as i64;
        let available = written.min(self.capacity as i64);
        let oldest = written - available;

        // Window [end - requested, end] clamped to the retained range.
        let end = (written + offset_frames).min(written);
        let start = (end - requested as i64).max(oldest).max(0);
        let returned = (end - start).max(0) as usize;

        if returned == 0 {
            let window = PcmWindow::new(Vec::new(), self.config.channels, self.config.sample_rate)
                .map_err(SyncError::InvalidRequest)?;
            return Ok(RingRead {
                window,
                start_time_s: start as f64 / rate,
                short: true,
            });
        }

        // Map stream position to a buffer slot and copy out, unwrapping the
        // circular layout into at most two slices.
        let start_slot = (start % self.capacity as i64) as usize;
        let mut samples = Vec::with_capacity(returned * ch);
        let first = (self.capacity - start_slot).min(returned);
        samples.extend_from_slice(&inner.buffer[start_slot * ch..(start_slot + first) * ch]);
        if first < returned {
            let rest = returned - first;
            samples.extend_from_slice(&inner.buffer[..rest * ch]);
        }
        drop(inner);

        let short = (returned as u64) < requested;
        if short {
            log::debug!(
                "[AudioRing] short read: requested {} frames, returned {}",
                requested,
                returned
            );
        }

        let window = PcmWindow::new(samples, self.config.channels, self.config.sample_rate)
            .map_err(SyncError::InvalidRequest)?;

        Ok(RingRead {
            window,
            start_time_s: start as f64 / rate,
            short,
        })
    }

    /// Reads the most recent `duration_s` seconds.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::read`].
    pub fn latest(&self, duration_s: f32) -> Result<RingRead, SyncError> {
        self.read(duration_s, 0.0)
    }

    /// Snapshot of ring state.
    #[must_use]
    pub fn info(&self) -> RingInfo {
        let inner = self.inner.read();
        let retained = inner.samples_written.min(self.capacity as u64);
        let now = now_secs();
        RingInfo {
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            buffer_seconds: self.config.buffer_seconds,
            capacity_frames: self.capacity,
            samples_written: inner.samples_written,
            fill_ratio: retained as f32 / self.capacity as f32,
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            last_write_unix: inner.last_write_unix,
            seconds_since_last_write: if inner.last_write_unix > 0.0 {
                (now - inner.last_write_unix).max(0.0)
            } else {
                0.0
            },
        }
    }

    /// Zeroes the buffer and resets counters.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.buffer.fill(0.0);
        inner.write_index = 0;
        inner.samples_written = 0;
        inner.last_write_unix = 0.0;
        log::info!("[AudioRing] cleared");
    }
}
