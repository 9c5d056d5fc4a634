//! Microphone capture seam for the receiver agent.
//!
//! Real capture backends (I2S hats, USB mics) run their own producer and
//! push chunks into a [`ChunkQueue`]; the estimator pulls assembled
//! windows from the other side. When the estimator falls behind, the queue
//! drops its **oldest** chunks; a measurement on stale audio is worse
//! than a skipped measurement.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::audio::{AudioRing, PcmWindow};
use crate::error::{SyncError, SyncResult};

/// Source of microphone windows for drift measurement.
#[async_trait]
pub trait MicCapture: Send + Sync {
    /// Captures the most recent `duration_s` seconds of microphone audio.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ResourceExhaustion`] when not enough audio has
    /// been captured yet.
    async fn capture(&self, duration_s: f32) -> SyncResult<PcmWindow>;

    /// The capture sample rate in Hz.
    fn sample_rate(&self) -> u32;
}

// ─────────────────────────────────────────────────────────────────────────────
// Chunk Queue
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded queue of captured chunks with drop-oldest overflow.
pub struct ChunkQueue {
    sample_rate: u32,
    max_chunks: usize,
    chunks: Mutex<VecDeque<Vec<f32>>>,
    dropped: AtomicU64,
}

impl ChunkQueue {
    /// Creates a queue holding at most `max_chunks` chunks.
    #[must_use]
    pub fn new(sample_rate: u32, max_chunks: usize) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            max_chunks: max_chunks.max(1),
            chunks: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        })
    }

    /// Pushes a mono chunk, evicting the oldest when full.
    pub fn push(&self, chunk: Vec<f32>) {
        if chunk.is_empty() {
            return;
        }
        let mut chunks = self.chunks.lock();
        if chunks.len() == self.max_chunks {
            chunks.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        chunks.push_back(chunk);
    }

    /// Assembles the most recent `duration_s` seconds into one window.
    ///
    /// Returns `None` when less audio than requested is queued.
    #[must_use]
    pub fn window(&self, duration_s: f32) -> Option<PcmWindow> {
        let needed = (duration_s * self.sample_rate as f32) as usize;
        if needed == 0 {
            return None;
        }
        let chunks = self.chunks.lock();
        let total: usize = chunks.iter().map(Vec::len).sum();
        if total < needed {
            return None;
        }

        let mut samples = Vec::with_capacity(needed);
        let mut to_skip = total - needed;
        for chunk in chunks.iter() {
            if to_skip >= chunk.len() {
                to_skip -= chunk.len();
                continue;
            }
            samples.extend_from_slice(&chunk[to_skip..]);
            to_skip = 0;
        }
        Some(PcmWindow::mono(samples, self.sample_rate))
    }

    /// Chunks dropped to keep the queue fresh.
    #[must_use]
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// [`MicCapture`] fed by an external producer through a [`ChunkQueue`].
pub struct QueueMicCapture {
    queue: Arc<ChunkQueue>,
}

impl QueueMicCapture {
    /// Wraps a queue.
    #[must_use]
    pub fn new(queue: Arc<ChunkQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl MicCapture for QueueMicCapture {
    async fn capture(&self, duration_s: f32) -> SyncResult<PcmWindow> {
        self.queue.window(duration_s).ok_or_else(|| {
            SyncError::ResourceExhaustion("not enough captured audio queued".to_string())
        })
    }

    fn sample_rate(&self) -> u32 {
        self.queue.sample_rate
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ring Loopback Capture
// ─────────────────────────────────────────────────────────────────────────────

/// Capture that reads straight from an [`AudioRing`].
///
/// Used by receivers co-located with the transmitter (loopback) and by
/// tests; what "the microphone hears" is exactly the program audio.
pub struct RingMicCapture {
    ring: Arc<AudioRing>,
}

impl RingMicCapture {
    /// Wraps a ring.
    #[must_use]
    pub fn new(ring: Arc<AudioRing>) -> Self {
        Self { ring }
    }
}

#[async_trait]
impl MicCapture for RingMicCapture {
    async fn capture(&self, duration_s: f32) -> SyncResult<PcmWindow> {
        let read = self.ring.latest(duration_s)?;
        Ok(read.window)
    }

    fn sample_rate(&self) -> u32 {
        self.ring.sample_rate()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Simulated Capture
// ─────────────────────────────────────────────────────────────────────────────

/// Capture that emulates a microphone hearing the program audio with a
/// fixed acoustic+pipeline latency.
///
/// Demo receivers without real capture hardware use this: "what the mic
/// hears" is the reference audio from `latency_ms` in the past, so the
/// whole closed loop (measure → report → offset) can be exercised against
/// a live transmitter.
pub struct SimulatedMicCapture {
    source: Arc<dyn super::reference::ReferenceSource>,
    sample_rate: u32,
    latency_ms: f32,
}

impl SimulatedMicCapture {
    /// Creates a simulated capture with the given apparent latency.
    #[must_use]
    pub fn new(
        source: Arc<dyn super::reference::ReferenceSource>,
        sample_rate: u32,
        latency_ms: f32,
    ) -> Self {
        Self {
            source,
            sample_rate,
            latency_ms,
        }
    }
}

#[async_trait]
impl MicCapture for SimulatedMicCapture {
    async fn capture(&self, duration_s: f32) -> SyncResult<PcmWindow> {
        self.source.fetch(duration_s, -self.latency_ms / 1000.0).await
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_most_recent_window() {
        let queue = ChunkQueue::new(1000, 16);
        queue.push(vec![0.1; 500]);
        queue.push(vec![0.2; 500]);
        queue.push(vec![0.3; 500]);

        // 1 second = 1000 samples: the last two chunks.
        let window = queue.window(1.0).unwrap();
        assert_eq!(window.frames(), 1000);
        assert_eq!(window.samples()[0], 0.2);
        assert_eq!(window.samples()[999], 0.3);
    }

    #[test]
    fn returns_none_until_enough_audio() {
        let queue = ChunkQueue::new(1000, 16);
        queue.push(vec![0.0; 400]);
        assert!(queue.window(1.0).is_none());
        queue.push(vec![0.0; 700]);
        assert!(queue.window(1.0).is_some());
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = ChunkQueue::new(1000, 2);
        queue.push(vec![0.1; 600]);
        queue.push(vec![0.2; 600]);
        queue.push(vec![0.3; 600]);
        assert_eq!(queue.dropped_chunks(), 1);

        let window = queue.window(1.0).unwrap();
        // The 0.1 chunk is gone; the window spans the 0.2 and 0.3 chunks.
        assert_eq!(window.samples()[0], 0.2);
        assert_eq!(window.samples()[999], 0.3);
    }

    #[tokio::test]
    async fn queue_capture_errors_when_starved() {
        let queue = ChunkQueue::new(44_100, 16);
        let capture = QueueMicCapture::new(queue);
        let err = capture.capture(1.0).await.unwrap_err();
        assert_eq!(err.code(), "resource_exhausted");
    }

    #[tokio::test]
    async fn ring_capture_reads_latest() {
        use crate::config::RingConfig;

        let ring = Arc::new(
            AudioRing::new(RingConfig {
                sample_rate: 44_100,
                channels: 1,
                buffer_seconds: 5.0,
            })
            .unwrap(),
        );
        ring.write(&PcmWindow::mono(vec![0.5; 44_100], 44_100));

        let capture = RingMicCapture::new(ring);
        let window = capture.capture(0.5).await.unwrap();
        assert_eq!(window.frames(), 22_050);
        assert!(window.samples().iter().all(|&s| s == 0.5));
    }
}
