//! Built-in audio sources for the reference ring.
//!
//! Real deployments ingest program audio from a capture or decode
//! pipeline; the built-in sources stand in for it so a bare server still
//! serves correlatable reference audio. Chunks are pumped at real-time
//! pace with a phase-continuous generator.

use std::str::FromStr;
use std::sync::Arc;

use syncstream_core::{AudioRing, PcmWindow};
use tokio_util::sync::CancellationToken;

/// Chunk length pumped into the ring per tick.
const CHUNK_SECONDS: f32 = 0.1;

/// Selectable built-in source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceKind {
    /// Zeroed frames. Receivers cannot correlate against silence, so this
    /// is only useful when an external writer feeds the ring instead.
    Silence,
    /// Phase-continuous sine at the given frequency.
    Tone { frequency: f32 },
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("silence") {
            return Ok(Self::Silence);
        }
        if let Some(freq) = value.strip_prefix("tone:") {
            let frequency: f32 = freq
                .parse()
                .map_err(|_| format!("invalid tone frequency: {}", freq))?;
            if frequency <= 0.0 {
                return Err(format!("tone frequency must be > 0, got {}", frequency));
            }
            return Ok(Self::Tone { frequency });
        }
        Err(format!(
            "unknown source '{}' (expected 'silence' or 'tone:<hz>')",
            value
        ))
    }
}

/// Spawns the source pump until cancellation.
pub fn spawn_source(ring: Arc<AudioRing>, kind: SourceKind, cancel: CancellationToken) {
    tokio::spawn(async move {
        let sample_rate = ring.sample_rate();
        let chunk_frames = (sample_rate as f32 * CHUNK_SECONDS) as usize;
        let mut phase_frame: u64 = 0;

        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs_f32(CHUNK_SECONDS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);

        log::info!("[Source] pumping {:?} into the reference ring", kind);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let samples = match kind {
                        SourceKind::Silence => vec![0.0f32; chunk_frames],
                        SourceKind::Tone { frequency } => {
                            let step =
                                2.0 * std::f32::consts::PI * frequency / sample_rate as f32;
                            (0..chunk_frames)
                                .map(|i| 0.5 * (step * (phase_frame + i as u64) as f32).sin())
                                .collect()
                        }
                    };
                    phase_frame += chunk_frames as u64;
                    ring.write(&PcmWindow::mono(samples, sample_rate));
                }
            }
        }
        log::info!("[Source] pump stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_source_kinds() {
        assert_eq!(SourceKind::from_str("silence").unwrap(), SourceKind::Silence);
        assert_eq!(
            SourceKind::from_str("tone:440").unwrap(),
            SourceKind::Tone { frequency: 440.0 }
        );
        assert!(SourceKind::from_str("tone:-5").is_err());
        assert!(SourceKind::from_str("microphone").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pump_fills_the_ring() {
        use syncstream_core::RingConfig;

        let ring = Arc::new(
            AudioRing::new(RingConfig {
                sample_rate: 44_100,
                channels: 2,
                buffer_seconds: 5.0,
            })
            .unwrap(),
        );
        let cancel = CancellationToken::new();
        spawn_source(
            Arc::clone(&ring),
            SourceKind::Tone { frequency: 440.0 },
            cancel.clone(),
        );

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        cancel.cancel();

        assert!(ring.info().samples_written > 0);
    }
}
