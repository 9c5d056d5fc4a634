//! Audio output seam.
//!
//! The core never drives hardware. Receivers hand playback to an
//! [`AudioOutput`] implementation selected by an [`OutputConfig`] tagged
//! variant; the agent only ever sets a target playback delay on it
//! (setpoint-only; the pipeline smooths the transition itself). The
//! implementations shipped here are the null output for headless and test
//! use and a logging wrapper; real ALSA/Pulse/cast drivers implement the
//! same trait out of crate.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::protocol::DeviceType;

/// Output selection, tagged by ecosystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputConfig {
    Analog {
        #[serde(default)]
        device_name: Option<String>,
    },
    Hdmi {
        #[serde(default)]
        device_name: Option<String>,
    },
    Chromecast {
        #[serde(default)]
        host: Option<String>,
    },
    Airplay {
        #[serde(default)]
        host: Option<String>,
    },
    Bluetooth {
        device_address: String,
    },
    Snapcast {
        server_host: String,
        #[serde(default = "default_snapcast_port")]
        server_port: u16,
    },
    Pulse {
        #[serde(default)]
        sink_name: Option<String>,
    },
    Alsa {
        #[serde(default)]
        device_name: Option<String>,
    },
}

fn default_snapcast_port() -> u16 {
    1704
}

impl OutputConfig {
    /// The protocol device type this output reports.
    #[must_use]
    pub fn device_type(&self) -> DeviceType {
        match self {
            Self::Analog { .. } => DeviceType::Analog,
            Self::Hdmi { .. } => DeviceType::Hdmi,
            Self::Chromecast { .. } => DeviceType::Chromecast,
            Self::Airplay { .. } => DeviceType::Airplay,
            Self::Bluetooth { .. } => DeviceType::Bluetooth,
            Self::Snapcast { .. } => DeviceType::Snapcast,
            Self::Pulse { .. } => DeviceType::Pulse,
            Self::Alsa { .. } => DeviceType::Alsa,
        }
    }
}

/// Copied-out output state.
#[derive(Debug, Clone, Serialize)]
pub struct OutputStatus {
    pub device_type: DeviceType,
    pub connected: bool,
    pub playing: bool,
    pub muted: bool,
    pub volume: f32,
    pub delay_ms: f32,
    pub stream_url: Option<String>,
}

/// Capability set shared by every output driver.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Establishes whatever session the ecosystem needs.
    async fn connect(&self) -> SyncResult<()>;

    /// Tears the session down. Idempotent.
    async fn disconnect(&self);

    /// Starts playing the given stream.
    async fn start_stream(&self, stream_url: &str) -> SyncResult<()>;

    /// Stops playback. Idempotent.
    async fn stop_stream(&self);

    /// Sets the output volume in [0, 1].
    async fn set_volume(&self, volume: f32) -> SyncResult<()>;

    /// Mutes or unmutes the output.
    fn set_mute(&self, muted: bool);

    /// Sets the target playback delay. Setpoint-only: the pipeline ramps
    /// toward it at its own pace.
    fn set_delay(&self, delay_ms: f32);

    /// Copies out the current state.
    fn status(&self) -> OutputStatus;
}

// ─────────────────────────────────────────────────────────────────────────────
// Null Output
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct NullState {
    connected: bool,
    playing: bool,
    muted: bool,
    volume: f32,
    delay_ms: f32,
    stream_url: Option<String>,
}

/// In-memory output for headless receivers and tests. Tracks every
/// setpoint faithfully but never touches hardware.
pub struct NullOutput {
    device_type: DeviceType,
    state: Mutex<NullState>,
}

impl NullOutput {
    /// Creates a null output reporting the given device type.
    #[must_use]
    pub fn new(device_type: DeviceType) -> Self {
        Self {
            device_type,
            state: Mutex::new(NullState {
                connected: false,
                playing: false,
                muted: false,
                volume: 1.0,
                delay_ms: 0.0,
                stream_url: None,
            }),
        }
    }
}

#[async_trait]
impl AudioOutput for NullOutput {
    async fn connect(&self) -> SyncResult<()> {
        self.state.lock().connected = true;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.playing = false;
    }

    async fn start_stream(&self, stream_url: &str) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.playing = true;
        state.stream_url = Some(stream_url.to_string());
        Ok(())
    }

    async fn stop_stream(&self) {
        let mut state = self.state.lock();
        state.playing = false;
        state.stream_url = None;
    }

    async fn set_volume(&self, volume: f32) -> SyncResult<()> {
        self.state.lock().volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    fn set_mute(&self, muted: bool) {
        self.state.lock().muted = muted;
    }

    fn set_delay(&self, delay_ms: f32) {
        self.state.lock().delay_ms = delay_ms;
    }

    fn status(&self) -> OutputStatus {
        let state = self.state.lock();
        OutputStatus {
            device_type: self.device_type,
            connected: state.connected,
            playing: state.playing,
            muted: state.muted,
            volume: state.volume,
            delay_ms: state.delay_ms,
            stream_url: state.stream_url.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Output
// ─────────────────────────────────────────────────────────────────────────────

/// Wraps another output and logs every call. Useful when bringing up a new
/// receiver without hardware attached.
pub struct LoggingOutput<O: AudioOutput> {
    inner: O,
}

impl<O: AudioOutput> LoggingOutput<O> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: O) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<O: AudioOutput> AudioOutput for LoggingOutput<O> {
    async fn connect(&self) -> SyncResult<()> {
        log::info!("[Output] connect");
        self.inner.connect().await
    }

    async fn disconnect(&self) {
        log::info!("[Output] disconnect");
        self.inner.disconnect().await;
    }

    async fn start_stream(&self, stream_url: &str) -> SyncResult<()> {
        log::info!("[Output] start_stream {}", stream_url);
        self.inner.start_stream(stream_url).await
    }

    async fn stop_stream(&self) {
        log::info!("[Output] stop_stream");
        self.inner.stop_stream().await;
    }

    async fn set_volume(&self, volume: f32) -> SyncResult<()> {
        log::info!("[Output] set_volume {:.2}", volume);
        self.inner.set_volume(volume).await
    }

    fn set_mute(&self, muted: bool) {
        log::info!("[Output] set_mute {}", muted);
        self.inner.set_mute(muted);
    }

    fn set_delay(&self, delay_ms: f32) {
        log::debug!("[Output] set_delay {:.1}ms", delay_ms);
        self.inner.set_delay(delay_ms);
    }

    fn status(&self) -> OutputStatus {
        self.inner.status()
    }
}

/// Builds the output for a configuration.
///
/// The core ships only setpoint-tracking outputs; embedders swap in real
/// drivers by constructing their own `Arc<dyn AudioOutput>` instead.
#[must_use]
pub fn create_output(config: &OutputConfig) -> Arc<dyn AudioOutput> {
    Arc::new(LoggingOutput::new(NullOutput::new(config.device_type())))
}
