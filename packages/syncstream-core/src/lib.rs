//! SyncStream core - the synchronization control plane for multi-room
//! audio playback.
//!
//! A single transmitter feeds many heterogeneous receivers (analog amps,
//! HDMI sinks, cast targets). Each receiver measures its own drift by
//! cross-correlating what its microphone hears against reference audio
//! fetched from the transmitter, and a central controller pulls every
//! receiver toward a common virtual playback time via per-device buffer
//! offsets.
//!
//! # Architecture
//!
//! - [`audio`]: PCM primitives and the rolling [`audio::AudioRing`]
//! - [`api`]: HTTP reference service serving ring windows
//! - [`dsp`]: high-pass conditioning, FFT cross-correlation, the
//!   [`dsp::DriftEstimator`]
//! - [`agent`]: the per-receiver measurement/report/command loop
//! - [`sync`]: per-device state and the group [`sync::SyncController`]
//! - [`bus`]: topic pub/sub (broker, local and WebSocket clients)
//! - [`protocol`]: topics, message schemas, validation
//! - [`events`]: event fan-out for observers
//! - [`bootstrap`]: composition roots for both node roles
//!
//! # Wiring
//!
//! Components never reach for globals. Both node roles are assembled by a
//! composition root ([`bootstrap::bootstrap_transmitter`] /
//! [`bootstrap::bootstrap_receiver`]) that hands each service its
//! dependencies as trait objects, so every seam (bus, capture, reference
//! source, audio output, event sink) can be swapped for tests or
//! alternative backends.

#![warn(clippy::all)]

pub mod agent;
pub mod api;
pub mod audio;
pub mod bootstrap;
pub mod bus;
pub mod config;
pub mod dsp;
pub mod error;
pub mod events;
pub mod output;
pub mod protocol;
pub mod sync;
pub mod utils;

// Re-export commonly used types at the crate root
pub use agent::{
    ChunkQueue, DeviceIdentity, HttpReferenceClient, MicCapture, QueueMicCapture, ReceiverAgent,
    ReferenceSource, RingMicCapture, RingReference, SimulatedMicCapture,
};
pub use api::{api_router, AppState};
pub use audio::{AudioRing, PcmWindow, RingInfo, RingRead};
pub use bootstrap::{bootstrap_receiver, bootstrap_transmitter, ReceiverRuntime, SyncRuntime};
pub use bus::{
    bus_router, BusMessage, BusStats, LastWill, LocalBusClient, MessageBroker, MessageBus, QoS,
    WsBusClient,
};
pub use config::{AgentConfig, BusConfig, ControllerConfig, EstimatorConfig, RingConfig};
pub use dsp::{DriftEstimator, DriftMeasurement, MeasurementError};
pub use error::{ErrorCode, SyncError, SyncResult};
pub use events::{BroadcastEventEmitter, EventEmitter, LoggingEventEmitter, NoopEventEmitter, SyncEvent};
pub use output::{create_output, AudioOutput, NullOutput, OutputConfig, OutputStatus};
pub use protocol::{
    BufferOffset, Command, CommandType, DeviceRegister, DeviceStatus, DeviceType, DriftReport,
    Heartbeat, MessageKind, SyncStatus,
};
pub use sync::{ControllerSnapshot, DeviceSnapshot, DeviceState, SyncController, SyncQuality};
pub use utils::{now_millis, now_secs};
