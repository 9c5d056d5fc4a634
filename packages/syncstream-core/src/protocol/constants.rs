//! Fixed protocol constants that should NOT be changed.
//!
//! These values are part of the wire contract between transmitters and
//! receivers; changing them breaks interoperability with deployed nodes.

/// Root segment of every SyncStream topic.
pub const TOPIC_ROOT: &str = "syncstream";

/// Maximum serialized payload size in bytes (64 KiB).
///
/// Larger payloads are rejected on both publish and receive so that one
/// misbehaving node cannot balloon broker memory.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default QoS for control-plane messages (at-least-once).
pub const DEFAULT_QOS: u8 = 1;

/// Timeout for reference-audio fetches (seconds).
pub const REFERENCE_FETCH_TIMEOUT_SECS: u64 = 5;

/// Bound on graceful component shutdown before in-flight work is abandoned
/// (seconds).
pub const SHUTDOWN_GRACE_SECS: u64 = 5;

/// Service identifier reported by the transmitter's `/health` endpoint.
///
/// Receivers probe `/health` and expect this exact string to confirm they
/// reached a SyncStream transmitter rather than some other HTTP server.
pub const SERVICE_ID: &str = "syncstream-transmitter";

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;
