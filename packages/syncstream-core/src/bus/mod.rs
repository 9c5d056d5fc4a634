//! Topic-based publish/subscribe messaging.
//!
//! The control plane talks over a small MQTT-like bus:
//!
//! - [`MessageBroker`]: the in-process topic router hosted by the
//!   transmitter (wildcard subscriptions, retained messages, last-will).
//! - [`LocalBusClient`]: a broker-attached client for services living in
//!   the transmitter process.
//! - [`WsBusClient`]: the receiver-side client, speaking the broker's
//!   WebSocket framing with backoff reconnect.
//! - [`bus_router`]: the axum endpoint bridging remote sessions into the
//!   broker.
//!
//! Delivery is at-least-once for QoS 1 topics (drift, offsets, commands,
//! registrations) and best-effort for QoS 0 (status, heartbeat).

pub mod broker;
pub mod local;
pub mod remote;
pub mod server;

pub use broker::{BrokerStats, MessageBroker};
pub use local::LocalBusClient;
pub use remote::WsBusClient;
pub use server::bus_router;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::utils::now_secs;

/// Delivery guarantee for a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QoS {
    /// Fire-and-forget fan-out.
    AtMostOnce,
    /// Queued for known-but-disconnected subscribers and redelivered on
    /// reattach.
    AtLeastOnce,
}

impl Default for QoS {
    fn default() -> Self {
        Self::from_level(crate::protocol::constants::DEFAULT_QOS)
    }
}

impl QoS {
    /// Numeric wire representation.
    #[must_use]
    pub fn level(&self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
        }
    }

    /// Parses a numeric QoS level; anything above 1 clamps to 1.
    #[must_use]
    pub fn from_level(level: u8) -> Self {
        if level == 0 {
            Self::AtMostOnce
        } else {
            Self::AtLeastOnce
        }
    }
}

/// A message traveling over the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    /// UTF-8 JSON payload.
    pub payload: String,
    pub qos: QoS,
    /// Retained messages are replayed to late subscribers.
    pub retain: bool,
}

impl BusMessage {
    /// Creates a non-retained message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        }
    }

    /// Marks the message as retained.
    #[must_use]
    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}

/// Testament registered at connect time; the broker publishes it when the
/// session drops without a graceful disconnect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

/// Subscription callback. Handlers run sequentially per client; a panic in
/// a handler is contained and logged, never taking down the bus.
pub type Handler = Arc<dyn Fn(BusMessage) + Send + Sync>;

/// Counters surfaced by every bus client.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub connection_attempts: u64,
    pub last_activity_unix: f64,
    pub connected: bool,
}

/// Shared atomic counter block backing [`BusStats`].
#[derive(Default)]
pub(crate) struct StatsCounters {
    sent: AtomicU64,
    received: AtomicU64,
    attempts: AtomicU64,
    /// Unix time in milliseconds to keep it atomic.
    last_activity_ms: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub(crate) fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn touch(&self) {
        self.last_activity_ms
            .store((now_secs() * 1000.0) as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, connected: bool) -> BusStats {
        BusStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            connection_attempts: self.attempts.load(Ordering::Relaxed),
            last_activity_unix: self.last_activity_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            connected,
        }
    }
}

/// Capability set shared by all bus clients.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Establishes the session. Idempotent; a second call on a live
    /// session is a no-op.
    async fn connect(&self) -> SyncResult<()>;

    /// Gracefully tears the session down (the last-will does not fire).
    async fn disconnect(&self);

    /// Publishes a payload.
    async fn publish(&self, topic: &str, payload: String, qos: QoS) -> SyncResult<()>;

    /// Publishes a retained payload.
    async fn publish_retained(&self, topic: &str, payload: String, qos: QoS) -> SyncResult<()>;

    /// Registers a handler for a topic pattern (`+`/`#` wildcards).
    ///
    /// Subscriptions survive reconnects: clients re-establish every
    /// registered pattern when a new session comes up.
    async fn subscribe(&self, pattern: &str, handler: Handler) -> SyncResult<()>;

    /// Whether a session is currently live.
    fn is_connected(&self) -> bool;

    /// Counter snapshot.
    fn statistics(&self) -> BusStats;
}

/// Invokes a handler, containing panics so one bad subscriber cannot take
/// down the dispatch loop.
pub(crate) fn dispatch_guarded(handler: &Handler, message: BusMessage) {
    let topic = message.topic.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(message)));
    if result.is_err() {
        log::warn!("[Bus] subscriber panicked handling '{}'", topic);
    }
}
