//! Event emitter abstraction for decoupling services from transport.
//!
//! Services depend on the [`EventEmitter`] trait rather than a concrete
//! channel, enabling testing and alternative delivery mechanisms.

use super::SyncEvent;

/// Trait for emitting sync events without knowledge of transport.
pub trait EventEmitter: Send + Sync {
    /// Emits a synchronization event.
    fn emit(&self, event: SyncEvent);
}

/// No-op emitter for tests and embedders that don't observe events.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: SyncEvent) {
        // No-op
    }
}

/// Logging emitter for debugging and headless deployments.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit(&self, event: SyncEvent) {
        tracing::debug!(?event, "sync_event");
    }
}

/// Emitter that fans events out over a tokio broadcast channel.
///
/// Dashboards or persistence layers subscribe via [`Self::subscribe`]; a
/// send with no subscribers is not an error.
pub struct BroadcastEventEmitter {
    tx: tokio::sync::broadcast::Sender<SyncEvent>,
}

impl BroadcastEventEmitter {
    /// Creates an emitter with a channel of the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribes to the event stream.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl EventEmitter for BroadcastEventEmitter {
    fn emit(&self, event: SyncEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Test emitter that counts events.
    struct CountingEventEmitter {
        count: AtomicUsize,
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit(&self, _event: SyncEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn counting_emitter_tracks_events() {
        let emitter = Arc::new(CountingEventEmitter {
            count: AtomicUsize::new(0),
        });

        emitter.emit(SyncEvent::DeviceTimedOut {
            device_id: "a".to_string(),
            timestamp: 0,
        });
        emitter.emit(SyncEvent::DeviceRegistered {
            device_id: "a".to_string(),
            sync_group: "default".to_string(),
            timestamp: 0,
        });

        assert_eq!(emitter.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn broadcast_emitter_delivers_to_subscribers() {
        let emitter = BroadcastEventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(SyncEvent::DeviceTimedOut {
            device_id: "kitchen".to_string(),
            timestamp: 42,
        });

        match rx.recv().await.unwrap() {
            SyncEvent::DeviceTimedOut { device_id, .. } => assert_eq!(device_id, "kitchen"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn broadcast_emitter_without_subscribers_is_fine() {
        let emitter = BroadcastEventEmitter::new(4);
        emitter.emit(SyncEvent::DeviceTimedOut {
            device_id: "a".to_string(),
            timestamp: 0,
        });
    }
}
