//! Broker-attached bus client for services inside the transmitter process.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::broker::MessageBroker;
use super::{dispatch_guarded, BusMessage, BusStats, Handler, LastWill, MessageBus, QoS, StatsCounters};
use crate::error::{SyncError, SyncResult};
use crate::protocol::topic_matches;

struct LiveSession {
    session_id: u64,
    cancel: CancellationToken,
}

/// A [`MessageBus`] implementation wired directly into the in-process
/// [`MessageBroker`]. The transmitter's controller uses one of these; no
/// network sits between it and the broker, so `connect` cannot fail other
/// than by repeated use after `disconnect`.
pub struct LocalBusClient {
    broker: Arc<MessageBroker>,
    client_id: String,
    last_will: Option<LastWill>,
    handlers: Arc<RwLock<Vec<(String, Handler)>>>,
    session: Mutex<Option<LiveSession>>,
    counters: Arc<StatsCounters>,
}

impl LocalBusClient {
    /// Creates a client for the given broker.
    #[must_use]
    pub fn new(broker: Arc<MessageBroker>, client_id: impl Into<String>) -> Self {
        Self {
            broker,
            client_id: client_id.into(),
            last_will: None,
            handlers: Arc::new(RwLock::new(Vec::new())),
            session: Mutex::new(None),
            counters: Arc::new(StatsCounters::default()),
        }
    }

    /// Registers the last-will published if this session drops abruptly.
    #[must_use]
    pub fn with_last_will(mut self, will: LastWill) -> Self {
        self.last_will = Some(will);
        self
    }
}

#[async_trait]
impl MessageBus for LocalBusClient {
    async fn connect(&self) -> SyncResult<()> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Ok(());
        }
        self.counters.record_attempt();

        let handle = self.broker.attach(&self.client_id, self.last_will.clone());
        let session_id = handle.session_id;
        let mut rx = handle.rx;
        let cancel = CancellationToken::new();

        // Re-establish every known subscription on the fresh session.
        for (pattern, _) in self.handlers.read().iter() {
            self.broker.subscribe(session_id, pattern);
        }

        let handlers = Arc::clone(&self.handlers);
        let counters = Arc::clone(&self.counters);
        let dispatch_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = dispatch_cancel.cancelled() => break,
                    received = rx.recv() => {
                        let Some(message) = received else { break };
                        counters.record_received();
                        let matching: Vec<Handler> = handlers
                            .read()
                            .iter()
                            .filter(|(pattern, _)| topic_matches(&message.topic, pattern))
                            .map(|(_, handler)| Arc::clone(handler))
                            .collect();
                        for handler in matching {
                            dispatch_guarded(&handler, message.clone());
                        }
                    }
                }
            }
        });

        *session = Some(LiveSession { session_id, cancel });
        log::info!("[Bus] local client '{}' connected", self.client_id);
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(live) = self.session.lock().take() else {
            return;
        };
        live.cancel.cancel();
        self.broker.detach(live.session_id, true);
        log::info!("[Bus] local client '{}' disconnected", self.client_id);
    }

    async fn publish(&self, topic: &str, payload: String, qos: QoS) -> SyncResult<()> {
        if self.session.lock().is_none() {
            return Err(SyncError::TransientTransport(
                "bus client is not connected".to_string(),
            ));
        }
        self.counters.record_sent();
        self.broker.publish(BusMessage::new(topic, payload, qos));
        Ok(())
    }

    async fn publish_retained(&self, topic: &str, payload: String, qos: QoS) -> SyncResult<()> {
        if self.session.lock().is_none() {
            return Err(SyncError::TransientTransport(
                "bus client is not connected".to_string(),
            ));
        }
        self.counters.record_sent();
        self.broker
            .publish(BusMessage::new(topic, payload, qos).retained());
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, handler: Handler) -> SyncResult<()> {
        self.handlers
            .write()
            .push((pattern.to_string(), handler));
        if let Some(live) = self.session.lock().as_ref() {
            self.broker.subscribe(live.session_id, pattern);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }

    fn statistics(&self) -> BusStats {
        self.counters.snapshot(self.is_connected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let broker = Arc::new(MessageBroker::new(32));
        let client = LocalBusClient::new(Arc::clone(&broker), "controller");
        client.connect().await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = Arc::clone(&seen);
        client
            .subscribe(
                "syncstream/drift/+",
                Arc::new(move |msg| {
                    assert_eq!(msg.topic, "syncstream/drift/kitchen");
                    seen_in_handler.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        client
            .publish(
                "syncstream/drift/kitchen",
                "{}".to_string(),
                QoS::AtLeastOnce,
            )
            .await
            .unwrap();

        sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_without_connect_is_transient_error() {
        let broker = Arc::new(MessageBroker::new(32));
        let client = LocalBusClient::new(broker, "x");
        let err = client
            .publish("syncstream/drift/x", "{}".to_string(), QoS::AtLeastOnce)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "transient_transport");
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let broker = Arc::new(MessageBroker::new(32));
        let client = LocalBusClient::new(broker, "x");
        client.connect().await.unwrap();
        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert_eq!(client.statistics().connection_attempts, 1);
    }

    #[tokio::test]
    async fn subscriptions_survive_reconnect() {
        let broker = Arc::new(MessageBroker::new(32));
        let client = LocalBusClient::new(Arc::clone(&broker), "controller");

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = Arc::clone(&seen);
        client
            .subscribe(
                "syncstream/heartbeat/+",
                Arc::new(move |_| {
                    seen_in_handler.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        client.connect().await.unwrap();
        client.disconnect().await;
        client.connect().await.unwrap();

        client
            .publish(
                "syncstream/heartbeat/kitchen",
                "{}".to_string(),
                QoS::AtMostOnce,
            )
            .await
            .unwrap();

        sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_break_others() {
        let broker = Arc::new(MessageBroker::new(32));
        let client = LocalBusClient::new(Arc::clone(&broker), "controller");
        client.connect().await.unwrap();

        client
            .subscribe("syncstream/drift/+", Arc::new(|_| panic!("boom")))
            .await
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = Arc::clone(&seen);
        client
            .subscribe(
                "syncstream/drift/+",
                Arc::new(move |_| {
                    seen_in_handler.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        client
            .publish("syncstream/drift/a", "{}".to_string(), QoS::AtLeastOnce)
            .await
            .unwrap();

        sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
