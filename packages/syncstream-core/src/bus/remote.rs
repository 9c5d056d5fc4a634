//! Receiver-side bus client over WebSocket.
//!
//! Maintains a session against the transmitter's bus endpoint with capped
//! exponential backoff (plus jitter) between attempts. Every time a new
//! session comes up the client re-establishes all subscriptions and fires
//! the registered session hook so the agent can re-send its registration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::server::WireFrame;
use super::{dispatch_guarded, BusMessage, BusStats, Handler, LastWill, MessageBus, QoS, StatsCounters};
use crate::config::BusConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::topic_matches;

/// How long `connect` waits for the first session before giving up.
const CONNECT_WAIT: Duration = Duration::from_secs(10);

/// How long a session waits for `CONN_ACK` after sending `CONNECT`.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Hook invoked on every (re)established session.
pub type SessionHook = Arc<dyn Fn() + Send + Sync>;

/// WebSocket [`MessageBus`] client with automatic reconnect.
pub struct WsBusClient {
    url: String,
    client_id: String,
    last_will: Mutex<Option<LastWill>>,
    config: BusConfig,
    handlers: Arc<RwLock<Vec<(String, Handler)>>>,
    outgoing_tx: mpsc::Sender<WireFrame>,
    outgoing_rx: Mutex<Option<mpsc::Receiver<WireFrame>>>,
    connected: Arc<AtomicBool>,
    session_hook: Arc<RwLock<Option<SessionHook>>>,
    cancel: CancellationToken,
    counters: Arc<StatsCounters>,
}

impl WsBusClient {
    /// Creates a client for the given bus endpoint URL
    /// (e.g. `ws://host:8080/ws`).
    #[must_use]
    pub fn new(url: impl Into<String>, client_id: impl Into<String>, config: BusConfig) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.session_queue_capacity);
        Self {
            url: url.into(),
            client_id: client_id.into(),
            last_will: Mutex::new(None),
            config,
            handlers: Arc::new(RwLock::new(Vec::new())),
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            connected: Arc::new(AtomicBool::new(false)),
            session_hook: Arc::new(RwLock::new(None)),
            cancel: CancellationToken::new(),
            counters: Arc::new(StatsCounters::default()),
        }
    }

    /// Registers the last-will published if the session drops abruptly.
    /// Takes effect from the next session.
    pub fn set_last_will(&self, will: LastWill) {
        *self.last_will.lock() = Some(will);
    }

    /// Registers a hook run on every (re)established session, after
    /// subscriptions are restored. The agent uses this to re-send its
    /// registration.
    pub fn set_session_hook(&self, hook: SessionHook) {
        *self.session_hook.write() = Some(hook);
    }

    fn enqueue(&self, frame: WireFrame) -> SyncResult<()> {
        match self.outgoing_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Bounded queue: dropping is preferable to unbounded growth
                // while the transmitter is away.
                log::warn!("[Bus] outbound queue full, dropping message");
                Err(SyncError::ResourceExhaustion(
                    "bus outbound queue full".to_string(),
                ))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SyncError::TransientTransport(
                "bus client is shut down".to_string(),
            )),
        }
    }
}

#[async_trait]
impl MessageBus for WsBusClient {
    async fn connect(&self) -> SyncResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Start the connection manager exactly once.
        if let Some(outgoing_rx) = self.outgoing_rx.lock().take() {
            let manager = ManagerContext {
                url: self.url.clone(),
                client_id: self.client_id.clone(),
                last_will: self.last_will.lock().clone(),
                config: self.config.clone(),
                handlers: Arc::clone(&self.handlers),
                connected: Arc::clone(&self.connected),
                session_hook: Arc::clone(&self.session_hook),
                cancel: self.cancel.clone(),
                counters: Arc::clone(&self.counters),
            };
            tokio::spawn(manager.run(outgoing_rx));
        }

        let waited = tokio::time::timeout(CONNECT_WAIT, async {
            while !self.connected.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        match waited {
            Ok(()) => Ok(()),
            Err(_) => Err(SyncError::TransientTransport(format!(
                "no bus session to {} within {:?} (reconnecting in background)",
                self.url, CONNECT_WAIT
            ))),
        }
    }

    async fn disconnect(&self) {
        // A graceful shutdown tells the broker not to fire the last-will.
        let _ = self.enqueue(WireFrame::Disconnect);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.cancel.cancel();
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn publish(&self, topic: &str, payload: String, qos: QoS) -> SyncResult<()> {
        self.counters.record_sent();
        self.enqueue(WireFrame::Publish {
            topic: topic.to_string(),
            payload,
            qos: qos.level(),
            retain: false,
        })
    }

    async fn publish_retained(&self, topic: &str, payload: String, qos: QoS) -> SyncResult<()> {
        self.counters.record_sent();
        self.enqueue(WireFrame::Publish {
            topic: topic.to_string(),
            payload,
            qos: qos.level(),
            retain: true,
        })
    }

    async fn subscribe(&self, pattern: &str, handler: Handler) -> SyncResult<()> {
        self.handlers
            .write()
            .push((pattern.to_string(), handler));
        if self.connected.load(Ordering::SeqCst) {
            self.enqueue(WireFrame::Subscribe {
                pattern: pattern.to_string(),
            })?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn statistics(&self) -> BusStats {
        self.counters.snapshot(self.is_connected())
    }
}

/// Everything the background connection manager owns.
struct ManagerContext {
    url: String,
    client_id: String,
    last_will: Option<LastWill>,
    config: BusConfig,
    handlers: Arc<RwLock<Vec<(String, Handler)>>>,
    connected: Arc<AtomicBool>,
    session_hook: Arc<RwLock<Option<SessionHook>>>,
    cancel: CancellationToken,
    counters: Arc<StatsCounters>,
}

impl ManagerContext {
    async fn run(self, mut outgoing_rx: mpsc::Receiver<WireFrame>) {
        let mut delay_ms = self.config.reconnect_initial_ms;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.counters.record_attempt();

            match tokio_tungstenite::connect_async(&self.url).await {
                Ok((ws, _)) => {
                    log::info!("[Bus] connected to {}", self.url);
                    let outcome = self.run_session(ws, &mut outgoing_rx).await;
                    self.connected.store(false, Ordering::SeqCst);
                    match outcome {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost => {
                            log::warn!("[Bus] session to {} lost", self.url);
                            delay_ms = self.config.reconnect_initial_ms;
                        }
                    }
                }
                Err(e) => {
                    log::debug!("[Bus] connect to {} failed: {}", self.url, e);
                }
            }

            // Jittered, capped exponential backoff before the next attempt.
            let jitter = rand::thread_rng().gen_range(0.8..1.2);
            let sleep_ms =
                ((delay_ms as f32 * jitter) as u64).min(self.config.reconnect_max_ms);
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
            }
            delay_ms = ((delay_ms as f32 * self.config.reconnect_backoff) as u64)
                .min(self.config.reconnect_max_ms);
        }

        log::info!("[Bus] connection manager for '{}' stopped", self.client_id);
    }

    async fn run_session<S>(
        &self,
        ws: tokio_tungstenite::WebSocketStream<S>,
        outgoing_rx: &mut mpsc::Receiver<WireFrame>,
    ) -> SessionEnd
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();

        let connect = WireFrame::Connect {
            client_id: self.client_id.clone(),
            last_will: self.last_will.clone(),
        };
        if send_frame(&mut sink, &connect).await.is_err() {
            return SessionEnd::Lost;
        }

        // Wait for the broker's acknowledgement before trusting the session.
        let acked = tokio::time::timeout(ACK_TIMEOUT, async {
            while let Some(Ok(message)) = stream.next().await {
                if let WsMessage::Text(text) = message {
                    if matches!(
                        serde_json::from_str::<WireFrame>(text.as_str()),
                        Ok(WireFrame::ConnAck)
                    ) {
                        return true;
                    }
                }
            }
            false
        })
        .await;
        if !matches!(acked, Ok(true)) {
            log::warn!("[Bus] no CONN_ACK from {}", self.url);
            return SessionEnd::Lost;
        }

        // Restore subscriptions, then let the agent re-register.
        let patterns: Vec<String> = self
            .handlers
            .read()
            .iter()
            .map(|(p, _)| p.clone())
            .collect();
        for pattern in patterns {
            if send_frame(&mut sink, &WireFrame::Subscribe { pattern }).await.is_err() {
                return SessionEnd::Lost;
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        if let Some(hook) = self.session_hook.read().clone() {
            hook();
        }

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = send_frame(&mut sink, &WireFrame::Disconnect).await;
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
                outbound = outgoing_rx.recv() => {
                    let Some(frame) = outbound else {
                        return SessionEnd::Shutdown;
                    };
                    let shutdown = matches!(frame, WireFrame::Disconnect);
                    if send_frame(&mut sink, &frame).await.is_err() {
                        return SessionEnd::Lost;
                    }
                    if shutdown {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<WireFrame>(text.as_str()) {
                                Ok(WireFrame::Publish { topic, payload, qos, retain }) => {
                                    self.counters.record_received();
                                    let mut message =
                                        BusMessage::new(topic, payload, QoS::from_level(qos));
                                    message.retain = retain;
                                    self.dispatch(message);
                                }
                                Ok(WireFrame::Ping) => {
                                    if send_frame(&mut sink, &WireFrame::Pong).await.is_err() {
                                        return SessionEnd::Lost;
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    log::warn!("[Bus] malformed frame from broker: {}", e);
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => return SessionEnd::Lost,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::debug!("[Bus] socket error: {}", e);
                            return SessionEnd::Lost;
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&self, message: BusMessage) {
        let matching: Vec<Handler> = self
            .handlers
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

enum SessionEnd {
    /// Cancelled or gracefully disconnected; do not reconnect.
    Shutdown,
    /// Transport failure; reconnect with backoff.
    Lost,
}

async fn send_frame<S>(
    sink: &mut futures::stream::SplitSink<tokio_tungstenite::WebSocketStream<S>, WsMessage>,
    frame: &WireFrame,
) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let text = serde_json::to_string(frame).unwrap_or_default();
    sink.send(WsMessage::Text(text.into())).await
}
