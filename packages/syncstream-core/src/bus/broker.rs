//! In-process topic broker hosted by the transmitter.
//!
//! Routes published messages to every attached session with a matching
//! subscription, replays retained messages to late subscribers, queues
//! QoS 1 traffic for known-but-disconnected clients, and publishes a
//! session's last-will when it drops without a graceful disconnect.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use super::{BusMessage, LastWill, QoS, StatsCounters};
use crate::protocol::topic_matches;

/// Bound on each disconnected client's QoS 1 backlog; oldest entries are
/// dropped first when it fills.
const OFFLINE_QUEUE_CAPACITY: usize = 512;

/// Handle to an attached session.
pub struct SessionHandle {
    pub session_id: u64,
    /// Messages routed to this session.
    pub rx: mpsc::Receiver<BusMessage>,
}

struct Session {
    client_id: String,
    tx: mpsc::Sender<BusMessage>,
    subscriptions: Mutex<Vec<String>>,
    last_will: Option<LastWill>,
}

/// Per-client state remembered across sessions so QoS 1 messages can be
/// redelivered on reattach.
struct KnownClient {
    subscriptions: Vec<String>,
    backlog: VecDeque<BusMessage>,
}

/// Counters surfaced by [`MessageBroker::statistics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct BrokerStats {
    pub sessions: usize,
    pub retained_messages: usize,
    pub known_clients: usize,
    pub messages_routed: u64,
    pub messages_dropped: u64,
}

/// The in-process topic router.
pub struct MessageBroker {
    next_session_id: AtomicU64,
    sessions: DashMap<u64, Arc<Session>>,
    retained: DashMap<String, BusMessage>,
    known_clients: DashMap<String, KnownClient>,
    routed: AtomicU64,
    dropped: AtomicU64,
    session_queue_capacity: usize,
    pub(crate) counters: StatsCounters,
}

impl MessageBroker {
    /// Creates a broker whose per-session queues hold `queue_capacity`
    /// messages.
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            next_session_id: AtomicU64::new(1),
            sessions: DashMap::new(),
            retained: DashMap::new(),
            known_clients: DashMap::new(),
            routed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            session_queue_capacity: queue_capacity.max(1),
            counters: StatsCounters::default(),
        }
    }

    /// Attaches a client session.
    ///
    /// A previous session for the same `client_id` stays untouched (the
    /// old socket will drop on its own); the new session inherits nothing
    /// except the queued QoS 1 backlog, which is flushed into it.
    pub fn attach(&self, client_id: &str, last_will: Option<LastWill>) -> SessionHandle {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.session_queue_capacity);

        let session = Arc::new(Session {
            client_id: client_id.to_string(),
            tx,
            subscriptions: Mutex::new(Vec::new()),
            last_will,
        });
        self.sessions.insert(session_id, Arc::clone(&session));

        log::info!(
            "[Broker] session {} attached (client '{}', {} total)",
            session_id,
            client_id,
            self.sessions.len()
        );

        // Redeliver anything queued while the client was away.
        if let Some(mut known) = self.known_clients.get_mut(client_id) {
            let backlog: Vec<BusMessage> = known.backlog.drain(..).collect();
            drop(known);
            for message in backlog {
                self.deliver(&session, message);
            }
        }

        SessionHandle { session_id, rx }
    }

    /// Detaches a session. `graceful` suppresses the last-will.
    pub fn detach(&self, session_id: u64, graceful: bool) {
        let Some((_, session)) = self.sessions.remove(&session_id) else {
            return;
        };

        // Remember the client's subscriptions so QoS 1 traffic queues for
        // it while it is away.
        let subscriptions = session.subscriptions.lock().clone();
        self.known_clients
            .entry(session.client_id.clone())
            .or_insert_with(|| KnownClient {
                subscriptions: Vec::new(),
                backlog: VecDeque::new(),
            })
            .subscriptions = subscriptions;

        log::info!(
            "[Broker] session {} detached ({}, client '{}')",
            session_id,
            if graceful { "graceful" } else { "abrupt" },
            session.client_id
        );

        if !graceful {
            if let Some(will) = session.last_will.clone() {
                log::warn!(
                    "[Broker] firing last-will for '{}' on {}",
                    session.client_id,
                    will.topic
                );
                let mut message = BusMessage::new(will.topic, will.payload, will.qos);
                message.retain = will.retain;
                self.publish(message);
            }
        }
    }

    /// Adds a subscription pattern to a session and replays matching
    /// retained messages.
    pub fn subscribe(&self, session_id: u64, pattern: &str) {
        let Some(session) = self.sessions.get(&session_id).map(|s| Arc::clone(&s)) else {
            return;
        };
        {
            let mut subs = session.subscriptions.lock();
            if !subs.iter().any(|p| p == pattern) {
                subs.push(pattern.to_string());
            }
        }
        log::debug!(
            "[Broker] session {} subscribed to '{}'",
            session_id,
            pattern
        );

        let retained: Vec<BusMessage> = self
            .retained
            .iter()
            .filter(|entry| topic_matches(entry.key(), pattern))
            .map(|entry| entry.value().clone())
            .collect();
        for message in retained {
            self.deliver(&session, message);
        }
    }

    /// Routes a message to every matching subscriber.
    ///
    /// Retained messages replace the previous retained payload for their
    /// topic (an empty retained payload clears it). QoS 1 messages that
    /// match a known-but-disconnected client are queued for redelivery.
    pub fn publish(&self, message: BusMessage) {
        if message.retain {
            if message.payload.is_empty() {
                self.retained.remove(&message.topic);
            } else {
                self.retained
                    .insert(message.topic.clone(), message.clone());
            }
        }

        let connected: Vec<String> = self
            .sessions
            .iter()
            .map(|s| s.value().client_id.clone())
            .collect();

        for session in self.sessions.iter() {
            let matched = session
                .value()
                .subscriptions
                .lock()
                .iter()
                .any(|p| topic_matches(&message.topic, p));
            if matched {
                self.deliver(session.value(), message.clone());
            }
        }

        // Queue QoS 1 traffic for subscribed clients that are away.
        if message.qos == QoS::AtLeastOnce {
            for mut known in self.known_clients.iter_mut() {
                if connected.iter().any(|c| c == known.key()) {
                    continue;
                }
                let matched = known
                    .value()
                    .subscriptions
                    .iter()
                    .any(|p| topic_matches(&message.topic, p));
                if matched {
                    let backlog = &mut known.value_mut().backlog;
                    if backlog.len() == OFFLINE_QUEUE_CAPACITY {
                        backlog.pop_front();
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    backlog.push_back(message.clone());
                }
            }
        }
    }

    fn deliver(&self, session: &Session, message: BusMessage) {
        match session.tx.try_send(message) {
            Ok(()) => {
                self.routed.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(m)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "[Broker] queue full for client '{}', dropping message on '{}'",
                    session.client_id,
                    m.topic
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Session is going away; detach will clean up.
            }
        }
    }

    /// Counter snapshot.
    #[must_use]
    pub fn statistics(&self) -> BrokerStats {
        BrokerStats {
            sessions: self.sessions.len(),
            retained_messages: self.retained.len(),
            known_clients: self.known_clients.len(),
            messages_routed: self.routed.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
