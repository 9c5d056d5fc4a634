//! WebSocket endpoint bridging remote bus sessions into the broker.
//!
//! Receivers connect to `/ws`, introduce themselves with a `CONNECT` frame
//! (carrying their client id and optional last-will), then exchange
//! `PUBLISH`/`SUBSCRIBE` frames. A socket that drops without a
//! `DISCONNECT` frame counts as an abrupt loss and fires the last-will.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};

use super::broker::MessageBroker;
use super::{BusMessage, LastWill, QoS};
use crate::protocol::constants::MAX_MESSAGE_SIZE;

/// How long a fresh socket gets to send its `CONNECT` frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames exchanged between bus clients and the broker endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireFrame {
    Connect {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_will: Option<LastWill>,
    },
    ConnAck,
    Publish {
        topic: String,
        payload: String,
        qos: u8,
        #[serde(default)]
        retain: bool,
    },
    Subscribe {
        pattern: String,
    },
    Disconnect,
    Ping,
    Pong,
}

/// Builds the bus WebSocket router.
pub fn bus_router(broker: Arc<MessageBroker>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(broker)
}

async fn ws_upgrade(
    State(broker): State<Arc<MessageBroker>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(broker, socket))
}

async fn handle_session(broker: Arc<MessageBroker>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    // The first frame must introduce the client.
    let (client_id, last_will) = match tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.next()).await
    {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str(text.as_str()) {
            Ok(WireFrame::Connect {
                client_id,
                last_will,
            }) => (client_id, last_will),
            Ok(_) | Err(_) => {
                log::warn!("[BusWs] rejecting session: first frame was not CONNECT");
                return;
            }
        },
        _ => {
            log::warn!("[BusWs] rejecting session: no CONNECT within handshake timeout");
            return;
        }
    };

    let mut handle = broker.attach(&client_id, last_will);
    let session_id = handle.session_id;

    if send_frame(&mut sink, &WireFrame::ConnAck).await.is_err() {
        broker.detach(session_id, false);
        return;
    }

    let mut graceful = false;
    loop {
        tokio::select! {
            routed = handle.rx.recv() => {
                let Some(message) = routed else { break };
                let frame = WireFrame::Publish {
                    topic: message.topic,
                    payload: message.payload,
                    qos: message.qos.level(),
                    retain: message.retain,
                };
                if send_frame(&mut sink, &frame).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str().len() > MAX_MESSAGE_SIZE {
                            log::warn!(
                                "[BusWs] dropping oversized frame from '{}' ({} bytes)",
                                client_id,
                                text.as_str().len()
                            );
                            continue;
                        }
                        match serde_json::from_str::<WireFrame>(text.as_str()) {
                            Ok(WireFrame::Publish { topic, payload, qos, retain }) => {
                                broker.counters.record_received();
                                let mut message =
                                    BusMessage::new(topic, payload, QoS::from_level(qos));
                                message.retain = retain;
                                broker.publish(message);
                            }
                            Ok(WireFrame::Subscribe { pattern }) => {
                                broker.subscribe(session_id, &pattern);
                            }
                            Ok(WireFrame::Ping) => {
                                if send_frame(&mut sink, &WireFrame::Pong).await.is_err() {
                                    break;
                                }
                            }
                            Ok(WireFrame::Disconnect) => {
                                graceful = true;
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                log::warn!(
                                    "[BusWs] dropping malformed frame from '{}': {}",
                                    client_id,
                                    e
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("[BusWs] socket error for '{}': {}", client_id, e);
                        break;
                    }
                }
            }
        }
    }

    broker.detach(session_id, graceful);
}

async fn send_frame(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    frame: &WireFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    sink.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_frames_round_trip() {
        let frames = vec![
            WireFrame::Connect {
                client_id: "kitchen".to_string(),
                last_will: Some(LastWill {
                    topic: "syncstream/status/kitchen".to_string(),
                    payload: "{\"is_online\":false}".to_string(),
                    qos: QoS::AtLeastOnce,
                    retain: true,
                }),
            },
            WireFrame::ConnAck,
            WireFrame::Publish {
                topic: "syncstream/drift/kitchen".to_string(),
                payload: "{}".to_string(),
                qos: 1,
                retain: false,
            },
            WireFrame::Subscribe {
                pattern: "syncstream/command/+".to_string(),
            },
            WireFrame::Disconnect,
        ];

        for frame in frames {
            let text = serde_json::to_string(&frame).unwrap();
            let parsed: WireFrame = serde_json::from_str(&text).unwrap();
            assert_eq!(
                serde_json::to_string(&parsed).unwrap(),
                text,
                "frame did not round-trip: {}",
                text
            );
        }
    }

    #[test]
    fn frame_tags_are_screaming_snake_case() {
        let text = serde_json::to_string(&WireFrame::ConnAck).unwrap();
        assert!(text.contains("CONN_ACK"));
        let text = serde_json::to_string(&WireFrame::Subscribe {
            pattern: "x".to_string(),
        })
        .unwrap();
        assert!(text.contains("SUBSCRIBE"));
    }
}
