//! Topic schema for the SyncStream message bus.
//!
//! All topics live under the `syncstream/` root:
//!
//! | Direction | Topic | Producer |
//! |-----------|-------|----------|
//! | R→T | `drift/<id>` | receiver |
//! | T→R | `buffer_offset/<id>` | controller |
//! | R→T | `register/<id>` | receiver on startup |
//! | R→T | `status/<id>` | receiver |
//! | R→T | `heartbeat/<id>` | receiver |
//! | T→R | `config/<id>` or `config/all` | controller |
//! | T→R | `command/<id>` or `command/all` | controller |
//! | T→* | `sync_status` | controller broadcast |

use super::constants::TOPIC_ROOT;
use crate::error::SyncError;

/// The id segment used for broadcast command/config topics.
pub const BROADCAST_ID: &str = "all";

/// Message kinds carried by the bus, one per topic family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    DriftReport,
    BufferOffset,
    DeviceRegister,
    DeviceStatus,
    Heartbeat,
    ConfigUpdate,
    Command,
    SyncStatus,
}

impl MessageKind {
    /// The topic segment identifying this kind.
    #[must_use]
    pub fn segment(&self) -> &'static str {
        match self {
            Self::DriftReport => "drift",
            Self::BufferOffset => "buffer_offset",
            Self::DeviceRegister => "register",
            Self::DeviceStatus => "status",
            Self::Heartbeat => "heartbeat",
            Self::ConfigUpdate => "config",
            Self::Command => "command",
            Self::SyncStatus => "sync_status",
        }
    }

    /// Whether topics of this kind carry a device id segment.
    #[must_use]
    pub fn is_per_device(&self) -> bool {
        !matches!(self, Self::SyncStatus)
    }

    fn from_segment(segment: &str) -> Option<Self> {
        Some(match segment {
            "drift" => Self::DriftReport,
            "buffer_offset" => Self::BufferOffset,
            "register" => Self::DeviceRegister,
            "status" => Self::DeviceStatus,
            "heartbeat" => Self::Heartbeat,
            "config" => Self::ConfigUpdate,
            "command" => Self::Command,
            "sync_status" => Self::SyncStatus,
            _ => return None,
        })
    }
}

/// Builds the concrete topic for a message kind and device id.
///
/// # Errors
///
/// Returns [`SyncError::InvalidMessage`] when a per-device kind is given no
/// device id, or a broadcast kind is given one.
pub fn topic_for(kind: MessageKind, device_id: Option<&str>) -> Result<String, SyncError> {
    match (kind.is_per_device(), device_id) {
        (true, Some(id)) => {
            if id.is_empty() || id.contains('/') || id.contains('+') || id.contains('#') {
                return Err(SyncError::InvalidMessage(format!(
                    "invalid device id in topic: {:?}",
                    id
                )));
            }
            Ok(format!("{}/{}/{}", TOPIC_ROOT, kind.segment(), id))
        }
        (true, None) => Err(SyncError::InvalidMessage(format!(
            "device id required for {} topic",
            kind.segment()
        ))),
        (false, None) => Ok(format!("{}/{}", TOPIC_ROOT, kind.segment())),
        (false, Some(_)) => Err(SyncError::InvalidMessage(format!(
            "{} is a broadcast topic and carries no device id",
            kind.segment()
        ))),
    }
}

/// Parses a topic back into its message kind and optional device id.
///
/// # Errors
///
/// Returns [`SyncError::InvalidMessage`] for topics outside the
/// `syncstream/` root or with an unknown kind segment.
pub fn parse_topic(topic: &str) -> Result<(MessageKind, Option<String>), SyncError> {
    let mut parts = topic.split('/');
    match parts.next() {
        Some(root) if root == TOPIC_ROOT => {}
        _ => {
            return Err(SyncError::InvalidMessage(format!(
                "invalid topic prefix: {}",
                topic
            )))
        }
    }

    let kind = parts
        .next()
        .and_then(MessageKind::from_segment)
        .ok_or_else(|| SyncError::InvalidMessage(format!("unknown message type in topic: {}", topic)))?;

    let device_id = parts.next().map(str::to_string);
    if parts.next().is_some() {
        return Err(SyncError::InvalidMessage(format!(
            "invalid topic format: {}",
            topic
        )));
    }
    if kind.is_per_device() && device_id.is_none() {
        return Err(SyncError::InvalidMessage(format!(
            "missing device id in topic: {}",
            topic
        )));
    }
    if !kind.is_per_device() && device_id.is_some() {
        return Err(SyncError::InvalidMessage(format!(
            "unexpected device id in topic: {}",
            topic
        )));
    }

    Ok((kind, device_id))
}

/// Checks a concrete topic against a subscription pattern.
///
/// Patterns use MQTT-style wildcards: `+` matches exactly one level and `#`
/// matches the remainder of the topic (it must be the last segment).
#[must_use]
pub fn topic_matches(topic: &str, pattern: &str) -> bool {
    let mut topic_parts = topic.split('/');
    let mut pattern_parts = pattern.split('/').peekable();

    loop {
        match (topic_parts.next(), pattern_parts.next()) {
            (_, Some("#")) => return pattern_parts.peek().is_none(),
            (Some(t), Some(p)) => {
                if p != "+" && p != t {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}
