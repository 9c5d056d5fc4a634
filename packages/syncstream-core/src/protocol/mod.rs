//! Wire protocol: topic schema, message shapes, validation and
//! (de)serialization for the SyncStream control plane.

pub mod constants;
pub mod messages;
pub mod topics;

pub use constants::{DEFAULT_QOS, MAX_MESSAGE_SIZE, TOPIC_ROOT};
pub use messages::{
    validate, BufferOffset, Command, CommandType, ConfigUpdate, DeviceRegister, DeviceStatus,
    DeviceType, DriftReport, Heartbeat, SyncStatus,
};
pub use topics::{parse_topic, topic_for, topic_matches, MessageKind, BROADCAST_ID};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SyncError;

/// Serializes a message for the bus, enforcing the size limit.
///
/// # Errors
///
/// Returns [`SyncError::InvalidMessage`] if serialization fails or the
/// encoded payload exceeds [`MAX_MESSAGE_SIZE`].
pub fn encode<T: Serialize>(message: &T) -> Result<String, SyncError> {
    let payload = serde_json::to_string(message)
        .map_err(|e| SyncError::InvalidMessage(format!("serialize failed: {}", e)))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(SyncError::InvalidMessage(format!(
            "payload of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    Ok(payload)
}

/// Validates and deserializes a payload received from the bus.
///
/// Runs the schema validator for `kind` first so that malformed payloads
/// are reported (and dropped by callers) before any typed parse. Never
/// partially applies a message.
///
/// # Errors
///
/// Returns [`SyncError::InvalidMessage`] with the first validation error,
/// or with the serde error if the typed parse still fails.
pub fn decode<T: DeserializeOwned>(kind: MessageKind, payload: &str) -> Result<T, SyncError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(SyncError::InvalidMessage(format!(
            "payload of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| SyncError::InvalidMessage(format!("invalid JSON: {}", e)))?;
    let errors = validate(kind, &value);
    if let Some(first) = errors.into_iter().next() {
        return Err(SyncError::InvalidMessage(first));
    }
    serde_json::from_value(value)
        .map_err(|e| SyncError::InvalidMessage(format!("deserialize failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let report = DriftReport {
            device_id: "kitchen".to_string(),
            drift_ms: 4.0,
            correlation: 0.8,
            signal_strength: -50.0,
            measurement_time: 1.0,
            measurement_count: 1,
            avg_drift_ms: 4.0,
            drift_variance: 0.0,
        };
        let payload = encode(&report).unwrap();
        let decoded: DriftReport = decode(MessageKind::DriftReport, &payload).unwrap();
        assert_eq!(decoded, report);
    }

    #[test]
    fn decode_rejects_invalid_payload_before_parse() {
        let err = decode::<DriftReport>(
            MessageKind::DriftReport,
            r#"{"device_id": "x", "drift_ms": "NaN-string", "correlation": 0.9}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("drift_ms must be a number"));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode::<Heartbeat>(MessageKind::Heartbeat, "not json").is_err());
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let mut cfg = std::collections::HashMap::new();
        cfg.insert(
            "blob".to_string(),
            serde_json::Value::String("x".repeat(MAX_MESSAGE_SIZE)),
        );
        let update = ConfigUpdate {
            device_id: "x".to_string(),
            config: cfg,
            config_version: "1.0".to_string(),
            timestamp: 0.0,
        };
        assert!(encode(&update).is_err());
    }
}
