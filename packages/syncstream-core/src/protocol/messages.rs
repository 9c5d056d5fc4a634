//! Message schemas for the SyncStream protocol.
//!
//! Payloads are UTF-8 JSON with snake_case fields, at most
//! [`MAX_MESSAGE_SIZE`](super::constants::MAX_MESSAGE_SIZE) bytes. Every
//! message carries a producer timestamp in fractional Unix seconds.
//!
//! Enumerations are closed: unknown device types and commands are rejected
//! by [`validate`] before any typed deserialization happens.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::topics::MessageKind;
use crate::utils::now_secs;

// ─────────────────────────────────────────────────────────────────────────────
// Enumerations
// ─────────────────────────────────────────────────────────────────────────────

/// Output ecosystem a receiver drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Analog,
    Hdmi,
    Chromecast,
    Airplay,
    Bluetooth,
    Snapcast,
    Pulse,
    Alsa,
}

impl DeviceType {
    /// All recognized wire values, used by the validator.
    pub const ALL: [&'static str; 8] = [
        "analog",
        "hdmi",
        "chromecast",
        "airplay",
        "bluetooth",
        "snapcast",
        "pulse",
        "alsa",
    ];
}

/// Commands a controller can issue to receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Resync,
    Mute,
    Unmute,
    SetVolume,
    SetDelay,
    Restart,
    Shutdown,
    Calibrate,
    TestTone,
    UpdateConfig,
}

impl CommandType {
    /// All recognized wire values, used by the validator.
    pub const ALL: [&'static str; 10] = [
        "resync",
        "mute",
        "unmute",
        "set_volume",
        "set_delay",
        "restart",
        "shutdown",
        "calibrate",
        "test_tone",
        "update_config",
    ];
}

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

fn default_signal_strength() -> f32 {
    -50.0
}

fn default_volume() -> f32 {
    1.0
}

fn default_sync_group() -> String {
    "default".to_string()
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Drift report from a receiver (topic `syncstream/drift/<id>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriftReport {
    pub device_id: String,
    /// Signed drift of local playback relative to the reference (ms).
    pub drift_ms: f32,
    /// Peak normalized cross-correlation in [0, 1]; the estimator's value
    /// is authoritative and is never recomputed downstream.
    pub correlation: f32,
    /// Signal strength in dBm; the useful range is −80 … −50.
    #[serde(default = "default_signal_strength")]
    pub signal_strength: f32,
    #[serde(default = "now_secs")]
    pub measurement_time: f64,
    #[serde(default)]
    pub measurement_count: u32,
    #[serde(default)]
    pub avg_drift_ms: f32,
    #[serde(default)]
    pub drift_variance: f32,
}

/// Playback offset assignment (topic `syncstream/buffer_offset/<id>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BufferOffset {
    pub device_id: String,
    pub offset_ms: f32,
    #[serde(default = "now_secs")]
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_group: Option<String>,
}

/// Device registration (topic `syncstream/register/<id>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceRegister {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub base_latency_ms: f32,
    #[serde(default = "default_sync_group")]
    pub sync_group: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default = "now_secs")]
    pub timestamp: f64,
}

/// Periodic device status (topic `syncstream/status/<id>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatus {
    pub device_id: String,
    pub is_online: bool,
    pub is_playing: bool,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default)]
    pub current_offset_ms: f32,
    #[serde(default)]
    pub cpu_usage: f32,
    #[serde(default)]
    pub memory_usage: f32,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub uptime: f64,
    #[serde(default)]
    pub last_drift_ms: f32,
    #[serde(default)]
    pub correlation_quality: f32,
    #[serde(default = "now_secs")]
    pub timestamp: f64,
}

/// Liveness beacon (topic `syncstream/heartbeat/<id>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    pub device_id: String,
    #[serde(default = "now_secs")]
    pub timestamp: f64,
    #[serde(default)]
    pub sequence: u32,
}

/// Configuration push (topic `syncstream/config/<id>` or `config/all`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigUpdate {
    pub device_id: String,
    pub config: HashMap<String, Value>,
    #[serde(default = "default_version")]
    pub config_version: String,
    #[serde(default = "now_secs")]
    pub timestamp: f64,
}

/// Command push (topic `syncstream/command/<id>` or `command/all`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub device_id: String,
    pub command: CommandType,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    pub command_id: String,
    #[serde(default = "now_secs")]
    pub timestamp: f64,
}

impl Command {
    /// Creates a command with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(device_id: impl Into<String>, command: CommandType) -> Self {
        Self {
            device_id: device_id.into(),
            command,
            params: HashMap::new(),
            command_id: format!("cmd_{}", uuid::Uuid::new_v4().simple()),
            timestamp: now_secs(),
        }
    }

    /// Attaches a parameter to the command.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// Controller sync status broadcast (topic `syncstream/sync_status`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncStatus {
    /// Group name → member device ids.
    pub sync_groups: HashMap<String, Vec<String>>,
    pub device_count: usize,
    pub online_devices: usize,
    pub sync_events: u64,
    pub last_sync_time: f64,
    #[serde(default)]
    pub avg_drift_ms: f32,
    #[serde(default)]
    pub max_drift_ms: f32,
    #[serde(default = "now_secs")]
    pub timestamp: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

fn is_number(value: &Value) -> bool {
    value.is_number()
}

fn check_number(data: &Value, field: &str, errors: &mut Vec<String>) {
    if let Some(v) = data.get(field) {
        if !is_number(v) {
            errors.push(format!("{} must be a number", field));
        }
    }
}

/// Validates a raw JSON payload against the schema for `kind`.
///
/// Returns the list of validation errors; an empty list means the payload
/// may be deserialized into its typed message. Validation never mutates
/// state and runs before any typed parse so that unknown enum values are
/// reported with their offending string.
#[must_use]
pub fn validate(kind: MessageKind, data: &Value) -> Vec<String> {
    let mut errors = Vec::new();

    let obj = match data.as_object() {
        Some(obj) => obj,
        None => return vec!["payload must be a JSON object".to_string()],
    };

    let required: &[&str] = match kind {
        MessageKind::DriftReport => &["device_id", "drift_ms", "correlation"],
        MessageKind::BufferOffset => &["device_id", "offset_ms"],
        MessageKind::DeviceRegister => &["device_id", "device_name", "device_type"],
        MessageKind::DeviceStatus => &["device_id", "is_online", "is_playing"],
        MessageKind::Heartbeat => &["device_id"],
        MessageKind::ConfigUpdate => &["device_id", "config"],
        MessageKind::Command => &["device_id", "command"],
        MessageKind::SyncStatus => &["sync_groups", "device_count", "online_devices"],
    };

    for field in required {
        if !obj.contains_key(*field) {
            errors.push(format!("Missing required field: {}", field));
        }
    }

    match kind {
        MessageKind::DriftReport => {
            check_number(data, "drift_ms", &mut errors);
            check_number(data, "correlation", &mut errors);
            check_number(data, "signal_strength", &mut errors);
            if let Some(corr) = data.get("correlation").and_then(Value::as_f64) {
                if !(0.0..=1.0).contains(&corr) {
                    errors.push("correlation must be within [0, 1]".to_string());
                }
            }
        }
        MessageKind::BufferOffset => {
            check_number(data, "offset_ms", &mut errors);
        }
        MessageKind::DeviceRegister => {
            if let Some(device_type) = data.get("device_type") {
                match device_type.as_str() {
                    Some(s) if DeviceType::ALL.contains(&s) => {}
                    Some(s) => errors.push(format!("Invalid device_type: {}", s)),
                    None => errors.push("device_type must be a string".to_string()),
                }
            }
            check_number(data, "base_latency_ms", &mut errors);
        }
        MessageKind::DeviceStatus => {
            for field in ["is_online", "is_playing", "is_muted"] {
                if let Some(v) = data.get(field) {
                    if !v.is_boolean() {
                        errors.push(format!("{} must be a boolean", field));
                    }
                }
            }
            check_number(data, "volume", &mut errors);
            check_number(data, "current_offset_ms", &mut errors);
        }
        MessageKind::Heartbeat => {
            check_number(data, "sequence", &mut errors);
        }
        MessageKind::ConfigUpdate => {
            if let Some(config) = data.get("config") {
                if !config.is_object() {
                    errors.push("config must be an object".to_string());
                }
            }
        }
        MessageKind::Command => {
            if let Some(command) = data.get("command") {
                match command.as_str() {
                    Some(s) if CommandType::ALL.contains(&s) => {}
                    Some(s) => errors.push(format!("Invalid command: {}", s)),
                    None => errors.push("command must be a string".to_string()),
                }
            }
            if let Some(params) = data.get("params") {
                if !params.is_object() {
                    errors.push("params must be an object".to_string());
                }
            }
        }
        MessageKind::SyncStatus => {
            if let Some(groups) = data.get("sync_groups") {
                if !groups.is_object() {
                    errors.push("sync_groups must be an object".to_string());
                }
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn drift_report_round_trips() {
        let report = DriftReport {
            device_id: "kitchen".to_string(),
            drift_ms: 12.5,
            correlation: 0.91,
            signal_strength: -48.0,
            measurement_time: 1_700_000_000.0,
            measurement_count: 7,
            avg_drift_ms: 11.0,
            drift_variance: 1.2,
        };
        let encoded = serde_json::to_string(&report).unwrap();
        let decoded: DriftReport = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, report);
    }

    #[test]
    fn register_defaults_fill_in() {
        let decoded: DeviceRegister = serde_json::from_value(json!({
            "device_id": "patio",
            "device_name": "Patio Amp",
            "device_type": "analog",
        }))
        .unwrap();
        assert_eq!(decoded.sync_group, "default");
        assert_eq!(decoded.base_latency_ms, 0.0);
        assert_eq!(decoded.version, "1.0");
        assert!(decoded.capabilities.is_empty());
        assert!(decoded.timestamp > 0.0);
    }

    #[test]
    fn heartbeat_round_trips() {
        let hb = Heartbeat {
            device_id: "x".to_string(),
            timestamp: 1.0,
            sequence: 42,
        };
        let decoded: Heartbeat =
            serde_json::from_str(&serde_json::to_string(&hb).unwrap()).unwrap();
        assert_eq!(decoded, hb);
    }

    #[test]
    fn buffer_offset_round_trips_without_group() {
        let offset = BufferOffset {
            device_id: "x".to_string(),
            offset_ms: 40.0,
            timestamp: 2.0,
            sync_group: None,
        };
        let encoded = serde_json::to_string(&offset).unwrap();
        assert!(!encoded.contains("sync_group"));
        let decoded: BufferOffset = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, offset);
    }

    #[test]
    fn sync_status_round_trips() {
        let mut groups = HashMap::new();
        groups.insert("default".to_string(), vec!["a".to_string(), "b".to_string()]);
        let status = SyncStatus {
            sync_groups: groups,
            device_count: 2,
            online_devices: 2,
            sync_events: 5,
            last_sync_time: 100.0,
            avg_drift_ms: 1.0,
            max_drift_ms: 12.0,
            timestamp: 101.0,
        };
        let decoded: SyncStatus =
            serde_json::from_str(&serde_json::to_string(&status).unwrap()).unwrap();
        assert_eq!(decoded, status);
    }

    #[test]
    fn command_new_generates_id() {
        let cmd = Command::new("kitchen", CommandType::Resync);
        assert!(cmd.command_id.starts_with("cmd_"));
        assert!(cmd.params.is_empty());

        let cmd = cmd.with_param("volume", json!(0.5));
        assert_eq!(cmd.params["volume"], json!(0.5));
    }

    #[test]
    fn command_type_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&CommandType::SetVolume).unwrap(),
            "\"set_volume\""
        );
        assert_eq!(
            serde_json::to_string(&CommandType::TestTone).unwrap(),
            "\"test_tone\""
        );
    }

    #[test]
    fn validate_flags_non_numeric_drift() {
        let errors = validate(
            MessageKind::DriftReport,
            &json!({"device_id": "x", "drift_ms": "NaN-string", "correlation": 0.9}),
        );
        assert_eq!(errors, vec!["drift_ms must be a number".to_string()]);
    }

    #[test]
    fn validate_flags_missing_fields() {
        let errors = validate(MessageKind::DriftReport, &json!({"device_id": "x"}));
        assert!(errors.contains(&"Missing required field: drift_ms".to_string()));
        assert!(errors.contains(&"Missing required field: correlation".to_string()));
    }

    #[test]
    fn validate_rejects_unknown_device_type() {
        let errors = validate(
            MessageKind::DeviceRegister,
            &json!({"device_id": "x", "device_name": "X", "device_type": "gramophone"}),
        );
        assert_eq!(errors, vec!["Invalid device_type: gramophone".to_string()]);
    }

    #[test]
    fn validate_rejects_unknown_command() {
        let errors = validate(
            MessageKind::Command,
            &json!({"device_id": "x", "command": "self_destruct"}),
        );
        assert_eq!(errors, vec!["Invalid command: self_destruct".to_string()]);
    }

    #[test]
    fn validate_rejects_out_of_range_correlation() {
        let errors = validate(
            MessageKind::DriftReport,
            &json!({"device_id": "x", "drift_ms": 1.0, "correlation": 1.5}),
        );
        assert_eq!(errors, vec!["correlation must be within [0, 1]".to_string()]);
    }

    #[test]
    fn validate_accepts_well_formed_messages() {
        assert!(validate(
            MessageKind::DriftReport,
            &json!({"device_id": "x", "drift_ms": 3.2, "correlation": 0.8}),
        )
        .is_empty());
        assert!(validate(
            MessageKind::Command,
            &json!({"device_id": "x", "command": "resync"}),
        )
        .is_empty());
        assert!(validate(MessageKind::Heartbeat, &json!({"device_id": "x"})).is_empty());
    }

    #[test]
    fn validate_rejects_non_object_payload() {
        let errors = validate(MessageKind::Heartbeat, &json!([1, 2, 3]));
        assert_eq!(errors, vec!["payload must be a JSON object".to_string()]);
    }
}
