//! Event system for observers of the synchronization control plane.
//!
//! This module provides:
//! - [`EventEmitter`] trait for core services to emit events
//! - [`SyncEvent`], the tagged union of everything the core announces
//!
//! The core only emits; whether events are logged, broadcast to dashboards
//! or persisted is up to the embedding application.

mod emitter;

pub use emitter::{BroadcastEventEmitter, EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

/// Events emitted by the synchronization core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A drift measurement was accepted into a device's history.
    DriftReported {
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "driftMs")]
        drift_ms: f32,
        correlation: f32,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A sync pass adjusted a device's playback offset.
    OffsetApplied {
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "offsetMs")]
        offset_ms: f32,
        #[serde(rename = "targetMs")]
        target_ms: f32,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A device registered (or re-registered) with the controller.
    DeviceRegistered {
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "syncGroup")]
        sync_group: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A device went silent past the online timeout.
    DeviceTimedOut {
        #[serde(rename = "deviceId")]
        device_id: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A group sync pass completed with at least one adjustment.
    GroupSynced {
        group: String,
        #[serde(rename = "referenceDriftMs")]
        reference_drift_ms: f32,
        adjustments: usize,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = SyncEvent::DeviceTimedOut {
            device_id: "kitchen".to_string(),
            timestamp: 1000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "deviceTimedOut");
        assert_eq!(json["deviceId"], "kitchen");
    }

    #[test]
    fn group_synced_carries_reference_drift() {
        let event = SyncEvent::GroupSynced {
            group: "main_floor".to_string(),
            reference_drift_ms: 1.0,
            adjustments: 2,
            timestamp: 1000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["referenceDriftMs"], 1.0);
        assert_eq!(json["adjustments"], 2);
    }
}
