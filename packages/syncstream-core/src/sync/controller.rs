//! Group synchronization controller.
//!
//! Responsibilities:
//! - Owns the device map exclusively; every mutation funnels through the
//!   single state mutex and readers only ever get copied-out snapshots.
//! - Folds accepted drift reports into per-device state.
//! - Runs rate-limited sync passes per group: median reference drift over
//!   stable devices, tolerance deadband, first-order low-pass on the
//!   applied offset.
//! - Publishes `BufferOffset` messages for adjusted devices only, plus a
//!   retained `sync_status` broadcast.
//! - Sweeps for devices that went silent and marks them offline.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::device::{DeviceSnapshot, DeviceState, DriftSample};
use crate::bus::{Handler, MessageBus, QoS};
use crate::config::ControllerConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventEmitter, SyncEvent};
use crate::protocol::{
    self, decode, encode, topic_for, BufferOffset, DeviceRegister, DeviceStatus, DriftReport,
    Heartbeat, MessageKind, SyncStatus,
};
use crate::utils::{mean, median, now_millis, now_secs, sample_variance};

/// The reserved group every controller starts with.
pub const DEFAULT_GROUP: &str = "default";

/// Capacity of the inbound message queue. Reports arriving while a pass
/// holds the state mutex buffer here rather than being dropped.
const INBOX_CAPACITY: usize = 1024;

/// Per-group sync quality classification, by recent drift variance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    SingleDevice,
    Unknown,
}

impl SyncQuality {
    fn classify(drifts: &[f32]) -> Self {
        match drifts.len() {
            0 => Self::Unknown,
            1 => Self::SingleDevice,
            _ => {
                let variance = sample_variance(drifts);
                if variance < 25.0 {
                    Self::Excellent
                } else if variance < 100.0 {
                    Self::Good
                } else if variance < 250.0 {
                    Self::Fair
                } else {
                    Self::Poor
                }
            }
        }
    }
}

/// Copied-out view of one sync group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub devices: Vec<String>,
    pub device_count: usize,
    pub avg_drift_ms: f32,
    pub max_drift_ms: f32,
    pub sync_quality: SyncQuality,
}

/// Copied-out view of the whole controller.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    pub devices: HashMap<String, DeviceSnapshot>,
    pub groups: HashMap<String, GroupSnapshot>,
    pub sync_events: u64,
    pub last_sync_time: f64,
    pub sync_tolerance_ms: f32,
    pub adjustment_rate: f32,
}

struct ControllerState {
    config: ControllerConfig,
    devices: HashMap<String, DeviceState>,
    /// Group name → member ids. A device belongs to exactly one group.
    groups: HashMap<String, Vec<String>>,
    /// Instant of the last executed pass per group (rate limiting).
    last_group_pass: HashMap<String, Instant>,
    sync_events: u64,
    last_sync_time: f64,
}

/// An offset adjustment produced by a sync pass, published after the state
/// lock is released.
#[derive(Debug, Clone)]
struct Adjustment {
    device_id: String,
    offset_ms: f32,
    target_ms: f32,
    sync_group: String,
}

/// The transmitter-side synchronization controller.
pub struct SyncController {
    state: Mutex<ControllerState>,
    bus: Arc<dyn MessageBus>,
    emitter: Arc<dyn EventEmitter>,
}

impl SyncController {
    /// Creates a controller.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Fatal`] for an invalid configuration.
    pub fn new(
        config: ControllerConfig,
        bus: Arc<dyn MessageBus>,
        emitter: Arc<dyn EventEmitter>,
    ) -> SyncResult<Self> {
        config.validate().map_err(SyncError::Fatal)?;
        log::info!(
            "[SyncController] initialized with tolerance={}ms, adjustment_rate={}",
            config.sync_tolerance_ms,
            config.adjustment_rate
        );
        let mut groups = HashMap::new();
        groups.insert(DEFAULT_GROUP.to_string(), Vec::new());
        Ok(Self {
            state: Mutex::new(ControllerState {
                config,
                devices: HashMap::new(),
                groups,
                last_group_pass: HashMap::new(),
                sync_events: 0,
                last_sync_time: 0.0,
            }),
            bus,
            emitter,
        })
    }

    /// Replaces the tunables. The only sanctioned way to change them at
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidRequest`] for invalid values; the old
    /// configuration stays in effect.
    pub fn reconfigure(&self, config: ControllerConfig) -> SyncResult<()> {
        config.validate().map_err(SyncError::InvalidRequest)?;
        let mut state = self.state.lock();
        log::info!(
            "[SyncController] reconfigured: tolerance={}ms, adjustment_rate={}",
            config.sync_tolerance_ms,
            config.adjustment_rate
        );
        state.config = config;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registration & lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Registers a device or updates an existing registration.
    ///
    /// Re-registration refreshes the base latency and may move the device
    /// to a different group; drift history and offsets are preserved.
    pub fn register_device(&self, registration: &DeviceRegister) {
        let mut state = self.state.lock();
        let device_id = registration.device_id.clone();
        let group = registration.sync_group.clone();

        let mut old_group = None;
        match state.devices.get_mut(&device_id) {
            Some(device) => {
                device.set_base_latency_ms(registration.base_latency_ms);
                if device.sync_group() != group {
                    old_group = Some(device.sync_group().to_string());
                    device.set_sync_group(group.clone());
                }
                device.touch(Instant::now());
            }
            None => {
                let mut device =
                    DeviceState::new(&device_id, registration.base_latency_ms, &group);
                device.touch(Instant::now());
                state.devices.insert(device_id.clone(), device);
            }
        }
        if let Some(old) = old_group {
            remove_from_group(&mut state.groups, &old, &device_id);
        }

        let members = state.groups.entry(group.clone()).or_default();
        if !members.contains(&device_id) {
            members.push(device_id.clone());
        }
        drop(state);

        log::info!(
            "[SyncController] registered device {} (type={:?}, group={}, base_latency={}ms)",
            device_id,
            registration.device_type,
            group,
            registration.base_latency_ms
        );
        self.emitter.emit(SyncEvent::DeviceRegistered {
            device_id,
            sync_group: group,
            timestamp: now_millis(),
        });
    }

    /// Removes a device and its group membership entirely.
    ///
    /// Returns false when the id was never registered. The reserved
    /// `default` group survives even when emptied.
    pub fn deregister_device(&self, device_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(device) = state.devices.remove(device_id) else {
            return false;
        };
        let group = device.sync_group().to_string();
        remove_from_group(&mut state.groups, &group, device_id);
        log::info!("[SyncController] deregistered device {}", device_id);
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Drift path
    // ─────────────────────────────────────────────────────────────────────────

    /// Folds a drift measurement into a device's state, then runs a
    /// rate-limited sync check across all groups.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownDevice`] for unregistered ids; drift
    /// never auto-registers.
    pub async fn update_device_drift(
        &self,
        device_id: &str,
        drift_ms: f32,
        correlation: f32,
        signal_strength: f32,
    ) -> SyncResult<()> {
        let adjustments = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let config = state.config.clone();
            let device = state
                .devices
                .get_mut(device_id)
                .ok_or_else(|| SyncError::UnknownDevice(device_id.to_string()))?;
            device.update_drift(
                DriftSample {
                    drift_ms,
                    correlation,
                    signal_strength_dbm: signal_strength,
                    captured_at: now,
                },
                &config,
            );

            self.emitter.emit(SyncEvent::DriftReported {
                device_id: device_id.to_string(),
                drift_ms,
                correlation,
                timestamp: now_millis(),
            });

            self.run_passes_locked(&mut state, now, false)
        };

        self.publish_adjustments(adjustments).await;
        Ok(())
    }

    /// Forces an immediate pass for one group (or all groups), ignoring
    /// the rate limit.
    pub async fn force_resync(&self, group: Option<&str>) {
        let adjustments = {
            let mut state = self.state.lock();
            let now = Instant::now();
            match group {
                Some(name) => {
                    log::info!("[SyncController] forced resync of group '{}'", name);
                    self.run_group_pass_locked(&mut state, name, now, true)
                }
                None => {
                    log::info!("[SyncController] forced resync of all groups");
                    self.run_passes_locked(&mut state, now, true)
                }
            }
        };
        self.publish_adjustments(adjustments).await;
    }

    /// Runs rate-limited passes over every group. Must hold the state
    /// lock; returns adjustments to publish after releasing it.
    fn run_passes_locked(
        &self,
        state: &mut ControllerState,
        now: Instant,
        ignore_rate_limit: bool,
    ) -> Vec<Adjustment> {
        let groups: Vec<String> = state.groups.keys().cloned().collect();
        let mut adjustments = Vec::new();
        for group in groups {
            adjustments.extend(self.run_group_pass_locked(state, &group, now, ignore_rate_limit));
        }
        adjustments
    }

    /// One sync pass for one group.
    fn run_group_pass_locked(
        &self,
        state: &mut ControllerState,
        group: &str,
        now: Instant,
        ignore_rate_limit: bool,
    ) -> Vec<Adjustment> {
        let min_interval = Duration::from_secs_f32(state.config.min_sync_interval_seconds);
        if !ignore_rate_limit {
            if let Some(last) = state.last_group_pass.get(group) {
                if now.saturating_duration_since(*last) < min_interval {
                    return Vec::new();
                }
            }
        }

        let Some(member_ids) = state.groups.get(group).cloned() else {
            return Vec::new();
        };
        state.last_group_pass.insert(group.to_string(), now);
        state.last_sync_time = now_secs();

        // Consensus needs at least two stable devices.
        let config = state.config.clone();
        let stable_drifts: Vec<f32> = member_ids
            .iter()
            .filter_map(|id| state.devices.get(id))
            .filter(|d| d.is_stable(&config))
            .map(|d| d.avg_drift_ms())
            .collect();
        if stable_drifts.len() < 2 {
            return Vec::new();
        }

        // Median is robust to a single runaway receiver.
        let reference_drift = median(&stable_drifts);

        let mut adjustments = Vec::new();
        for id in &member_ids {
            let Some(device) = state.devices.get_mut(id) else {
                continue;
            };
            let new_target = device.calculate_target_offset(reference_drift);
            if (new_target - device.target_offset_ms()).abs() > config.sync_tolerance_ms {
                let applied = device.apply_adjustment(new_target, config.adjustment_rate);
                log::info!(
                    "[SyncController] adjusted {} offset: {:.1}ms (target: {:.1}ms)",
                    id,
                    applied,
                    new_target
                );
                adjustments.push(Adjustment {
                    device_id: id.clone(),
                    offset_ms: applied,
                    target_ms: new_target,
                    sync_group: group.to_string(),
                });
            }
        }

        if !adjustments.is_empty() {
            state.sync_events += 1;
            log::info!(
                "[SyncController] synchronized group '{}': {} adjustments, reference_drift={:.1}ms",
                group,
                adjustments.len(),
                reference_drift
            );
            self.emitter.emit(SyncEvent::GroupSynced {
                group: group.to_string(),
                reference_drift_ms: reference_drift,
                adjustments: adjustments.len(),
                timestamp: now_millis(),
            });
        }

        adjustments
    }

    /// Publishes `BufferOffset` messages for adjusted devices only, then a
    /// retained `sync_status` broadcast when anything changed.
    async fn publish_adjustments(&self, adjustments: Vec<Adjustment>) {
        if adjustments.is_empty() {
            return;
        }
        for adjustment in &adjustments {
            self.emitter.emit(SyncEvent::OffsetApplied {
                device_id: adjustment.device_id.clone(),
                offset_ms: adjustment.offset_ms,
                target_ms: adjustment.target_ms,
                timestamp: now_millis(),
            });

            let message = BufferOffset {
                device_id: adjustment.device_id.clone(),
                offset_ms: adjustment.offset_ms,
                timestamp: now_secs(),
                sync_group: Some(adjustment.sync_group.clone()),
            };
            let Ok(topic) = topic_for(MessageKind::BufferOffset, Some(&adjustment.device_id))
            else {
                continue;
            };
            match encode(&message) {
                Ok(payload) => {
                    if let Err(e) = self.bus.publish(&topic, payload, QoS::AtLeastOnce).await {
                        log::warn!(
                            "[SyncController] failed to publish offset for {}: {}",
                            adjustment.device_id,
                            e
                        );
                    }
                }
                Err(e) => {
                    log::warn!("[SyncController] failed to encode offset: {}", e)
                }
            }
        }
        self.broadcast_sync_status().await;
    }

    /// Publishes the retained `sync_status` broadcast.
    pub async fn broadcast_sync_status(&self) {
        let message = self.sync_status_message();
        let Ok(topic) = topic_for(MessageKind::SyncStatus, None) else {
            return;
        };
        match encode(&message) {
            Ok(payload) => {
                if let Err(e) = self
                    .bus
                    .publish_retained(&topic, payload, QoS::AtMostOnce)
                    .await
                {
                    log::debug!("[SyncController] sync_status broadcast failed: {}", e);
                }
            }
            Err(e) => log::warn!("[SyncController] failed to encode sync_status: {}", e),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Liveness
    // ─────────────────────────────────────────────────────────────────────────

    /// Marks a device alive (heartbeat / status traffic).
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownDevice`] for unregistered ids.
    pub fn touch_device(&self, device_id: &str) -> SyncResult<()> {
        let mut state = self.state.lock();
        let device = state
            .devices
            .get_mut(device_id)
            .ok_or_else(|| SyncError::UnknownDevice(device_id.to_string()))?;
        device.touch(Instant::now());
        Ok(())
    }

    /// Marks a device offline immediately (last-will status).
    pub fn mark_device_offline(&self, device_id: &str) {
        let mut state = self.state.lock();
        if let Some(device) = state.devices.get_mut(device_id) {
            device.mark_offline();
            log::info!("[SyncController] device {} reported offline", device_id);
        }
    }

    /// One offline sweep: marks devices silent past the timeout offline.
    /// Their last offset is preserved until explicit deregistration.
    pub fn sweep_offline(&self) {
        let timed_out: Vec<String> = {
            let mut state = self.state.lock();
            let timeout = Duration::from_secs_f32(state.config.online_timeout_seconds);
            let now = Instant::now();
            let mut timed_out = Vec::new();
            for (id, device) in state.devices.iter_mut() {
                if !device.is_online() {
                    continue;
                }
                let silent = device
                    .last_seen()
                    .map(|seen| now.saturating_duration_since(seen) > timeout)
                    .unwrap_or(true);
                if silent {
                    device.mark_offline();
                    timed_out.push(id.clone());
                }
            }
            timed_out
        };

        for device_id in timed_out {
            log::warn!("[SyncController] device {} timed out", device_id);
            self.emitter.emit(SyncEvent::DeviceTimedOut {
                device_id,
                timestamp: now_millis(),
            });
        }
    }

    /// Spawns the periodic offline sweep until cancellation.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let interval = {
                let state = controller.state.lock();
                Duration::from_secs_f32(state.config.sweep_interval_seconds)
            };
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => controller.sweep_offline(),
                }
            }
            log::info!("[SyncController] offline sweeper stopped");
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Current applied offset for a device.
    #[must_use]
    pub fn get_device_offset(&self, device_id: &str) -> Option<f32> {
        self.state
            .lock()
            .devices
            .get(device_id)
            .map(DeviceState::current_offset_ms)
    }

    /// Applied offsets for every device.
    #[must_use]
    pub fn get_all_offsets(&self) -> HashMap<String, f32> {
        self.state
            .lock()
            .devices
            .iter()
            .map(|(id, d)| (id.clone(), d.current_offset_ms()))
            .collect()
    }

    /// Status snapshot for one device.
    #[must_use]
    pub fn get_device_status(&self, device_id: &str) -> Option<DeviceSnapshot> {
        let state = self.state.lock();
        state
            .devices
            .get(device_id)
            .map(|d| d.snapshot(&state.config, Instant::now()))
    }

    /// Copies out the full controller state.
    #[must_use]
    pub fn snapshot(&self) -> ControllerSnapshot {
        let state = self.state.lock();
        let now = Instant::now();

        let devices: HashMap<String, DeviceSnapshot> = state
            .devices
            .iter()
            .map(|(id, d)| (id.clone(), d.snapshot(&state.config, now)))
            .collect();

        let groups = state
            .groups
            .iter()
            .map(|(name, ids)| {
                let drifts: Vec<f32> = ids
                    .iter()
                    .filter_map(|id| state.devices.get(id))
                    .filter(|d| d.is_online())
                    .map(|d| d.last_drift_ms())
                    .collect();
                let max_drift = drifts.iter().fold(0.0f32, |acc, d| acc.max(d.abs()));
                (
                    name.clone(),
                    GroupSnapshot {
                        devices: ids.clone(),
                        device_count: ids.len(),
                        avg_drift_ms: mean(&drifts),
                        max_drift_ms: max_drift,
                        sync_quality: SyncQuality::classify(&drifts),
                    },
                )
            })
            .collect();

        ControllerSnapshot {
            devices,
            groups,
            sync_events: state.sync_events,
            last_sync_time: state.last_sync_time,
            sync_tolerance_ms: state.config.sync_tolerance_ms,
            adjustment_rate: state.config.adjustment_rate,
        }
    }

    /// Builds the `sync_status` broadcast message.
    #[must_use]
    pub fn sync_status_message(&self) -> SyncStatus {
        let state = self.state.lock();
        let sync_groups: HashMap<String, Vec<String>> = state
            .groups
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let online: Vec<&DeviceState> =
            state.devices.values().filter(|d| d.is_online()).collect();
        let drifts: Vec<f32> = online.iter().map(|d| d.last_drift_ms()).collect();
        SyncStatus {
            sync_groups,
            device_count: state.devices.len(),
            online_devices: online.len(),
            sync_events: state.sync_events,
            last_sync_time: state.last_sync_time,
            avg_drift_ms: mean(&drifts),
            max_drift_ms: drifts.iter().fold(0.0f32, |acc, d| acc.max(d.abs())),
            timestamp: now_secs(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bus wiring
    // ─────────────────────────────────────────────────────────────────────────

    /// Subscribes to receiver traffic and processes it through a single
    /// ordered inbox until cancellation.
    ///
    /// One inbox task serializes all state mutations, which preserves
    /// per-device arrival order and keeps `BufferOffset` publishes ordered
    /// after the drift updates that caused them.
    ///
    /// # Errors
    ///
    /// Returns an error when the initial subscriptions fail.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> SyncResult<()> {
        let (tx, mut rx) = mpsc::channel::<crate::bus::BusMessage>(INBOX_CAPACITY);

        for pattern in [
            "syncstream/drift/+",
            "syncstream/register/+",
            "syncstream/heartbeat/+",
            "syncstream/status/+",
        ] {
            let tx = tx.clone();
            let handler: Handler = Arc::new(move |message| {
                if let Err(e) = tx.try_send(message) {
                    // Better to shed one report than to block the bus.
                    log::warn!("[SyncController] inbox full, dropping message: {}", e);
                }
            });
            self.bus.subscribe(pattern, handler).await?;
        }

        let controller = Arc::clone(self);
        let inbox_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = inbox_cancel.cancelled() => break,
                    received = rx.recv() => {
                        let Some(message) = received else { break };
                        controller.handle_bus_message(message).await;
                    }
                }
            }
            log::info!("[SyncController] inbox stopped");
        });

        self.spawn_sweeper(cancel);
        Ok(())
    }

    /// Routes one bus message. Malformed payloads are dropped with a
    /// warning; the drift path never propagates errors outward.
    pub async fn handle_bus_message(&self, message: crate::bus::BusMessage) {
        let (kind, topic_device) = match protocol::parse_topic(&message.topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("[SyncController] unroutable topic '{}': {}", message.topic, e);
                return;
            }
        };

        match kind {
            MessageKind::DriftReport => {
                let report: DriftReport = match decode(kind, &message.payload) {
                    Ok(report) => report,
                    Err(e) => {
                        log::warn!("[SyncController] dropping drift report: {}", e);
                        return;
                    }
                };
                if Some(report.device_id.as_str()) != topic_device.as_deref() {
                    log::warn!(
                        "[SyncController] drift report id '{}' does not match topic '{}'",
                        report.device_id,
                        message.topic
                    );
                    return;
                }
                if let Err(e) = self
                    .update_device_drift(
                        &report.device_id,
                        report.drift_ms,
                        report.correlation,
                        report.signal_strength,
                    )
                    .await
                {
                    log::warn!(
                        "[SyncController] drift update for {} dropped: {}",
                        report.device_id,
                        e
                    );
                }
            }
            MessageKind::DeviceRegister => {
                match decode::<DeviceRegister>(kind, &message.payload) {
                    Ok(registration) => self.register_device(&registration),
                    Err(e) => log::warn!("[SyncController] dropping registration: {}", e),
                }
            }
            MessageKind::Heartbeat => match decode::<Heartbeat>(kind, &message.payload) {
                Ok(heartbeat) => {
                    if self.touch_device(&heartbeat.device_id).is_err() {
                        log::debug!(
                            "[SyncController] heartbeat from unknown device {}",
                            heartbeat.device_id
                        );
                    }
                }
                Err(e) => log::warn!("[SyncController] dropping heartbeat: {}", e),
            },
            MessageKind::DeviceStatus => match decode::<DeviceStatus>(kind, &message.payload) {
                Ok(status) => {
                    if status.is_online {
                        let _ = self.touch_device(&status.device_id);
                    } else {
                        // Last-will or a clean shutdown notice.
                        self.mark_device_offline(&status.device_id);
                    }
                }
                Err(e) => log::warn!("[SyncController] dropping status: {}", e),
            },
            _ => {
                log::debug!(
                    "[SyncController] ignoring message on '{}'",
                    message.topic
                );
            }
        }
    }
}

fn remove_from_group(groups: &mut HashMap<String, Vec<String>>, group: &str, device_id: &str) {
    if let Some(members) = groups.get_mut(group) {
        members.retain(|id| id != device_id);
        if members.is_empty() && group != DEFAULT_GROUP {
            groups.remove(group);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::protocol::DeviceType;
    use async_trait::async_trait;

    /// Bus stub that records every publish.
    struct RecordingBus {
        published: Mutex<Vec<(String, String, QoS)>>,
    }

    impl RecordingBus {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                published: Mutex::new(Vec::new()),
            })
        }

        fn published(&self) -> Vec<(String, String, QoS)> {
            self.published.lock().clone()
        }

        fn offsets_for(&self, device_id: &str) -> Vec<BufferOffset> {
            let topic = format!("syncstream/buffer_offset/{}", device_id);
            self.published
                .lock()
                .iter()
                .filter(|(t, _, _)| *t == topic)
                .map(|(_, payload, _)| serde_json::from_str(payload).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        async fn connect(&self) -> SyncResult<()> {
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn publish(&self, topic: &str, payload: String, qos: QoS) -> SyncResult<()> {
            self.published
                .lock()
                .push((topic.to_string(), payload, qos));
            Ok(())
        }

        async fn publish_retained(&self, topic: &str, payload: String, qos: QoS) -> SyncResult<()> {
            self.published
                .lock()
                .push((topic.to_string(), payload, qos));
            Ok(())
        }

        async fn subscribe(&self, _pattern: &str, _handler: Handler) -> SyncResult<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn statistics(&self) -> crate::bus::BusStats {
            crate::bus::BusStats::default()
        }
    }

    fn registration(id: &str, base: f32, group: &str) -> DeviceRegister {
        DeviceRegister {
            device_id: id.to_string(),
            device_name: id.to_string(),
            device_type: DeviceType::Analog,
            location: None,
            base_latency_ms: base,
            sync_group: group.to_string(),
            capabilities: Vec::new(),
            version: "1.0".to_string(),
            ip_address: None,
            timestamp: 0.0,
        }
    }

    fn controller(bus: Arc<RecordingBus>) -> Arc<SyncController> {
        Arc::new(
            SyncController::new(
                ControllerConfig::default(),
                bus,
                Arc::new(NoopEventEmitter),
            )
            .unwrap(),
        )
    }

    async fn feed(controller: &SyncController, id: &str, drifts: &[f32]) {
        for &drift in drifts {
            controller
                .update_device_drift(id, drift, 0.9, -50.0)
                .await
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn two_device_group_converges() {
        let bus = RecordingBus::new();
        let controller = controller(Arc::clone(&bus));

        controller.register_device(&registration("A", 50.0, "G"));
        controller.register_device(&registration("B", 100.0, "G"));

        let a_drifts = [10.0, 12.0, 11.0, 10.0, 12.0];
        let b_drifts = [-8.0, -10.0, -9.0, -10.0, -8.0];
        for i in 0..5 {
            feed(&controller, "A", &a_drifts[i..=i]).await;
            feed(&controller, "B", &b_drifts[i..=i]).await;
        }

        controller.force_resync(Some("G")).await;

        // reference = median(11, -9) = 1; targets 40 and 110; one pass at
        // gain 0.1 from zero applies 4.0 and 11.0.
        let a = controller.get_device_status("A").unwrap();
        let b = controller.get_device_status("B").unwrap();
        assert!((a.current_offset_ms - 4.0).abs() < 1e-3, "A = {}", a.current_offset_ms);
        assert!((b.current_offset_ms - 11.0).abs() < 1e-3, "B = {}", b.current_offset_ms);
        assert_eq!(a.target_offset_ms, 40.0);
        assert_eq!(b.target_offset_ms, 110.0);
        assert!(a.is_stable);
        assert!(b.is_stable);

        // Offsets were published for the adjusted devices.
        let a_offsets = bus.offsets_for("A");
        assert_eq!(a_offsets.len(), 1);
        assert!((a_offsets[0].offset_ms - 4.0).abs() < 1e-3);
        assert_eq!(a_offsets[0].sync_group.as_deref(), Some("G"));
    }

    #[tokio::test(start_paused = true)]
    async fn offset_contracts_toward_constant_target() {
        let bus = RecordingBus::new();
        let controller = controller(Arc::clone(&bus));
        controller.register_device(&registration("A", 50.0, "G"));
        controller.register_device(&registration("B", 100.0, "G"));

        for _ in 0..5 {
            feed(&controller, "A", &[10.0]).await;
            feed(&controller, "B", &[-10.0]).await;
        }

        controller.force_resync(Some("G")).await;
        let first = controller.get_device_status("A").unwrap();
        let gap_after_one = (first.current_offset_ms - first.target_offset_ms).abs();

        controller.force_resync(Some("G")).await;
        let second = controller.get_device_status("A").unwrap();

        if (second.target_offset_ms - first.target_offset_ms).abs() < 1e-6 {
            let gap_after_two = (second.current_offset_ms - second.target_offset_ms).abs();
            // Each pass closes the gap by factor (1 − α) = 0.9.
            assert!((gap_after_two - gap_after_one * 0.9).abs() < 1e-3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn outlier_adjusts_alone_without_dragging_group() {
        let bus = RecordingBus::new();
        let controller = controller(Arc::clone(&bus));

        for (id, drift) in [("A", 0.0), ("B", 0.0), ("C", 1.0), ("D", 1.0)] {
            controller.register_device(&registration(id, 0.0, "G"));
            for _ in 0..5 {
                feed(&controller, id, &[drift]).await;
            }
        }
        controller.register_device(&registration("E", 0.0, "G"));
        for _ in 0..5 {
            feed(&controller, "E", &[500.0]).await;
        }

        controller.force_resync(Some("G")).await;

        // reference = median({0, 0, 1, 1, 500}) = 1: the outlier cannot
        // drag the group.
        for id in ["A", "B", "C", "D"] {
            let status = controller.get_device_status(id).unwrap();
            assert!(
                status.current_offset_ms.abs() <= 1.0 + 1e-3,
                "{} moved to {}",
                id,
                status.current_offset_ms
            );
            assert!(bus.offsets_for(id).is_empty(), "{} got an offset", id);
        }

        let e = controller.get_device_status("E").unwrap();
        assert!((e.target_offset_ms - (1.0 - 500.0)).abs() < 1e-3);
        assert!((e.current_offset_ms - (-49.9)).abs() < 0.1);
        assert_eq!(bus.offsets_for("E").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fewer_than_two_stable_devices_skips_group() {
        let bus = RecordingBus::new();
        let controller = controller(Arc::clone(&bus));
        controller.register_device(&registration("A", 50.0, "G"));
        for _ in 0..5 {
            feed(&controller, "A", &[10.0]).await;
        }

        controller.force_resync(Some("G")).await;
        assert_eq!(controller.get_device_offset("A"), Some(0.0));
        assert!(bus.offsets_for("A").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drift_for_unknown_device_is_rejected() {
        let bus = RecordingBus::new();
        let controller = controller(bus);
        let err = controller
            .update_device_drift("ghost", 5.0, 0.9, -50.0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unknown_device");
    }

    #[tokio::test(start_paused = true)]
    async fn device_times_out_and_keeps_offset() {
        let bus = RecordingBus::new();
        let controller = controller(Arc::clone(&bus));

        controller.register_device(&registration("X", 0.0, "G"));
        controller.register_device(&registration("Y", 0.0, "G"));
        for _ in 0..5 {
            feed(&controller, "X", &[20.0]).await;
            feed(&controller, "Y", &[-20.0]).await;
        }
        controller.force_resync(Some("G")).await;
        let offset_before = controller.get_device_offset("X").unwrap();
        assert!(offset_before.abs() > 0.0);

        // Silence past the online timeout.
        tokio::time::advance(Duration::from_secs(31)).await;
        controller.sweep_offline();

        let x = controller.get_device_status("X").unwrap();
        assert!(!x.is_online);
        assert!(!x.is_stable);
        assert_eq!(x.current_offset_ms, offset_before);

        // With X unstable the group falls below consensus and the next
        // pass adjusts nobody.
        let published_before = bus.published().len();
        controller.force_resync(Some("G")).await;
        assert_eq!(bus.published().len(), published_before);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_bounds_pass_frequency() {
        let bus = RecordingBus::new();
        let controller = controller(Arc::clone(&bus));
        controller.register_device(&registration("A", 50.0, "G"));
        controller.register_device(&registration("B", 100.0, "G"));

        for _ in 0..5 {
            feed(&controller, "A", &[10.0]).await;
            feed(&controller, "B", &[-10.0]).await;
        }

        // Both devices are stable now; rapid-fire updates inside one
        // rate-limit window trigger at most one adjusting pass.
        tokio::time::advance(Duration::from_secs(2)).await;
        for _ in 0..10 {
            feed(&controller, "A", &[10.0]).await;
            feed(&controller, "B", &[-10.0]).await;
        }
        assert!(bus.offsets_for("A").len() <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reregistration_moves_device_between_groups() {
        let bus = RecordingBus::new();
        let controller = controller(bus);

        controller.register_device(&registration("A", 10.0, "upstairs"));
        controller.register_device(&registration("A", 20.0, "downstairs"));

        let snapshot = controller.snapshot();
        assert!(!snapshot.groups.contains_key("upstairs"));
        assert!(snapshot.groups["downstairs"].devices.contains(&"A".to_string()));
        assert_eq!(snapshot.devices["A"].base_latency_ms, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn deregistration_removes_device_and_membership() {
        let bus = RecordingBus::new();
        let controller = controller(bus);

        controller.register_device(&registration("A", 0.0, "default"));
        assert!(controller.deregister_device("A"));
        assert!(!controller.deregister_device("A"));

        let snapshot = controller.snapshot();
        assert!(snapshot.devices.is_empty());
        // The reserved group survives.
        assert!(snapshot.groups.contains_key(DEFAULT_GROUP));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_drift_payload_mutates_nothing() {
        let bus = RecordingBus::new();
        let controller = controller(bus);
        controller.register_device(&registration("X", 0.0, "default"));

        controller
            .handle_bus_message(crate::bus::BusMessage::new(
                "syncstream/drift/X",
                r#"{"device_id": "X", "drift_ms": "NaN-string", "correlation": 0.9}"#,
                QoS::AtLeastOnce,
            ))
            .await;

        let status = controller.get_device_status("X").unwrap();
        assert_eq!(status.drift_measurements, 0);
        assert_eq!(status.last_drift_ms, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn drift_report_id_must_match_topic() {
        let bus = RecordingBus::new();
        let controller = controller(bus);
        controller.register_device(&registration("X", 0.0, "default"));
        controller.register_device(&registration("Y", 0.0, "default"));

        let report = DriftReport {
            device_id: "Y".to_string(),
            drift_ms: 5.0,
            correlation: 0.9,
            signal_strength: -50.0,
            measurement_time: 0.0,
            measurement_count: 1,
            avg_drift_ms: 5.0,
            drift_variance: 0.0,
        };
        controller
            .handle_bus_message(crate::bus::BusMessage::new(
                "syncstream/drift/X",
                encode(&report).unwrap(),
                QoS::AtLeastOnce,
            ))
            .await;

        assert_eq!(controller.get_device_status("X").unwrap().drift_measurements, 0);
        assert_eq!(controller.get_device_status("Y").unwrap().drift_measurements, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_status_marks_device_offline() {
        let bus = RecordingBus::new();
        let controller = controller(bus);
        controller.register_device(&registration("X", 0.0, "default"));
        feed(&controller, "X", &[1.0]).await;
        assert!(controller.get_device_status("X").unwrap().is_online);

        let status = DeviceStatus {
            device_id: "X".to_string(),
            is_online: false,
            is_playing: false,
            is_muted: false,
            volume: 1.0,
            current_offset_ms: 0.0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            temperature: 0.0,
            uptime: 0.0,
            last_drift_ms: 0.0,
            correlation_quality: 0.0,
            timestamp: 0.0,
        };
        controller
            .handle_bus_message(crate::bus::BusMessage::new(
                "syncstream/status/X",
                encode(&status).unwrap(),
                QoS::AtMostOnce,
            ))
            .await;

        assert!(!controller.get_device_status("X").unwrap().is_online);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_status_message_reflects_state() {
        let bus = RecordingBus::new();
        let controller = controller(bus);
        controller.register_device(&registration("A", 0.0, "G"));
        controller.register_device(&registration("B", 0.0, "G"));
        feed(&controller, "A", &[4.0]).await;

        let status = controller.sync_status_message();
        assert_eq!(status.device_count, 2);
        assert_eq!(status.online_devices, 2);
        assert_eq!(status.sync_groups["G"].len(), 2);
        assert_eq!(status.max_drift_ms, 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_classifies_group_quality() {
        let bus = RecordingBus::new();
        let controller = controller(bus);
        controller.register_device(&registration("A", 0.0, "G"));
        controller.register_device(&registration("B", 0.0, "G"));
        for _ in 0..5 {
            feed(&controller, "A", &[1.0]).await;
            feed(&controller, "B", &[2.0]).await;
        }

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.groups["G"].sync_quality, SyncQuality::Excellent);

        let solo = RecordingBus::new();
        let controller = super::tests::controller(solo);
        controller.register_device(&registration("A", 0.0, "G"));
        feed(&controller, "A", &[1.0]).await;
        assert_eq!(
            controller.snapshot().groups["G"].sync_quality,
            SyncQuality::SingleDevice
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconfigure_validates() {
        let bus = RecordingBus::new();
        let controller = controller(bus);

        let mut bad = ControllerConfig::default();
        bad.adjustment_rate = 2.0;
        assert!(controller.reconfigure(bad).is_err());

        let mut good = ControllerConfig::default();
        good.sync_tolerance_ms = 20.0;
        assert!(controller.reconfigure(good).is_ok());
        assert_eq!(controller.snapshot().sync_tolerance_ms, 20.0);
    }
}
