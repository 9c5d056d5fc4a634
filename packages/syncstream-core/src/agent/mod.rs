//! Receiver agent: the long-running loop on each playback node.
//!
//! Every measurement period the agent captures a mic window, fetches the
//! matching reference window, runs the drift estimator and reports the
//! result on `syncstream/drift/<id>`. In parallel it heartbeats, publishes
//! status, honors inbound commands, and forwards `BufferOffset`
//! assignments to the output stage as delay setpoints.

pub mod capture;
pub mod reference;

pub use capture::{ChunkQueue, MicCapture, QueueMicCapture, RingMicCapture, SimulatedMicCapture};
pub use reference::{HttpReferenceClient, ReferenceSource, RingReference};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::audio::{rms, sine_tone};
use crate::bus::{Handler, LastWill, MessageBus, QoS};
use crate::config::AgentConfig;
use crate::dsp::DriftEstimator;
use crate::error::{SyncError, SyncResult};
use crate::output::AudioOutput;
use crate::protocol::{
    decode, encode, topic_for, Command, CommandType, ConfigUpdate, DeviceRegister, DeviceStatus,
    DeviceType, DriftReport, Heartbeat, MessageKind,
};
use crate::utils::now_secs;

/// Who this receiver is, as sent in its registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub base_latency_ms: f32,
    #[serde(default = "default_group")]
    pub sync_group: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

fn default_group() -> String {
    "default".to_string()
}

impl DeviceIdentity {
    /// Builds the registration message for this identity.
    #[must_use]
    pub fn registration(&self) -> DeviceRegister {
        DeviceRegister {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            device_type: self.device_type,
            location: self.location.clone(),
            base_latency_ms: self.base_latency_ms,
            sync_group: self.sync_group.clone(),
            capabilities: self.capabilities.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ip_address: self.ip_address.clone(),
            timestamp: now_secs(),
        }
    }

    /// Builds the last-will "offline" status the broker publishes if this
    /// receiver drops abruptly.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidMessage`] if encoding fails.
    pub fn last_will(&self) -> SyncResult<LastWill> {
        let status = DeviceStatus {
            device_id: self.device_id.clone(),
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
            timestamp: now_secs(),
        };
        Ok(LastWill {
            topic: topic_for(MessageKind::DeviceStatus, Some(&self.device_id))?,
            payload: encode(&status)?,
            qos: QoS::AtLeastOnce,
            retain: false,
        })
    }
}

/// Maps a normalized RMS level onto the pseudo-dBm scale the controller's
/// quality formula expects: silence ≈ −80 dBm, full scale ≈ −30 dBm.
#[must_use]
pub fn signal_strength_dbm(rms_level: f32) -> f32 {
    (-80.0 + 50.0 * rms_level.clamp(0.0, 1.0)).clamp(-80.0, -30.0)
}

/// The per-receiver synchronization agent.
pub struct ReceiverAgent {
    identity: DeviceIdentity,
    config: AgentConfig,
    bus: Arc<dyn MessageBus>,
    reference: Arc<dyn ReferenceSource>,
    capture: Arc<dyn MicCapture>,
    output: Arc<dyn AudioOutput>,
    estimator: Mutex<DriftEstimator>,
    heartbeat_seq: AtomicU32,
    config_version: Mutex<Option<String>>,
    /// Last successful contact with the transmitter, for the watchdog.
    last_contact: Mutex<Instant>,
    started_at: Instant,
    cancel: CancellationToken,
}

impl ReceiverAgent {
    /// Creates an agent.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Fatal`] for an invalid configuration.
    pub fn new(
        identity: DeviceIdentity,
        config: AgentConfig,
        bus: Arc<dyn MessageBus>,
        reference: Arc<dyn ReferenceSource>,
        capture: Arc<dyn MicCapture>,
        output: Arc<dyn AudioOutput>,
    ) -> SyncResult<Self> {
        config.validate().map_err(SyncError::Fatal)?;
        log::info!(
            "[ReceiverAgent] initialized for '{}' (type={:?}, group={})",
            identity.device_id,
            identity.device_type,
            identity.sync_group
        );
        let estimator = DriftEstimator::new(config.estimator.clone());
        Ok(Self {
            identity,
            config,
            bus,
            reference,
            capture,
            output,
            estimator: Mutex::new(estimator),
            heartbeat_seq: AtomicU32::new(0),
            config_version: Mutex::new(None),
            last_contact: Mutex::new(Instant::now()),
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
        })
    }

    /// The shutdown token; cancelled by `stop()` or a `shutdown` command.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Version of the last config push received, if any.
    #[must_use]
    pub fn config_version(&self) -> Option<String> {
        self.config_version.lock().clone()
    }

    /// Connects the bus, registers the device, and spawns the measurement,
    /// heartbeat and status loops.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriptions or the initial bus connection
    /// fail.
    pub async fn start(self: &Arc<Self>) -> SyncResult<()> {
        let id = &self.identity.device_id;

        // Inbound offset assignments.
        let agent = Arc::clone(self);
        let offset_handler: Handler = Arc::new(move |message| {
            match decode::<crate::protocol::BufferOffset>(MessageKind::BufferOffset, &message.payload)
            {
                Ok(offset) => agent.apply_offset(offset.offset_ms),
                Err(e) => log::warn!("[ReceiverAgent] dropping buffer offset: {}", e),
            }
        });
        self.bus
            .subscribe(&topic_for(MessageKind::BufferOffset, Some(id))?, offset_handler)
            .await?;

        // Commands, direct and broadcast.
        for topic in [
            topic_for(MessageKind::Command, Some(id))?,
            "syncstream/command/all".to_string(),
        ] {
            let agent = Arc::clone(self);
            let handler: Handler = Arc::new(move |message| {
                match decode::<Command>(MessageKind::Command, &message.payload) {
                    Ok(command) => {
                        tokio::spawn(Arc::clone(&agent).handle_command(command));
                    }
                    Err(e) => log::warn!("[ReceiverAgent] dropping command: {}", e),
                }
            });
            self.bus.subscribe(&topic, handler).await?;
        }

        // Config pushes, direct and broadcast.
        for topic in [
            topic_for(MessageKind::ConfigUpdate, Some(id))?,
            "syncstream/config/all".to_string(),
        ] {
            let agent = Arc::clone(self);
            let handler: Handler = Arc::new(move |message| {
                match decode::<ConfigUpdate>(MessageKind::ConfigUpdate, &message.payload) {
                    Ok(update) => agent.handle_config(update),
                    Err(e) => log::warn!("[ReceiverAgent] dropping config update: {}", e),
                }
            });
            self.bus.subscribe(&topic, handler).await?;
        }

        // An unreachable broker is not fatal: the client reconnects in the
        // background and the session hook re-registers us.
        match self.bus.connect().await {
            Ok(()) => {
                if let Err(e) = self.register().await {
                    log::warn!("[ReceiverAgent] initial registration failed: {}", e);
                }
            }
            Err(e) => {
                log::warn!("[ReceiverAgent] bus not reachable yet: {}", e);
            }
        }

        let agent = Arc::clone(self);
        tokio::spawn(agent.run_drift_loop());
        let agent = Arc::clone(self);
        tokio::spawn(agent.run_heartbeat_loop());
        let agent = Arc::clone(self);
        tokio::spawn(agent.run_status_loop());

        log::info!("[ReceiverAgent] '{}' started", self.identity.device_id);
        Ok(())
    }

    /// Publishes (or re-publishes) the registration.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the bus rejects the publish.
    pub async fn register(&self) -> SyncResult<()> {
        let topic = topic_for(MessageKind::DeviceRegister, Some(&self.identity.device_id))?;
        let payload = encode(&self.identity.registration())?;
        self.bus.publish(&topic, payload, QoS::AtLeastOnce).await
    }

    /// Publishes a final offline status, stops the loops and disconnects.
    /// Idempotent; in-flight work is bounded by the shutdown grace period.
    pub async fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        log::info!("[ReceiverAgent] '{}' stopping", self.identity.device_id);
        let grace = Duration::from_secs(crate::protocol::constants::SHUTDOWN_GRACE_SECS);
        if tokio::time::timeout(grace, self.publish_status(false))
            .await
            .is_err()
        {
            log::warn!("[ReceiverAgent] offline status not delivered within grace period");
        }
        self.cancel.cancel();
        self.bus.disconnect().await;
    }

    fn touch_contact(&self) {
        *self.last_contact.lock() = Instant::now();
    }

    fn apply_offset(&self, offset_ms: f32) {
        self.touch_contact();
        log::debug!(
            "[ReceiverAgent] '{}' applying offset {:.1}ms",
            self.identity.device_id,
            offset_ms
        );
        self.output.set_delay(offset_ms);
    }

    fn handle_config(&self, update: ConfigUpdate) {
        self.touch_contact();
        log::info!(
            "[ReceiverAgent] '{}' received config v{} ({} keys)",
            self.identity.device_id,
            update.config_version,
            update.config.len()
        );
        *self.config_version.lock() = Some(update.config_version);
    }

    /// Applies one inbound command.
    async fn handle_command(self: Arc<Self>, command: Command) {
        self.touch_contact();
        log::info!(
            "[ReceiverAgent] '{}' handling command {:?} ({})",
            self.identity.device_id,
            command.command,
            command.command_id
        );
        match command.command {
            CommandType::Resync => {
                self.estimator.lock().reset_statistics();
                self.output.set_delay(0.0);
            }
            CommandType::Mute => self.output.set_mute(true),
            CommandType::Unmute => self.output.set_mute(false),
            CommandType::SetVolume => {
                let volume = command
                    .params
                    .get("volume")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(1.0) as f32;
                if let Err(e) = self.output.set_volume(volume).await {
                    log::warn!("[ReceiverAgent] set_volume failed: {}", e);
                }
            }
            CommandType::SetDelay => {
                let delay = command
                    .params
                    .get("delay_ms")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0) as f32;
                self.output.set_delay(delay);
            }
            CommandType::Restart => {
                self.estimator.lock().reset_statistics();
                self.output.set_delay(0.0);
                let _ = self.register().await;
            }
            CommandType::Shutdown => self.cancel.cancel(),
            CommandType::Calibrate => self.estimator.lock().reset_statistics(),
            CommandType::TestTone => {
                let frequency = command
                    .params
                    .get("frequency")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(440.0) as f32;
                let duration = command
                    .params
                    .get("duration")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(1.0) as f32;
                // Synthesize up front so the output stage only needs to
                // play samples it is handed.
                let samples = sine_tone(frequency, duration, self.capture.sample_rate(), 0.5);
                log::info!(
                    "[ReceiverAgent] test tone: {} Hz for {:.1}s ({} samples)",
                    frequency,
                    duration,
                    samples.len()
                );
                if let Err(e) = self
                    .output
                    .start_stream(&format!("tone://{}:{}", frequency, duration))
                    .await
                {
                    log::warn!("[ReceiverAgent] test tone failed: {}", e);
                }
            }
            CommandType::UpdateConfig => {
                log::info!(
                    "[ReceiverAgent] '{}' asked to refresh config",
                    self.identity.device_id
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loops
    // ─────────────────────────────────────────────────────────────────────────

    async fn run_drift_loop(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs_f32(self.config.drift_interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.measure_once().await,
            }
        }
        log::info!("[ReceiverAgent] '{}' drift loop stopped", self.identity.device_id);
    }

    /// One measurement cycle: capture, fetch, estimate, report.
    async fn measure_once(&self) {
        let window_s = self.config.estimator.correlation_window_s;

        let mic = match self.capture.capture(window_s).await {
            Ok(window) => window,
            Err(e) => {
                log::debug!("[ReceiverAgent] skipping measurement, no mic audio: {}", e);
                return;
            }
        };

        let reference = match self
            .reference
            .fetch(window_s, self.config.reference_offset_seconds)
            .await
        {
            Ok(window) => window,
            Err(e) => {
                // Transient transport failure: the next cycle retries.
                log::debug!("[ReceiverAgent] reference fetch failed: {}", e);
                return;
            }
        };
        self.touch_contact();

        let signal_strength = signal_strength_dbm(rms(&mic.to_mono()));

        let measurement = {
            let mut estimator = self.estimator.lock();
            estimator.measure(&mic, &reference)
        };

        match measurement {
            Ok(measurement) => {
                let report = DriftReport {
                    device_id: self.identity.device_id.clone(),
                    drift_ms: measurement.drift_ms,
                    correlation: measurement.correlation,
                    signal_strength,
                    measurement_time: measurement.measurement_time,
                    measurement_count: measurement.measurement_count,
                    avg_drift_ms: measurement.avg_drift_ms,
                    drift_variance: measurement.drift_variance,
                };
                if let Err(e) = self.publish_report(&report).await {
                    log::warn!("[ReceiverAgent] drift report publish failed: {}", e);
                }
            }
            Err(e) => {
                log::debug!("[ReceiverAgent] measurement rejected: {}", e);
            }
        }
    }

    async fn publish_report(&self, report: &DriftReport) -> SyncResult<()> {
        let topic = topic_for(MessageKind::DriftReport, Some(&self.identity.device_id))?;
        self.bus
            .publish(&topic, encode(report)?, QoS::AtLeastOnce)
            .await
    }

    async fn run_heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs_f32(
            self.config.heartbeat_interval_seconds,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let heartbeat = Heartbeat {
                        device_id: self.identity.device_id.clone(),
                        timestamp: now_secs(),
                        sequence: self.heartbeat_seq.fetch_add(1, Ordering::Relaxed),
                    };
                    let result = async {
                        let topic =
                            topic_for(MessageKind::Heartbeat, Some(&self.identity.device_id))?;
                        self.bus
                            .publish(&topic, encode(&heartbeat)?, QoS::AtMostOnce)
                            .await
                    }
                    .await;
                    if let Err(e) = result {
                        log::debug!("[ReceiverAgent] heartbeat publish failed: {}", e);
                    }
                }
            }
        }
    }

    async fn run_status_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs_f32(
            self.config.status_interval_seconds,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // Watchdog: a long-silent transmitter link warrants a
                    // fresh registration once it comes back.
                    let silent = self.last_contact.lock().elapsed().as_secs_f32();
                    if silent > self.config.device_timeout_seconds {
                        log::warn!(
                            "[ReceiverAgent] no transmitter contact for {:.0}s, re-registering",
                            silent
                        );
                        self.touch_contact();
                        if let Err(e) = self.register().await {
                            log::debug!("[ReceiverAgent] re-registration failed: {}", e);
                        }
                    }
                    if let Err(e) = self.publish_status(true).await {
                        log::debug!("[ReceiverAgent] status publish failed: {}", e);
                    }
                }
            }
        }
    }

    /// Publishes the current device status.
    async fn publish_status(&self, online: bool) -> SyncResult<()> {
        let output = self.output.status();
        let (last_drift, correlation) = {
            let estimator = self.estimator.lock();
            let stats = estimator.statistics();
            (stats.last_drift_ms, stats.last_correlation)
        };
        let status = DeviceStatus {
            device_id: self.identity.device_id.clone(),
            is_online: online,
            is_playing: output.playing,
            is_muted: output.muted,
            volume: output.volume,
            current_offset_ms: output.delay_ms,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            temperature: 0.0,
            uptime: self.started_at.elapsed().as_secs_f64(),
            last_drift_ms: last_drift,
            correlation_quality: correlation,
            timestamp: now_secs(),
        };
        let topic = topic_for(MessageKind::DeviceStatus, Some(&self.identity.device_id))?;
        self.bus
            .publish(&topic, encode(&status)?, QoS::AtMostOnce)
            .await
    }
}
