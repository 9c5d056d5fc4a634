//! Application bootstrap and dependency wiring.
//!
//! The composition roots for both node roles live here - the single place
//! where services are instantiated and handed their dependencies. Nothing
//! in the core reaches for globals; everything flows through the runtime
//! handles built below.

use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::agent::{MicCapture, ReceiverAgent, ReferenceSource};
use crate::api::{api_router, AppState};
use crate::audio::AudioRing;
use crate::bus::{bus_router, LocalBusClient, MessageBroker, MessageBus, WsBusClient};
use crate::config::{AgentConfig, BusConfig, ControllerConfig, RingConfig};
use crate::error::SyncResult;
use crate::events::BroadcastEventEmitter;
use crate::output::AudioOutput;
use crate::protocol::constants::EVENT_CHANNEL_CAPACITY;
use crate::sync::SyncController;

/// Everything a transmitter process runs: the rolling reference buffer,
/// the in-process broker, the controller, and the event fan-out.
pub struct SyncRuntime {
    pub ring: Arc<AudioRing>,
    pub broker: Arc<MessageBroker>,
    pub bus: Arc<LocalBusClient>,
    pub controller: Arc<SyncController>,
    pub events: Arc<BroadcastEventEmitter>,
    pub cancel_token: CancellationToken,
}

impl SyncRuntime {
    /// Builds the combined HTTP router: reference API plus the bus
    /// WebSocket endpoint.
    #[must_use]
    pub fn router(&self) -> Router {
        let state = AppState {
            ring: Arc::clone(&self.ring),
            controller: Some(Arc::clone(&self.controller)),
        };
        api_router(state).merge(bus_router(Arc::clone(&self.broker)))
    }

    /// Initiates graceful shutdown of all services.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] beginning graceful shutdown...");
        self.cancel_token.cancel();
        self.bus.disconnect().await;
        log::info!("[Bootstrap] shutdown complete");
    }
}

/// Bootstraps the transmitter services in dependency order:
///
/// 1. Audio ring (reference store)
/// 2. Broker and the controller's local bus client
/// 3. Event fan-out
/// 4. Controller, wired to bus and events, with its inbox and sweeper
///
/// # Errors
///
/// Returns an error when any configuration is invalid or the controller
/// fails to subscribe.
pub async fn bootstrap_transmitter(
    ring_config: RingConfig,
    controller_config: ControllerConfig,
    bus_config: BusConfig,
) -> SyncResult<SyncRuntime> {
    bus_config.validate().map_err(crate::error::SyncError::Fatal)?;

    let ring = Arc::new(AudioRing::new(ring_config)?);
    let broker = Arc::new(MessageBroker::new(bus_config.session_queue_capacity));
    let events = Arc::new(BroadcastEventEmitter::new(EVENT_CHANNEL_CAPACITY));
    let bus = Arc::new(LocalBusClient::new(
        Arc::clone(&broker),
        "syncstream-transmitter",
    ));

    let controller = Arc::new(SyncController::new(
        controller_config,
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        Arc::clone(&events) as Arc<dyn crate::events::EventEmitter>,
    )?);

    let cancel_token = CancellationToken::new();
    bus.connect().await?;
    controller.start(cancel_token.clone()).await?;

    log::info!("[Bootstrap] transmitter services ready");
    Ok(SyncRuntime {
        ring,
        broker,
        bus,
        controller,
        events,
        cancel_token,
    })
}

/// Everything a receiver process runs.
pub struct ReceiverRuntime {
    pub bus: Arc<WsBusClient>,
    pub agent: Arc<ReceiverAgent>,
    pub cancel_token: CancellationToken,
}

impl ReceiverRuntime {
    /// Initiates graceful shutdown.
    pub async fn shutdown(&self) {
        self.agent.stop().await;
        self.cancel_token.cancel();
    }
}

/// Bootstraps a receiver: WebSocket bus client (with last-will and
/// re-registration hook), then the agent with its capture, reference and
/// output stages.
///
/// # Errors
///
/// Returns an error when the agent configuration is invalid. An
/// unreachable transmitter is *not* an error here; the bus client keeps
/// reconnecting in the background.
pub async fn bootstrap_receiver(
    identity: crate::agent::DeviceIdentity,
    agent_config: AgentConfig,
    bus_config: BusConfig,
    bus_url: &str,
    reference: Arc<dyn ReferenceSource>,
    capture: Arc<dyn MicCapture>,
    output: Arc<dyn AudioOutput>,
) -> SyncResult<ReceiverRuntime> {
    bus_config.validate().map_err(crate::error::SyncError::Fatal)?;

    let bus = Arc::new(WsBusClient::new(
        bus_url,
        identity.device_id.clone(),
        bus_config,
    ));
    bus.set_last_will(identity.last_will()?);

    let agent = Arc::new(ReceiverAgent::new(
        identity,
        agent_config,
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        reference,
        capture,
        output,
    )?);

    // Re-announce the device every time the bus session comes back.
    let agent_for_hook = Arc::clone(&agent);
    bus.set_session_hook(Arc::new(move || {
        let agent = Arc::clone(&agent_for_hook);
        tokio::spawn(async move {
            if let Err(e) = agent.register().await {
                log::warn!("[Bootstrap] re-registration failed: {}", e);
            }
        });
    }));

    let cancel_token = agent.cancel_token();
    if let Err(e) = agent.start().await {
        // The drift loop copes with a missing transmitter; only log here.
        log::warn!("[Bootstrap] receiver started degraded: {}", e);
    }

    log::info!("[Bootstrap] receiver services ready");
    Ok(ReceiverRuntime {
        bus,
        agent,
        cancel_token,
    })
}
