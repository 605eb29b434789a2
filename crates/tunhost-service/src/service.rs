//! Tunnel service facade
//!
//! Mirrors the lifecycle entry points a host platform drives: create,
//! start commands, bind, revoke and destroy. Each entry point only posts a
//! message to the service actor and returns.

use crate::actor::{ServiceActor, ServiceEvent};
use crate::context::ServiceContext;
use crate::engine::{EngineHost, TunnelEngine};
use crate::error::ServiceError;
use crate::platform::ServicePlatform;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tunhost_core::{ClientEnvelope, ServiceLink, TunnelState};

/// Start command actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartCommand {
    /// Start a tunnel run unless one is active
    Start,
    /// Stop the active run (idempotent)
    Stop,
}

/// Handle to a running tunnel service.
pub struct TunnelService {
    events: mpsc::UnboundedSender<ServiceEvent>,
    clients: mpsc::UnboundedSender<ClientEnvelope>,
    state: watch::Receiver<TunnelState>,
    actor: JoinHandle<()>,
}

impl TunnelService {
    /// Create the service and its engine. `create_engine` is called
    /// exactly once, with the host the engine reports back through.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn on_create<E, F>(ctx: ServiceContext, platform: Arc<dyn ServicePlatform>, create_engine: F) -> Self
    where
        E: TunnelEngine,
        F: FnOnce(EngineHost) -> E,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (clients_tx, clients_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(TunnelState::Stopped);

        let engine_config = Arc::new(RwLock::new(String::new()));
        let host = EngineHost::new(
            events_tx.clone(),
            Arc::clone(&engine_config),
            Arc::clone(ctx.store()),
        );
        let engine: Arc<dyn TunnelEngine> = Arc::new(create_engine(host));

        let actor = ServiceActor::new(
            ctx,
            engine,
            engine_config,
            platform,
            events_tx.clone(),
            state_tx,
        );
        let actor = tokio::spawn(actor.run(events_rx, clients_rx));
        info!("Tunnel service created");

        Self {
            events: events_tx,
            clients: clients_tx,
            state: state_rx,
            actor,
        }
    }

    pub fn on_start_command(&self, command: StartCommand) {
        debug!("Start command: {:?}", command);
        self.post(match command {
            StartCommand::Start => ServiceEvent::Start,
            StartCommand::Stop => ServiceEvent::Stop,
        });
    }

    /// A link for a new client to send messages through.
    pub fn on_bind(&self) -> ServiceLink {
        ServiceLink::new(self.clients.clone())
    }

    /// The platform withdrew VPN permission.
    pub fn on_revoke(&self) {
        self.post(ServiceEvent::Revoke);
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TunnelState> {
        self.state.clone()
    }

    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    /// Stop any run and wait until its thread has finished.
    pub async fn on_destroy(self) -> Result<(), ServiceError> {
        let (ack, done) = oneshot::channel();
        self.events
            .send(ServiceEvent::Destroy { ack })
            .map_err(|_| ServiceError::ServiceGone)?;
        done.await.map_err(|_| ServiceError::ServiceGone)?;
        self.actor.await.map_err(|_| ServiceError::ServiceGone)?;
        info!("Tunnel service destroyed");
        Ok(())
    }

    fn post(&self, event: ServiceEvent) {
        if self.events.send(event).is_err() {
            debug!("Tunnel service actor is gone");
        }
    }
}
