//! Tunnel engine seam
//!
//! The engine is an external library. The service drives it through
//! [`TunnelEngine`] and the engine reports back through an [`EngineHost`],
//! which forwards every callback into the service actor so that all
//! state changes happen on one task.

use crate::actor::ServiceEvent;
use crate::error::EngineError;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tunhost_config::ConfigStore;

/// Tracing target of engine diagnostic messages.
pub const DIAGNOSTIC_TARGET: &str = "tunhost::diagnostic";

/// Operations the service performs on the engine.
///
/// Every method may block; the service never calls them from its actor
/// task.
pub trait TunnelEngine: Send + Sync + 'static {
    /// Establish the device routing interface (VPN mode only).
    fn start_routing(&self) -> Result<(), EngineError>;

    /// Start tunneling with the given newline-separated server entries.
    /// The engine fetches its config through [`EngineHost::get_config`].
    fn start_tunneling(&self, embedded_server_entries: &str) -> Result<(), EngineError>;

    /// Reconnect in place, re-reading the config.
    fn restart(&self) -> Result<(), EngineError>;

    /// Send device traffic through the established tunnel.
    fn begin_routing(&self) -> Result<(), EngineError>;

    fn stop(&self);

    /// Connection info for a companion device.
    fn export_exchange_payload(&self) -> String;

    /// Returns `true` if the payload was accepted.
    fn import_exchange_payload(&self, payload: &str) -> bool;
}

/// Engine callbacks, as delivered to the service actor.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EngineEvent {
    Connecting,
    Connected,
    StartedWaitingForNetwork,
    Homepage(String),
    ClientRegion(String),
    AvailableEgressRegions(Vec<String>),
    BytesTransferred { sent: u64, received: u64 },
    SocksProxyPortInUse(u16),
    HttpProxyPortInUse(u16),
    ListeningSocksProxyPort(u16),
    ListeningHttpProxyPort(u16),
    UpstreamProxyError(String),
    ServerAlert {
        reason: String,
        subject: String,
        action_urls: Vec<String>,
    },
}

/// The host side of the engine callback interface.
///
/// Cheap to clone; callbacks may arrive on any engine thread.
#[derive(Debug, Clone)]
pub struct EngineHost {
    events: mpsc::UnboundedSender<ServiceEvent>,
    config: Arc<RwLock<String>>,
    store: Arc<ConfigStore>,
}

impl EngineHost {
    pub(crate) fn new(
        events: mpsc::UnboundedSender<ServiceEvent>,
        config: Arc<RwLock<String>>,
        store: Arc<ConfigStore>,
    ) -> Self {
        Self {
            events,
            config,
            store,
        }
    }

    fn post(&self, event: EngineEvent) {
        if self.events.send(ServiceEvent::Engine(event)).is_err() {
            debug!("Engine callback after service shutdown");
        }
    }

    /// Config JSON of the current run.
    pub fn get_config(&self) -> String {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Applications that bypass the VPN.
    pub fn excluded_applications(&self) -> Vec<String> {
        self.store.excluded_apps()
    }

    pub fn on_connecting(&self) {
        self.post(EngineEvent::Connecting);
    }

    pub fn on_connected(&self) {
        self.post(EngineEvent::Connected);
    }

    pub fn on_started_waiting_for_network(&self) {
        self.post(EngineEvent::StartedWaitingForNetwork);
    }

    pub fn on_homepage(&self, url: &str) {
        self.post(EngineEvent::Homepage(url.to_string()));
    }

    pub fn on_client_region(&self, region: &str) {
        self.post(EngineEvent::ClientRegion(region.to_string()));
    }

    pub fn on_available_egress_regions(&self, regions: Vec<String>) {
        self.post(EngineEvent::AvailableEgressRegions(regions));
    }

    pub fn on_bytes_transferred(&self, sent: u64, received: u64) {
        self.post(EngineEvent::BytesTransferred { sent, received });
    }

    pub fn on_diagnostic_message(&self, message: &str) {
        info!(target: DIAGNOSTIC_TARGET, "{}", message);
    }

    pub fn on_socks_proxy_port_in_use(&self, port: u16) {
        self.post(EngineEvent::SocksProxyPortInUse(port));
    }

    pub fn on_http_proxy_port_in_use(&self, port: u16) {
        self.post(EngineEvent::HttpProxyPortInUse(port));
    }

    pub fn on_listening_socks_proxy_port(&self, port: u16) {
        self.post(EngineEvent::ListeningSocksProxyPort(port));
    }

    pub fn on_listening_http_proxy_port(&self, port: u16) {
        self.post(EngineEvent::ListeningHttpProxyPort(port));
    }

    pub fn on_upstream_proxy_error(&self, message: &str) {
        self.post(EngineEvent::UpstreamProxyError(message.to_string()));
    }

    pub fn on_server_alert(&self, reason: &str, subject: &str, action_urls: Vec<String>) {
        self.post(EngineEvent::ServerAlert {
            reason: reason.to_string(),
            subject: subject.to_string(),
            action_urls,
        });
    }
}
