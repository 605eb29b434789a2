//! Messenger protocol between UI clients and the tunnel service.
//!
//! Each side owns an unbounded inbox. A [`Messenger`] is a client's inbox
//! handle as seen by the service; a [`ServiceLink`] is the service inbox as
//! seen by a client. A send that fails means the receiving side is gone.

use crate::bundle::Bundle;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Intent extra: home page URLs (string list)
pub const EXTRA_HOME_PAGES: &str = "homePages";
/// Intent extra: region code
pub const EXTRA_REGION: &str = "region";
/// Intent extra: human-readable error message
pub const EXTRA_MESSAGE: &str = "message";
/// Intent extra: server alert subject
pub const EXTRA_SUBJECT: &str = "subject";
/// Intent extra: server alert action URLs (string list)
pub const EXTRA_ACTION_URLS: &str = "actionUrls";

/// Global messenger ID counter
static NEXT_MESSENGER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a client messenger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessengerId(pub u64);

impl MessengerId {
    /// Allocate a process-unique ID.
    pub fn next() -> Self {
        Self(NEXT_MESSENGER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MessengerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Messenger({})", self.0)
    }
}

/// Messenger send errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessengerError {
    #[error("{0} is no longer reachable")]
    PeerGone(MessengerId),

    #[error("Tunnel service is not reachable")]
    ServiceGone,
}

/// Intent actions the service delivers to a UI client, directly or
/// through a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentAction {
    /// Open the app (service notification tap)
    View,
    /// Tunnel connected, show home pages
    Handshake,
    /// Selected egress region no longer offered
    SelectedRegionNotAvailable,
    /// VPN permission was revoked by the system
    VpnRevoked,
    /// Upstream proxy rejected the connection
    UpstreamProxyError,
    /// Server flagged traffic as unsafe
    UnsafeTrafficAlert,
}

impl IntentAction {
    /// Stable action string.
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentAction::View => "ACTION_VIEW",
            IntentAction::Handshake => "tunhost.intent.HANDSHAKE",
            IntentAction::SelectedRegionNotAvailable => {
                "tunhost.intent.SELECTED_REGION_NOT_AVAILABLE"
            }
            IntentAction::VpnRevoked => "tunhost.intent.VPN_REVOKED",
            IntentAction::UpstreamProxyError => "tunhost.intent.UPSTREAM_PROXY_ERROR",
            IntentAction::UnsafeTrafficAlert => "tunhost.intent.UNSAFE_TRAFFIC_ALERT",
        }
    }
}

impl fmt::Display for IntentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An intent with its extras.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIntent {
    pub action: IntentAction,
    pub extras: Bundle,
}

impl ServiceIntent {
    pub fn new(action: IntentAction) -> Self {
        Self {
            action,
            extras: Bundle::new(),
        }
    }

    pub fn with_extras(action: IntentAction, extras: Bundle) -> Self {
        Self { action, extras }
    }
}

/// Messages sent from a UI client to the service.
#[derive(Debug, Clone)]
pub enum ClientToService {
    /// Start receiving state; `is_activity` marks an interactive client
    Register { reply_to: Messenger, is_activity: bool },
    /// Stop receiving state
    Unregister,
    /// Stop the tunnel and the service
    StopService,
    /// Restart the tunnel in place with the current configuration
    RestartTunnel,
    /// UI language changed (`None` resets to the system locale)
    LocaleChanged { language_code: Option<String> },
    /// Import connection info obtained from a companion device
    CompanionExchangeImport { payload: String },
    /// Export connection info for a companion device
    CompanionExchangeExport,
    /// Answer to a service `Ping`
    Pong,
}

impl ClientToService {
    pub fn name(&self) -> &'static str {
        match self {
            ClientToService::Register { .. } => "REGISTER",
            ClientToService::Unregister => "UNREGISTER",
            ClientToService::StopService => "STOP_SERVICE",
            ClientToService::RestartTunnel => "RESTART_TUNNEL",
            ClientToService::LocaleChanged { .. } => "LOCALE_CHANGED",
            ClientToService::CompanionExchangeImport { .. } => "COMPANION_EXCHANGE_IMPORT",
            ClientToService::CompanionExchangeExport => "COMPANION_EXCHANGE_EXPORT",
            ClientToService::Pong => "PONG",
        }
    }
}

/// A client message tagged with its sender.
#[derive(Debug, Clone)]
pub struct ClientEnvelope {
    pub sender: MessengerId,
    pub message: ClientToService,
}

/// Messages sent from the service to UI clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceToClient {
    /// Current tunnel state (see `TunnelState::to_bundle`)
    TunnelConnectionState(Bundle),
    /// Current transfer statistics (see `DataTransferSnapshot::to_bundle`)
    DataTransferStats(Bundle),
    /// Known egress regions were updated in the config store
    KnownServerRegions,
    /// Liveness probe, answer with `ClientToService::Pong`
    Ping,
    /// Connection info export result
    ExchangeExport(String),
    /// Connection info import result
    ExchangeImport(bool),
    /// Intent delivered directly to a reachable client
    Intent(ServiceIntent),
    /// A full restart began; embedded browser views must be torn down
    TunnelRestarting,
}

impl ServiceToClient {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceToClient::TunnelConnectionState(_) => "TUNNEL_CONNECTION_STATE",
            ServiceToClient::DataTransferStats(_) => "DATA_TRANSFER_STATS",
            ServiceToClient::KnownServerRegions => "KNOWN_SERVER_REGIONS",
            ServiceToClient::Ping => "PING",
            ServiceToClient::ExchangeExport(_) => "EXCHANGE_EXPORT",
            ServiceToClient::ExchangeImport(_) => "EXCHANGE_IMPORT",
            ServiceToClient::Intent(_) => "INTENT",
            ServiceToClient::TunnelRestarting => "TUNNEL_RESTARTING",
        }
    }
}

/// A client inbox handle held by the service.
#[derive(Debug, Clone)]
pub struct Messenger {
    id: MessengerId,
    tx: mpsc::UnboundedSender<ServiceToClient>,
}

impl Messenger {
    /// Create a new client inbox.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServiceToClient>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: MessengerId::next(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> MessengerId {
        self.id
    }

    /// Deliver a message; fails once the client dropped its inbox.
    pub fn send(&self, message: ServiceToClient) -> Result<(), MessengerError> {
        self.tx
            .send(message)
            .map_err(|_| MessengerError::PeerGone(self.id))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The service inbox handle held by a client.
#[derive(Debug, Clone)]
pub struct ServiceLink {
    tx: mpsc::UnboundedSender<ClientEnvelope>,
}

impl ServiceLink {
    pub fn new(tx: mpsc::UnboundedSender<ClientEnvelope>) -> Self {
        Self { tx }
    }

    /// Send `message` on behalf of `sender`.
    pub fn send(&self, sender: MessengerId, message: ClientToService) -> Result<(), MessengerError> {
        self.tx
            .send(ClientEnvelope { sender, message })
            .map_err(|_| MessengerError::ServiceGone)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messenger_ids_are_unique() {
        let (a, _rx_a) = Messenger::channel();
        let (b, _rx_b) = Messenger::channel();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_send_to_dropped_client_fails() {
        let (messenger, rx) = Messenger::channel();
        drop(rx);
        assert!(matches!(
            messenger.send(ServiceToClient::Ping),
            Err(MessengerError::PeerGone(id)) if id == messenger.id()
        ));
    }

    #[tokio::test]
    async fn test_service_link_delivers_envelope() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = ServiceLink::new(tx);
        let sender = MessengerId::next();

        link.send(sender, ClientToService::Pong).unwrap();
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.sender, sender);
        assert_eq!(envelope.message.name(), "PONG");
    }
}
