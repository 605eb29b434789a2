//! Service client bridge
//!
//! One bridge per UI process. While resumed it holds a binding to the
//! tunnel service: a registered inbox plus a pump task that decodes every
//! service message into the bridge's streams. Pausing drops the binding
//! and parks the state at `Unknown`.
//!
//! State uses a watch channel so a late subscriber sees the current value
//! immediately. Consecutive identical states are published once.

use crate::error::ClientError;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tunhost_core::{
    ClientToService, DataTransferSnapshot, Messenger, MessengerId, ServiceIntent, ServiceLink,
    ServiceToClient, TunnelState,
};

/// Buffered one-shot events per subscriber before it starts lagging
const EVENT_CAPACITY: usize = 32;

/// How the bridge reaches the tunnel service.
pub trait ServiceConnector: Send + Sync + 'static {
    /// A link to the service if it is running.
    fn connect(&self) -> Option<ServiceLink>;

    /// Ask the platform to start the service. Returns `false` if refused.
    fn start_service(&self) -> bool;
}

/// One-shot notifications from the service.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// The known egress region list was updated in the config store
    KnownRegionsUpdated,
    ExchangeExported(String),
    ExchangeImported(bool),
    /// Intent delivered directly to this client
    Intent(ServiceIntent),
    /// A full restart began
    TunnelRestarting,
}

struct Binding {
    id: MessengerId,
    link: ServiceLink,
    pump: JoinHandle<()>,
}

impl Binding {
    fn release(self) {
        if let Err(e) = self.link.send(self.id, ClientToService::Unregister) {
            debug!("Unregister of {} not delivered: {}", self.id, e);
        }
        self.pump.abort();
    }
}

struct Inner {
    paused: bool,
    binding: Option<Binding>,
}

impl Inner {
    fn is_bound_as(&self, id: MessengerId) -> bool {
        self.binding.as_ref().is_some_and(|b| b.id == id)
    }
}

struct Shared {
    inner: Mutex<Inner>,
    state: watch::Sender<TunnelState>,
    stats: watch::Sender<Option<DataTransferSnapshot>>,
    events: broadcast::Sender<BridgeEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish_state(&self, next: TunnelState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!("Tunnel state: {}", next);
            *current = next;
            true
        });
    }

    fn emit(&self, event: BridgeEvent) {
        if self.events.send(event).is_err() {
            debug!("No event subscribers");
        }
    }

    fn disconnected(&self) {
        self.publish_state(TunnelState::Stopped);
        self.stats.send_replace(None);
    }
}

/// Typed view of the tunnel service for one UI process.
pub struct ServiceClientBridge {
    connector: Arc<dyn ServiceConnector>,
    is_activity: bool,
    shared: Arc<Shared>,
}

impl ServiceClientBridge {
    /// Create a paused bridge. `is_activity` marks an interactive client,
    /// one the service may hand intents to and ping for reachability.
    pub fn new(connector: Arc<dyn ServiceConnector>, is_activity: bool) -> Self {
        let (state, _) = watch::channel(TunnelState::Unknown);
        let (stats, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connector,
            is_activity,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    paused: true,
                    binding: None,
                }),
                state,
                stats,
                events,
            }),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.shared.state.borrow().clone()
    }

    /// Tunnel state, latest value first.
    pub fn subscribe_state(&self) -> watch::Receiver<TunnelState> {
        self.shared.state.subscribe()
    }

    /// Transfer statistics; `None` until the service sends them and again
    /// after it disconnects.
    pub fn subscribe_stats(&self) -> watch::Receiver<Option<DataTransferSnapshot>> {
        self.shared.stats.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_bound(&self) -> bool {
        self.shared.lock().binding.is_some()
    }

    /// Bind to the service if it is running, else report it stopped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn resume(&self) {
        let mut inner = self.shared.lock();
        inner.paused = false;
        self.shared.publish_state(TunnelState::Unknown);
        match self.connector.connect() {
            Some(link) => self.bind(&mut inner, link),
            None => self.shared.publish_state(TunnelState::Stopped),
        }
    }

    /// Unregister and unbind. The state reads `Unknown` until resumed.
    pub fn pause(&self) {
        let mut inner = self.shared.lock();
        inner.paused = true;
        self.shared.publish_state(TunnelState::Unknown);
        if let Some(binding) = inner.binding.take() {
            debug!("Unbinding {}", binding.id);
            binding.release();
        }
    }

    /// Start the service and, unless paused, bind to it.
    pub fn start_tunnel_service(&self) -> Result<(), ClientError> {
        let mut inner = self.shared.lock();
        self.shared.publish_state(TunnelState::Unknown);
        if !self.connector.start_service() {
            warn!("Tunnel service refused to start");
            self.shared.publish_state(TunnelState::Stopped);
            return Err(ClientError::StartRefused);
        }
        if inner.paused {
            return Ok(());
        }
        match self.connector.connect() {
            Some(link) => self.bind(&mut inner, link),
            None => self.shared.publish_state(TunnelState::Stopped),
        }
        Ok(())
    }

    pub fn stop_tunnel_service(&self) -> Result<(), ClientError> {
        self.send(ClientToService::StopService)
    }

    /// Reconnect with the current configuration without stopping the
    /// service.
    pub fn restart_tunnel(&self) -> Result<(), ClientError> {
        self.send(ClientToService::RestartTunnel)
    }

    pub fn change_locale(&self, language_code: Option<String>) -> Result<(), ClientError> {
        self.send(ClientToService::LocaleChanged { language_code })
    }

    /// The result arrives as [`BridgeEvent::ExchangeImported`].
    pub fn import_connection_info(&self, payload: impl Into<String>) -> Result<(), ClientError> {
        self.send(ClientToService::CompanionExchangeImport {
            payload: payload.into(),
        })
    }

    /// The result arrives as [`BridgeEvent::ExchangeExported`].
    pub fn export_connection_info(&self) -> Result<(), ClientError> {
        self.send(ClientToService::CompanionExchangeExport)
    }

    fn bind(&self, inner: &mut Inner, link: ServiceLink) {
        if let Some(previous) = inner.binding.take() {
            previous.release();
        }

        let (messenger, inbox) = Messenger::channel();
        let id = messenger.id();
        let register = ClientToService::Register {
            reply_to: messenger,
            is_activity: self.is_activity,
        };
        if let Err(e) = link.send(id, register) {
            warn!("Failed to register with the tunnel service: {}", e);
            self.shared.disconnected();
            return;
        }

        let pump = tokio::spawn(pump(Arc::clone(&self.shared), id, link.clone(), inbox));
        inner.binding = Some(Binding { id, link, pump });
        info!("Bound to tunnel service as {}", id);
    }

    fn send(&self, message: ClientToService) -> Result<(), ClientError> {
        let mut inner = self.shared.lock();
        let Some(binding) = &inner.binding else {
            debug!("Dropping {}: not bound", message.name());
            return Err(ClientError::NotBound);
        };

        let name = message.name();
        match binding.link.send(binding.id, message) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Sending {} failed: {}", name, e);
                if let Some(binding) = inner.binding.take() {
                    binding.pump.abort();
                }
                self.shared.disconnected();
                Err(e.into())
            }
        }
    }
}

impl Drop for ServiceClientBridge {
    fn drop(&mut self) {
        if let Some(binding) = self.shared.lock().binding.take() {
            binding.release();
        }
    }
}

async fn pump(
    shared: Arc<Shared>,
    id: MessengerId,
    link: ServiceLink,
    mut inbox: mpsc::UnboundedReceiver<ServiceToClient>,
) {
    while let Some(message) = inbox.recv().await {
        if !handle_message(&shared, id, &link, message) {
            return;
        }
    }

    let mut inner = shared.lock();
    if inner.is_bound_as(id) {
        inner.binding = None;
        info!("Tunnel service disconnected");
        shared.disconnected();
    }
}

/// Apply one service message. Returns `false` once this binding is stale.
fn handle_message(
    shared: &Shared,
    id: MessengerId,
    link: &ServiceLink,
    message: ServiceToClient,
) -> bool {
    let inner = shared.lock();
    if !inner.is_bound_as(id) {
        return false;
    }

    match message {
        ServiceToClient::TunnelConnectionState(bundle) => match TunnelState::from_bundle(&bundle) {
            Ok(state) => shared.publish_state(state),
            Err(e) => warn!("Malformed tunnel state: {}", e),
        },
        ServiceToClient::DataTransferStats(bundle) => {
            match DataTransferSnapshot::from_bundle(&bundle) {
                Ok(snapshot) => {
                    shared.stats.send_replace(Some(snapshot));
                }
                Err(e) => warn!("Malformed transfer stats: {}", e),
            }
        }
        ServiceToClient::Ping => {
            if let Err(e) = link.send(id, ClientToService::Pong) {
                debug!("Pong not delivered: {}", e);
            }
        }
        ServiceToClient::KnownServerRegions => shared.emit(BridgeEvent::KnownRegionsUpdated),
        ServiceToClient::ExchangeExport(payload) => {
            shared.emit(BridgeEvent::ExchangeExported(payload))
        }
        ServiceToClient::ExchangeImport(accepted) => {
            shared.emit(BridgeEvent::ExchangeImported(accepted))
        }
        ServiceToClient::Intent(intent) => {
            debug!("Intent {}", intent.action);
            shared.emit(BridgeEvent::Intent(intent))
        }
        ServiceToClient::TunnelRestarting => shared.emit(BridgeEvent::TunnelRestarting),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use tunhost_core::{ClientEnvelope, ConnectionData, IntentAction, NetworkConnectionState};

    const WAIT: Duration = Duration::from_secs(5);

    /// A connector backed by a bare channel standing in for the service.
    struct FakeConnector {
        running: bool,
        start_allowed: bool,
        tx: mpsc::UnboundedSender<ClientEnvelope>,
    }

    impl ServiceConnector for FakeConnector {
        fn connect(&self) -> Option<ServiceLink> {
            self.running.then(|| ServiceLink::new(self.tx.clone()))
        }

        fn start_service(&self) -> bool {
            self.start_allowed
        }
    }

    fn bridge(running: bool) -> (ServiceClientBridge, mpsc::UnboundedReceiver<ClientEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(FakeConnector {
            running,
            start_allowed: true,
            tx,
        });
        (ServiceClientBridge::new(connector, true), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ClientEnvelope>) -> ClientEnvelope {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    /// Take the register envelope and return the client's inbox handle.
    async fn accept(rx: &mut mpsc::UnboundedReceiver<ClientEnvelope>) -> Messenger {
        match next(rx).await.message {
            ClientToService::Register {
                reply_to,
                is_activity,
            } => {
                assert!(is_activity);
                reply_to
            }
            other => panic!("expected REGISTER, got {}", other.name()),
        }
    }

    fn running(network_state: NetworkConnectionState) -> TunnelState {
        let mut data = ConnectionData::connecting("SPONSOR", true);
        data.network_state = network_state;
        TunnelState::Running(data)
    }

    async fn wait_state(bridge: &ServiceClientBridge, expected: TunnelState) {
        let mut rx = bridge.subscribe_state();
        timeout(WAIT, rx.wait_for(|s| *s == expected))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_new_bridge_is_unknown_and_unbound() {
        let (bridge, _rx) = bridge(true);
        assert_eq!(bridge.state(), TunnelState::Unknown);
        assert!(!bridge.is_bound());
        assert!(matches!(bridge.stop_tunnel_service(), Err(ClientError::NotBound)));
    }

    #[tokio::test]
    async fn test_resume_without_service_reports_stopped() {
        let (bridge, mut rx) = bridge(false);
        bridge.resume();
        assert_eq!(bridge.state(), TunnelState::Stopped);
        assert!(!bridge.is_bound());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_state_follows_service_without_repeats() {
        let (bridge, mut rx) = bridge(true);
        bridge.resume();
        let client = accept(&mut rx).await;

        let connected = running(NetworkConnectionState::Connected);
        client
            .send(ServiceToClient::TunnelConnectionState(connected.to_bundle()))
            .unwrap();
        wait_state(&bridge, connected.clone()).await;

        let mut states = bridge.subscribe_state();
        let _ = states.borrow_and_update();
        client
            .send(ServiceToClient::TunnelConnectionState(connected.to_bundle()))
            .unwrap();
        // The pump handles messages in order, so once the pong is back the
        // repeated state has been processed
        client.send(ServiceToClient::Ping).unwrap();
        assert!(matches!(next(&mut rx).await.message, ClientToService::Pong));
        assert!(!states.has_changed().unwrap());

        let waiting = running(NetworkConnectionState::WaitingForNetwork);
        client
            .send(ServiceToClient::TunnelConnectionState(waiting.to_bundle()))
            .unwrap();
        timeout(WAIT, states.changed()).await.unwrap().unwrap();
        assert_eq!(*states.borrow(), waiting);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_current_state() {
        let (bridge, mut rx) = bridge(true);
        bridge.resume();
        let client = accept(&mut rx).await;
        client
            .send(ServiceToClient::TunnelConnectionState(TunnelState::Stopped.to_bundle()))
            .unwrap();
        wait_state(&bridge, TunnelState::Stopped).await;

        let late = bridge.subscribe_state();
        assert_eq!(*late.borrow(), TunnelState::Stopped);
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_pong() {
        let (bridge, mut rx) = bridge(true);
        bridge.resume();
        let client = accept(&mut rx).await;

        client.send(ServiceToClient::Ping).unwrap();
        let envelope = next(&mut rx).await;
        assert_eq!(envelope.sender, client.id());
        assert!(matches!(envelope.message, ClientToService::Pong));
    }

    #[tokio::test]
    async fn test_pause_unregisters_and_reports_unknown() {
        let (bridge, mut rx) = bridge(true);
        bridge.resume();
        let client = accept(&mut rx).await;
        client
            .send(ServiceToClient::TunnelConnectionState(TunnelState::Stopped.to_bundle()))
            .unwrap();
        wait_state(&bridge, TunnelState::Stopped).await;

        bridge.pause();
        assert_eq!(bridge.state(), TunnelState::Unknown);
        assert!(!bridge.is_bound());
        let envelope = next(&mut rx).await;
        assert_eq!(envelope.sender, client.id());
        assert!(matches!(envelope.message, ClientToService::Unregister));

        // Late messages for the old binding are ignored
        let _ = client.send(ServiceToClient::TunnelConnectionState(
            running(NetworkConnectionState::Connected).to_bundle(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bridge.state(), TunnelState::Unknown);
    }

    #[tokio::test]
    async fn test_service_disconnect_reports_stopped() {
        let (bridge, mut rx) = bridge(true);
        bridge.resume();
        let client = accept(&mut rx).await;
        client
            .send(ServiceToClient::TunnelConnectionState(
                running(NetworkConnectionState::Connected).to_bundle(),
            ))
            .unwrap();
        client
            .send(ServiceToClient::DataTransferStats(DataTransferSnapshot::default().to_bundle()))
            .unwrap();
        wait_state(&bridge, running(NetworkConnectionState::Connected)).await;

        drop(client);
        wait_state(&bridge, TunnelState::Stopped).await;
        assert!(!bridge.is_bound());
        assert!(bridge.subscribe_stats().borrow().is_none());
    }

    #[tokio::test]
    async fn test_one_shot_messages_become_events() {
        let (bridge, mut rx) = bridge(true);
        let mut events = bridge.subscribe_events();
        bridge.resume();
        let client = accept(&mut rx).await;

        client.send(ServiceToClient::KnownServerRegions).unwrap();
        client
            .send(ServiceToClient::ExchangeExport("payload".into()))
            .unwrap();
        client
            .send(ServiceToClient::Intent(ServiceIntent::new(IntentAction::VpnRevoked)))
            .unwrap();
        client.send(ServiceToClient::TunnelRestarting).unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(timeout(WAIT, events.recv()).await.unwrap().unwrap());
        }
        assert_eq!(
            seen,
            vec![
                BridgeEvent::KnownRegionsUpdated,
                BridgeEvent::ExchangeExported("payload".into()),
                BridgeEvent::Intent(ServiceIntent::new(IntentAction::VpnRevoked)),
                BridgeEvent::TunnelRestarting,
            ]
        );
    }

    #[tokio::test]
    async fn test_send_to_gone_service_reports_stopped() {
        let (bridge, mut rx) = bridge(true);
        bridge.resume();
        let _client = accept(&mut rx).await;
        drop(rx);

        assert!(matches!(
            bridge.restart_tunnel(),
            Err(ClientError::Messenger(_))
        ));
        assert_eq!(bridge.state(), TunnelState::Stopped);
        assert!(!bridge.is_bound());
    }

    #[tokio::test]
    async fn test_refused_start_reports_stopped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connector = Arc::new(FakeConnector {
            running: false,
            start_allowed: false,
            tx,
        });
        let bridge = ServiceClientBridge::new(connector, false);
        bridge.resume();

        assert!(matches!(
            bridge.start_tunnel_service(),
            Err(ClientError::StartRefused)
        ));
        assert_eq!(bridge.state(), TunnelState::Stopped);
    }
}
