//! Shared fakes for service integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tunhost_config::{
    ConfigStore, EmbeddedValues, Preferences, SubscriptionTier, TunnelConfigManager,
};
use tunhost_core::{
    ClientToService, IntentAction, Messenger, MessengerId, ServiceIntent, ServiceLink,
    ServiceToClient, TunnelState,
};
use tunhost_service::{
    EngineError, EngineHost, Notification, NotificationId, ServiceContext, ServicePlatform,
    ServiceSettings, TunnelEngine, TunnelService,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// What the fake engine was asked to do.
#[derive(Default)]
pub struct EngineLog {
    calls: Mutex<Vec<&'static str>>,
    config: Mutex<String>,
    host: Mutex<Option<EngineHost>>,
}

impl EngineLog {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    /// Config JSON read at the last start or restart.
    pub fn config(&self) -> String {
        self.config.lock().unwrap().clone()
    }

    pub fn host(&self) -> EngineHost {
        self.host.lock().unwrap().clone().expect("engine not created")
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

pub struct FakeEngine {
    log: Arc<EngineLog>,
    host: EngineHost,
}

impl TunnelEngine for FakeEngine {
    fn start_routing(&self) -> Result<(), EngineError> {
        self.log.record("start_routing");
        Ok(())
    }

    fn start_tunneling(&self, _: &str) -> Result<(), EngineError> {
        *self.log.config.lock().unwrap() = self.host.get_config();
        self.log.record("start_tunneling");
        Ok(())
    }

    fn restart(&self) -> Result<(), EngineError> {
        *self.log.config.lock().unwrap() = self.host.get_config();
        self.log.record("restart");
        Ok(())
    }

    fn begin_routing(&self) -> Result<(), EngineError> {
        self.log.record("begin_routing");
        Ok(())
    }

    fn stop(&self) {
        self.log.record("stop");
    }

    fn export_exchange_payload(&self) -> String {
        "exchange-payload".to_string()
    }

    fn import_exchange_payload(&self, payload: &str) -> bool {
        payload == "exchange-payload"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    StartForeground,
    Notify(NotificationId, String),
    Cancel(NotificationId),
    Launch(IntentAction),
    SetLocale(Option<String>),
    StopForeground,
    StopSelf,
}

pub struct FakePlatform {
    calls: Mutex<Vec<PlatformCall>>,
    launch_allowed: bool,
}

impl FakePlatform {
    pub fn new(launch_allowed: bool) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            launch_allowed,
        }
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &PlatformCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn notifications(&self, id: NotificationId) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, PlatformCall::Notify(n, _) if *n == id))
            .count()
    }

    fn record(&self, call: PlatformCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ServicePlatform for FakePlatform {
    fn start_foreground(&self, _: &Notification) {
        self.record(PlatformCall::StartForeground);
    }

    fn notify(&self, id: NotificationId, notification: &Notification) {
        self.record(PlatformCall::Notify(id, notification.text.clone()));
    }

    fn cancel_notification(&self, id: NotificationId) {
        self.record(PlatformCall::Cancel(id));
    }

    fn launch(&self, intent: &ServiceIntent) -> bool {
        self.record(PlatformCall::Launch(intent.action));
        self.launch_allowed
    }

    fn set_locale(&self, language_code: Option<&str>) {
        self.record(PlatformCall::SetLocale(language_code.map(str::to_string)));
    }

    fn stop_foreground(&self) {
        self.record(PlatformCall::StopForeground);
    }

    fn stop_self(&self) {
        self.record(PlatformCall::StopSelf);
    }
}

/// Settings of a platform that lets the service launch activities.
pub fn unrestricted() -> ServiceSettings {
    ServiceSettings {
        platform_version: 28,
        ping_timeout_ms: 200,
        stats_interval_ms: 60_000,
        ..ServiceSettings::default()
    }
}

/// Settings of a platform that requires a reachable client.
pub fn restricted() -> ServiceSettings {
    ServiceSettings {
        platform_version: 30,
        ping_timeout_ms: 200,
        stats_interval_ms: 60_000,
        ..ServiceSettings::default()
    }
}

pub struct Harness {
    pub service: TunnelService,
    pub engine: Arc<EngineLog>,
    pub platform: Arc<FakePlatform>,
    pub config: Arc<TunnelConfigManager>,
    pub store: Arc<ConfigStore>,
}

impl Harness {
    pub async fn new(prefs: Preferences, settings: ServiceSettings, launch_allowed: bool) -> Self {
        let store = Arc::new(ConfigStore::with_preferences(prefs));
        let embedded = Arc::new(EmbeddedValues::development());
        let config = Arc::new(TunnelConfigManager::new(Arc::clone(&store), &embedded));
        config
            .init_configuration(
                async { false },
                async { false },
                async { String::new() },
                async { SubscriptionTier::None },
            )
            .await
            .unwrap();

        let engine = Arc::new(EngineLog::default());
        let platform = Arc::new(FakePlatform::new(launch_allowed));
        let ctx = ServiceContext::new(settings, embedded, Arc::clone(&config));
        let log = Arc::clone(&engine);
        let service = TunnelService::on_create(ctx, platform.clone(), move |host| {
            *log.host.lock().unwrap() = Some(host.clone());
            FakeEngine { log, host }
        });

        Self {
            service,
            engine,
            platform,
            config,
            store,
        }
    }

    pub async fn wait_state<F>(&self, what: &str, predicate: F) -> TunnelState
    where
        F: Fn(&TunnelState) -> bool,
    {
        let mut rx = self.service.subscribe_state();
        let state = timeout(WAIT, rx.wait_for(|s| predicate(s)))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
            .unwrap()
            .clone();
        state
    }

    pub async fn wait_running(&self) -> TunnelState {
        self.wait_state("running", TunnelState::is_running).await
    }

    pub async fn wait_connected(&self) -> TunnelState {
        self.wait_state("connected", |s| {
            s.connection_data().is_some_and(|d| d.is_connected())
        })
        .await
    }

    pub async fn wait_stopped(&self) -> TunnelState {
        self.wait_state("stopped", TunnelState::is_stopped).await
    }
}

/// Poll `condition` until it holds.
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A UI client talking to the service.
pub struct TestClient {
    pub id: MessengerId,
    pub rx: mpsc::UnboundedReceiver<ServiceToClient>,
    pub link: ServiceLink,
}

impl TestClient {
    pub fn register(service: &TunnelService, is_activity: bool) -> Self {
        let (messenger, rx) = Messenger::channel();
        let id = messenger.id();
        let link = service.on_bind();
        link.send(
            id,
            ClientToService::Register {
                reply_to: messenger,
                is_activity,
            },
        )
        .unwrap();
        Self { id, rx, link }
    }

    pub fn send(&self, message: ClientToService) {
        self.link.send(self.id, message).unwrap();
    }

    pub async fn recv(&mut self) -> ServiceToClient {
        timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for a service message")
            .expect("service closed the client inbox")
    }

    /// Receive messages until one matches, skipping the rest.
    pub async fn recv_matching<F>(&mut self, what: &str, predicate: F) -> ServiceToClient
    where
        F: Fn(&ServiceToClient) -> bool,
    {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.rx.recv()).await {
                Ok(Some(message)) if predicate(&message) => return message,
                Ok(Some(_)) => continue,
                Ok(None) => panic!("service closed the client inbox"),
                Err(_) => panic!("timed out waiting for {}", what),
            }
        }
    }

    /// Drain whatever is queued right now.
    pub fn drain(&mut self) -> Vec<ServiceToClient> {
        let mut messages = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            messages.push(message);
        }
        messages
    }
}
