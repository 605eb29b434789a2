//! Tunnel service actor
//!
//! A single task owns every piece of mutable service state: the client
//! registry, the active run, the published state, the reachability probe
//! and the error caches. Engine callbacks, client messages, timers and
//! config changes all arrive as messages, so they are handled strictly
//! one at a time.
//!
//! ```text
//!   engine callbacks ──┐
//!   client envelopes ──┤
//!   probe deadline   ──┼──▶ ServiceActor ──▶ state relay + client broadcast
//!   stats interval   ──┤        │
//!   config relay     ──┘        └──▶ run thread (stop latch)
//! ```
//!
//! Routing through the tunnel and direct intent delivery both need a UI
//! client that is provably alive on newer platforms. The actor pings every
//! registered activity and waits for a `Pong`; if none arrives before the
//! deadline, intents fall back to notifications and routing keeps waiting
//! behind an "open the app" notification.

use crate::context::ServiceContext;
use crate::engine::{EngineEvent, TunnelEngine};
use crate::error::EngineError;
use crate::platform::{Notification, NotificationId, Notifier, ServicePlatform};
use crate::registry::ClientRegistry;
use crate::run::{spawn_run, RunSpec};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::thread;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tunhost_config::{
    build_engine_config, ConfigError, EngineConfigParams, RestartType, TunnelConfig, TunnelMode,
};
use tunhost_core::{
    Bundle, ClientEnvelope, ClientToService, ConnectionData, DataTransferStats, IntentAction,
    Messenger, MessengerId, NetworkConnectionState, ServiceIntent, ServiceToClient, StopLatch,
    TaskBag, TunnelState, EXTRA_ACTION_URLS, EXTRA_HOME_PAGES, EXTRA_MESSAGE, EXTRA_REGION,
    EXTRA_SUBJECT, REGION_CODE_ANY,
};
use url::Url;

const NOTIFICATION_TITLE: &str = "tunhost";

/// Server alert reason for traffic the server refused to carry.
const UNSAFE_TRAFFIC_REASON: &str = "unsafe-traffic";

/// Service actor inbox messages
#[derive(Debug)]
pub(crate) enum ServiceEvent {
    Start,
    Stop,
    Revoke,
    Destroy { ack: oneshot::Sender<()> },
    ConfigReady {
        attempt: u64,
        result: Result<TunnelConfig, ConfigError>,
    },
    RestartReady {
        run: u64,
        restart_type: RestartType,
        result: Result<TunnelConfig, ConfigError>,
    },
    EngineCallFailed { run: u64, error: EngineError },
    Reply {
        to: MessengerId,
        message: ServiceToClient,
    },
    Engine(EngineEvent),
    RunFinished { run: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Routing {
    NotRouted,
    /// Connected, waiting for a reachable UI client
    Waiting,
    Routed,
}

/// The active tunnel run.
struct RunRecord {
    id: u64,
    latch: StopLatch,
    thread: Option<thread::JoinHandle<()>>,
    data: ConnectionData,
    routing: Routing,
    handshake_sent: bool,
    /// Suppress `Connecting` until the engine reconnects
    quiet_restart: bool,
}

/// An intent waiting for a reachable client.
struct Delivery {
    intent: ServiceIntent,
    fallback: Option<(NotificationId, Notification)>,
}

/// Outstanding reachability check.
#[derive(Default)]
struct Probe {
    deadline: Option<Instant>,
    routing: bool,
    deliveries: Vec<Delivery>,
}

impl Probe {
    fn is_idle(&self) -> bool {
        !self.routing && self.deliveries.is_empty()
    }
}

pub(crate) struct ServiceActor {
    ctx: ServiceContext,
    engine: Arc<dyn TunnelEngine>,
    engine_config: Arc<RwLock<String>>,
    platform: Arc<dyn ServicePlatform>,
    notifier: Notifier,
    events_tx: mpsc::UnboundedSender<ServiceEvent>,
    clients: ClientRegistry,
    state: watch::Sender<TunnelState>,
    stats: DataTransferStats,
    run: Option<RunRecord>,
    pending_start: Option<u64>,
    next_id: u64,
    probe: Probe,
    tasks: TaskBag,
    stop_requested: bool,
    self_stopped: bool,
    destroy_acks: Vec<oneshot::Sender<()>>,
    last_upstream_proxy_error: Option<String>,
    unsafe_traffic_subjects: BTreeSet<String>,
    unavailable_region: Option<String>,
}

impl ServiceActor {
    pub fn new(
        ctx: ServiceContext,
        engine: Arc<dyn TunnelEngine>,
        engine_config: Arc<RwLock<String>>,
        platform: Arc<dyn ServicePlatform>,
        events_tx: mpsc::UnboundedSender<ServiceEvent>,
        state: watch::Sender<TunnelState>,
    ) -> Self {
        Self {
            ctx,
            engine,
            engine_config,
            notifier: Notifier::new(Arc::clone(&platform)),
            platform,
            events_tx,
            clients: ClientRegistry::default(),
            state,
            stats: DataTransferStats::new(),
            run: None,
            pending_start: None,
            next_id: 1,
            probe: Probe::default(),
            tasks: TaskBag::new("tunnel-service"),
            stop_requested: false,
            self_stopped: false,
            destroy_acks: Vec::new(),
            last_upstream_proxy_error: None,
            unsafe_traffic_subjects: BTreeSet::new(),
            unavailable_region: None,
        }
    }

    /// Main loop. Returns after `Destroy` once no run is active.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ServiceEvent>,
        mut clients: mpsc::UnboundedReceiver<ClientEnvelope>,
    ) {
        let mut config_rx = self.ctx.config.subscribe();
        let mut config_open = true;
        let mut clients_open = true;
        let mut stats_tick = tokio::time::interval(self.ctx.settings.stats_interval());
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.platform.start_foreground(&self.status_notification());

        loop {
            let deadline = self.probe.deadline;
            let run_active = self.run.is_some();

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle_event(event);
                        if !self.destroy_acks.is_empty() && self.is_idle() {
                            break;
                        }
                    }
                    None => break,
                },
                envelope = clients.recv(), if clients_open => match envelope {
                    Some(envelope) => self.handle_client(envelope),
                    None => clients_open = false,
                },
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.probe_timed_out();
                }
                _ = stats_tick.tick(), if run_active => self.broadcast_stats(),
                changed = config_rx.changed(), if config_open => match changed {
                    Ok(()) => {
                        let config = config_rx.borrow_and_update().clone();
                        if let Some(config) = config {
                            self.on_config_published(config);
                        }
                    }
                    Err(_) => config_open = false,
                },
            }
        }

        self.tasks.clear();
        for ack in self.destroy_acks.drain(..) {
            let _ = ack.send(());
        }
        info!("Tunnel service actor exited");
    }

    fn is_idle(&self) -> bool {
        self.run.is_none() && self.pending_start.is_none()
    }

    fn is_current_run(&self, id: u64) -> bool {
        self.run.as_ref().is_some_and(|run| run.id == id)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn handle_event(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::Start => self.start(),
            ServiceEvent::Stop => self.stop(),
            ServiceEvent::Revoke => self.revoke(),
            ServiceEvent::Destroy { ack } => {
                info!("Tunnel service destroying");
                self.destroy_acks.push(ack);
                self.stop();
            }
            ServiceEvent::ConfigReady { attempt, result } => self.on_config_ready(attempt, result),
            ServiceEvent::RestartReady {
                run,
                restart_type,
                result,
            } => self.on_restart_ready(run, restart_type, result),
            ServiceEvent::EngineCallFailed { run, error } => {
                if self.is_current_run(run) {
                    error!("Tunnel run {} failed: {}", run, error);
                    self.stop();
                }
            }
            ServiceEvent::Reply { to, message } => {
                self.clients.send(to, message);
            }
            ServiceEvent::Engine(event) => self.on_engine_event(event),
            ServiceEvent::RunFinished { run } => self.on_run_finished(run),
        }
    }

    // ---------------------------------------------------------------
    // Client messages
    // ---------------------------------------------------------------

    fn handle_client(&mut self, envelope: ClientEnvelope) {
        let ClientEnvelope { sender, message } = envelope;
        match message {
            ClientToService::Register {
                reply_to,
                is_activity,
            } => self.on_register(reply_to, is_activity),
            message if !self.clients.contains(sender) => {
                debug!("Ignoring {} from unregistered {}", message.name(), sender);
            }
            ClientToService::Unregister => {
                self.clients.unregister(sender);
                debug!("{} unregistered ({} left)", sender, self.clients.len());
            }
            ClientToService::StopService => self.stop(),
            ClientToService::RestartTunnel => {
                let restart_type = self
                    .ctx
                    .config
                    .current()
                    .map_or(RestartType::Full, |config| config.restart_type);
                self.request_restart(restart_type);
            }
            ClientToService::LocaleChanged { language_code } => self.on_locale_changed(language_code),
            ClientToService::CompanionExchangeImport { payload } => self.exchange(sender, move |engine| {
                ServiceToClient::ExchangeImport(engine.import_exchange_payload(&payload))
            }),
            ClientToService::CompanionExchangeExport => self.exchange(sender, |engine| {
                ServiceToClient::ExchangeExport(engine.export_exchange_payload())
            }),
            ClientToService::Pong => self.on_pong(sender),
        }
    }

    fn on_register(&mut self, messenger: Messenger, is_activity: bool) {
        let id = messenger.id();
        self.clients.register(messenger, is_activity);
        info!("{} registered (activity={}, {} clients)", id, is_activity, self.clients.len());

        // Current state first, before anything else reaches the new client.
        let state = self.state.borrow().to_bundle();
        if !self.clients.send(id, ServiceToClient::TunnelConnectionState(state)) {
            return;
        }
        let stats = self.stats.snapshot().to_bundle();
        if !self.clients.send(id, ServiceToClient::DataTransferStats(stats)) {
            return;
        }
        if is_activity && !self.probe.is_idle() {
            self.clients.send(id, ServiceToClient::Ping);
        }
    }

    fn on_locale_changed(&mut self, language_code: Option<String>) {
        if let Err(e) = self.ctx.store().set_language_code(language_code.clone()) {
            warn!("Failed to persist language: {}", e);
        }
        self.platform.set_locale(language_code.as_deref());
        self.notifier.refresh(NotificationId::Service);
    }

    fn exchange<F>(&self, client: MessengerId, call: F)
    where
        F: FnOnce(&dyn TunnelEngine) -> ServiceToClient + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(move || call(engine.as_ref())).await {
                Ok(message) => {
                    let _ = events.send(ServiceEvent::Reply { to: client, message });
                }
                Err(e) => error!("Companion exchange failed: {}", e),
            }
        });
    }

    // ---------------------------------------------------------------
    // Run lifecycle
    // ---------------------------------------------------------------

    fn start(&mut self) {
        if !self.is_idle() {
            debug!("Start ignored: a tunnel run is already active");
            return;
        }
        if self.self_stopped {
            self.self_stopped = false;
            self.platform.start_foreground(&self.status_notification());
        }
        self.stop_requested = false;

        let attempt = self.next_id();
        self.pending_start = Some(attempt);
        let config = Arc::clone(&self.ctx.config);
        let events = self.events_tx.clone();
        self.tasks.spawn(async move {
            let result = config.effective_config().await;
            let _ = events.send(ServiceEvent::ConfigReady { attempt, result });
        });
    }

    fn on_config_ready(&mut self, attempt: u64, result: Result<TunnelConfig, ConfigError>) {
        if self.pending_start != Some(attempt) {
            debug!("Discarding tunnel config of a cancelled start");
            return;
        }
        self.pending_start = None;

        let prepared = result.and_then(|config| {
            let json = self.engine_config_json(&config)?;
            Ok((config, json))
        });
        let (config, json) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("Cannot start tunnel: {}", e);
                self.finish_service();
                return;
            }
        };
        self.set_engine_config(json);

        self.stats.start_session();
        self.last_upstream_proxy_error = None;
        self.unavailable_region = None;
        self.unsafe_traffic_subjects.clear();

        let vpn_mode = self.ctx.settings.vpn_mode;
        let latch = StopLatch::new();
        let thread = spawn_run(RunSpec {
            id: attempt,
            engine: Arc::clone(&self.engine),
            latch: latch.clone(),
            vpn_mode,
            server_entries: self.ctx.embedded.server_entries(),
            events: self.events_tx.clone(),
        });
        info!(
            "Tunnel run {} starting: config v{} sponsor={} region={:?}",
            attempt,
            config.version,
            config.sponsor_id(),
            config.egress_region
        );
        self.run = Some(RunRecord {
            id: attempt,
            latch,
            thread: Some(thread),
            data: ConnectionData::connecting(config.sponsor_id(), vpn_mode),
            routing: Routing::NotRouted,
            handshake_sent: false,
            quiet_restart: false,
        });
        self.publish_state();
    }

    fn engine_config_json(&self, config: &TunnelConfig) -> Result<String, ConfigError> {
        build_engine_config(&EngineConfigParams {
            embedded: &self.ctx.embedded,
            config,
            upstream_proxy_url: self.ctx.store().upstream_proxy_url(),
            upgrade_download: self.ctx.settings.upgrade_download.clone(),
            mode: TunnelMode::Primary,
        })
    }

    fn set_engine_config(&self, json: String) {
        *self
            .engine_config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = json;
    }

    /// Idempotent: signals the run latch once, stops the service once.
    fn stop(&mut self) {
        self.stop_requested = true;
        self.tasks.clear();
        if self.pending_start.take().is_some() {
            debug!("Pending tunnel start cancelled");
        }
        self.cancel_routing_wait();

        match &self.run {
            Some(run) => {
                if run.latch.signal() {
                    info!("Stopping tunnel run {}", run.id);
                }
            }
            None => self.finish_service(),
        }
    }

    fn revoke(&mut self) {
        warn!("VPN permission revoked");
        self.deliver(
            ServiceIntent::new(IntentAction::VpnRevoked),
            Some((
                NotificationId::VpnRevoked,
                alert_notification(
                    "The VPN connection was revoked by another application",
                    IntentAction::VpnRevoked,
                    Bundle::new(),
                ),
            )),
        );
        self.stop();
    }

    fn on_run_finished(&mut self, id: u64) {
        if !self.is_current_run(id) {
            return;
        }
        let Some(mut run) = self.run.take() else {
            return;
        };
        if let Some(thread) = run.thread.take() {
            tokio::task::spawn_blocking(move || {
                if thread.join().is_err() {
                    error!("Tunnel run thread panicked");
                }
            });
        }

        self.tasks.clear();
        self.cancel_routing_wait();
        self.stats.stop();
        self.publish_state();
        self.finish_service();
    }

    /// Leave the foreground and ask the platform to stop the service.
    fn finish_service(&mut self) {
        if self.self_stopped {
            return;
        }
        self.self_stopped = true;
        self.notifier.forget(NotificationId::Service);
        self.platform.stop_foreground();
        if self.destroy_acks.is_empty() {
            self.platform.stop_self();
        }
    }

    // ---------------------------------------------------------------
    // Restart
    // ---------------------------------------------------------------

    fn on_config_published(&mut self, config: TunnelConfig) {
        if self.run.is_none() {
            debug!("Tunnel config v{} published while idle", config.version);
            return;
        }
        info!(
            "Tunnel config v{} published, restarting ({})",
            config.version, config.restart_type
        );
        self.request_restart(config.restart_type);
    }

    fn request_restart(&mut self, restart_type: RestartType) {
        let Some(run) = self.run.as_ref() else {
            debug!("Restart ignored: no active run");
            return;
        };
        if self.stop_requested || run.latch.is_signaled() {
            debug!("Restart ignored: tunnel is stopping");
            return;
        }
        let run_id = run.id;
        self.cancel_routing_wait();
        self.publish_state();

        let config = Arc::clone(&self.ctx.config);
        let events = self.events_tx.clone();
        self.tasks.spawn(async move {
            let result = config.refresh_base_config().await;
            let _ = events.send(ServiceEvent::RestartReady {
                run: run_id,
                restart_type,
                result,
            });
        });
    }

    fn on_restart_ready(
        &mut self,
        run_id: u64,
        restart_type: RestartType,
        result: Result<TunnelConfig, ConfigError>,
    ) {
        if !self.is_current_run(run_id) || self.stop_requested {
            return;
        }
        let json = match result.and_then(|config| self.engine_config_json(&config)) {
            Ok(json) => json,
            Err(e) => {
                error!("Cannot restart tunnel: {}", e);
                self.stop();
                return;
            }
        };
        self.set_engine_config(json);

        let Some(run) = self.run.as_mut() else {
            return;
        };
        info!("Tunnel run {}: {} restart", run_id, restart_type);
        match restart_type {
            RestartType::Full => {
                run.routing = Routing::NotRouted;
                run.handshake_sent = false;
                run.quiet_restart = false;
                run.data.network_state = NetworkConnectionState::Connecting;
                run.data.home_pages.clear();
                run.data.waiting_for_app = false;
                self.stats.stop();
                self.clients.broadcast(&ServiceToClient::TunnelRestarting);
                self.publish_state();
            }
            RestartType::Quiet => run.quiet_restart = true,
        }
        self.spawn_engine_call(run_id, "restart", |engine| engine.restart());
    }

    fn spawn_engine_call<F>(&self, run: u64, what: &'static str, call: F)
    where
        F: FnOnce(&dyn TunnelEngine) -> Result<(), EngineError> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let events = self.events_tx.clone();
        self.tasks.spawn(async move {
            match tokio::task::spawn_blocking(move || call(engine.as_ref())).await {
                Ok(Ok(())) => debug!("Engine {} done", what),
                Ok(Err(error)) => {
                    let _ = events.send(ServiceEvent::EngineCallFailed { run, error });
                }
                Err(e) => error!("Engine {} panicked: {}", what, e),
            }
        });
    }

    // ---------------------------------------------------------------
    // Published state
    // ---------------------------------------------------------------

    fn current_state(&self) -> TunnelState {
        match &self.run {
            Some(run) => TunnelState::Running(run.data.clone()),
            None => TunnelState::Stopped,
        }
    }

    /// Publish the current state if it differs from the last published one.
    fn publish_state(&mut self) {
        let next = self.current_state();
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
        if !changed {
            return;
        }
        debug!("Tunnel state: {}", next);
        self.clients
            .broadcast(&ServiceToClient::TunnelConnectionState(next.to_bundle()));
        self.update_status_notification();
    }

    fn broadcast_stats(&mut self) {
        let snapshot = self.stats.snapshot();
        self.clients
            .broadcast(&ServiceToClient::DataTransferStats(snapshot.to_bundle()));
    }

    fn update_status_notification(&mut self) {
        let Some(run) = &self.run else {
            return;
        };
        if self.self_stopped || (self.stop_requested && !run.data.is_connected()) {
            return;
        }
        let notification = self.status_notification();
        self.notifier.show(NotificationId::Service, notification);
    }

    fn status_notification(&self) -> Notification {
        let data = self.run.as_ref().map(|run| &run.data);
        let text = match data {
            None => "Starting",
            Some(data) if data.waiting_for_app => "Connected. Open the app to finish connecting",
            Some(data) if data.is_connected() && data.is_vpn_mode => "Connected. Device traffic is tunneled",
            Some(data) if data.is_connected() => "Connected. Local proxy is available",
            Some(data) if data.network_state == NetworkConnectionState::WaitingForNetwork => {
                "Waiting for network"
            }
            Some(_) => "Connecting",
        };
        let (sound, vibrate) = if data.is_some_and(|d| d.is_connected()) {
            self.ctx.store().notification_alerts()
        } else {
            (false, false)
        };
        Notification {
            title: NOTIFICATION_TITLE.to_string(),
            text: text.to_string(),
            intent: ServiceIntent::new(IntentAction::View),
            ongoing: true,
            sound,
            vibrate,
        }
    }

    // ---------------------------------------------------------------
    // Reachability probe, routing and intent delivery
    // ---------------------------------------------------------------

    /// Arm the probe deadline and ping every activity, unless a probe is
    /// already in flight.
    fn request_probe(&mut self) {
        if self.probe.deadline.is_some() {
            return;
        }
        self.probe.deadline = Some(Instant::now() + self.ctx.settings.ping_timeout());
        for id in self.clients.activity_ids() {
            self.clients.send(id, ServiceToClient::Ping);
        }
    }

    fn on_pong(&mut self, sender: MessengerId) {
        if !self.clients.is_activity(sender) {
            debug!("Ignoring pong from non-activity {}", sender);
            return;
        }
        if self.probe.is_idle() {
            return;
        }
        debug!("{} is reachable", sender);
        self.probe.deadline = None;

        if self.probe.routing {
            self.route_through_tunnel(Some(sender));
        }
        for delivery in std::mem::take(&mut self.probe.deliveries) {
            if !self
                .clients
                .send(sender, ServiceToClient::Intent(delivery.intent.clone()))
            {
                self.notify_fallback(delivery);
            }
        }
    }

    fn probe_timed_out(&mut self) {
        self.probe.deadline = None;
        debug!("No UI client answered the ping");

        for delivery in std::mem::take(&mut self.probe.deliveries) {
            self.notify_fallback(delivery);
        }
        if !self.probe.routing {
            return;
        }
        if let Some(run) = self.run.as_mut() {
            run.data.waiting_for_app = run.data.is_connected();
        }
        self.notifier.show(
            NotificationId::OpenApp,
            Notification::new(
                NOTIFICATION_TITLE,
                "Connected. Open the app to start using the tunnel",
                ServiceIntent::new(IntentAction::View),
            ),
        );
        self.publish_state();
    }

    fn notify_fallback(&mut self, delivery: Delivery) {
        match delivery.fallback {
            Some((id, notification)) => self.notifier.alert(id, notification),
            None => debug!("Dropping {} intent: no reachable client", delivery.intent.action),
        }
    }

    /// Stop waiting for a client before routing. Pending intent deliveries
    /// keep their deadline.
    fn cancel_routing_wait(&mut self) {
        self.probe.routing = false;
        if self.probe.deliveries.is_empty() {
            self.probe.deadline = None;
        }
        self.notifier.cancel(NotificationId::OpenApp);
        if let Some(run) = self.run.as_mut() {
            run.data.waiting_for_app = false;
            if run.routing == Routing::Waiting {
                run.routing = Routing::NotRouted;
            }
        }
    }

    fn wait_for_app(&mut self) {
        if let Some(run) = self.run.as_mut() {
            run.routing = Routing::Waiting;
        }
        self.probe.routing = true;
        self.request_probe();
    }

    /// Begin routing, then hand the home pages to `client` (or launch them
    /// directly when no client was required).
    fn route_through_tunnel(&mut self, client: Option<MessengerId>) {
        self.probe.routing = false;
        self.notifier.cancel(NotificationId::OpenApp);

        let Some(run) = self.run.as_mut() else {
            return;
        };
        run.routing = Routing::Routed;
        run.data.waiting_for_app = false;
        let run_id = run.id;
        let handshake = take_handshake(run);

        info!("Tunnel run {}: routing through tunnel", run_id);
        self.spawn_engine_call(run_id, "begin routing", |engine| engine.begin_routing());
        self.publish_state();

        if let Some(intent) = handshake {
            match client {
                Some(id) => {
                    self.clients.send(id, ServiceToClient::Intent(intent));
                }
                None => self.deliver(intent, None),
            }
        }
    }

    /// Hand `intent` to a UI client: directly where the platform allows
    /// it, otherwise through a reachable activity, with `fallback` shown
    /// when nobody is reachable.
    fn deliver(&mut self, intent: ServiceIntent, fallback: Option<(NotificationId, Notification)>) {
        if !self.ctx.settings.requires_reachable_client() {
            if self.platform.launch(&intent) {
                return;
            }
            self.notify_fallback(Delivery { intent, fallback });
            return;
        }
        self.probe.deliveries.push(Delivery { intent, fallback });
        self.request_probe();
    }

    // ---------------------------------------------------------------
    // Engine callbacks
    // ---------------------------------------------------------------

    fn on_engine_event(&mut self, event: EngineEvent) {
        if self.run.is_none() {
            debug!("Ignoring {:?}: no active run", event);
            return;
        }
        match event {
            EngineEvent::Connecting => self.on_connecting(),
            EngineEvent::Connected => self.on_connected(),
            EngineEvent::StartedWaitingForNetwork => self.on_waiting_for_network(),
            EngineEvent::Homepage(url) => self.on_homepage(url),
            EngineEvent::ClientRegion(region) => {
                if let Some(run) = self.run.as_mut() {
                    run.data.client_region = region;
                }
                self.publish_state();
            }
            EngineEvent::AvailableEgressRegions(regions) => self.on_available_regions(regions),
            EngineEvent::BytesTransferred { sent, received } => self.stats.add_bytes(sent, received),
            EngineEvent::SocksProxyPortInUse(port) => {
                error!("Local SOCKS proxy port {} is in use", port);
                self.stop();
            }
            EngineEvent::HttpProxyPortInUse(port) => {
                error!("Local HTTP proxy port {} is in use", port);
                self.stop();
            }
            EngineEvent::ListeningSocksProxyPort(port) => {
                if let Some(run) = self.run.as_mut() {
                    run.data.listening_socks_port = port;
                }
                self.publish_state();
            }
            EngineEvent::ListeningHttpProxyPort(port) => {
                if let Err(e) = self.ctx.store().set_last_http_proxy_port(port) {
                    warn!("Failed to persist HTTP proxy port: {}", e);
                }
                if let Some(run) = self.run.as_mut() {
                    run.data.listening_http_port = port;
                }
                self.publish_state();
            }
            EngineEvent::UpstreamProxyError(message) => self.on_upstream_proxy_error(message),
            EngineEvent::ServerAlert {
                reason,
                subject,
                action_urls,
            } => self.on_server_alert(reason, subject, action_urls),
        }
    }

    fn on_connecting(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.quiet_restart {
            debug!("Tunnel run {}: reconnecting quietly", run.id);
            return;
        }
        if !self.stop_requested {
            info!("Tunnel run {}: connecting", run.id);
        }
        run.data.network_state = NetworkConnectionState::Connecting;
        run.data.home_pages.clear();
        self.cancel_routing_wait();
        self.stats.stop();
        self.publish_state();
    }

    fn on_connected(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        info!("Tunnel run {}: connected", run.id);
        run.quiet_restart = false;
        run.data.network_state = NetworkConnectionState::Connected;
        let routing = run.routing;
        self.stats.start_connected();

        match routing {
            Routing::Routed => self.publish_state(),
            _ if !self.ctx.settings.requires_reachable_client() => self.route_through_tunnel(None),
            _ => {
                self.wait_for_app();
                self.publish_state();
            }
        }
    }

    fn on_waiting_for_network(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        info!("Tunnel run {}: waiting for network", run.id);
        run.data.network_state = NetworkConnectionState::WaitingForNetwork;
        self.cancel_routing_wait();
        self.stats.stop();
        self.publish_state();
    }

    fn on_homepage(&mut self, url: String) {
        if let Err(e) = Url::parse(&url) {
            warn!("Ignoring invalid home page {:?}: {}", url, e);
            return;
        }
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.data.home_pages.contains(&url) {
            return;
        }
        run.data.home_pages.push(url);
        let late_handshake = if run.routing == Routing::Routed {
            take_handshake(run)
        } else {
            None
        };
        self.publish_state();
        if let Some(intent) = late_handshake {
            self.deliver(intent, None);
        }
    }

    fn on_available_regions(&mut self, regions: Vec<String>) {
        let store = Arc::clone(self.ctx.store());
        if let Err(e) = store.set_known_regions(&regions) {
            warn!("Failed to persist known regions: {}", e);
        }
        self.clients.broadcast(&ServiceToClient::KnownServerRegions);

        let selected = store.egress_region();
        if selected == REGION_CODE_ANY || regions.contains(&selected) {
            self.unavailable_region = None;
            return;
        }
        if self.unavailable_region.as_deref() == Some(selected.as_str()) {
            return;
        }

        warn!("Selected egress region {} is no longer available", selected);
        self.unavailable_region = Some(selected.clone());
        if let Err(e) = store.set_egress_region(REGION_CODE_ANY) {
            error!("Failed to reset egress region: {}", e);
        }

        let mut extras = Bundle::new();
        extras.put_string(EXTRA_REGION, selected.clone());
        self.deliver(
            ServiceIntent::with_extras(IntentAction::SelectedRegionNotAvailable, extras.clone()),
            Some((
                NotificationId::RegionNotAvailable,
                alert_notification(
                    format!("Region {} is not available. Choose another region.", selected),
                    IntentAction::SelectedRegionNotAvailable,
                    extras,
                ),
            )),
        );
        self.stop();
    }

    fn on_upstream_proxy_error(&mut self, message: String) {
        if self.last_upstream_proxy_error.as_deref() == Some(message.as_str()) {
            return;
        }
        warn!("Upstream proxy error: {}", message);
        self.last_upstream_proxy_error = Some(message.clone());

        let mut extras = Bundle::new();
        extras.put_string(EXTRA_MESSAGE, message.clone());
        self.deliver(
            ServiceIntent::with_extras(IntentAction::UpstreamProxyError, extras.clone()),
            Some((
                NotificationId::UpstreamProxyError,
                alert_notification(
                    format!("Upstream proxy error: {}", message),
                    IntentAction::UpstreamProxyError,
                    extras,
                ),
            )),
        );
    }

    fn on_server_alert(&mut self, reason: String, subject: String, action_urls: Vec<String>) {
        info!("Server alert: reason={} subject={}", reason, subject);
        if reason != UNSAFE_TRAFFIC_REASON {
            return;
        }
        if !self.unsafe_traffic_subjects.insert(subject.clone()) {
            return;
        }

        let mut extras = Bundle::new();
        extras
            .put_string(EXTRA_SUBJECT, subject)
            .put_string_list(EXTRA_ACTION_URLS, action_urls);
        let subjects: Vec<&str> = self
            .unsafe_traffic_subjects
            .iter()
            .map(String::as_str)
            .collect();
        self.deliver(
            ServiceIntent::with_extras(IntentAction::UnsafeTrafficAlert, extras.clone()),
            Some((
                NotificationId::UnsafeTrafficAlert,
                alert_notification(
                    format!("Unsafe traffic blocked: {}", subjects.join(", ")),
                    IntentAction::UnsafeTrafficAlert,
                    extras,
                ),
            )),
        );
    }
}

/// Build the handshake intent once per connection.
fn take_handshake(run: &mut RunRecord) -> Option<ServiceIntent> {
    if run.handshake_sent || run.data.home_pages.is_empty() {
        return None;
    }
    run.handshake_sent = true;
    let mut extras = Bundle::new();
    extras.put_string_list(EXTRA_HOME_PAGES, run.data.home_pages.clone());
    Some(ServiceIntent::with_extras(IntentAction::Handshake, extras))
}

fn alert_notification(text: impl Into<String>, action: IntentAction, extras: Bundle) -> Notification {
    Notification::new(
        NOTIFICATION_TITLE,
        text,
        ServiceIntent::with_extras(action, extras),
    )
}
