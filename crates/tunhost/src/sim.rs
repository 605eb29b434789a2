//! Stand-ins for the tunnel engine and the host platform.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};
use tunhost_companion::{CompanionConnection, CompanionError, CompanionPlatform};
use tunhost_core::ServiceIntent;
use tunhost_service::{
    EngineError, EngineHost, Notification, NotificationId, ServicePlatform, TunnelEngine,
};

const SOCKS_PORT: u16 = 1080;
const HTTP_PORT: u16 = 8080;
const HOME_PAGE: &str = "https://tunhost.example/welcome";
const TICK: Duration = Duration::from_secs(1);

enum Command {
    Restart,
    Stop,
}

/// Engine that walks through a connection without touching the network.
pub struct SimulatedEngine {
    host: EngineHost,
    commands: Mutex<Option<Sender<Command>>>,
}

impl SimulatedEngine {
    pub fn new(host: EngineHost) -> Self {
        Self {
            host,
            commands: Mutex::new(None),
        }
    }

    fn command(&self, command: Command) -> bool {
        let commands = self.commands.lock().unwrap_or_else(|p| p.into_inner());
        commands.as_ref().is_some_and(|tx| tx.send(command).is_ok())
    }
}

impl TunnelEngine for SimulatedEngine {
    fn start_routing(&self) -> Result<(), EngineError> {
        info!("Routing interface established");
        Ok(())
    }

    fn start_tunneling(&self, embedded_server_entries: &str) -> Result<(), EngineError> {
        let config = self.host.get_config();
        if config.is_empty() {
            return Err(EngineError::StartFailed("no engine config".to_string()));
        }
        debug!(
            "Starting with {} embedded entries and config {}",
            embedded_server_entries.lines().count(),
            config
        );

        let (tx, rx) = unbounded();
        let host = self.host.clone();
        thread::Builder::new()
            .name("sim-engine".to_string())
            .spawn(move || simulate(host, rx))
            .map_err(|e| EngineError::StartFailed(e.to_string()))?;
        *self.commands.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        Ok(())
    }

    fn restart(&self) -> Result<(), EngineError> {
        if self.command(Command::Restart) {
            Ok(())
        } else {
            Err(EngineError::RestartFailed("engine not started".to_string()))
        }
    }

    fn begin_routing(&self) -> Result<(), EngineError> {
        info!("Device traffic routed through the tunnel");
        Ok(())
    }

    fn stop(&self) {
        self.command(Command::Stop);
        self.commands.lock().unwrap_or_else(|p| p.into_inner()).take();
    }

    fn export_exchange_payload(&self) -> String {
        String::new()
    }

    fn import_exchange_payload(&self, _payload: &str) -> bool {
        false
    }
}

fn connect(host: &EngineHost) {
    host.on_connecting();
    host.on_diagnostic_message("simulated handshake");
    host.on_homepage(HOME_PAGE);
    host.on_connected();
}

fn simulate(host: EngineHost, commands: Receiver<Command>) {
    host.on_listening_socks_proxy_port(SOCKS_PORT);
    host.on_listening_http_proxy_port(HTTP_PORT);
    host.on_client_region("US");
    host.on_available_egress_regions(vec!["US".into(), "DE".into(), "JP".into()]);
    connect(&host);

    let mut sent = 0u64;
    loop {
        match commands.recv_timeout(TICK) {
            Ok(Command::Restart) => connect(&host),
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                sent += 1;
                host.on_bytes_transferred(512 * sent, 2048 * sent);
            }
        }
    }
    debug!("Simulated engine stopped");
}

/// Platform without a display: everything is logged.
pub struct LoggingPlatform;

impl ServicePlatform for LoggingPlatform {
    fn start_foreground(&self, notification: &Notification) {
        info!("Foreground: {}", notification.text);
    }

    fn notify(&self, id: NotificationId, notification: &Notification) {
        info!("Notification {:?}: {} - {}", id, notification.title, notification.text);
    }

    fn cancel_notification(&self, id: NotificationId) {
        info!("Notification {:?} cancelled", id);
    }

    fn launch(&self, intent: &ServiceIntent) -> bool {
        debug!("Cannot launch {} without a display", intent.action);
        false
    }

    fn set_locale(&self, language_code: Option<&str>) {
        info!("Locale: {}", language_code.unwrap_or("system"));
    }

    fn stop_foreground(&self) {
        info!("Left the foreground");
    }

    fn stop_self(&self) {
        info!("Service asked to stop");
    }
}

/// The companion application is never installed here.
pub struct AbsentCompanion;

impl CompanionPlatform for AbsentCompanion {
    fn is_package_installed(&self, _package: &str) -> bool {
        false
    }

    fn verify_trusted_package(&self, _package: &str) -> bool {
        false
    }

    fn resolve_state_service(&self, _package: &str, _action: &str) -> bool {
        false
    }

    fn bind_state_service(
        &self,
        _package: &str,
        _action: &str,
        _connection: CompanionConnection,
    ) -> Result<bool, CompanionError> {
        Ok(false)
    }

    fn unbind_state_service(&self) {}
}
