//! Companion state manager
//!
//! Binds to the companion application's state service and republishes
//! what it reports as a [`CompanionState`].
//!
//! # Binding sequence
//!
//! ```text
//! start ─▶ installed? ─no──▶ NotInstalled (no retry)
//!             │ yes
//!          trusted?  ─no──▶ NotInstalled (no retry)
//!             │ yes
//!          resolvable? ─no─▶ UpgradeRequired
//!             │ yes
//!          bind ─refused──▶ retry
//!             │
//!          connected ─▶ register callback ─▶ payloads
//!             │
//!          disconnected ─▶ Unknown, retry after delay
//!
//! retry: attempt n ≤ max schedules one reconnect, n > max ─▶ MaxRetriesExceeded
//! ```
//!
//! Every callback handed to the platform carries the session generation
//! it was created for. `stop` bumps the generation, so late callbacks
//! and timers from an old session are ignored. Generation checks,
//! publishes and timer scheduling happen under the session lock.

use crate::error::CompanionError;
use crate::platform::{CompanionPlatform, StateServiceHandle};
use crate::state::CompanionState;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tunhost_core::TaskBag;

/// Companion binding settings
#[derive(Debug, Clone)]
pub struct CompanionSettings {
    /// Companion application package
    pub package: String,
    /// Bind action of the state service
    pub bind_action: String,
    /// Delay before each reconnect attempt
    pub reconnect_delay: Duration,
    /// Reconnect attempts before giving up
    pub max_retries: u32,
}

impl Default for CompanionSettings {
    fn default() -> Self {
        Self {
            package: "net.tunhost.companion".to_string(),
            bind_action: "net.tunhost.companion.ACTION_BIND_STATE".to_string(),
            reconnect_delay: Duration::from_secs(1),
            max_retries: 3,
        }
    }
}

#[derive(Default)]
struct Session {
    generation: u64,
    running: bool,
    /// A bind was requested and not yet released
    bound: bool,
    retry_count: u32,
    service: Option<StateServiceHandle>,
    runtime: Option<Handle>,
}

impl Session {
    /// Current if `generation` belongs to the running session.
    fn is_current(&self, generation: u64) -> bool {
        self.running && self.generation == generation
    }
}

struct Shared {
    platform: Arc<dyn CompanionPlatform>,
    settings: CompanionSettings,
    session: Mutex<Session>,
    state: watch::Sender<CompanionState>,
    reconnects: TaskBag,
}

/// Observes the companion application's running state.
pub struct CompanionStateManager {
    shared: Arc<Shared>,
}

impl CompanionStateManager {
    pub fn new(platform: Arc<dyn CompanionPlatform>, settings: CompanionSettings) -> Self {
        let (state, _) = watch::channel(CompanionState::Unknown);
        Self {
            shared: Arc::new(Shared {
                platform,
                settings,
                session: Mutex::new(Session::default()),
                state,
                reconnects: TaskBag::new("companion"),
            }),
        }
    }

    /// Begin observing. Must be called from within a tokio runtime; no-op
    /// while already started.
    pub fn start(&self) {
        let generation = {
            let mut session = self.shared.lock();
            if session.running {
                debug!("Companion: already started");
                return;
            }
            session.generation += 1;
            session.running = true;
            session.retry_count = 0;
            session.runtime = Some(Handle::current());
            session.generation
        };
        info!("Companion: starting");
        self.shared.check_and_bind(generation);
    }

    /// Stop observing. Idempotent; always leaves the state at `Unknown`
    /// with no reconnect scheduled.
    pub fn stop(&self) {
        let (service, bound) = {
            let mut session = self.shared.lock();
            if session.running {
                info!("Companion: stopping");
            }
            session.generation += 1;
            session.running = false;
            session.runtime = None;
            self.shared.reconnects.clear();
            self.shared.publish(CompanionState::Unknown);
            (session.service.take(), std::mem::take(&mut session.bound))
        };

        if let Some(service) = service {
            if let Err(e) = service.unregister_client() {
                warn!("Companion: failed to unregister client: {}", e);
            }
        }
        if bound {
            self.shared.platform.unbind_state_service();
        }
    }

    /// Latest state, replayed to new subscribers.
    pub fn subscribe(&self) -> watch::Receiver<CompanionState> {
        self.shared.state.subscribe()
    }

    pub fn state(&self) -> CompanionState {
        *self.shared.state.borrow()
    }

    /// Reconnect timers currently scheduled.
    pub fn pending_reconnects(&self) -> usize {
        self.shared.reconnects.pending()
    }
}

impl Drop for CompanionStateManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Callers that act for a session hold its lock while publishing.
    fn publish(&self, state: CompanionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!("Companion: state {}", state);
        }
    }

    fn check_and_bind(self: &Arc<Self>, generation: u64) {
        if !self.lock().is_current(generation) {
            return;
        }
        let package = self.settings.package.as_str();
        let action = self.settings.bind_action.as_str();

        if !self.platform.is_package_installed(package) {
            self.handle_error(
                generation,
                CompanionError::Package("companion package not installed".into()),
            );
            return;
        }
        if !self.platform.verify_trusted_package(package) {
            self.handle_error(
                generation,
                CompanionError::Security("companion package trust verification failed".into()),
            );
            return;
        }
        if !self.platform.resolve_state_service(package, action) {
            let session = self.lock();
            if session.is_current(generation) {
                self.publish(CompanionState::UpgradeRequired);
            }
            return;
        }

        self.lock().bound = true;
        let connection = CompanionConnection {
            generation,
            shared: Arc::clone(self),
        };
        match self.platform.bind_state_service(package, action, connection) {
            Ok(true) => debug!("Companion: bind requested"),
            Ok(false) => self.handle_error(
                generation,
                CompanionError::Binding("failed to request bind to state service".into()),
            ),
            Err(e) => self.handle_error(generation, e),
        }
    }

    fn on_connected(self: &Arc<Self>, generation: u64, service: StateServiceHandle) {
        {
            let mut session = self.lock();
            if !session.is_current(generation) {
                debug!("Companion: ignoring stale connection");
                return;
            }
            session.bound = true;
            session.retry_count = 0;
            session.service = Some(Arc::clone(&service));
        }
        info!("Companion: connected to state service");

        let callback = StateCallback {
            generation,
            shared: Arc::clone(self),
        };
        if let Err(e) = service.register_client(callback) {
            error!("Companion: failed to register client: {}", e);
            self.handle_error(
                generation,
                CompanionError::Binding(format!("failed to register client: {}", e)),
            );
        }
    }

    fn on_disconnected(self: &Arc<Self>, generation: u64) {
        {
            let mut session = self.lock();
            if !session.is_current(generation) {
                return;
            }
            warn!("Companion: disconnected from state service");
            session.service = None;
            self.publish(CompanionState::Unknown);
        }
        self.schedule_reconnect(generation);
    }

    fn on_state_update(&self, generation: u64, payload: &str) {
        let state = CompanionState::from_payload(payload);
        let session = self.lock();
        if session.is_current(generation) {
            self.publish(state);
        }
    }

    fn handle_error(self: &Arc<Self>, generation: u64, error: CompanionError) {
        info!("Companion: handling service error: {}", error);

        let unbind = {
            let mut session = self.lock();
            if !session.is_current(generation) {
                return;
            }
            session.service = None;
            if !error.is_retryable() {
                session.retry_count = self.settings.max_retries;
                self.publish(CompanionState::NotInstalled);
            }
            std::mem::take(&mut session.bound)
        };
        if unbind {
            self.platform.unbind_state_service();
        }

        if error.is_retryable() {
            self.schedule_reconnect(generation);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, generation: u64) {
        let mut session = self.lock();
        if !session.is_current(generation) {
            return;
        }
        let Some(runtime) = session.runtime.clone() else {
            return;
        };
        session.retry_count += 1;
        let attempt = session.retry_count;

        let max = self.settings.max_retries;
        if attempt > max {
            error!("Companion: max retry attempts exceeded");
            self.publish(CompanionState::MaxRetriesExceeded);
            return;
        }

        info!("Companion: scheduling reconnection attempt {} of {}", attempt, max);
        let delay = self.settings.reconnect_delay;
        let shared = Arc::clone(self);
        self.reconnects.clear();
        self.reconnects.spawn_on(&runtime, async move {
            tokio::time::sleep(delay).await;
            shared.check_and_bind(generation);
        });
    }
}

/// Bind outcome handle given to the platform.
#[derive(Clone)]
pub struct CompanionConnection {
    generation: u64,
    shared: Arc<Shared>,
}

impl CompanionConnection {
    pub fn on_service_connected(&self, service: StateServiceHandle) {
        self.shared.on_connected(self.generation, service);
    }

    /// Unexpected loss of the bound service.
    pub fn on_service_disconnected(&self) {
        self.shared.on_disconnected(self.generation);
    }
}

/// State payload sink registered with the companion service.
#[derive(Clone)]
pub struct StateCallback {
    generation: u64,
    shared: Arc<Shared>,
}

impl StateCallback {
    pub fn on_state_update(&self, payload: &str) {
        self.shared.on_state_update(self.generation, payload);
    }
}
