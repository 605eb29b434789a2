//! tunhost: tunnel service host
//!
//! Runs the tunnel service in-process against a simulated engine, with one
//! UI client bridge that logs what it observes. Ctrl-C stops the tunnel
//! and tears the service down.

mod sim;

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tunhost_client::{BridgeEvent, ServiceClientBridge, ServiceConnector};
use tunhost_companion::{CompanionSettings, CompanionState, CompanionStateManager};
use tunhost_config::{ConfigStore, EmbeddedValues, SubscriptionTier, TunnelConfigManager};
use tunhost_core::ServiceLink;
use tunhost_service::{
    spawn_companion_feed, ServiceContext, ServiceSettings, StartCommand, TunnelService,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Data directory override
const HOME_ENV: &str = "TUNHOST_HOME";
const DEFAULT_HOME: &str = "tunhost-data";

/// How long startup waits for the companion to report a definite state
const COMPANION_STATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Reaches the service living in this process.
struct InProcess(Arc<TunnelService>);

impl ServiceConnector for InProcess {
    fn connect(&self) -> Option<ServiceLink> {
        Some(self.0.on_bind())
    }

    fn start_service(&self) -> bool {
        self.0.on_start_command(StartCommand::Start);
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .compact()
        .init();

    let home = std::env::var_os(HOME_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_HOME));
    std::fs::create_dir_all(&home)
        .with_context(|| format!("Failed to create {}", home.display()))?;
    info!("tunhost starting in {}", home.display());

    let embedded_path = home.join("embedded.toml");
    let embedded = if embedded_path.exists() {
        EmbeddedValues::from_file(&embedded_path)?
    } else {
        warn!("{} not found, using development values", embedded_path.display());
        EmbeddedValues::development()
    };
    let embedded = Arc::new(embedded);
    let store = Arc::new(ConfigStore::open(home.join("preferences.toml"))?);
    let settings = ServiceSettings::from_toml_file(&home.join("service.toml"))?;

    // Companion first: its running state is one of the config inputs
    let companion = CompanionStateManager::new(Arc::new(sim::AbsentCompanion), CompanionSettings::default());
    companion.start();

    let config = Arc::new(TunnelConfigManager::new(store, &embedded));
    config
        .init_configuration(
            async { false },
            companion_running(companion.subscribe()),
            async { String::new() },
            async { SubscriptionTier::None },
        )
        .await?;
    let feed = spawn_companion_feed(companion.subscribe(), Arc::clone(&config), false);

    let ctx = ServiceContext::new(settings, embedded, Arc::clone(&config));
    let service = Arc::new(TunnelService::on_create(
        ctx,
        Arc::new(sim::LoggingPlatform),
        sim::SimulatedEngine::new,
    ));

    let bridge = ServiceClientBridge::new(Arc::new(InProcess(Arc::clone(&service))), true);
    let state_log = tokio::spawn(log_states(bridge.subscribe_state()));
    let event_log = tokio::spawn(log_events(bridge.subscribe_events()));
    bridge.resume();
    bridge.start_tunnel_service()?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    if let Err(e) = bridge.stop_tunnel_service() {
        warn!("Stop request not delivered: {}", e);
    }
    bridge.pause();
    drop(bridge);

    let service = Arc::try_unwrap(service).map_err(|_| anyhow!("Tunnel service is still shared"))?;
    service.on_destroy().await?;

    companion.stop();
    drop(companion);
    feed.abort();
    state_log.abort();
    event_log.abort();

    info!("tunhost stopped");
    Ok(())
}

/// First definite companion state, or not running if none arrives in time.
async fn companion_running(mut rx: watch::Receiver<CompanionState>) -> bool {
    match tokio::time::timeout(
        COMPANION_STATE_TIMEOUT,
        rx.wait_for(|s| *s != CompanionState::Unknown),
    )
    .await
    {
        Ok(Ok(state)) => state.is_running(),
        _ => false,
    }
}

async fn log_states(mut rx: watch::Receiver<tunhost_core::TunnelState>) {
    loop {
        info!("Tunnel: {}", *rx.borrow_and_update());
        if rx.changed().await.is_err() {
            break;
        }
    }
}

async fn log_events(mut rx: tokio::sync::broadcast::Receiver<BridgeEvent>) {
    loop {
        match rx.recv().await {
            Ok(BridgeEvent::Intent(intent)) => info!("Intent: {}", intent.action),
            Ok(event) => info!("Event: {:?}", event),
            Err(RecvError::Lagged(skipped)) => warn!("Skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}
