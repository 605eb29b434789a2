//! Feeds from other process components into the tunnel config.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tunhost_companion::CompanionState;
use tunhost_config::TunnelConfigManager;

/// Forward companion running state into the tunnel config until the
/// companion manager goes away. Only changes of the running flag are
/// forwarded.
pub fn spawn_companion_feed(
    mut companion: watch::Receiver<CompanionState>,
    config: Arc<TunnelConfigManager>,
    has_enforcement: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = None;
        loop {
            let state = *companion.borrow_and_update();
            let running = state.is_running();
            if last != Some(running) {
                last = Some(running);
                let published = config.update_companion_state_conditional(running, has_enforcement);
                debug!("Companion {} forwarded (published={})", state, published);
            }
            if companion.changed().await.is_err() {
                break;
            }
        }
    })
}
