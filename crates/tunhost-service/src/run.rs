//! Tunnel run thread
//!
//! Engine start and stop block, so each run gets its own thread. The
//! thread starts the engine, parks on the stop latch for the lifetime of
//! the run, stops the engine and reports back to the service actor.

use crate::actor::ServiceEvent;
use crate::engine::TunnelEngine;
use crate::error::EngineError;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tunhost_core::StopLatch;

/// Everything a run thread needs.
pub(crate) struct RunSpec {
    pub id: u64,
    pub engine: Arc<dyn TunnelEngine>,
    pub latch: StopLatch,
    pub vpn_mode: bool,
    pub server_entries: String,
    pub events: mpsc::UnboundedSender<ServiceEvent>,
}

pub(crate) fn spawn_run(spec: RunSpec) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("tunnel-run-{}", spec.id))
        .spawn(move || run(spec))
        .expect("Failed to spawn tunnel run thread")
}

fn run(spec: RunSpec) {
    let RunSpec {
        id,
        engine,
        latch,
        vpn_mode,
        server_entries,
        events,
    } = spec;

    match start(engine.as_ref(), vpn_mode, &server_entries) {
        Ok(()) => {
            info!("Tunnel run {} started", id);
            latch.wait();
            debug!("Tunnel run {} stop requested", id);
        }
        Err(e) => error!("Tunnel run {} failed to start: {}", id, e),
    }

    engine.stop();
    info!("Tunnel run {} stopped", id);
    let _ = events.send(ServiceEvent::RunFinished { run: id });
}

fn start(engine: &dyn TunnelEngine, vpn_mode: bool, server_entries: &str) -> Result<(), EngineError> {
    if vpn_mode {
        engine.start_routing()?;
    }
    engine.start_tunneling(server_entries)
}
