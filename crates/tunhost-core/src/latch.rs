//! One-shot stop latch awaited by a run thread.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Cooperative stop signal.
///
/// `signal` may be called any number of times from any thread; the first
/// call releases every waiter and later calls are no-ops. Releasing drops
/// the only sender, so waiters observe a disconnect and the latch never
/// reads as unsignaled again.
#[derive(Debug, Clone)]
pub struct StopLatch {
    inner: Arc<Latch>,
}

#[derive(Debug)]
struct Latch {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl StopLatch {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(Latch {
                tx: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    /// Release the latch. Returns `true` only for the call that released it.
    pub fn signal(&self) -> bool {
        self.inner
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .is_some()
    }

    pub fn is_signaled(&self) -> bool {
        self.inner
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    /// Block the calling thread until the latch is released.
    pub fn wait(&self) {
        // Nothing is ever sent; `recv` returns once the sender is dropped.
        while self.inner.rx.recv().is_ok() {}
    }

    /// Block for at most `timeout`. Returns `true` if released.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        !matches!(self.inner.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

impl Default for StopLatch {
    fn default() -> Self {
        Self::new()
    }
}
