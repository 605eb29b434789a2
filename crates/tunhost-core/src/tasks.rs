//! Disposable bag for scheduled work.
//!
//! Every delayed or periodic task a component schedules goes into a
//! [`TaskBag`]; `clear` aborts all of them at once.

use std::future::Future;
use std::sync::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

/// Tracks spawned tasks so they can be cancelled together.
#[derive(Debug, Default)]
pub struct TaskBag {
    name: &'static str,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskBag {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `future` on the current runtime and track it.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_on(&Handle::current(), future);
    }

    /// Spawn `future` on `runtime` and track it. Usable from threads
    /// outside the runtime.
    pub fn spawn_on<F>(&self, runtime: &Handle, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = runtime.spawn(future);
        let mut handles = self.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Abort every tracked task.
    pub fn clear(&self) {
        let drained: Vec<_> = self.lock().drain(..).collect();
        if !drained.is_empty() {
            debug!("{}: cancelling {} scheduled task(s)", self.name, drained.len());
        }
        for handle in drained {
            handle.abort();
        }
    }

    /// Number of tracked tasks still running.
    pub fn pending(&self) -> usize {
        self.lock().iter().filter(|h| !h.is_finished()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        // A panic while holding this lock cannot leave the Vec inconsistent.
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TaskBag {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_pending_work() {
        let bag = TaskBag::new("test");
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        bag.spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(bag.pending(), 1);

        bag.clear();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(bag.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_tasks_are_not_pending() {
        let bag = TaskBag::new("test");
        bag.spawn(async {});
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(bag.pending(), 0);
    }
}
