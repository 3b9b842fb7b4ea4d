//! Worker lifecycle coordination
//!
//! One coordinator per running worker set. Every worker holds a
//! [`WorkerSlot`]; dropping the slot (normal exit, error return or panic
//! unwinding) decrements the active count, and the drop that takes the count
//! to zero releases the completion signal that [`LifecycleCoordinator::stop`]
//! waits on. The signal is released at most once per coordinator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::StreamError;
use crate::events::{EventSink, NoopSink, StreamEvent};

/// Set in `state` once the completion signal has been released.
const RELEASED: usize = 1 << (usize::BITS - 1);

/// Active-worker counter, stop flag and single-release completion signal.
pub struct LifecycleCoordinator {
    /// Active count in the low bits, [`RELEASED`] in the top bit. Both change
    /// together so a registration can never slip in behind the release.
    state: AtomicUsize,
    releases: AtomicUsize,
    stop_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    events: Arc<dyn EventSink>,
}

impl Default for LifecycleCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleCoordinator {
    pub fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            stop_tx: watch::Sender::new(false),
            done_tx: watch::Sender::new(false),
            events: Arc::new(NoopSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Count a new worker in. The returned slot must live as long as the worker.
    ///
    /// Fails once the completion signal has been released: a drained
    /// coordinator cannot be reused for another cycle.
    pub fn register(self: &Arc<Self>) -> Result<WorkerSlot, StreamError> {
        let previous = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                (state & RELEASED == 0).then_some(state + 1)
            })
            .map_err(|_| StreamError::Internal("lifecycle coordinator already drained".into()))?;
        let count = previous + 1;
        debug!(active = count, "Worker registered");
        self.events.emit(&StreamEvent::ActiveWorkers { count });
        Ok(WorkerSlot {
            coordinator: Arc::clone(self),
        })
    }

    /// Number of workers currently holding a slot.
    pub fn active_workers(&self) -> usize {
        self.state.load(Ordering::SeqCst) & !RELEASED
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// How many times the completion signal fired (0 or 1).
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Ask every worker to stop after its current dispatch.
    pub fn request_stop(&self) {
        if !self.stop_tx.send_replace(true) {
            info!(active = self.active_workers(), "Stop requested");
        }
    }

    /// Request a stop and wait until every worker has terminated.
    ///
    /// Returns immediately when no worker is active. Calling it again after
    /// completion also returns immediately.
    pub async fn stop(&self) {
        self.request_stop();

        if self.active_workers() == 0 {
            debug!("No active workers, stop completes immediately");
            return;
        }

        let mut done = self.done_tx.subscribe();
        // The sender lives in `self`, so this only ends when the signal fires.
        let _ = done.wait_for(|released| *released).await;
        info!("All workers stopped");
    }

    /// Like [`stop`](Self::stop), giving up after `timeout`.
    ///
    /// Returns `false` if workers were still active when the wait ended.
    pub async fn stop_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.stop()).await.is_ok()
    }

    /// Resolves once a stop has been requested.
    pub async fn stop_requested(&self) {
        let mut stop = self.stop_tx.subscribe();
        let _ = stop.wait_for(|requested| *requested).await;
    }

    fn worker_terminated(&self) {
        // The decrement to zero and the release are one transition.
        let previous = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| match state & !RELEASED {
                0 => None,
                1 => Some(RELEASED),
                _ => Some(state - 1),
            });

        let remaining = match previous {
            Ok(previous) => (previous & !RELEASED) - 1,
            Err(_) => {
                error!("Worker terminated with no active workers registered");
                return;
            }
        };

        info!(remaining, "Worker terminated");
        self.events
            .emit(&StreamEvent::ActiveWorkers { count: remaining });

        if remaining == 0 {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.done_tx.send_replace(true);
            debug!("Completion signal released");
        }
    }
}

/// A worker's registration. Dropping it reports the worker as terminated.
pub struct WorkerSlot {
    coordinator: Arc<LifecycleCoordinator>,
}

impl WorkerSlot {
    pub fn coordinator(&self) -> &Arc<LifecycleCoordinator> {
        &self.coordinator
    }

    pub fn is_stop_requested(&self) -> bool {
        self.coordinator.is_stop_requested()
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.coordinator.worker_terminated();
    }
}
