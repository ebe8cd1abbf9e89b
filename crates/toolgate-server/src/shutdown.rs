//! Graceful shutdown coordination.
//!
//! One watch channel carries the drain signal to every execution and
//! suspension point. The sequence is deadline-bounded end to end: stop
//! intake, cancel executions (bridges closed, sandboxes killed after
//! grace), drain the pool, flush state. Past the hard ceiling the
//! process exits even if some I/O is abandoned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;

/// The process-wide drain signal.
pub struct ShutdownCoordinator {
    cancel_tx: watch::Sender<bool>,
    draining: AtomicBool,
    ceiling: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator with the given hard ceiling.
    pub fn new(ceiling: Duration) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            cancel_tx,
            draining: AtomicBool::new(false),
            ceiling,
        }
    }

    /// Subscribe to the drain signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Whether intake should be refused.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Flip the drain flag and broadcast cancellation.
    pub fn begin(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutdown: draining");
        let _ = self.cancel_tx.send(true);
    }

    /// The hard ceiling for the whole sequence.
    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}
