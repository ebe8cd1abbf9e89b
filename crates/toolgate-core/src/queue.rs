//! Bounded FIFO admission queue.
//!
//! When the downstream pool is at its concurrency cap, calls wait here.
//! Each entry carries a deadline and a oneshot waker: expired entries are
//! woken with a timeout outcome during cleanup (which runs on the dequeue
//! path and on a periodic timer), instead of being discovered lazily.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use toolgate_error::GatewayError;

/// Configuration for the admission queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum entries waiting at once.
    pub max_size: usize,
    /// Default wait budget for an entry without an explicit deadline.
    pub default_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 200,
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// How a queued wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// A slot was granted; the waiter may proceed.
    Admitted,
    /// The entry's deadline passed while waiting.
    TimedOut,
    /// The server is draining; the wait was cancelled.
    ShuttingDown,
}

/// One waiting tool call.
pub struct QueueEntry {
    /// Request id of the waiting call.
    pub request_id: String,
    /// Client that issued the call.
    pub client_id: String,
    /// Fully-qualified tool name being called.
    pub tool_name: String,
    enqueued_at: Instant,
    deadline: Instant,
    waker: oneshot::Sender<AdmissionOutcome>,
}

impl QueueEntry {
    /// How long the entry has been waiting.
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// Grant admission to the waiter. Returns false if the waiter is gone.
    pub fn admit(self) -> bool {
        self.waker.send(AdmissionOutcome::Admitted).is_ok()
    }
}

/// Bounded FIFO queue of waiting admissions.
///
/// All mutation runs under one internal lock; FIFO order holds among
/// non-expired entries.
pub struct WaitQueue {
    config: QueueConfig,
    entries: Mutex<VecDeque<QueueEntry>>,
}

impl std::fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WaitQueue {
    /// Create a queue with the given configuration.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.config.max_size
    }

    /// Current number of waiting entries (including not-yet-swept expired
    /// ones).
    pub fn len(&self) -> usize {
        self.entries.lock().expect("queue lock poisoned").len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a waiter. Fails immediately with `queue-full` at capacity.
    ///
    /// Returns the receiver the caller awaits for its outcome. `deadline`
    /// defaults to now + the configured timeout.
    pub fn enqueue(
        &self,
        request_id: impl Into<String>,
        client_id: impl Into<String>,
        tool_name: impl Into<String>,
        deadline: Option<Instant>,
    ) -> Result<oneshot::Receiver<AdmissionOutcome>, GatewayError> {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        // Make room by sweeping expired entries before rejecting.
        Self::sweep_locked(&mut entries);

        if entries.len() >= self.config.max_size {
            return Err(GatewayError::QueueFull {
                max_size: self.config.max_size,
            });
        }

        let (tx, rx) = oneshot::channel();
        entries.push_back(QueueEntry {
            request_id: request_id.into(),
            client_id: client_id.into(),
            tool_name: tool_name.into(),
            enqueued_at: Instant::now(),
            deadline: deadline.unwrap_or_else(|| Instant::now() + self.config.default_timeout),
            waker: tx,
        });
        Ok(rx)
    }

    /// Remove and return the oldest non-expired entry, waking any expired
    /// entries encountered on the way.
    pub fn dequeue(&self) -> Option<QueueEntry> {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        Self::sweep_locked(&mut entries);
        entries.pop_front()
    }

    /// Push an entry back to the front of the queue, preserving FIFO order.
    ///
    /// Used when a granted slot could not actually be handed over.
    pub fn requeue_front(&self, entry: QueueEntry) {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        entries.push_front(entry);
    }

    /// Wake and remove all entries whose deadline has passed. Returns how
    /// many were expired.
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        Self::sweep_locked(&mut entries)
    }

    /// Cancel every waiting entry with a shutting-down outcome.
    pub fn cancel_all(&self) -> usize {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        let drained: Vec<QueueEntry> = entries.drain(..).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.waker.send(AdmissionOutcome::ShuttingDown);
        }
        count
    }

    fn sweep_locked(entries: &mut VecDeque<QueueEntry>) -> usize {
        let now = Instant::now();
        let mut expired = 0;
        let mut kept = VecDeque::with_capacity(entries.len());
        while let Some(entry) = entries.pop_front() {
            if entry.deadline <= now {
                expired += 1;
                let _ = entry.waker.send(AdmissionOutcome::TimedOut);
            } else {
                kept.push_back(entry);
            }
        }
        *entries = kept;
        expired
    }

    /// Start a background task that sweeps expired entries on an interval.
    pub fn start_cleanup_task(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let expired = queue.cleanup_expired();
                if expired > 0 {
                    tracing::debug!(expired, "admission queue expired waiting entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(max_size: usize) -> WaitQueue {
        WaitQueue::new(QueueConfig {
            max_size,
            default_timeout: Duration::from_secs(30),
        })
    }

    fn far_deadline() -> Option<Instant> {
        Some(Instant::now() + Duration::from_secs(60))
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_returns_same_entry() {
        let q = queue(10);
        let _rx = q.enqueue("r1", "c1", "files.search", far_deadline()).unwrap();

        let entry = q.dequeue().unwrap();
        assert_eq!(entry.request_id, "r1");
        assert_eq!(entry.client_id, "c1");
        assert_eq!(entry.tool_name, "files.search");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn dequeue_is_fifo() {
        let q = queue(10);
        let _rx1 = q.enqueue("r1", "c", "t", far_deadline()).unwrap();
        let _rx2 = q.enqueue("r2", "c", "t", far_deadline()).unwrap();
        let _rx3 = q.enqueue("r3", "c", "t", far_deadline()).unwrap();

        assert_eq!(q.dequeue().unwrap().request_id, "r1");
        assert_eq!(q.dequeue().unwrap().request_id, "r2");
        assert_eq!(q.dequeue().unwrap().request_id, "r3");
        assert!(q.dequeue().is_none());
    }

    #[tokio::test]
    async fn enqueue_at_capacity_fails_queue_full() {
        let q = queue(2);
        let _rx1 = q.enqueue("r1", "c", "t", far_deadline()).unwrap();
        let _rx2 = q.enqueue("r2", "c", "t", far_deadline()).unwrap();

        let err = q.enqueue("r3", "c", "t", far_deadline()).unwrap_err();
        assert!(matches!(err, GatewayError::QueueFull { max_size: 2 }));
    }

    #[tokio::test]
    async fn expired_entries_are_woken_with_timeout() {
        let q = queue(10);
        let rx = q
            .enqueue("r1", "c", "t", Some(Instant::now() - Duration::from_millis(1)))
            .unwrap();

        assert_eq!(q.cleanup_expired(), 1);
        assert_eq!(rx.await.unwrap(), AdmissionOutcome::TimedOut);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn dequeue_skips_expired_entries() {
        let q = queue(10);
        let rx_expired = q
            .enqueue("old", "c", "t", Some(Instant::now() - Duration::from_millis(1)))
            .unwrap();
        let _rx_live = q.enqueue("live", "c", "t", far_deadline()).unwrap();

        let entry = q.dequeue().unwrap();
        assert_eq!(entry.request_id, "live");
        assert_eq!(rx_expired.await.unwrap(), AdmissionOutcome::TimedOut);
    }

    #[tokio::test]
    async fn expired_entries_free_capacity_for_enqueue() {
        let q = queue(1);
        let _rx = q
            .enqueue("old", "c", "t", Some(Instant::now() - Duration::from_millis(1)))
            .unwrap();

        // The expired occupant is swept rather than blocking admission.
        assert!(q.enqueue("new", "c", "t", far_deadline()).is_ok());
    }

    #[tokio::test]
    async fn admit_wakes_the_waiter() {
        let q = queue(10);
        let rx = q.enqueue("r1", "c", "t", far_deadline()).unwrap();

        let entry = q.dequeue().unwrap();
        assert!(entry.admit());
        assert_eq!(rx.await.unwrap(), AdmissionOutcome::Admitted);
    }

    #[tokio::test]
    async fn admit_reports_gone_waiter() {
        let q = queue(10);
        let rx = q.enqueue("r1", "c", "t", far_deadline()).unwrap();
        drop(rx);

        let entry = q.dequeue().unwrap();
        assert!(!entry.admit(), "send to a dropped receiver must fail");
    }

    #[tokio::test]
    async fn cancel_all_wakes_everyone_with_shutdown() {
        let q = queue(10);
        let rx1 = q.enqueue("r1", "c", "t", far_deadline()).unwrap();
        let rx2 = q.enqueue("r2", "c", "t", far_deadline()).unwrap();

        assert_eq!(q.cancel_all(), 2);
        assert_eq!(rx1.await.unwrap(), AdmissionOutcome::ShuttingDown);
        assert_eq!(rx2.await.unwrap(), AdmissionOutcome::ShuttingDown);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn requeue_front_preserves_order() {
        let q = queue(10);
        let _rx1 = q.enqueue("r1", "c", "t", far_deadline()).unwrap();
        let _rx2 = q.enqueue("r2", "c", "t", far_deadline()).unwrap();

        let first = q.dequeue().unwrap();
        q.requeue_front(first);
        assert_eq!(q.dequeue().unwrap().request_id, "r1");
        assert_eq!(q.dequeue().unwrap().request_id, "r2");
    }

    #[tokio::test]
    async fn waited_measures_queue_time() {
        let q = queue(10);
        let _rx = q.enqueue("r1", "c", "t", far_deadline()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let entry = q.dequeue().unwrap();
        assert!(entry.waited() >= Duration::from_millis(10));
    }
}
