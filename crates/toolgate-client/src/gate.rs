//! Concurrency admission for downstream calls.
//!
//! The pool tracks in-flight downstream calls with an atomic counter. A call
//! that fits under the cap enters immediately; otherwise it waits in the
//! bounded FIFO queue until a slot frees up or its deadline passes. The
//! permit decrements on drop, so every exit path (success, error, panic,
//! cancellation) releases its slot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use toolgate_core::queue::{AdmissionOutcome, WaitQueue};
use toolgate_error::GatewayError;

/// Shared admission state: counter plus overflow queue.
#[derive(Debug)]
pub struct AdmissionGate {
    max_concurrent: usize,
    active: AtomicUsize,
    queue: Arc<WaitQueue>,
}

/// An admitted slot. Dropping it releases the slot and promotes the oldest
/// queued waiter.
#[derive(Debug)]
pub struct AdmissionPermit {
    gate: Arc<AdmissionGate>,
}

impl AdmissionGate {
    /// Create a gate with the given cap and overflow queue.
    pub fn new(max_concurrent: usize, queue: Arc<WaitQueue>) -> Self {
        Self {
            max_concurrent,
            active: AtomicUsize::new(0),
            queue,
        }
    }

    /// Current in-flight count.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of calls waiting for admission.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// The overflow queue.
    pub fn queue(&self) -> &Arc<WaitQueue> {
        &self.queue
    }

    fn try_increment(&self) -> bool {
        let mut current = self.active.load(Ordering::SeqCst);
        loop {
            if current >= self.max_concurrent {
                return false;
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Admit immediately if a slot is free.
    pub fn try_acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        if self.try_increment() {
            Some(AdmissionPermit { gate: self.clone() })
        } else {
            None
        }
    }

    /// Admit, waiting in the queue up to `deadline` when the cap is
    /// saturated.
    pub async fn acquire(
        self: &Arc<Self>,
        request_id: &str,
        client_id: &str,
        tool_name: &str,
        deadline: Instant,
    ) -> Result<AdmissionPermit, GatewayError> {
        if let Some(permit) = self.try_acquire() {
            return Ok(permit);
        }

        let enqueued_at = Instant::now();
        let mut rx = self
            .queue
            .enqueue(request_id, client_id, tool_name, Some(deadline))?;

        // The counter and the queue are separate sync domains, so a release
        // may have run between the failed try_acquire above and the enqueue:
        // it found the queue empty, gave the slot back, and will never look
        // again. Re-driving promotion here closes that window; if a slot is
        // free now, the oldest waiter (possibly us) is woken through its
        // waker, keeping FIFO order and single slot ownership.
        self.promote();

        match tokio::time::timeout_at(deadline.into(), &mut rx).await {
            Ok(Ok(AdmissionOutcome::Admitted)) => Ok(AdmissionPermit { gate: self.clone() }),
            Ok(Ok(AdmissionOutcome::TimedOut)) => Err(GatewayError::QueueTimeout {
                waited_ms: enqueued_at.elapsed().as_millis() as u64,
            }),
            Ok(Ok(AdmissionOutcome::ShuttingDown)) => Err(GatewayError::Shutdown),
            Ok(Err(_)) => Err(GatewayError::Internal(anyhow::anyhow!(
                "admission waker dropped"
            ))),
            Err(_elapsed) => {
                // Deadline fired before the periodic cleanup did. Sweep now;
                // our waker resolves either way (a racing admit wins).
                self.queue.cleanup_expired();
                match rx.await {
                    Ok(AdmissionOutcome::Admitted) => Ok(AdmissionPermit { gate: self.clone() }),
                    _ => Err(GatewayError::QueueTimeout {
                        waited_ms: enqueued_at.elapsed().as_millis() as u64,
                    }),
                }
            }
        }
    }

    /// Release one slot and hand it to the oldest live waiter, if any.
    fn release_and_promote(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.promote();
    }

    /// Hand free slots to queued waiters, oldest first.
    ///
    /// Driven from two sides: every permit release, and every fresh enqueue
    /// (see `acquire`). A slot is incremented before the waiter is woken, so
    /// the woken waiter owns it; if no waiter is queued the slot is given
    /// back.
    fn promote(&self) {
        loop {
            if !self.try_increment() {
                return;
            }
            match self.queue.dequeue() {
                Some(entry) => {
                    if entry.admit() {
                        // The waiter now owns the slot we incremented.
                        return;
                    }
                    // Waiter vanished; give the slot back and try the next.
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                None => {
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    /// Cancel every queued waiter (server drain).
    pub fn cancel_waiters(&self) -> usize {
        self.queue.cancel_all()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.gate.release_and_promote();
    }
}
