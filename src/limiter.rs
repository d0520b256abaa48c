//! Admission control for background work.
//!
//! A two-tier gate: a fixed number of running slots plus a bounded wait
//! queue. Callers that find every running slot taken wait in the queue until
//! a slot frees up, the queue wait times out, or they are cancelled. When the
//! queue is full they are rejected immediately.
//!
//! Admission hands out an [`AdmissionPermit`]; dropping it releases the
//! running slot, so a slot can be neither leaked nor released twice.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Bounded running-slot + wait-queue gate.
#[derive(Debug)]
pub struct AdmissionLimiter {
    running: Arc<Semaphore>,
    queue: Arc<Semaphore>,
    max_running: usize,
    max_queued: usize,
    max_wait_in_queue: Option<Duration>,
}

/// Proof of admission. The running slot is released when this is dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    _slot: OwnedSemaphorePermit,
}

impl AdmissionLimiter {
    /// `max_wait_in_queue` of zero waits indefinitely while queued.
    pub fn new(max_running: usize, max_queued: usize, max_wait_in_queue: Duration) -> Self {
        Self {
            running: Arc::new(Semaphore::new(max_running)),
            queue: Arc::new(Semaphore::new(max_queued)),
            max_running,
            max_queued,
            max_wait_in_queue: (!max_wait_in_queue.is_zero()).then_some(max_wait_in_queue),
        }
    }

    /// Try to get admitted, waiting in the queue if necessary.
    pub async fn start(&self) -> Option<AdmissionPermit> {
        self.start_until(std::future::pending::<()>()).await
    }

    /// Like [`start`](Self::start), but gives up while queued as soon as
    /// `cancelled` completes.
    pub async fn start_until<F>(&self, cancelled: F) -> Option<AdmissionPermit>
    where
        F: Future<Output = ()>,
    {
        if let Ok(slot) = Arc::clone(&self.running).try_acquire_owned() {
            return Some(AdmissionPermit { _slot: slot });
        }

        // Held until this function returns, whatever the outcome.
        let _queued = match Arc::clone(&self.queue).try_acquire_owned() {
            Ok(q) => q,
            Err(_) => {
                debug!(
                    max_running = self.max_running,
                    max_queued = self.max_queued,
                    "admission rejected: queue full"
                );
                return None;
            }
        };

        let timeout = async {
            match self.max_wait_in_queue {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            slot = Arc::clone(&self.running).acquire_owned() => {
                slot.ok().map(|slot| AdmissionPermit { _slot: slot })
            }
            _ = timeout => {
                debug!(wait = ?self.max_wait_in_queue, "admission rejected: timed out in queue");
                None
            }
            _ = cancelled => {
                debug!("admission rejected: cancelled while queued");
                None
            }
        }
    }

    /// Number of callers currently admitted.
    pub fn running(&self) -> usize {
        self.max_running - self.running.available_permits()
    }

    /// Number of callers currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.max_queued - self.queue.available_permits()
    }
}
