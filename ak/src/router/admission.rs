//! Admission control: bounded parallelism with a priority queue
//!
//! Submissions beyond the concurrency cap wait here. Highest priority first;
//! FIFO by submission time within equal priority.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, oneshot};
use tracing::debug;

use crate::domain::Priority;

struct Waiter {
    priority: Priority,
    submitted_at: Instant,
    grant_tx: oneshot::Sender<()>,
}

impl Eq for Waiter {}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.submitted_at == other.submitted_at
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first, then earlier submission
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.submitted_at.cmp(&self.submitted_at))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct AdmissionInner {
    running: usize,
    queue: BinaryHeap<Waiter>,
}

/// Grants execution slots up to a fixed cap
#[derive(Clone)]
pub struct Admission {
    inner: Arc<Mutex<AdmissionInner>>,
    cap: usize,
}

/// RAII-ish slot; call `release` when the task finishes
pub struct Slot {
    admission: Admission,
    released: bool,
}

impl Slot {
    /// Give the slot back and wake the next waiter
    pub async fn release(mut self) {
        self.released = true;
        self.admission.release().await;
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if !self.released {
            // Dropped without release (driver panicked); give the slot back
            // from a detached task since Drop cannot await.
            let admission = self.admission.clone();
            tokio::spawn(async move { admission.release().await });
        }
    }
}

impl Admission {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AdmissionInner {
                running: 0,
                queue: BinaryHeap::new(),
            })),
            cap: cap.max(1),
        }
    }

    /// Wait for an execution slot
    pub async fn acquire(&self, priority: Priority) -> Slot {
        let grant_rx = {
            let mut inner = self.inner.lock().await;
            if inner.running < self.cap {
                inner.running += 1;
                debug!(running = inner.running, "Admission::acquire: immediate slot");
                return Slot {
                    admission: self.clone(),
                    released: false,
                };
            }

            let (grant_tx, grant_rx) = oneshot::channel();
            inner.queue.push(Waiter {
                priority,
                submitted_at: Instant::now(),
                grant_tx,
            });
            debug!(queued = inner.queue.len(), "Admission::acquire: queued");
            grant_rx
        };

        // The releasing side moved the slot to us before sending
        let _ = grant_rx.await;
        Slot {
            admission: self.clone(),
            released: false,
        }
    }

    async fn release(&self) {
        let mut inner = self.inner.lock().await;
        // Hand the slot to the next live waiter; skip abandoned ones
        loop {
            match inner.queue.pop() {
                Some(waiter) => {
                    if waiter.grant_tx.send(()).is_ok() {
                        debug!(queued = inner.queue.len(), "Admission::release: slot handed off");
                        return;
                    }
                    // Receiver dropped (cancelled while queued); try the next
                }
                None => {
                    inner.running = inner.running.saturating_sub(1);
                    return;
                }
            }
        }
    }

    /// Currently running count (for status surfaces)
    pub async fn running(&self) -> usize {
        self.inner.lock().await.running
    }

    /// Currently queued count
    pub async fn queued(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_immediate_grant_under_cap() {
        let admission = Admission::new(2);
        let a = admission.acquire(Priority::Normal).await;
        let b = admission.acquire(Priority::Normal).await;
        assert_eq!(admission.running().await, 2);
        a.release().await;
        b.release().await;
        assert_eq!(admission.running().await, 0);
    }

    #[tokio::test]
    async fn test_queueing_beyond_cap() {
        let admission = Admission::new(1);
        let first = admission.acquire(Priority::Normal).await;

        let admission2 = admission.clone();
        let waiter = tokio::spawn(async move { admission2.acquire(Priority::Normal).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(admission.queued().await, 1);
        assert!(!waiter.is_finished());

        first.release().await;
        let slot = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(admission.running().await, 1);
        slot.release().await;
    }

    #[tokio::test]
    async fn test_priority_order() {
        let admission = Admission::new(1);
        let first = admission.acquire(Priority::Normal).await;

        let (low_done_tx, mut low_done_rx) = oneshot::channel::<()>();
        let (high_done_tx, mut high_done_rx) = oneshot::channel::<()>();

        let a = admission.clone();
        tokio::spawn(async move {
            let slot = a.acquire(Priority::Low).await;
            let _ = low_done_tx.send(());
            slot.release().await;
        });
        // Make sure the low waiter queues first
        tokio::time::sleep(Duration::from_millis(50)).await;
        let a = admission.clone();
        tokio::spawn(async move {
            let slot = a.acquire(Priority::High).await;
            let _ = high_done_tx.send(());
            slot.release().await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        first.release().await;

        // High priority wins despite queueing later
        tokio::time::timeout(Duration::from_secs(1), &mut high_done_rx)
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), &mut low_done_rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let admission = Admission::new(1);
        let first = admission.acquire(Priority::Normal).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let admission = admission.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let slot = admission.acquire(Priority::Normal).await;
                order.lock().await.push(label);
                slot.release().await;
            });
            // Deterministic queue order
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        first.release().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(*order.lock().await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_skipped() {
        let admission = Admission::new(1);
        let first = admission.acquire(Priority::Normal).await;

        // This waiter gives up
        let a = admission.clone();
        let abandoned = tokio::spawn(async move { a.acquire(Priority::High).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        abandoned.abort();

        let a = admission.clone();
        let live = tokio::spawn(async move { a.acquire(Priority::Low).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        first.release().await;
        let slot = tokio::time::timeout(Duration::from_secs(1), live).await.unwrap().unwrap();
        slot.release().await;
    }
}
