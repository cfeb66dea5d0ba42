//! The Worker Dispatcher.
//!
//! A bounded pool of `N` worker slots served over a rendezvous channel:
//! [`Dispatcher::start`] prefills the channel, [`Dispatcher::obtain_slot`]
//! takes one out, and the slot is returned to the pool once the task
//! finishes (or panics — a [`WorkerSlot`]'s `Drop` impl guarantees this).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A single idle worker slot, taken from the dispatcher's pool.
///
/// Dropping the slot (normal return or task panic) always re-enqueues it,
/// so a panicking task never leaks a slot out of the pool.
pub struct WorkerSlot {
    pool: mpsc::Sender<()>,
    busy: Arc<AtomicUsize>,
}

impl WorkerSlot {
    /// Runs `task` to completion on this slot, then returns the slot.
    pub async fn run<F, Fut>(self, task: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        task().await;
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
        let _ = self.pool.try_send(());
        trace!("worker slot returned to pool");
    }
}

/// Bounded pool of `N` concurrent worker slots.
pub struct Dispatcher {
    capacity: usize,
    busy: Arc<AtomicUsize>,
    slots_tx: mpsc::Sender<()>,
    slots_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl Dispatcher {
    /// Prefills the rendezvous channel with `capacity` idle slots.
    pub fn start(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        for _ in 0..capacity {
            let _ = tx.try_send(());
        }
        debug!(capacity, "dispatcher started");
        Self {
            capacity,
            busy: Arc::new(AtomicUsize::new(0)),
            slots_tx: tx,
            slots_rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently checked out.
    pub fn busy_workers(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Blocks until a slot is free or `cancel` fires, whichever comes
    /// first. Returns `None` on cancellation.
    pub async fn obtain_slot(&self, cancel: &tokio_util::sync::CancellationToken) -> Option<WorkerSlot> {
        let mut rx = self.slots_rx.lock().await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            slot = rx.recv() => {
                slot?;
                self.busy.fetch_add(1, Ordering::SeqCst);
                Some(WorkerSlot {
                    pool: self.slots_tx.clone(),
                    busy: Arc::clone(&self.busy),
                })
            }
        }
    }

    /// Spawns `task` on a tokio task bound to `slot`, releasing the slot
    /// when the task completes (successfully or not).
    pub fn submit<F>(&self, slot: WorkerSlot, task: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            slot.run(|| task).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn start_prefills_n_slots_and_busy_starts_at_zero() {
        let dispatcher = Dispatcher::start(3);
        assert_eq!(dispatcher.busy_workers(), 0);
        assert_eq!(dispatcher.capacity(), 3);
    }

    #[tokio::test]
    async fn obtain_slot_increments_busy_and_drop_decrements() {
        let dispatcher = Dispatcher::start(1);
        let cancel = tokio_util::sync::CancellationToken::new();

        let slot = dispatcher.obtain_slot(&cancel).await.unwrap();
        assert_eq!(dispatcher.busy_workers(), 1);
        drop(slot);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(dispatcher.busy_workers(), 0);
    }

    #[tokio::test]
    async fn obtain_slot_blocks_when_pool_exhausted_until_release() {
        let dispatcher = Arc::new(Dispatcher::start(1));
        let cancel = tokio_util::sync::CancellationToken::new();

        let first = dispatcher.obtain_slot(&cancel).await.unwrap();

        let d2 = Arc::clone(&dispatcher);
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { d2.obtain_slot(&cancel2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter should resolve once the slot is released")
            .unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn obtain_slot_returns_none_on_cancellation() {
        let dispatcher = Dispatcher::start(0);
        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();

        let slot = dispatcher.obtain_slot(&cancel).await;
        assert!(slot.is_none());
    }

    #[tokio::test]
    async fn panicking_task_still_returns_its_slot() {
        let dispatcher = Arc::new(Dispatcher::start(1));
        let cancel = tokio_util::sync::CancellationToken::new();

        let slot = dispatcher.obtain_slot(&cancel).await.unwrap();
        let handle = dispatcher.submit(slot, async {
            panic!("boom");
        });
        let _ = handle.await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(dispatcher.busy_workers(), 0);

        let second = dispatcher.obtain_slot(&cancel).await;
        assert!(second.is_some());
    }
}
