//! Transaction wait queue
//!
//! A pusher that failed to push a transaction waits here until the pushee's
//! record changes on this range, or until its timeout expires. Apply calls
//! [`TxnWaitQueue::update_txn`] for every transaction record it writes.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use crate::txn::Transaction;

#[derive(Default)]
pub struct TxnWaitQueue {
    waiters: Mutex<HashMap<Uuid, watch::Sender<Option<Transaction>>>>,
}

impl TxnWaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the record of `pushee` is next updated. Returns the updated
    /// record, or `None` on timeout or if the queue was cleared.
    pub async fn wait_for_update(&self, pushee: Uuid, timeout: Duration) -> Option<Transaction> {
        let mut rx = {
            let mut waiters = self.waiters.lock();
            waiters
                .entry(pushee)
                .or_insert_with(|| watch::channel(None).0)
                .subscribe()
        };
        let changed = tokio::time::timeout(timeout, rx.changed()).await;
        let updated = match changed {
            Ok(Ok(())) => rx.borrow_and_update().clone(),
            _ => None,
        };
        drop(rx);
        let mut waiters = self.waiters.lock();
        if waiters
            .get(&pushee)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            waiters.remove(&pushee);
        }
        updated
    }

    /// Wake every pusher waiting on `txn`.
    pub fn update_txn(&self, txn: &Transaction) {
        let mut waiters = self.waiters.lock();
        if let Some(tx) = waiters.get(&txn.id()) {
            tx.send_replace(Some(txn.clone()));
            if txn.is_finalized() {
                waiters.remove(&txn.id());
            }
        }
    }

    /// Release every waiter, e.g. when the lease moves away.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.waiters.lock());
        if !drained.is_empty() {
            tracing::debug!(waiters = drained.len(), "Cleared txn wait queue");
        }
    }

    /// Number of pushees with waiters.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::txn::TxnStatus;

    #[tokio::test]
    async fn test_waiter_sees_update() {
        let queue = Arc::new(TxnWaitQueue::new());
        let mut txn = Transaction::default();
        txn.meta.id = Uuid::new_v4();

        let waiter = {
            let queue = queue.clone();
            let id = txn.id();
            tokio::spawn(async move { queue.wait_for_update(id, Duration::from_secs(5)).await })
        };
        while queue.is_empty() {
            tokio::task::yield_now().await;
        }
        txn.status = TxnStatus::Aborted;
        queue.update_txn(&txn);

        let seen = waiter.await.unwrap().unwrap();
        assert_eq!(seen.status, TxnStatus::Aborted);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_times_out() {
        let queue = TxnWaitQueue::new();
        let seen = queue
            .wait_for_update(Uuid::new_v4(), Duration::from_millis(10))
            .await;
        assert!(seen.is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_clear_releases_waiters() {
        let queue = Arc::new(TxnWaitQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .wait_for_update(Uuid::new_v4(), Duration::from_secs(5))
                    .await
            })
        };
        while queue.is_empty() {
            tokio::task::yield_now().await;
        }
        queue.clear();
        assert!(waiter.await.unwrap().is_none());
    }
}
