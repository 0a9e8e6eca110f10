//! Resolved timestamp tracking
//!
//! The resolved timestamp of a range is the highest timestamp at which no
//! new value can appear: it trails the closed timestamp and stays below the
//! oldest unresolved intent. Intents are tracked per transaction in an
//! [`UnresolvedIntentQueue`] ordered by the transaction's lowest intent
//! timestamp in the range.

use std::collections::{BTreeSet, HashMap};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::mvcc::LogicalOp;

/// A transaction with unresolved intents in the range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedTxn {
    pub txn_id: Uuid,
    pub txn_key: Vec<u8>,
    pub txn_min_timestamp: Timestamp,
    /// Lowest timestamp any of the transaction's intents may commit at.
    pub timestamp: Timestamp,
    /// Number of intents, possibly negative until the queue is initialized:
    /// a resolution may be observed before the initial scan reports the
    /// intent it resolves.
    pub ref_count: i64,
}

/// Transactions with unresolved intents, ordered by timestamp.
#[derive(Debug, Default)]
pub struct UnresolvedIntentQueue {
    txns: HashMap<Uuid, UnresolvedTxn>,
    order: BTreeSet<(Timestamp, Uuid)>,
    allow_neg_ref_count: bool,
}

impl UnresolvedIntentQueue {
    pub fn new() -> Self {
        Self {
            allow_neg_ref_count: true,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.txns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }

    pub fn get(&self, txn_id: &Uuid) -> Option<&UnresolvedTxn> {
        self.txns.get(txn_id)
    }

    /// The transaction holding back the resolved timestamp.
    pub fn oldest(&self) -> Option<&UnresolvedTxn> {
        self.order
            .iter()
            .next()
            .and_then(|(_, id)| self.txns.get(id))
    }

    /// Transactions whose timestamp is below `ts`, oldest first.
    pub fn before(&self, ts: Timestamp) -> Vec<UnresolvedTxn> {
        self.order
            .iter()
            .take_while(|(t, _)| *t < ts)
            .filter_map(|(_, id)| self.txns.get(id).cloned())
            .collect()
    }

    /// A new intent of `txn_id`. Returns true if the oldest timestamp moved.
    pub fn inc_ref(
        &mut self,
        txn_id: Uuid,
        txn_key: &[u8],
        txn_min_timestamp: Timestamp,
        ts: Timestamp,
    ) -> bool {
        self.update(txn_id, Some((txn_key, txn_min_timestamp)), ts, 1)
    }

    /// One intent of `txn_id` was resolved.
    pub fn dec_ref(&mut self, txn_id: Uuid, ts: Timestamp) -> bool {
        self.update(txn_id, None, ts, -1)
    }

    /// The intents of `txn_id` can no longer commit below `ts`.
    pub fn update_ts(&mut self, txn_id: Uuid, ts: Timestamp) -> bool {
        self.update(txn_id, None, ts, 0)
    }

    /// Drops `txn_id` regardless of its reference count.
    pub fn del(&mut self, txn_id: Uuid) -> bool {
        let was_min = self.is_oldest(&txn_id);
        match self.txns.remove(&txn_id) {
            Some(txn) => {
                self.order.remove(&(txn.timestamp, txn_id));
                was_min
            }
            None => false,
        }
    }

    /// Once every intent present at startup has been reported, reference
    /// counts can no longer legitimately go negative.
    pub fn disallow_neg_ref_count(&mut self) {
        self.allow_neg_ref_count = false;
        let negative: Vec<Uuid> = self
            .txns
            .values()
            .filter(|t| t.ref_count <= 0)
            .map(|t| t.txn_id)
            .collect();
        for txn_id in negative {
            tracing::warn!(%txn_id, "dropping txn with unbalanced intent count");
            self.del(txn_id);
        }
    }

    fn is_oldest(&self, txn_id: &Uuid) -> bool {
        self.order.iter().next().is_some_and(|(_, id)| id == txn_id)
    }

    fn update(
        &mut self,
        txn_id: Uuid,
        new_txn: Option<(&[u8], Timestamp)>,
        ts: Timestamp,
        delta: i64,
    ) -> bool {
        let was_min = self.is_oldest(&txn_id);
        let Some(txn) = self.txns.get_mut(&txn_id) else {
            if delta == 0 || (delta < 0 && !self.allow_neg_ref_count) {
                return false;
            }
            let (txn_key, txn_min_timestamp) = new_txn.unwrap_or((&[], Timestamp::ZERO));
            self.txns.insert(
                txn_id,
                UnresolvedTxn {
                    txn_id,
                    txn_key: txn_key.to_vec(),
                    txn_min_timestamp,
                    timestamp: ts,
                    ref_count: delta,
                },
            );
            self.order.insert((ts, txn_id));
            // A new entry cannot raise the minimum.
            return false;
        };

        if let Some((txn_key, min_ts)) = new_txn {
            if txn.txn_key.is_empty() {
                txn.txn_key = txn_key.to_vec();
                txn.txn_min_timestamp = min_ts;
            }
        }
        txn.ref_count += delta;
        if txn.ref_count == 0 || (txn.ref_count < 0 && !self.allow_neg_ref_count) {
            let key = (txn.timestamp, txn_id);
            self.txns.remove(&txn_id);
            self.order.remove(&key);
            return was_min;
        }
        let old = txn.timestamp;
        if txn.timestamp.forward(ts) {
            let new = txn.timestamp;
            self.order.remove(&(old, txn_id));
            self.order.insert((new, txn_id));
            return was_min;
        }
        false
    }
}

/// The resolved timestamp of one range.
#[derive(Debug)]
pub struct ResolvedTimestamp {
    init: bool,
    closed_ts: Timestamp,
    resolved_ts: Timestamp,
    intent_queue: UnresolvedIntentQueue,
}

impl Default for ResolvedTimestamp {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolvedTimestamp {
    pub fn new() -> Self {
        Self {
            init: false,
            closed_ts: Timestamp::ZERO,
            resolved_ts: Timestamp::ZERO,
            intent_queue: UnresolvedIntentQueue::new(),
        }
    }

    /// The resolved timestamp; `None` until initialized.
    pub fn get(&self) -> Option<Timestamp> {
        self.init.then_some(self.resolved_ts)
    }

    pub fn is_init(&self) -> bool {
        self.init
    }

    pub fn closed_ts(&self) -> Timestamp {
        self.closed_ts
    }

    pub fn intent_queue(&self) -> &UnresolvedIntentQueue {
        &self.intent_queue
    }

    /// Marks the initial intent scan complete. Returns true if the resolved
    /// timestamp advanced.
    pub fn init(&mut self) -> bool {
        self.init = true;
        self.intent_queue.disallow_neg_ref_count();
        self.recompute()
    }

    /// Raises the closed timestamp. Returns true if the resolved timestamp
    /// advanced.
    pub fn forward_closed_ts(&mut self, ts: Timestamp) -> bool {
        if self.closed_ts.forward(ts) {
            return self.recompute();
        }
        false
    }

    /// Tracks the intent effects of `op`. Returns true if the resolved
    /// timestamp advanced.
    pub fn consume_op(&mut self, op: &LogicalOp) -> Result<bool> {
        if self.consume(op)? {
            return Ok(self.recompute());
        }
        Ok(false)
    }

    fn consume(&mut self, op: &LogicalOp) -> Result<bool> {
        match op {
            LogicalOp::WriteValue { timestamp, .. } => {
                self.assert_above_resolved(op, *timestamp)?;
                Ok(false)
            }
            LogicalOp::WriteIntent {
                txn_id,
                txn_key,
                txn_min_timestamp,
                timestamp,
            } => {
                self.assert_above_resolved(op, *timestamp)?;
                Ok(self
                    .intent_queue
                    .inc_ref(*txn_id, txn_key, *txn_min_timestamp, *timestamp))
            }
            LogicalOp::UpdateIntent { txn_id, timestamp }
            | LogicalOp::UpdateIntentTs {
                txn_id, timestamp, ..
            } => Ok(self.intent_queue.update_ts(*txn_id, *timestamp)),
            LogicalOp::CommitIntent {
                txn_id, timestamp, ..
            } => Ok(self.intent_queue.dec_ref(*txn_id, *timestamp)),
            LogicalOp::AbortIntent { txn_id } => {
                Ok(self.intent_queue.dec_ref(*txn_id, Timestamp::ZERO))
            }
            LogicalOp::AbortTxn { txn_id } => {
                // Before initialization the scan may still report intents of
                // this txn, which would then never be removed.
                if !self.init {
                    return Ok(false);
                }
                Ok(self.intent_queue.del(*txn_id))
            }
        }
    }

    fn assert_above_resolved(&self, op: &LogicalOp, ts: Timestamp) -> Result<()> {
        if self.init && ts <= self.resolved_ts {
            return Err(Error::assertion(format!(
                "op {op:?} at {ts} not above resolved timestamp {}",
                self.resolved_ts
            )));
        }
        Ok(())
    }

    fn recompute(&mut self) -> bool {
        if !self.init {
            return false;
        }
        // Writes at the closed timestamp itself are still possible.
        let mut new_ts = self.closed_ts.floor_prev();
        if let Some(oldest) = self.intent_queue.oldest() {
            let blocked = oldest.timestamp.floor_prev();
            if blocked < new_ts {
                new_ts = blocked;
            }
        }
        new_ts.logical = 0;
        if new_ts < self.resolved_ts {
            tracing::error!(
                resolved_ts = %self.resolved_ts,
                new_ts = %new_ts,
                "resolved timestamp would regress"
            );
            return false;
        }
        self.resolved_ts.forward(new_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::Value;

    fn ts(wall: u64) -> Timestamp {
        Timestamp::from_wall(wall)
    }

    fn write_intent(txn_id: Uuid, t: u64) -> LogicalOp {
        LogicalOp::WriteIntent {
            txn_id,
            txn_key: b"a".to_vec(),
            txn_min_timestamp: ts(t),
            timestamp: ts(t),
        }
    }

    fn commit_intent(txn_id: Uuid, t: u64) -> LogicalOp {
        LogicalOp::CommitIntent {
            txn_id,
            key: b"m".to_vec(),
            timestamp: ts(t),
            value: Value::from_string("v"),
            prev_value: None,
        }
    }

    #[test]
    fn test_queue_orders_by_timestamp() {
        let mut q = UnresolvedIntentQueue::new();
        let (t1, t2) = (Uuid::new_v4(), Uuid::new_v4());
        q.inc_ref(t1, b"a", ts(20), ts(20));
        q.inc_ref(t2, b"b", ts(10), ts(10));
        assert_eq!(q.oldest().unwrap().txn_id, t2);
        assert!(q.update_ts(t2, ts(30)));
        assert_eq!(q.oldest().unwrap().txn_id, t1);
        assert_eq!(q.before(ts(25)).len(), 1);
        assert_eq!(q.before(ts(31)).len(), 2);

        // An update for an unknown txn is ignored.
        assert!(!q.update_ts(Uuid::new_v4(), ts(5)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_queue_ref_counts() {
        let mut q = UnresolvedIntentQueue::new();
        let t1 = Uuid::new_v4();
        q.inc_ref(t1, b"a", ts(10), ts(10));
        q.inc_ref(t1, b"a", ts(10), ts(12));
        assert_eq!(q.get(&t1).unwrap().ref_count, 2);
        assert!(!q.dec_ref(t1, ts(10)));
        assert_eq!(q.len(), 1);
        assert!(q.dec_ref(t1, ts(10)));
        assert!(q.is_empty());
    }

    #[test]
    fn test_queue_negative_ref_count_before_init() {
        let mut q = UnresolvedIntentQueue::new();
        let (t1, t2) = (Uuid::new_v4(), Uuid::new_v4());
        // Resolution observed before the scan reports the intent.
        q.dec_ref(t1, ts(10));
        assert_eq!(q.get(&t1).unwrap().ref_count, -1);
        q.inc_ref(t1, b"a", ts(10), ts(10));
        assert!(q.get(&t1).is_none());

        q.dec_ref(t2, ts(10));
        q.disallow_neg_ref_count();
        assert!(q.is_empty());
        q.dec_ref(t2, ts(10));
        assert!(q.is_empty());
    }

    #[test]
    fn test_resolved_ts_requires_init() {
        let mut rts = ResolvedTimestamp::new();
        assert!(!rts.forward_closed_ts(ts(100)));
        assert_eq!(rts.get(), None);
        assert!(rts.init());
        assert_eq!(rts.get(), Some(ts(99)));
    }

    #[test]
    fn test_resolved_ts_blocked_by_intent() {
        let mut rts = ResolvedTimestamp::new();
        let t3 = Uuid::new_v4();
        rts.init();
        assert!(!rts.consume_op(&write_intent(t3, 100)).unwrap());
        assert!(rts.forward_closed_ts(ts(150)));
        assert_eq!(rts.get(), Some(ts(99)));

        // Pushed to 110, then committed.
        assert!(rts
            .consume_op(&LogicalOp::UpdateIntent {
                txn_id: t3,
                timestamp: ts(110),
            })
            .unwrap());
        assert_eq!(rts.get(), Some(ts(109)));
        assert!(rts.consume_op(&commit_intent(t3, 110)).unwrap());
        assert_eq!(rts.get(), Some(ts(149)));
    }

    #[test]
    fn test_resolved_ts_abort_txn_ignored_before_init() {
        let mut rts = ResolvedTimestamp::new();
        let t1 = Uuid::new_v4();
        rts.consume_op(&write_intent(t1, 50)).unwrap();
        rts.consume_op(&LogicalOp::AbortTxn { txn_id: t1 }).unwrap();
        assert_eq!(rts.intent_queue().len(), 1);
        rts.forward_closed_ts(ts(100));
        rts.init();
        assert_eq!(rts.get(), Some(ts(49)));
        assert!(rts.consume_op(&LogicalOp::AbortTxn { txn_id: t1 }).unwrap());
        assert_eq!(rts.get(), Some(ts(99)));
    }

    #[test]
    fn test_resolved_ts_logical_truncated() {
        let mut rts = ResolvedTimestamp::new();
        rts.init();
        rts.forward_closed_ts(Timestamp::new(100, 5));
        assert_eq!(rts.get(), Some(ts(100)));
    }

    #[test]
    fn test_write_below_resolved_ts_rejected() {
        let mut rts = ResolvedTimestamp::new();
        rts.init();
        rts.forward_closed_ts(ts(100));
        let op = LogicalOp::WriteValue {
            key: b"k".to_vec(),
            timestamp: ts(90),
            value: Value::from_string("v"),
            prev_value: None,
        };
        assert!(rts.consume_op(&op).is_err());
    }
}
