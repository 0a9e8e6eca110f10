//! Timestamp cache
//!
//! Tracks the maximum timestamp at which each key span was read, and markers
//! on transaction record keys recording pushes and finalizations. Lookups
//! never return less than the low-water mark, which a new leaseholder seeds
//! with its lease start. When the cache fills up, every entry is folded into
//! the low-water mark.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::api::Span;
use crate::error::AbortReason;
use crate::hlc::Timestamp;
use crate::keys;

pub const DEFAULT_TSCACHE_CAPACITY: usize = 1 << 16;

#[derive(Debug, Clone, Copy)]
struct ReadMark {
    ts: Timestamp,
    txn: Option<Uuid>,
}

impl ReadMark {
    /// Folds `other` in: the higher timestamp wins, equal timestamps from
    /// different transactions lose their owner.
    fn forward(&mut self, other: ReadMark) {
        if other.ts > self.ts {
            *self = other;
        } else if other.ts == self.ts && other.txn != self.txn {
            self.txn = None;
        }
    }
}

#[derive(Default)]
struct Inner {
    low_water: Timestamp,
    /// start key -> (end key -> mark)
    reads: BTreeMap<Vec<u8>, HashMap<Vec<u8>, ReadMark>>,
    len: usize,
    /// Transaction record key -> highest push.
    pushes: HashMap<Vec<u8>, ReadMark>,
    /// Transaction record key -> highest finalization.
    tombstones: HashMap<Vec<u8>, ReadMark>,
}

impl Inner {
    fn rotate(&mut self) {
        let mut floor = self.low_water;
        for marks in self.reads.values() {
            for m in marks.values() {
                floor.forward(m.ts);
            }
        }
        for m in self.pushes.values().chain(self.tombstones.values()) {
            floor.forward(m.ts);
        }
        tracing::debug!(low_water = %floor, entries = self.len, "timestamp cache rotated");
        self.reads.clear();
        self.pushes.clear();
        self.tombstones.clear();
        self.len = 0;
        self.low_water = floor;
    }
}

/// Per-range read timestamp cache.
pub struct TimestampCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for TimestampCache {
    fn default() -> Self {
        Self::new(DEFAULT_TSCACHE_CAPACITY)
    }
}

impl TimestampCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn low_water(&self) -> Timestamp {
        self.inner.lock().low_water
    }

    /// Raises the floor of every lookup to `ts`. Never lowers it.
    pub fn set_low_water(&self, ts: Timestamp) {
        self.inner.lock().low_water.forward(ts);
    }

    /// Records a read of `span` at `ts` by `txn`.
    pub fn add(&self, span: &Span, ts: Timestamp, txn: Option<Uuid>) {
        let span = span.as_range();
        let mut inner = self.inner.lock();
        if ts <= inner.low_water {
            return;
        }
        if inner.len >= self.capacity {
            inner.rotate();
        }
        let mark = ReadMark { ts, txn };
        let ends = inner.reads.entry(span.key).or_default();
        let added = match ends.get_mut(&span.end_key) {
            Some(existing) => {
                existing.forward(mark);
                false
            }
            None => {
                ends.insert(span.end_key, mark);
                true
            }
        };
        if added {
            inner.len += 1;
        }
    }

    /// Highest read timestamp over `span` and the transaction that performed
    /// it, if a single one did.
    pub fn get_max(&self, span: &Span) -> (Timestamp, Option<Uuid>) {
        let span = span.as_range();
        let inner = self.inner.lock();
        let mut max = ReadMark {
            ts: inner.low_water,
            txn: None,
        };
        for (_, ends) in inner.reads.range(..span.end_key.clone()) {
            for (end, mark) in ends {
                if end.as_slice() > span.key.as_slice() {
                    max.forward(*mark);
                }
            }
        }
        (max.ts, max.txn)
    }

    /// Records that the transaction anchored at `key` was pushed to `ts`.
    pub fn add_txn_push(&self, key: &[u8], txn_id: Uuid, ts: Timestamp) {
        let record_key = keys::transaction_key(key, txn_id);
        let mut inner = self.inner.lock();
        inner
            .pushes
            .entry(record_key)
            .and_modify(|m| m.forward(ReadMark { ts, txn: None }))
            .or_insert(ReadMark { ts, txn: None });
    }

    /// Records that the transaction's record was finalized or removed at
    /// `ts`. `by` is the transaction responsible: the transaction itself when
    /// it ended, or its pusher.
    pub fn add_txn_tombstone(&self, key: &[u8], txn_id: Uuid, ts: Timestamp, by: Option<Uuid>) {
        let record_key = keys::transaction_key(key, txn_id);
        let mark = ReadMark { ts, txn: by };
        let mut inner = self.inner.lock();
        inner
            .tombstones
            .entry(record_key)
            .and_modify(|m| m.forward(mark))
            .or_insert(mark);
    }

    /// Whether a record may be created for the transaction anchored at `key`
    /// with minimum timestamp `min_ts`. Returns the outcome, the minimum
    /// commit timestamp imposed by earlier pushes, and the abort reason when
    /// creation is refused.
    pub fn can_create_txn_record(
        &self,
        txn_id: Uuid,
        key: &[u8],
        min_ts: Timestamp,
    ) -> (bool, Timestamp, Option<AbortReason>) {
        let record_key = keys::transaction_key(key, txn_id);
        let inner = self.inner.lock();

        let mut tombstone = ReadMark {
            ts: inner.low_water,
            txn: None,
        };
        if let Some(m) = inner.tombstones.get(&record_key) {
            tombstone.forward(*m);
        }
        if min_ts <= tombstone.ts {
            let reason = match tombstone.txn {
                Some(id) if id == txn_id => AbortReason::AbortedRecordFound,
                None => AbortReason::NewLeasePreventsTxn,
                Some(_) => AbortReason::TimestampCacheRejected,
            };
            return (false, Timestamp::ZERO, Some(reason));
        }

        let min_commit = inner
            .pushes
            .get(&record_key)
            .map(|m| m.ts)
            .unwrap_or(Timestamp::ZERO);
        (true, min_commit, None)
    }

    /// Drops every entry and sets the low-water mark to `low_water`.
    pub fn clear(&self, low_water: Timestamp) {
        let mut inner = self.inner.lock();
        *inner = Inner {
            low_water,
            ..Default::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(n: u64) -> Timestamp {
        Timestamp::from_wall(n)
    }

    #[test]
    fn test_point_and_range_reads() {
        let tc = TimestampCache::default();
        let t1 = Uuid::new_v4();
        tc.add(&Span::point(b"b".to_vec()), ts(10), Some(t1));
        tc.add(&Span::new(b"d".to_vec(), b"g".to_vec()), ts(20), None);

        assert_eq!(tc.get_max(&Span::point(b"b".to_vec())), (ts(10), Some(t1)));
        assert_eq!(tc.get_max(&Span::point(b"c".to_vec())), (Timestamp::ZERO, None));
        assert_eq!(tc.get_max(&Span::point(b"f".to_vec())).0, ts(20));
        assert_eq!(tc.get_max(&Span::point(b"g".to_vec())).0, Timestamp::ZERO);
        assert_eq!(
            tc.get_max(&Span::new(b"a".to_vec(), b"z".to_vec())),
            (ts(20), None)
        );
    }

    #[test]
    fn test_same_ts_different_txns_loses_owner() {
        let tc = TimestampCache::default();
        tc.add(&Span::point(b"k".to_vec()), ts(5), Some(Uuid::new_v4()));
        tc.add(&Span::point(b"k".to_vec()), ts(5), Some(Uuid::new_v4()));
        assert_eq!(tc.get_max(&Span::point(b"k".to_vec())), (ts(5), None));
    }

    #[test]
    fn test_low_water_never_regresses() {
        let tc = TimestampCache::default();
        tc.set_low_water(ts(100));
        tc.set_low_water(ts(50));
        assert_eq!(tc.low_water(), ts(100));
        assert_eq!(tc.get_max(&Span::point(b"x".to_vec())), (ts(100), None));
        tc.add(&Span::point(b"x".to_vec()), ts(90), None);
        assert_eq!(tc.get_max(&Span::point(b"x".to_vec())).0, ts(100));
    }

    #[test]
    fn test_rotation_raises_low_water() {
        let tc = TimestampCache::new(2);
        tc.add(&Span::point(b"a".to_vec()), ts(1), None);
        tc.add(&Span::point(b"b".to_vec()), ts(7), None);
        tc.add(&Span::point(b"c".to_vec()), ts(3), None);
        assert_eq!(tc.low_water(), ts(7));
        assert_eq!(tc.get_max(&Span::point(b"a".to_vec())).0, ts(7));
    }

    #[test]
    fn test_can_create_txn_record() {
        let tc = TimestampCache::default();
        let id = Uuid::new_v4();
        assert_eq!(
            tc.can_create_txn_record(id, b"k", ts(10)),
            (true, Timestamp::ZERO, None)
        );

        tc.add_txn_push(b"k", id, ts(30));
        assert_eq!(
            tc.can_create_txn_record(id, b"k", ts(10)),
            (true, ts(30), None)
        );

        tc.add_txn_tombstone(b"k", id, ts(40), Some(id));
        assert_eq!(
            tc.can_create_txn_record(id, b"k", ts(10)),
            (false, Timestamp::ZERO, Some(AbortReason::AbortedRecordFound))
        );

        let other = Uuid::new_v4();
        tc.add_txn_tombstone(b"k", other, ts(40), Some(Uuid::new_v4()));
        assert_eq!(
            tc.can_create_txn_record(other, b"k", ts(10)).2,
            Some(AbortReason::TimestampCacheRejected)
        );

        tc.set_low_water(ts(50));
        let fresh = Uuid::new_v4();
        assert_eq!(
            tc.can_create_txn_record(fresh, b"k", ts(20)).2,
            Some(AbortReason::NewLeasePreventsTxn)
        );
        assert!(tc.can_create_txn_record(fresh, b"k", ts(60)).0);
    }
}
