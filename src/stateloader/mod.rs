//! Replica state persistence
//!
//! Every field of a replica's persisted state (lease, GC thresholds, applied
//! indexes, stats, Raft truncated/hard state, tombstone) is read and written
//! through a [`StateLoader`] bound to one range ID. Replicated fields are
//! written as inline MVCC values and charged to the range's stats; the fused
//! applied-state record is not, because it holds those stats itself.

mod initial;

pub use initial::{
    write_initial_replica_state, write_initial_state, ClusterVersion, RAFT_INITIAL_LOG_INDEX,
    RAFT_INITIAL_LOG_TERM, VERSION_RANGE_APPLIED_STATE_KEY,
};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::{
    HardState, Lease, RaftTombstone, RaftTruncatedState, RangeAppliedState, RangeDescriptor,
    RangeId, TruncatedStateType,
};
use crate::error::Result;
use crate::hlc::Timestamp;
use crate::keys;
use crate::mvcc::{
    compute_stats, key_stats, mvcc_get, mvcc_put, mvcc_put_record, read_meta, MvccGetOptions,
    MvccStats, Value,
};
use crate::storage::{ReadWriter, Reader};

/// The in-memory image of a replica's replicated state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaState {
    pub raft_applied_index: u64,
    pub lease_applied_index: u64,
    pub desc: RangeDescriptor,
    pub lease: Lease,
    pub truncated_state: RaftTruncatedState,
    pub gc_threshold: Timestamp,
    pub txn_span_gc_threshold: Timestamp,
    pub stats: MvccStats,
    /// Applied indexes and stats live in the fused applied-state record.
    pub using_applied_state_key: bool,
}

fn put_record<RW: ReadWriter + ?Sized, T: Serialize>(
    rw: &mut RW,
    ms: Option<&mut MvccStats>,
    key: &[u8],
    record: &T,
) -> Result<()> {
    mvcc_put_record(rw, ms, key, Timestamp::ZERO, record, None)
}

fn get_record<R: Reader + ?Sized, T: DeserializeOwned>(reader: &R, key: &[u8]) -> Result<Option<T>> {
    match mvcc_get(reader, key, Timestamp::ZERO, &MvccGetOptions::default())?.value {
        Some(v) => Ok(Some(v.get_record()?)),
        None => Ok(None),
    }
}

fn get_u64<R: Reader + ?Sized>(reader: &R, key: &[u8]) -> Result<Option<u64>> {
    match mvcc_get(reader, key, Timestamp::ZERO, &MvccGetOptions::default())?.value {
        Some(v) => Ok(Some(v.get_int()? as u64)),
        None => Ok(None),
    }
}

fn put_u64<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ms: Option<&mut MvccStats>,
    key: &[u8],
    n: u64,
) -> Result<()> {
    mvcc_put(rw, ms, key, Timestamp::ZERO, Value::from_int(n as i64), None)
}

/// Reads and writes the persisted state of one range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateLoader {
    range_id: RangeId,
}

impl StateLoader {
    pub fn new(range_id: RangeId) -> Self {
        Self { range_id }
    }

    pub fn range_id(&self) -> RangeId {
        self.range_id
    }

    /// Loads the full replicated state. The descriptor is supplied by the
    /// caller since it is addressed by key rather than range ID.
    pub fn load<R: Reader + ?Sized>(&self, reader: &R, desc: &RangeDescriptor) -> Result<ReplicaState> {
        let (truncated_state, _) = self.load_raft_truncated_state(reader)?;
        let applied = self.load_range_applied_state(reader)?;
        let (raft_applied_index, lease_applied_index, stats) = match &applied {
            Some(a) => (a.raft_applied_index, a.lease_applied_index, a.range_stats),
            None => {
                let (raft, lease) = self.load_applied_index(reader)?;
                (raft, lease, self.load_mvcc_stats(reader)?)
            }
        };
        Ok(ReplicaState {
            raft_applied_index,
            lease_applied_index,
            desc: desc.clone(),
            lease: self.load_lease(reader)?,
            truncated_state,
            gc_threshold: self.load_gc_threshold(reader)?,
            txn_span_gc_threshold: self.load_txn_span_gc_threshold(reader)?,
            stats,
            using_applied_state_key: applied.is_some(),
        })
    }

    /// Persists every replicated field of `state` and returns the stats
    /// after charging the writes.
    pub fn save<RW: ReadWriter + ?Sized>(
        &self,
        rw: &mut RW,
        state: &ReplicaState,
        trunc_state_type: TruncatedStateType,
    ) -> Result<MvccStats> {
        let mut ms = state.stats;
        self.set_lease(rw, Some(&mut ms), &state.lease)?;
        self.set_gc_threshold(rw, Some(&mut ms), state.gc_threshold)?;
        self.set_txn_span_gc_threshold(rw, Some(&mut ms), state.txn_span_gc_threshold)?;
        match trunc_state_type {
            TruncatedStateType::Legacy => {
                self.set_legacy_raft_truncated_state(rw, Some(&mut ms), &state.truncated_state)?
            }
            TruncatedStateType::Unreplicated => {
                self.set_raft_truncated_state(rw, &state.truncated_state)?
            }
        }
        if state.using_applied_state_key {
            self.set_range_applied_state(
                rw,
                state.raft_applied_index,
                state.lease_applied_index,
                &ms,
            )?;
        } else {
            self.set_legacy_applied_index(rw, state.raft_applied_index, state.lease_applied_index)?;
            self.set_legacy_mvcc_stats(rw, &ms)?;
        }
        Ok(ms)
    }

    pub fn load_lease<R: Reader + ?Sized>(&self, reader: &R) -> Result<Lease> {
        Ok(get_record(reader, &keys::range_lease_key(self.range_id))?.unwrap_or_default())
    }

    pub fn set_lease<RW: ReadWriter + ?Sized>(
        &self,
        rw: &mut RW,
        ms: Option<&mut MvccStats>,
        lease: &Lease,
    ) -> Result<()> {
        put_record(rw, ms, &keys::range_lease_key(self.range_id), lease)
    }

    pub fn load_gc_threshold<R: Reader + ?Sized>(&self, reader: &R) -> Result<Timestamp> {
        Ok(get_record(reader, &keys::range_gc_threshold_key(self.range_id))?.unwrap_or_default())
    }

    pub fn set_gc_threshold<RW: ReadWriter + ?Sized>(
        &self,
        rw: &mut RW,
        ms: Option<&mut MvccStats>,
        threshold: Timestamp,
    ) -> Result<()> {
        put_record(rw, ms, &keys::range_gc_threshold_key(self.range_id), &threshold)
    }

    pub fn load_txn_span_gc_threshold<R: Reader + ?Sized>(&self, reader: &R) -> Result<Timestamp> {
        Ok(
            get_record(reader, &keys::range_txn_span_gc_threshold_key(self.range_id))?
                .unwrap_or_default(),
        )
    }

    pub fn set_txn_span_gc_threshold<RW: ReadWriter + ?Sized>(
        &self,
        rw: &mut RW,
        ms: Option<&mut MvccStats>,
        threshold: Timestamp,
    ) -> Result<()> {
        put_record(
            rw,
            ms,
            &keys::range_txn_span_gc_threshold_key(self.range_id),
            &threshold,
        )
    }

    pub fn load_range_applied_state<R: Reader + ?Sized>(
        &self,
        reader: &R,
    ) -> Result<Option<RangeAppliedState>> {
        get_record(reader, &keys::range_applied_state_key(self.range_id))
    }

    /// Whether this range has migrated to the fused applied-state record.
    pub fn using_applied_state_key<R: Reader + ?Sized>(&self, reader: &R) -> Result<bool> {
        Ok(read_meta(reader, &keys::range_applied_state_key(self.range_id))?.is_some())
    }

    /// Writes the fused record. Its own bytes are not charged to `stats`.
    pub fn set_range_applied_state<RW: ReadWriter + ?Sized>(
        &self,
        rw: &mut RW,
        raft_applied_index: u64,
        lease_applied_index: u64,
        stats: &MvccStats,
    ) -> Result<()> {
        let state = RangeAppliedState {
            raft_applied_index,
            lease_applied_index,
            range_stats: *stats,
        };
        put_record(rw, None, &keys::range_applied_state_key(self.range_id), &state)
    }

    /// Raft and lease applied indexes, from whichever representation is in
    /// use.
    pub fn load_applied_index<R: Reader + ?Sized>(&self, reader: &R) -> Result<(u64, u64)> {
        if let Some(state) = self.load_range_applied_state(reader)? {
            return Ok((state.raft_applied_index, state.lease_applied_index));
        }
        let raft = get_u64(reader, &keys::raft_applied_index_legacy_key(self.range_id))?;
        let lease = get_u64(reader, &keys::lease_applied_index_legacy_key(self.range_id))?;
        Ok((raft.unwrap_or(0), lease.unwrap_or(0)))
    }

    /// Writes the legacy index keys. Their footprint is fixed and charged
    /// once by [`account_for_legacy_stats`].
    pub fn set_legacy_applied_index<RW: ReadWriter + ?Sized>(
        &self,
        rw: &mut RW,
        raft_applied_index: u64,
        lease_applied_index: u64,
    ) -> Result<()> {
        put_u64(
            rw,
            None,
            &keys::raft_applied_index_legacy_key(self.range_id),
            raft_applied_index,
        )?;
        put_u64(
            rw,
            None,
            &keys::lease_applied_index_legacy_key(self.range_id),
            lease_applied_index,
        )
    }

    pub fn load_mvcc_stats<R: Reader + ?Sized>(&self, reader: &R) -> Result<MvccStats> {
        if let Some(state) = self.load_range_applied_state(reader)? {
            return Ok(state.range_stats);
        }
        Ok(get_record(reader, &keys::range_stats_legacy_key(self.range_id))?.unwrap_or_default())
    }

    fn set_legacy_mvcc_stats<RW: ReadWriter + ?Sized>(
        &self,
        rw: &mut RW,
        stats: &MvccStats,
    ) -> Result<()> {
        put_record(rw, None, &keys::range_stats_legacy_key(self.range_id), stats)
    }

    /// Persists `stats` in whichever representation is in use.
    pub fn set_mvcc_stats<RW: ReadWriter + ?Sized>(&self, rw: &mut RW, stats: &MvccStats) -> Result<()> {
        match self.load_range_applied_state(&*rw)? {
            Some(state) => self.set_range_applied_state(
                rw,
                state.raft_applied_index,
                state.lease_applied_index,
                stats,
            ),
            None => self.set_legacy_mvcc_stats(rw, stats),
        }
    }

    /// The truncated state and where it was found. The legacy replicated key
    /// takes precedence.
    pub fn load_raft_truncated_state<R: Reader + ?Sized>(
        &self,
        reader: &R,
    ) -> Result<(RaftTruncatedState, TruncatedStateType)> {
        if let Some(ts) = get_record(reader, &keys::raft_truncated_state_legacy_key(self.range_id))? {
            return Ok((ts, TruncatedStateType::Legacy));
        }
        let ts = get_record(reader, &keys::raft_truncated_state_key(self.range_id))?;
        Ok((ts.unwrap_or_default(), TruncatedStateType::Unreplicated))
    }

    pub fn set_raft_truncated_state<RW: ReadWriter + ?Sized>(
        &self,
        rw: &mut RW,
        state: &RaftTruncatedState,
    ) -> Result<()> {
        put_record(rw, None, &keys::raft_truncated_state_key(self.range_id), state)
    }

    pub fn set_legacy_raft_truncated_state<RW: ReadWriter + ?Sized>(
        &self,
        rw: &mut RW,
        ms: Option<&mut MvccStats>,
        state: &RaftTruncatedState,
    ) -> Result<()> {
        put_record(rw, ms, &keys::raft_truncated_state_legacy_key(self.range_id), state)
    }

    pub fn load_hard_state<R: Reader + ?Sized>(&self, reader: &R) -> Result<HardState> {
        Ok(get_record(reader, &keys::raft_hard_state_key(self.range_id))?.unwrap_or_default())
    }

    pub fn set_hard_state<RW: ReadWriter + ?Sized>(&self, rw: &mut RW, hs: &HardState) -> Result<()> {
        put_record(rw, None, &keys::raft_hard_state_key(self.range_id), hs)
    }

    /// Last index of the Raft log. Falls back to the truncated index when
    /// the log is empty.
    pub fn load_last_index<R: Reader + ?Sized>(&self, reader: &R) -> Result<u64> {
        match get_u64(reader, &keys::raft_last_index_key(self.range_id))? {
            Some(idx) => Ok(idx),
            None => Ok(self.load_raft_truncated_state(reader)?.0.index),
        }
    }

    pub fn set_last_index<RW: ReadWriter + ?Sized>(&self, rw: &mut RW, index: u64) -> Result<()> {
        put_u64(rw, None, &keys::raft_last_index_key(self.range_id), index)
    }

    pub fn load_raft_tombstone<R: Reader + ?Sized>(&self, reader: &R) -> Result<Option<RaftTombstone>> {
        get_record(reader, &keys::raft_tombstone_key(self.range_id))
    }

    pub fn set_raft_tombstone<RW: ReadWriter + ?Sized>(
        &self,
        rw: &mut RW,
        tombstone: &RaftTombstone,
    ) -> Result<()> {
        put_record(rw, None, &keys::raft_tombstone_key(self.range_id), tombstone)
    }

    pub fn load_last_replica_gc_timestamp<R: Reader + ?Sized>(&self, reader: &R) -> Result<Timestamp> {
        Ok(
            get_record(reader, &keys::range_last_replica_gc_timestamp_key(self.range_id))?
                .unwrap_or_default(),
        )
    }

    pub fn set_last_replica_gc_timestamp<RW: ReadWriter + ?Sized>(
        &self,
        rw: &mut RW,
        ts: Timestamp,
    ) -> Result<()> {
        put_record(
            rw,
            None,
            &keys::range_last_replica_gc_timestamp_key(self.range_id),
            &ts,
        )
    }

    /// Writes the Raft hard state and last index implied by the truncated
    /// state, as if the log up to it had been received in a snapshot.
    pub fn synthesize_raft_state<RW: ReadWriter + ?Sized>(&self, rw: &mut RW) -> Result<()> {
        let (truncated, _) = self.load_raft_truncated_state(&*rw)?;
        let mut hs = self.load_hard_state(&*rw)?;
        if hs.term < truncated.term {
            hs.term = truncated.term;
        }
        if hs.commit < truncated.index {
            hs.commit = truncated.index;
        }
        self.set_hard_state(rw, &hs)?;
        self.set_last_index(rw, truncated.index)
    }
}

/// Charges the fixed footprint of the legacy index and stats keys, which are
/// rewritten outside stats accounting.
pub fn account_for_legacy_stats(ms: &mut MvccStats, range_id: RangeId) -> Result<()> {
    let index_val = inline_len(&Value::from_int(0))?;
    let stats_val = inline_len(&Value::from_record(&MvccStats::default())?)?;
    for (key, val_len) in [
        (keys::raft_applied_index_legacy_key(range_id), index_val),
        (keys::lease_applied_index_legacy_key(range_id), index_val),
        (keys::range_stats_legacy_key(range_id), stats_val),
    ] {
        ms.account_sys(key.len() as i64 + 1, val_len);
    }
    Ok(())
}

fn inline_len(value: &Value) -> Result<i64> {
    let mut v = value.clone();
    v.init_checksum(b"");
    let meta = crate::mvcc::MvccMetadata::inline(v.raw_bytes);
    Ok(meta.encode()?.len() as i64)
}

/// Recomputes the replicated stats of the range described by `desc`,
/// excluding the applied-state record which stores them.
pub fn compute_range_stats<R: Reader + ?Sized>(
    reader: &R,
    desc: &RangeDescriptor,
    now: i64,
) -> Result<MvccStats> {
    let mut ms = MvccStats {
        last_update_nanos: now,
        ..Default::default()
    };
    for span in keys::replica_data_spans(desc.range_id, &desc.start_key, &desc.end_key) {
        ms.add(&compute_stats(reader, &span.key, &span.end_key, now)?);
    }
    let applied = key_stats(reader, &keys::range_applied_state_key(desc.range_id), now)?;
    ms.subtract(&applied);
    Ok(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ReplicaDescriptor;
    use crate::storage::Engine;

    fn desc() -> RangeDescriptor {
        RangeDescriptor::new(
            1,
            b"a".to_vec(),
            b"z".to_vec(),
            vec![ReplicaDescriptor::new(1, 1, 1)],
        )
    }

    #[test]
    fn test_field_roundtrip() {
        let engine = Engine::in_memory();
        let mut batch = engine.new_batch();
        let rsl = StateLoader::new(1);
        let mut ms = MvccStats::default();

        let lease = Lease {
            start: Timestamp::from_wall(5),
            replica: ReplicaDescriptor::new(1, 1, 1),
            sequence: 1,
            ..Default::default()
        };
        rsl.set_lease(&mut batch, Some(&mut ms), &lease).unwrap();
        rsl.set_gc_threshold(&mut batch, Some(&mut ms), Timestamp::from_wall(3))
            .unwrap();
        rsl.set_hard_state(
            &mut batch,
            &HardState {
                term: 2,
                vote: 1,
                commit: 9,
            },
        )
        .unwrap();
        rsl.set_raft_tombstone(&mut batch, &RaftTombstone { next_replica_id: 4 })
            .unwrap();
        batch.commit().unwrap();

        assert_eq!(rsl.load_lease(&*engine).unwrap(), lease);
        assert_eq!(rsl.load_gc_threshold(&*engine).unwrap(), Timestamp::from_wall(3));
        assert_eq!(rsl.load_txn_span_gc_threshold(&*engine).unwrap(), Timestamp::ZERO);
        assert_eq!(rsl.load_hard_state(&*engine).unwrap().commit, 9);
        assert_eq!(
            rsl.load_raft_tombstone(&*engine).unwrap(),
            Some(RaftTombstone { next_replica_id: 4 })
        );
        assert_eq!(ms.sys_count, 2);
    }

    #[test]
    fn test_applied_index_prefers_fused_record() {
        let engine = Engine::in_memory();
        let rsl = StateLoader::new(1);
        let mut batch = engine.new_batch();
        rsl.set_legacy_applied_index(&mut batch, 3, 2).unwrap();
        assert_eq!(rsl.load_applied_index(&batch).unwrap(), (3, 2));
        assert!(!rsl.using_applied_state_key(&batch).unwrap());

        rsl.set_range_applied_state(&mut batch, 7, 6, &MvccStats::default())
            .unwrap();
        assert_eq!(rsl.load_applied_index(&batch).unwrap(), (7, 6));
        assert!(rsl.using_applied_state_key(&batch).unwrap());
    }

    #[test]
    fn test_truncated_state_legacy_probe() {
        let engine = Engine::in_memory();
        let rsl = StateLoader::new(1);
        let mut batch = engine.new_batch();
        let ts = RaftTruncatedState { index: 10, term: 5 };
        rsl.set_raft_truncated_state(&mut batch, &ts).unwrap();
        assert_eq!(
            rsl.load_raft_truncated_state(&batch).unwrap(),
            (ts, TruncatedStateType::Unreplicated)
        );
        let legacy = RaftTruncatedState { index: 11, term: 5 };
        rsl.set_legacy_raft_truncated_state(&mut batch, None, &legacy)
            .unwrap();
        assert_eq!(
            rsl.load_raft_truncated_state(&batch).unwrap(),
            (legacy, TruncatedStateType::Legacy)
        );
    }

    #[test]
    fn test_last_index_falls_back_to_truncated() {
        let engine = Engine::in_memory();
        let rsl = StateLoader::new(1);
        let mut batch = engine.new_batch();
        rsl.set_raft_truncated_state(&mut batch, &RaftTruncatedState { index: 10, term: 5 })
            .unwrap();
        assert_eq!(rsl.load_last_index(&batch).unwrap(), 10);
        rsl.set_last_index(&mut batch, 12).unwrap();
        assert_eq!(rsl.load_last_index(&batch).unwrap(), 12);
    }

    #[test]
    fn test_compute_range_stats_excludes_applied_state() {
        let engine = Engine::in_memory();
        let rsl = StateLoader::new(1);
        let d = desc();
        let mut batch = engine.new_batch();
        let mut ms = MvccStats::default();
        rsl.set_lease(&mut batch, Some(&mut ms), &Lease::default()).unwrap();
        rsl.set_range_applied_state(&mut batch, 1, 1, &ms).unwrap();
        let computed = compute_range_stats(&batch, &d, 0).unwrap();
        assert!(computed.equal_counters(&ms));
    }
}
