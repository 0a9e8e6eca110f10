//! Initial replica state

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::api::{Lease, RaftTruncatedState, RangeDescriptor, TruncatedStateType};
use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::mvcc::MvccStats;
use crate::stateloader::{account_for_legacy_stats, ReplicaState, StateLoader};
use crate::storage::ReadWriter;

/// Both must exceed 1 so a new Raft group sends an initial snapshot instead
/// of replaying from index 1.
pub const RAFT_INITIAL_LOG_INDEX: u64 = 10;
pub const RAFT_INITIAL_LOG_TERM: u64 = 5;

/// Cluster version gating on-disk representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterVersion {
    pub major: u32,
    pub minor: u32,
}

impl ClusterVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ClusterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// First version storing applied indexes and stats in the fused
/// applied-state record.
pub const VERSION_RANGE_APPLIED_STATE_KEY: ClusterVersion = ClusterVersion::new(2, 1);

/// Bootstraps the replicated state of a brand-new replica and returns the
/// stats after the state writes are charged.
#[allow(clippy::too_many_arguments)]
pub fn write_initial_replica_state<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ms: MvccStats,
    desc: &RangeDescriptor,
    lease: Lease,
    gc_threshold: Timestamp,
    txn_span_gc_threshold: Timestamp,
    active_version: ClusterVersion,
    trunc_state_type: TruncatedStateType,
) -> Result<MvccStats> {
    let rsl = StateLoader::new(desc.range_id);

    let mut state = ReplicaState {
        raft_applied_index: RAFT_INITIAL_LOG_INDEX,
        lease_applied_index: 0,
        desc: RangeDescriptor {
            range_id: desc.range_id,
            ..Default::default()
        },
        lease,
        truncated_state: RaftTruncatedState {
            index: RAFT_INITIAL_LOG_INDEX,
            term: RAFT_INITIAL_LOG_TERM,
        },
        gc_threshold,
        txn_span_gc_threshold,
        stats: ms,
        using_applied_state_key: false,
    };
    if active_version >= VERSION_RANGE_APPLIED_STATE_KEY {
        state.using_applied_state_key = true;
    } else {
        account_for_legacy_stats(&mut state.stats, desc.range_id)?;
    }

    let existing = rsl.load_lease(&*rw)?;
    if !existing.is_empty() {
        return Err(Error::assertion(format!(
            "r{}: expected trivial lease, but found {}",
            desc.range_id, existing
        )));
    }
    let existing = rsl.load_gc_threshold(&*rw)?;
    if !existing.is_empty() {
        return Err(Error::assertion(format!(
            "r{}: expected trivial GC threshold, but found {}",
            desc.range_id, existing
        )));
    }
    let existing = rsl.load_txn_span_gc_threshold(&*rw)?;
    if !existing.is_empty() {
        return Err(Error::assertion(format!(
            "r{}: expected trivial txn span GC threshold, but found {}",
            desc.range_id, existing
        )));
    }

    let ms = rsl.save(rw, &state, trunc_state_type)?;
    tracing::debug!(
        range_id = desc.range_id,
        applied_state_key = state.using_applied_state_key,
        ?trunc_state_type,
        "wrote initial replica state"
    );
    Ok(ms)
}

/// Like [`write_initial_replica_state`], and also synthesizes the Raft hard
/// state and last index.
#[allow(clippy::too_many_arguments)]
pub fn write_initial_state<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ms: MvccStats,
    desc: &RangeDescriptor,
    lease: Lease,
    gc_threshold: Timestamp,
    txn_span_gc_threshold: Timestamp,
    bootstrap_version: ClusterVersion,
    trunc_state_type: TruncatedStateType,
) -> Result<MvccStats> {
    let ms = write_initial_replica_state(
        rw,
        ms,
        desc,
        lease,
        gc_threshold,
        txn_span_gc_threshold,
        bootstrap_version,
        trunc_state_type,
    )?;
    StateLoader::new(desc.range_id).synthesize_raft_state(rw)?;
    Ok(ms)
}
