//! Commit triggers
//!
//! A transaction that changes range boundaries or membership carries a
//! trigger on its EndTxn. The trigger runs inside the committing batch and
//! turns the descriptor writes into replica state changes.

use crate::api::{ChangeReplicasTrigger, Lease, MergeTrigger, SplitTrigger, TruncatedStateType};
use crate::batcheval::{EvalContext, EvalResult, SplitResult};
use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::keys;
use crate::mvcc::{compute_stats, key_stats, read_meta, MvccStats};
use crate::stateloader::{
    compute_range_stats, write_initial_replica_state, ClusterVersion, StateLoader,
    VERSION_RANGE_APPLIED_STATE_KEY,
};
use crate::storage::ReadWriter;
use crate::txn::AbortSpan;

/// Version written for a new range whose sibling predates the applied-state
/// record.
const VERSION_LEGACY_APPLIED_STATE: ClusterVersion = ClusterVersion::new(2, 0);

/// Writes the initial state of the right-hand side of a split and rewrites
/// `ms`, the batch's stats delta, to the delta of the shrunken left-hand
/// side. The right-hand side's absolute stats travel in the result.
pub fn split_trigger<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ctx: &EvalContext<'_>,
    ms: &mut MvccStats,
    split: &SplitTrigger,
    ts: Timestamp,
) -> Result<EvalResult> {
    let desc = ctx.desc();
    let (left, right) = (&split.left_desc, &split.right_desc);
    if left.start_key != desc.start_key
        || right.end_key != desc.end_key
        || left.end_key != right.start_key
    {
        return Err(Error::assertion(format!(
            "range does not match splits: ({}-{}) + ({}-{}) != {}",
            keys::pretty(&left.start_key),
            keys::pretty(&left.end_key),
            keys::pretty(&right.start_key),
            keys::pretty(&right.end_key),
            desc
        )));
    }
    let now = ts.wall_time as i64;

    // The left-hand side is recomputed from scratch; the right-hand side is
    // what remains of the pre-split range.
    let left_ms = compute_range_stats(&*rw, left, now)?;

    let lhs = StateLoader::new(desc.range_id);
    let rhs = StateLoader::new(right.range_id);
    let replica_gc_ts = lhs.load_last_replica_gc_timestamp(&*rw)?;
    if !replica_gc_ts.is_empty() {
        rhs.set_last_replica_gc_timestamp(rw, replica_gc_ts)?;
    }
    ctx.abort_span()
        .copy_to(rw, Some(&mut *ms), &AbortSpan::new(right.range_id))?;

    let mut right_ms = ctx.state.stats;
    right_ms.add(ms);
    right_ms.subtract(&left_ms);
    if ctx.state.stats.contains_estimates != 0 {
        right_ms = compute_range_stats(&*rw, right, now)?;
    }

    let left_lease = &ctx.state.lease;
    if left_lease.is_empty() {
        return Err(Error::assertion(format!(
            "LHS of split has no lease: {}",
            desc
        )));
    }
    let Some(replica) = right.replica_for_store(left_lease.replica.store_id) else {
        return Err(Error::assertion(format!(
            "pre-split lease holder {} not found in post-split descriptor {}",
            left_lease.replica, right
        )));
    };
    let right_lease = Lease {
        replica: *replica,
        ..left_lease.clone()
    };

    let trunc_type = if read_meta(&*rw, &keys::raft_truncated_state_legacy_key(desc.range_id))?.is_some() {
        TruncatedStateType::Legacy
    } else {
        TruncatedStateType::Unreplicated
    };
    let version = if ctx.state.using_applied_state_key {
        VERSION_RANGE_APPLIED_STATE_KEY
    } else {
        VERSION_LEGACY_APPLIED_STATE
    };
    let right_ms = write_initial_replica_state(
        rw,
        right_ms,
        right,
        right_lease,
        ctx.state.gc_threshold,
        ctx.state.txn_span_gc_threshold,
        version,
        trunc_type,
    )?;

    let mut delta = left_ms;
    delta.subtract(&ctx.state.stats);
    *ms = delta;

    tracing::info!(
        range_id = desc.range_id,
        left = %left,
        right = %right,
        "initiating a split"
    );
    let mut res = EvalResult::default();
    res.replicated.split = Some(SplitResult {
        trigger: split.clone(),
        rhs_delta: right_ms,
    });
    Ok(res)
}

/// Folds the subsumed right-hand range into the left-hand one: its abort
/// span entries are copied and its user data stats are absorbed.
pub fn merge_trigger<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ctx: &EvalContext<'_>,
    ms: &mut MvccStats,
    merge: &MergeTrigger,
    ts: Timestamp,
) -> Result<EvalResult> {
    let desc = ctx.desc();
    if merge.left_desc.start_key != desc.start_key {
        return Err(Error::assertion(format!(
            "LHS range start keys do not match: {} != {}",
            keys::pretty(&merge.left_desc.start_key),
            keys::pretty(&desc.start_key)
        )));
    }
    if desc.end_key != merge.right_desc.start_key {
        return Err(Error::assertion(format!(
            "LHS end key {} does not match RHS start key {}",
            keys::pretty(&desc.end_key),
            keys::pretty(&merge.right_desc.start_key)
        )));
    }
    if desc.end_key >= merge.left_desc.end_key {
        return Err(Error::assertion(format!(
            "merge does not extend {} beyond {}",
            desc,
            keys::pretty(&merge.left_desc.end_key)
        )));
    }
    let now = ts.wall_time as i64;

    AbortSpan::new(merge.right_desc.range_id).copy_to(rw, Some(&mut *ms), &ctx.abort_span())?;

    // The RHS's range-ID replicated keys are counted in its stats but are
    // about to be removed along with the replica.
    ms.add(&merge.right_stats);
    let prefix = keys::make_range_id_replicated_prefix(merge.right_desc.range_id);
    let mut rhs_local = compute_stats(&*rw, &prefix, &keys::prefix_end(&prefix), now)?;
    rhs_local.subtract(&key_stats(
        &*rw,
        &keys::range_applied_state_key(merge.right_desc.range_id),
        now,
    )?);
    ms.subtract(&rhs_local);

    tracing::info!(
        range_id = desc.range_id,
        subsumed = merge.right_desc.range_id,
        "initiating a merge"
    );
    let mut res = EvalResult::default();
    res.replicated.merge = Some(merge.clone());
    Ok(res)
}

pub(super) fn change_replicas_trigger(ctx: &EvalContext<'_>, change: &ChangeReplicasTrigger) -> EvalResult {
    tracing::info!(
        range_id = ctx.range_id(),
        desc = %change.desc,
        "change replicas"
    );
    let mut res = EvalResult::default();
    res.replicated.change_replicas = Some(change.clone());
    res.replicated.desc = Some(change.desc.clone());
    res.local.maybe_add_to_split_queue = true;
    res.local.gossip_first_range = change.desc.start_key.is_empty();
    res
}

#[cfg(test)]
mod tests {
    use crate::api::{
        ChangeReplicasTrigger, CommitTrigger, EndTxnRequest, MergeTrigger, RangeDescriptor,
        ReplicaDescriptor, ReplicaType, Request, SplitTrigger,
    };
    use crate::batcheval::testutil::*;
    use crate::api::Span;
    use crate::keys;
    use crate::mvcc::{MvccStats, Value};
    use crate::stateloader::{compute_range_stats, StateLoader};
    use crate::txn::{IsolationLevel, Transaction};

    fn descs() -> (RangeDescriptor, RangeDescriptor) {
        let replicas = vec![ReplicaDescriptor::new(1, 1, 1)];
        let mut left = RangeDescriptor::new(1, b"a".to_vec(), b"m".to_vec(), replicas.clone());
        left.generation = 1;
        let mut right = RangeDescriptor::new(2, b"m".to_vec(), b"z".to_vec(), replicas);
        right.generation = 1;
        (left, right)
    }

    /// Runs a split transaction the way the store does: both descriptors
    /// written as intents, then committed with the trigger attached.
    fn split(r: &mut TestRange) -> crate::batcheval::EvalResult {
        let (left, right) = descs();
        let anchor = keys::range_descriptor_key(b"a");
        let txn = Transaction::new("split", anchor.clone(), IsolationLevel::Serializable, 1, ts(50));
        let mut lock_spans = Vec::new();
        for d in [&left, &right] {
            let key = keys::range_descriptor_key(&d.start_key);
            r.send_one(txn_header(&txn), Request::put(key.clone(), Value::from_record(d).unwrap()))
                .unwrap();
            lock_spans.push(Span::point(key));
        }
        let mut et = EndTxnRequest::commit(anchor, lock_spans);
        et.commit_trigger = Some(CommitTrigger::Split(SplitTrigger {
            left_desc: left,
            right_desc: right,
        }));
        let ba = crate::api::BatchRequest::new(1, ts(50))
            .with_txn(txn)
            .add(Request::EndTxn(et));
        r.send(ba).unwrap().1
    }

    #[test]
    fn test_split_divides_stats() {
        let mut r = TestRange::new(b"a", b"z");
        for k in ["b", "c", "n", "x"] {
            r.send_one(header(10), Request::put(k.as_bytes().to_vec(), Value::from_string(k)))
                .unwrap();
        }
        let res = split(&mut r);
        let (left, right) = descs();
        let split = res.replicated.split.expect("split result");

        let left_actual = compute_range_stats(r.engine.as_ref(), &left, 50).unwrap();
        assert!(r.state.stats.equal_counters(&left_actual));
        let right_actual = compute_range_stats(r.engine.as_ref(), &right, 50).unwrap();
        assert!(split.rhs_delta.equal_counters(&right_actual));
        // n and x; the right-hand descriptor counts as system data.
        assert_eq!(right_actual.live_count, 2);

        let rhs_lease = StateLoader::new(2).load_lease(r.engine.as_ref()).unwrap();
        assert_eq!(rhs_lease.sequence, r.state.lease.sequence);
        assert_eq!(rhs_lease.replica.store_id, 1);
    }

    #[test]
    fn test_split_rejects_mismatched_bounds() {
        let mut r = TestRange::new(b"a", b"y");
        let (left, right) = descs();
        let anchor = keys::range_descriptor_key(b"a");
        let txn = Transaction::new("split", anchor.clone(), IsolationLevel::Serializable, 1, ts(50));
        let mut et = EndTxnRequest::commit(anchor, vec![]);
        et.commit_trigger = Some(CommitTrigger::Split(SplitTrigger {
            left_desc: left,
            right_desc: right,
        }));
        let err = r.send_one(txn_header(&txn), Request::EndTxn(et)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_merge_checks_descriptors() {
        let mut r = TestRange::new(b"a", b"m");
        let (_, right) = descs();
        let anchor = keys::range_descriptor_key(b"a");
        let txn = Transaction::new("merge", anchor.clone(), IsolationLevel::Serializable, 1, ts(50));
        let merged = RangeDescriptor::new(1, b"a".to_vec(), b"z".to_vec(), vec![ReplicaDescriptor::new(1, 1, 1)]);

        let trigger = |left_desc: RangeDescriptor| {
            let mut et = EndTxnRequest::commit(anchor.clone(), vec![]);
            et.commit_trigger = Some(CommitTrigger::Merge(MergeTrigger {
                left_desc,
                right_desc: right.clone(),
                right_stats: MvccStats {
                    live_count: 2,
                    key_count: 2,
                    ..Default::default()
                },
                freeze_start: ts(40),
            }));
            Request::EndTxn(et)
        };

        let mut short = merged.clone();
        short.end_key = b"m".to_vec();
        let err = r.send_one(txn_header(&txn), trigger(short)).unwrap_err();
        assert!(err.is_fatal());

        let before = r.state.stats;
        let ba = crate::api::BatchRequest::new(1, ts(50))
            .with_txn(txn)
            .add(trigger(merged));
        let (_, res) = r.send(ba).unwrap();
        assert!(res.replicated.merge.is_some());
        assert_eq!(r.state.stats.live_count, before.live_count + 2);
    }

    #[test]
    fn test_change_replicas_updates_descriptor() {
        let mut r = TestRange::new(b"", b"z");
        let mut desc = r.state.desc.clone();
        desc.add_replica(2, 2, ReplicaType::VoterFull);
        let anchor = keys::range_descriptor_key(b"");
        let txn = Transaction::new("change", anchor.clone(), IsolationLevel::Serializable, 1, ts(50));
        let mut et = EndTxnRequest::commit(anchor, vec![]);
        et.commit_trigger = Some(CommitTrigger::ChangeReplicas(ChangeReplicasTrigger {
            desc: desc.clone(),
        }));
        let ba = crate::api::BatchRequest::new(1, ts(50))
            .with_txn(txn)
            .add(Request::EndTxn(et));
        let (_, res) = r.send(ba).unwrap();
        assert_eq!(res.replicated.desc.as_ref(), Some(&desc));
        assert!(res.local.gossip_first_range);
        assert_eq!(r.state.desc.replicas().len(), 2);
    }
}
