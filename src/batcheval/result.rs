//! Evaluation results
//!
//! A command's effects beyond its response split in two. The replicated part
//! travels inside the Raft command and is applied identically on every
//! replica; the local part only concerns the proposing leaseholder.

use serde::{Deserialize, Serialize};

use crate::api::{ChangeReplicasTrigger, Lease, MergeTrigger, RangeDescriptor, SplitTrigger};
use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::mvcc::MvccStats;
use crate::txn::{LockUpdate, Transaction};

/// A split as applied below Raft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitResult {
    pub trigger: SplitTrigger,
    /// Absolute stats of the new right-hand range.
    pub rhs_delta: MvccStats,
}

/// Side effects carried in the Raft command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedResult {
    /// Stats change of this range.
    pub delta: MvccStats,
    pub split: Option<SplitResult>,
    pub merge: Option<MergeTrigger>,
    pub change_replicas: Option<ChangeReplicasTrigger>,
    /// Descriptor replacing the replica's in-memory one.
    pub desc: Option<RangeDescriptor>,
    /// Newly installed lease.
    pub lease: Option<Lease>,
    pub gc_threshold: Option<Timestamp>,
    pub txn_span_gc_threshold: Option<Timestamp>,
}

impl ReplicatedResult {
    /// True if applying requires more than writing the batch and stats.
    pub fn has_side_effects(&self) -> bool {
        self.split.is_some()
            || self.merge.is_some()
            || self.change_replicas.is_some()
            || self.desc.is_some()
            || self.lease.is_some()
            || self.gc_threshold.is_some()
            || self.txn_span_gc_threshold.is_some()
    }
}

/// Side effects handled by the proposer once the command applies.
#[derive(Debug, Clone, Default)]
pub struct LocalResult {
    /// Transaction records written, for the wait queue.
    pub updated_txns: Vec<Transaction>,
    /// Intents resolved by this command.
    pub resolved_locks: Vec<LockUpdate>,
    /// Intents outside the range left for asynchronous resolution.
    pub external_locks: Vec<LockUpdate>,
    pub maybe_add_to_split_queue: bool,
    pub gossip_first_range: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EvalResult {
    pub replicated: ReplicatedResult,
    pub local: LocalResult,
}

impl EvalResult {
    pub fn with_updated_txn(txn: Transaction) -> Self {
        let mut r = Self::default();
        r.local.updated_txns.push(txn);
        r
    }

    /// Folds `other` into `self`. Two commands of one batch may not both
    /// carry the same structural side effect.
    pub fn merge(&mut self, other: EvalResult) -> Result<()> {
        let EvalResult { replicated, local } = other;

        self.replicated.delta.add(&replicated.delta);
        merge_unique(&mut self.replicated.split, replicated.split, "split")?;
        merge_unique(&mut self.replicated.merge, replicated.merge, "merge")?;
        merge_unique(
            &mut self.replicated.change_replicas,
            replicated.change_replicas,
            "change replicas",
        )?;
        merge_unique(&mut self.replicated.desc, replicated.desc, "descriptor update")?;
        merge_unique(&mut self.replicated.lease, replicated.lease, "lease")?;
        if let Some(ts) = replicated.gc_threshold {
            self.replicated
                .gc_threshold
                .get_or_insert(Timestamp::ZERO)
                .forward(ts);
        }
        if let Some(ts) = replicated.txn_span_gc_threshold {
            self.replicated
                .txn_span_gc_threshold
                .get_or_insert(Timestamp::ZERO)
                .forward(ts);
        }

        self.local.updated_txns.extend(local.updated_txns);
        self.local.resolved_locks.extend(local.resolved_locks);
        self.local.external_locks.extend(local.external_locks);
        self.local.maybe_add_to_split_queue |= local.maybe_add_to_split_queue;
        self.local.gossip_first_range |= local.gossip_first_range;
        Ok(())
    }
}

fn merge_unique<T>(dst: &mut Option<T>, src: Option<T>, what: &str) -> Result<()> {
    if let Some(v) = src {
        if dst.is_some() {
            return Err(Error::assertion(format!(
                "conflicting {what} side effects in one batch"
            )));
        }
        *dst = Some(v);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_accumulates() {
        let mut a = EvalResult::default();
        a.replicated.delta.live_count = 1;
        a.replicated.gc_threshold = Some(Timestamp::from_wall(5));
        let mut b = EvalResult::with_updated_txn(Transaction::default());
        b.replicated.delta.live_count = 2;
        b.replicated.gc_threshold = Some(Timestamp::from_wall(3));
        b.local.maybe_add_to_split_queue = true;

        a.merge(b).unwrap();
        assert_eq!(a.replicated.delta.live_count, 3);
        assert_eq!(a.replicated.gc_threshold, Some(Timestamp::from_wall(5)));
        assert_eq!(a.local.updated_txns.len(), 1);
        assert!(a.local.maybe_add_to_split_queue);
        assert!(a.replicated.has_side_effects());
    }

    #[test]
    fn test_conflicting_side_effects() {
        let mut a = EvalResult::default();
        a.replicated.lease = Some(Lease::default());
        let mut b = EvalResult::default();
        b.replicated.lease = Some(Lease::default());
        assert!(a.merge(b).unwrap_err().is_fatal());
    }
}
