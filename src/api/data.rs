//! Replicated range records: descriptors, leases, Raft state and commit
//! triggers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::api::{NodeId, RangeId, ReplicaId, Span, StoreId};
use crate::hlc::Timestamp;
use crate::keys;
use crate::mvcc::MvccStats;

/// Role of a replica in its Raft group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReplicaType {
    #[default]
    VoterFull,
    VoterIncoming,
    VoterOutgoing,
    Learner,
    NonVoter,
}

impl ReplicaType {
    pub fn is_voter(&self) -> bool {
        matches!(
            self,
            ReplicaType::VoterFull | ReplicaType::VoterIncoming | ReplicaType::VoterOutgoing
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub node_id: NodeId,
    pub store_id: StoreId,
    pub replica_id: ReplicaId,
    pub replica_type: ReplicaType,
}

impl ReplicaDescriptor {
    pub fn new(node_id: NodeId, store_id: StoreId, replica_id: ReplicaId) -> Self {
        Self {
            node_id,
            store_id,
            replica_id,
            replica_type: ReplicaType::VoterFull,
        }
    }
}

impl fmt::Display for ReplicaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(n{},s{}):", self.node_id, self.store_id)?;
        if self.replica_id == 0 {
            f.write_str("?")?;
        } else {
            write!(f, "{}", self.replica_id)?;
        }
        match self.replica_type {
            ReplicaType::VoterFull => Ok(()),
            ReplicaType::VoterIncoming => f.write_str("VOTER_INCOMING"),
            ReplicaType::VoterOutgoing => f.write_str("VOTER_OUTGOING"),
            ReplicaType::Learner => f.write_str("LEARNER"),
            ReplicaType::NonVoter => f.write_str("NON_VOTER"),
        }
    }
}

/// The canonical description of a range: its span and replica set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: RangeId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub internal_replicas: Vec<ReplicaDescriptor>,
    pub next_replica_id: ReplicaId,
    /// Incremented on every split and merge.
    pub generation: i64,
}

impl RangeDescriptor {
    pub fn new(
        range_id: RangeId,
        start_key: impl Into<Vec<u8>>,
        end_key: impl Into<Vec<u8>>,
        replicas: Vec<ReplicaDescriptor>,
    ) -> Self {
        let next_replica_id = replicas.iter().map(|r| r.replica_id).max().unwrap_or(0) + 1;
        Self {
            range_id,
            start_key: start_key.into(),
            end_key: end_key.into(),
            internal_replicas: replicas,
            next_replica_id,
            generation: 0,
        }
    }

    pub fn span(&self) -> Span {
        Span::new(self.start_key.clone(), self.end_key.clone())
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && key < self.end_key.as_slice()
    }

    /// True if the addressable span `[start, end)` lies within the range. An
    /// empty `end` checks the point `start`.
    pub fn contains_key_range(&self, start: &[u8], end: &[u8]) -> bool {
        if end.is_empty() {
            return self.contains_key(start);
        }
        start >= self.start_key.as_slice() && end <= self.end_key.as_slice() && start < end
    }

    pub fn replicas(&self) -> &[ReplicaDescriptor] {
        &self.internal_replicas
    }

    pub fn replica_for_store(&self, store_id: StoreId) -> Option<&ReplicaDescriptor> {
        self.internal_replicas.iter().find(|r| r.store_id == store_id)
    }

    pub fn replica_by_id(&self, replica_id: ReplicaId) -> Option<&ReplicaDescriptor> {
        self.internal_replicas
            .iter()
            .find(|r| r.replica_id == replica_id)
    }

    /// Add a replica on `(node_id, store_id)` with the next replica ID.
    pub fn add_replica(
        &mut self,
        node_id: NodeId,
        store_id: StoreId,
        replica_type: ReplicaType,
    ) -> ReplicaDescriptor {
        let replica = ReplicaDescriptor {
            node_id,
            store_id,
            replica_id: self.next_replica_id,
            replica_type,
        };
        self.next_replica_id += 1;
        self.internal_replicas.push(replica);
        replica
    }

    pub fn remove_replica(&mut self, node_id: NodeId, store_id: StoreId) -> Option<ReplicaDescriptor> {
        let pos = self
            .internal_replicas
            .iter()
            .position(|r| r.node_id == node_id && r.store_id == store_id)?;
        Some(self.internal_replicas.remove(pos))
    }

    pub fn is_initialized(&self) -> bool {
        !self.end_key.is_empty()
    }
}

impl fmt::Display for RangeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "r{}:{{{}-{}}} [",
            self.range_id,
            keys::pretty(&self.start_key),
            keys::pretty(&self.end_key)
        )?;
        for (i, r) in self.internal_replicas.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{r}")?;
        }
        write!(f, ", next={}, gen={}]", self.next_replica_id, self.generation)
    }
}

/// The right to serve reads and propose writes for a range.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Lease {
    pub start: Timestamp,
    /// End of an expiration-based lease.
    pub expiration: Option<Timestamp>,
    pub replica: ReplicaDescriptor,
    /// Liveness epoch of an epoch-based lease.
    pub epoch: i64,
    /// Incremented whenever the holder changes.
    pub sequence: i64,
    pub proposed_ts: Option<Timestamp>,
}

impl Lease {
    pub fn is_empty(&self) -> bool {
        self.replica.replica_id == 0 && self.sequence == 0
    }

    /// True if the lease is valid at `ts`.
    pub fn covers(&self, ts: Timestamp) -> bool {
        if self.is_empty() || ts < self.start {
            return false;
        }
        match self.expiration {
            Some(exp) => ts < exp,
            None => true,
        }
    }

    pub fn owned_by(&self, store_id: StoreId) -> bool {
        self.replica.store_id == store_id
    }

    /// Same holder with compatible terms; extensions are equivalent.
    pub fn equivalent(&self, other: &Lease) -> bool {
        self.replica.replica_id == other.replica.replica_id
            && self.replica.store_id == other.replica.store_id
            && self.start == other.start
            && self.epoch == other.epoch
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("<empty>");
        }
        write!(f, "repl={} seq={} start={}", self.replica, self.sequence, self.start)?;
        match self.expiration {
            Some(exp) => write!(f, " exp={exp}")?,
            None => write!(f, " epo={}", self.epoch)?,
        }
        if let Some(pro) = self.proposed_ts {
            write!(f, " pro={pro}")?;
        }
        Ok(())
    }
}

/// Raft log position below which entries are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RaftTruncatedState {
    pub index: u64,
    pub term: u64,
}

impl fmt::Display for RaftTruncatedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "index:{} term:{}", self.index, self.term)
    }
}

/// Where a range keeps its truncated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TruncatedStateType {
    /// In the replicated range-ID keyspace.
    Legacy,
    /// In the unreplicated range-ID keyspace.
    #[default]
    Unreplicated,
}

/// Applied indexes and stats fused into one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RangeAppliedState {
    pub raft_applied_index: u64,
    pub lease_applied_index: u64,
    pub range_stats: MvccStats,
}

impl fmt::Display for RangeAppliedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "raft_applied_index:{} lease_applied_index:{} range_stats:<{}>",
            self.raft_applied_index, self.lease_applied_index, self.range_stats
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

impl fmt::Display for HardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "term:{} vote:{} commit:{}", self.term, self.vote, self.commit)
    }
}

/// Marks a replica removed; replica IDs below `next_replica_id` are dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RaftTombstone {
    pub next_replica_id: ReplicaId,
}

impl fmt::Display for RaftTombstone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "next_replica_id:{}", self.next_replica_id)
    }
}

/// Side effect of committing a split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitTrigger {
    pub left_desc: RangeDescriptor,
    pub right_desc: RangeDescriptor,
}

/// Side effect of committing a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeTrigger {
    pub left_desc: RangeDescriptor,
    pub right_desc: RangeDescriptor,
    /// Stats of the subsumed range, including its range-ID local keys.
    pub right_stats: MvccStats,
    pub freeze_start: Timestamp,
}

/// Side effect of committing a replica set change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeReplicasTrigger {
    pub desc: RangeDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitTrigger {
    Split(SplitTrigger),
    Merge(MergeTrigger),
    ChangeReplicas(ChangeReplicasTrigger),
}

impl fmt::Display for CommitTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitTrigger::Split(t) => write!(f, "split {} | {}", t.left_desc, t.right_desc),
            CommitTrigger::Merge(t) => write!(f, "merge {} <- {}", t.left_desc, t.right_desc),
            CommitTrigger::ChangeReplicas(t) => write!(f, "change replicas {}", t.desc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_record, encode_record};

    fn desc() -> RangeDescriptor {
        RangeDescriptor::new(
            1,
            b"a".to_vec(),
            b"z".to_vec(),
            vec![ReplicaDescriptor::new(1, 1, 1)],
        )
    }

    #[test]
    fn test_descriptor_record_roundtrip() {
        let d = desc();
        let bytes = encode_record(&d).unwrap();
        assert_eq!(decode_record::<RangeDescriptor>(&bytes).unwrap(), d);
        assert_eq!(d.next_replica_id, 2);
    }

    #[test]
    fn test_descriptor_contains() {
        let d = desc();
        assert!(d.contains_key(b"a"));
        assert!(!d.contains_key(b"z"));
        assert!(d.contains_key_range(b"b", b"z"));
        assert!(!d.contains_key_range(b"b", b"zz"));
        assert!(d.contains_key_range(b"m", b""));
    }

    #[test]
    fn test_descriptor_replicas() {
        let mut d = desc();
        let added = d.add_replica(2, 2, ReplicaType::Learner);
        assert_eq!(added.replica_id, 2);
        assert_eq!(d.next_replica_id, 3);
        assert_eq!(d.replica_for_store(2), Some(&added));
        assert!(d.remove_replica(2, 2).is_some());
        assert!(d.replica_for_store(2).is_none());
        assert_eq!(d.to_string(), "r1:{\"a\"-\"z\"} [(n1,s1):1, next=3, gen=0]");
    }

    #[test]
    fn test_lease_covers() {
        let lease = Lease {
            start: Timestamp::from_wall(10),
            expiration: Some(Timestamp::from_wall(20)),
            replica: ReplicaDescriptor::new(1, 1, 1),
            sequence: 1,
            ..Default::default()
        };
        assert!(!lease.covers(Timestamp::from_wall(9)));
        assert!(lease.covers(Timestamp::from_wall(10)));
        assert!(!lease.covers(Timestamp::from_wall(20)));
        assert!(!Lease::default().covers(Timestamp::from_wall(15)));
    }
}
