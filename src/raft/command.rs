//! Raft command envelopes
//!
//! A proposal carries everything a follower needs to reach the same state as
//! the leaseholder without re-evaluating: the byte-exact write batch, the
//! replicated side effects and the logical ops for rangefeeds.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::api::{RangeId, ReplicaDescriptor};
use crate::batcheval::ReplicatedResult;
use crate::codec;
use crate::error::Result;
use crate::mvcc::LogicalOp;
use crate::storage::BatchReader;

/// Identifies a proposal so the applying replica can hand the outcome back
/// to the waiting proposer.
pub type CommandId = u64;

/// Encoded write batch of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub data: Vec<u8>,
}

impl WriteBatch {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Number of entries in the batch.
    pub fn count(&self) -> Result<u32> {
        Ok(BatchReader::entry_count(&self.data)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftCommand {
    /// Sequence of the lease the proposer held when evaluating. A command
    /// proposed under a different lease is rejected at apply time.
    pub proposer_lease_sequence: i64,
    /// The command applies only while the range's lease applied index is
    /// below this value, which rules out reordering and reapplication.
    pub max_lease_index: u64,
    pub write_batch: Option<WriteBatch>,
    pub replicated: ReplicatedResult,
    pub logical_ops: Vec<LogicalOp>,
}

impl RaftCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        codec::encode_record(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        codec::decode_record(bytes)
    }

    /// True for lease requests and transfers, which are checked against the
    /// lease they replace rather than the proposer's lease sequence.
    pub fn is_lease_request(&self) -> bool {
        self.replicated.lease.is_some()
    }
}

impl fmt::Display for RaftCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lease_seq={} max_lease_index={} ops={}",
            self.proposer_lease_sequence,
            self.max_lease_index,
            self.logical_ops.len()
        )?;
        if let Some(wb) = &self.write_batch {
            write!(f, " batch={}B", wb.data.len())?;
        }
        if self.replicated.split.is_some() {
            f.write_str(" split")?;
        }
        if self.replicated.merge.is_some() {
            f.write_str(" merge")?;
        }
        if self.replicated.change_replicas.is_some() {
            f.write_str(" change-replicas")?;
        }
        if let Some(lease) = &self.replicated.lease {
            write!(f, " lease={lease}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeType {
    AddNode,
    RemoveNode,
    AddLearnerNode,
}

/// Membership change of a range's Raft group. The context command carries
/// the descriptor update and applies like any other command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfChange {
    pub change_type: ConfChangeType,
    pub replica: ReplicaDescriptor,
    pub context: RaftCommand,
}

/// Payload of a store Raft log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Appended by a new leader
    Noop,
    Range {
        range_id: RangeId,
        cmd_id: CommandId,
        command: RaftCommand,
    },
    ConfChange {
        range_id: RangeId,
        cmd_id: CommandId,
        change: ConfChange,
    },
}

impl Command {
    pub fn range_id(&self) -> Option<RangeId> {
        match self {
            Command::Noop => None,
            Command::Range { range_id, .. } | Command::ConfChange { range_id, .. } => {
                Some(*range_id)
            }
        }
    }

    /// The replicated command to apply, if any.
    pub fn raft_command(&self) -> Option<(RangeId, CommandId, &RaftCommand)> {
        match self {
            Command::Noop => None,
            Command::Range {
                range_id,
                cmd_id,
                command,
            } => Some((*range_id, *cmd_id, command)),
            Command::ConfChange {
                range_id,
                cmd_id,
                change,
            } => Some((*range_id, *cmd_id, &change.context)),
        }
    }
}

/// Response from applying a command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommandResponse {
    Ok,
    /// The command was rejected below Raft and applied as a no-op.
    Rejected(String),
}
