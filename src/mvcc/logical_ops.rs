//! Logical MVCC operations
//!
//! Writes record what they did at the MVCC level alongside the physical
//! batch. Applied commands hand these to the rangefeed processor. Local keys
//! never produce logical operations.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hlc::Timestamp;
use crate::mvcc::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    /// A committed value was written directly.
    WriteValue {
        key: Vec<u8>,
        timestamp: Timestamp,
        value: Value,
        prev_value: Option<Value>,
    },
    /// A new intent was written.
    WriteIntent {
        txn_id: Uuid,
        txn_key: Vec<u8>,
        txn_min_timestamp: Timestamp,
        timestamp: Timestamp,
    },
    /// An intent's timestamp moved because its transaction was pushed.
    UpdateIntent { txn_id: Uuid, timestamp: Timestamp },
    /// A transaction rewrote its own intent, possibly at a higher timestamp.
    UpdateIntentTs {
        txn_id: Uuid,
        key: Vec<u8>,
        timestamp: Timestamp,
    },
    /// An intent was resolved into a committed value.
    CommitIntent {
        txn_id: Uuid,
        key: Vec<u8>,
        timestamp: Timestamp,
        value: Value,
        prev_value: Option<Value>,
    },
    /// An intent was removed.
    AbortIntent { txn_id: Uuid },
    /// Every intent of a transaction is known to be aborted.
    AbortTxn { txn_id: Uuid },
}

impl LogicalOp {
    /// Key and timestamp of a committed value carried by this op.
    pub fn committed_value(&self) -> Option<(&[u8], Timestamp)> {
        match self {
            LogicalOp::WriteValue { key, timestamp, .. }
            | LogicalOp::CommitIntent { key, timestamp, .. } => Some((key, *timestamp)),
            _ => None,
        }
    }

    /// Slot for the previous value of a committed write.
    pub fn prev_value_mut(&mut self) -> Option<&mut Option<Value>> {
        match self {
            LogicalOp::WriteValue { prev_value, .. }
            | LogicalOp::CommitIntent { prev_value, .. } => Some(prev_value),
            _ => None,
        }
    }

    pub fn txn_id(&self) -> Option<Uuid> {
        match self {
            LogicalOp::WriteValue { .. } => None,
            LogicalOp::WriteIntent { txn_id, .. }
            | LogicalOp::UpdateIntent { txn_id, .. }
            | LogicalOp::UpdateIntentTs { txn_id, .. }
            | LogicalOp::CommitIntent { txn_id, .. }
            | LogicalOp::AbortIntent { txn_id }
            | LogicalOp::AbortTxn { txn_id } => Some(*txn_id),
        }
    }
}
