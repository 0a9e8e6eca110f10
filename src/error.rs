//! Error taxonomy.
//!
//! Every error carries a [`ErrorKind`] band: retriable errors are expected under
//! contention and are recovered by the transactional client; structural errors
//! mean the request cannot succeed against this range; fatal errors mean the
//! replica's state is corrupt and the replica must stop.

use std::fmt;

use thiserror::Error;

use crate::api::{Lease, RangeDescriptor, RangeId};
use crate::hlc::Timestamp;
use crate::storage::StorageError;
use crate::txn::{Intent, Transaction};

/// Result type for crate operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected under contention; back off, refresh or restart.
    Retriable,
    /// The operation cannot succeed against this range.
    Structural,
    /// Replica or cluster state is corrupt.
    Fatal,
    /// The request itself is invalid or its precondition failed.
    Request,
}

/// Why a transaction must retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RetryReason {
    /// Write timestamp was pushed past the read timestamp.
    Serializable,
    /// A write encountered a newer committed value.
    WriteTooOld,
    /// The commit deadline passed.
    DeadlineExceeded,
    /// A pipelined write could not be proven.
    AsyncWriteFailure,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetryReason::Serializable => "RETRY_SERIALIZABLE",
            RetryReason::WriteTooOld => "RETRY_WRITE_TOO_OLD",
            RetryReason::DeadlineExceeded => "RETRY_COMMIT_DEADLINE_EXCEEDED",
            RetryReason::AsyncWriteFailure => "RETRY_ASYNC_WRITE_FAILURE",
        };
        f.write_str(s)
    }
}

/// Why a transaction was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AbortReason {
    Unknown,
    /// A finalized record for the transaction was found.
    AbortedRecordFound,
    /// The client rolled back.
    ClientReject,
    /// Another transaction aborted this one.
    PusherAborted,
    /// The abort span holds an entry for the transaction.
    AbortSpan,
    /// A lease change happened after the transaction started.
    NewLeasePreventsTxn,
    /// The timestamp cache prevents creating the record.
    TimestampCacheRejected,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortReason::Unknown => "ABORT_REASON_UNKNOWN",
            AbortReason::AbortedRecordFound => "ABORT_REASON_ABORTED_RECORD_FOUND",
            AbortReason::ClientReject => "ABORT_REASON_CLIENT_REJECT",
            AbortReason::PusherAborted => "ABORT_REASON_PUSHER_ABORTED",
            AbortReason::AbortSpan => "ABORT_REASON_ABORT_SPAN",
            AbortReason::NewLeasePreventsTxn => "ABORT_REASON_NEW_LEASE_PREVENTS_TXN",
            AbortReason::TimestampCacheRejected => "ABORT_REASON_TIMESTAMP_CACHE_REJECTED",
        };
        f.write_str(s)
    }
}

/// Why a rangefeed registration was disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeFeedRetryReason {
    ReplicaRemoved,
    RangeSplit,
    RangeMerged,
    /// The registration's buffer overflowed.
    BufferCapacityExceeded,
    /// The processor could not keep up with the apply loop.
    SlowProcessor,
    /// Logical ops were not available for an applied command.
    LogicalOpsMissing,
}

impl fmt::Display for RangeFeedRetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RangeFeedRetryReason::ReplicaRemoved => "REASON_REPLICA_REMOVED",
            RangeFeedRetryReason::RangeSplit => "REASON_RANGE_SPLIT",
            RangeFeedRetryReason::RangeMerged => "REASON_RANGE_MERGED",
            RangeFeedRetryReason::BufferCapacityExceeded => "REASON_BUFFER_CAPACITY_EXCEEDED",
            RangeFeedRetryReason::SlowProcessor => "REASON_SLOW_CONSUMER",
            RangeFeedRetryReason::LogicalOpsMissing => "REASON_LOGICAL_OPS_MISSING",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone)]
pub enum Error {
    // ---- retriable ----
    #[error("conflicting intents on {}", fmt_intent_keys(.intents))]
    WriteIntentConflict { intents: Vec<Intent> },

    #[error("write at timestamp {timestamp} too old; existing version at {existing_timestamp}")]
    WriteTooOld {
        timestamp: Timestamp,
        existing_timestamp: Timestamp,
    },

    #[error("transaction retry ({reason}): {message}")]
    TransactionRetry { reason: RetryReason, message: String },

    #[error("transaction aborted ({reason})")]
    TransactionAborted {
        reason: AbortReason,
        txn: Option<Box<Transaction>>,
    },

    #[error("failed to push transaction {}", .pushee.short_id())]
    TransactionPushFailed { pushee: Box<Transaction> },

    #[error("intent missing on key {}", crate::keys::pretty(.key))]
    IntentMissing { key: Vec<u8>, intent: Option<Intent> },

    #[error("result is ambiguous: {0}")]
    AmbiguousResult(String),

    #[error("rangefeed retry: {reason}")]
    RangefeedRetry { reason: RangeFeedRetryReason },

    // ---- structural ----
    #[error(
        "key range {}-{} outside of bounds of range {}",
        crate::keys::pretty(.requested_start),
        crate::keys::pretty(.requested_end),
        fmt_desc(.desc)
    )]
    RangeKeyMismatch {
        requested_start: Vec<u8>,
        requested_end: Vec<u8>,
        desc: Option<Box<RangeDescriptor>>,
    },

    #[error("r{range_id} was not found")]
    RangeNotFound { range_id: RangeId },

    #[error("r{range_id}: replica not lease holder; current lease is {}", fmt_lease(.lease))]
    NotLeaseHolder {
        range_id: RangeId,
        lease: Option<Box<Lease>>,
    },

    #[error("batch timestamp {timestamp} must be after replica GC threshold {threshold}")]
    BelowGcThreshold {
        timestamp: Timestamp,
        threshold: Timestamp,
    },

    #[error("r{range_id} was merged into its left-hand neighbor")]
    MergedRange { range_id: RangeId },

    // ---- fatal ----
    #[error("replica corruption: {0}")]
    ReplicaCorruption(String),

    #[error("assertion failed: {0}")]
    Assertion(String),

    // ---- request ----
    #[error("transaction status error: {message}")]
    TransactionStatus {
        message: String,
        txn: Option<Box<Transaction>>,
    },

    #[error("unexpected value: {}", fmt_actual(.actual))]
    ConditionFailed { actual: Option<Vec<u8>> },

    #[error("invalid checksum for key {}: expected {expected:#010x}, computed {computed:#010x}", crate::keys::pretty(.key))]
    InvalidChecksum {
        key: Vec<u8>,
        expected: u32,
        computed: u32,
    },

    #[error("cannot replace lease {existing} with {requested}: {message}")]
    LeaseRejected {
        message: String,
        requested: Box<Lease>,
        existing: Box<Lease>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// The band this error belongs to. Wrapped errors report their cause's band.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WriteIntentConflict { .. }
            | Error::WriteTooOld { .. }
            | Error::TransactionRetry { .. }
            | Error::TransactionAborted { .. }
            | Error::TransactionPushFailed { .. }
            | Error::IntentMissing { .. }
            | Error::AmbiguousResult(_)
            | Error::RangefeedRetry { .. } => ErrorKind::Retriable,
            Error::RangeKeyMismatch { .. }
            | Error::RangeNotFound { .. }
            | Error::NotLeaseHolder { .. }
            | Error::BelowGcThreshold { .. }
            | Error::MergedRange { .. } => ErrorKind::Structural,
            Error::ReplicaCorruption(_) | Error::Assertion(_) => ErrorKind::Fatal,
            Error::Storage(e) if e.is_corruption() => ErrorKind::Fatal,
            Error::TransactionStatus { .. }
            | Error::ConditionFailed { .. }
            | Error::InvalidChecksum { .. }
            | Error::LeaseRejected { .. }
            | Error::InvalidArgument(_)
            | Error::Codec(_)
            | Error::Cancelled
            | Error::Storage(_) => ErrorKind::Request,
            Error::Wrapped { source, .. } => source.kind(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind() == ErrorKind::Retriable
    }

    pub fn is_structural(&self) -> bool {
        self.kind() == ErrorKind::Structural
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// Wraps the error with context, keeping it as the cause.
    pub fn context(self, context: impl Into<String>) -> Error {
        Error::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error of a wrap chain.
    pub fn root(&self) -> &Error {
        match self {
            Error::Wrapped { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn assertion(msg: impl Into<String>) -> Error {
        Error::Assertion(msg.into())
    }

    pub fn retry(reason: RetryReason, message: impl Into<String>) -> Error {
        Error::TransactionRetry {
            reason,
            message: message.into(),
        }
    }

    pub fn status(message: impl Into<String>, txn: Option<&Transaction>) -> Error {
        Error::TransactionStatus {
            message: message.into(),
            txn: txn.map(|t| Box::new(t.clone())),
        }
    }
}

fn fmt_intent_keys(intents: &[Intent]) -> String {
    let keys: Vec<String> = intents
        .iter()
        .map(|i| crate::keys::pretty(&i.key))
        .collect();
    format!("[{}]", keys.join(", "))
}

fn fmt_desc(desc: &Option<Box<RangeDescriptor>>) -> String {
    match desc {
        Some(d) => d.to_string(),
        None => "<unknown>".to_string(),
    }
}

fn fmt_lease(lease: &Option<Box<Lease>>) -> String {
    match lease {
        Some(l) => l.to_string(),
        None => "<none>".to_string(),
    }
}

fn fmt_actual(actual: &Option<Vec<u8>>) -> String {
    match actual {
        Some(v) => crate::keys::pretty(v),
        None => "<nil>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bands() {
        let e = Error::WriteTooOld {
            timestamp: Timestamp::from_wall(90),
            existing_timestamp: Timestamp::from_wall(100),
        };
        assert!(e.is_retriable());
        assert!(Error::RangeNotFound { range_id: 7 }.is_structural());
        assert!(Error::assertion("epoch regression").is_fatal());
        assert_eq!(
            Error::ConditionFailed { actual: None }.kind(),
            ErrorKind::Request
        );
    }

    #[test]
    fn test_wrapped_keeps_kind_and_root() {
        let e = Error::RangeNotFound { range_id: 3 }.context("routing batch");
        assert!(e.is_structural());
        assert!(matches!(e.root(), Error::RangeNotFound { range_id: 3 }));
        assert_eq!(e.to_string(), "routing batch: r3 was not found");
    }

    #[test]
    fn test_storage_corruption_is_fatal() {
        let e: Error = StorageError::Corrupted("bad block".into()).into();
        assert!(e.is_fatal());
        let e: Error = StorageError::Closed.into();
        assert_eq!(e.kind(), ErrorKind::Request);
    }
}
