//! Transaction records and related types
//!
//! # Isolation Levels
//!
//! | Level | Behavior |
//! |-------|----------|
//! | `SERIALIZABLE` | Default. Commit fails with a retry error if the write timestamp was pushed past the read timestamp |
//! | `READ COMMITTED` | The read timestamp may move per statement; a pushed write timestamp does not force a retry |
//!
//! # Status
//!
//! ```text
//! pending ──► staging ──► committed
//!    │           │
//!    └───────────┴──────► aborted
//! ```
//!
//! A staging transaction is implicitly committed once every in-flight write
//! is proven present; recovery makes that explicit.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{merge_spans, Span};
use crate::hlc::Timestamp;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Default. The transaction commits at a single timestamp.
    #[default]
    Serializable,

    /// Reads see data committed before each statement.
    ReadCommitted,
}

impl IsolationLevel {
    /// Parse from SQL string (case-insensitive)
    pub fn from_sql(s: &str) -> Option<Self> {
        match s.to_uppercase().replace('-', " ").as_str() {
            "READ COMMITTED" => Some(Self::ReadCommitted),
            "SERIALIZABLE" => Some(Self::Serializable),
            _ => None,
        }
    }

    /// Convert to SQL string
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ-COMMITTED",
            Self::Serializable => "SERIALIZABLE",
        }
    }

    /// Whether a pushed write timestamp forces a retry at commit.
    pub fn requires_fixed_timestamp(&self) -> bool {
        matches!(self, Self::Serializable)
    }
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub enum TxnStatus {
    #[default]
    Pending,
    /// Parallel commit in progress.
    Staging,
    Committed,
    Aborted,
}

impl TxnStatus {
    /// Committed or aborted.
    pub fn is_finalized(&self) -> bool {
        matches!(self, TxnStatus::Committed | TxnStatus::Aborted)
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnStatus::Pending => "PENDING",
            TxnStatus::Staging => "STAGING",
            TxnStatus::Committed => "COMMITTED",
            TxnStatus::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

pub const MIN_TXN_PRIORITY: i32 = 0;
pub const MAX_TXN_PRIORITY: i32 = i32::MAX;

/// The part of a transaction stored in every intent it writes.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnMeta {
    pub id: Uuid,
    /// Anchor key; the transaction record lives on this key's range.
    pub key: Vec<u8>,
    pub isolation: IsolationLevel,
    pub epoch: u32,
    pub write_timestamp: Timestamp,
    /// Lowest timestamp the transaction ever had.
    pub min_timestamp: Timestamp,
    pub priority: i32,
    pub sequence: i32,
}

impl TxnMeta {
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for TxnMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id={} key={} iso={} pri={} epo={} ts={} min={} seq={}",
            self.short_id(),
            crate::keys::pretty(&self.key),
            self.isolation.to_sql(),
            self.priority,
            self.epoch,
            self.write_timestamp,
            self.min_timestamp,
            self.sequence
        )
    }
}

impl fmt::Debug for TxnMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A write whose success is not yet proven, for parallel commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequencedWrite {
    pub key: Vec<u8>,
    pub sequence: i32,
}

/// A transaction, as carried in request headers and stored as its record.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub meta: TxnMeta,
    pub name: String,
    pub status: TxnStatus,
    pub read_timestamp: Timestamp,
    pub last_heartbeat: Timestamp,
    /// A write encountered a newer committed value and was pushed.
    pub write_too_old: bool,
    /// Spans holding the transaction's intents.
    pub lock_spans: Vec<Span>,
    /// Writes not yet proven, while staging.
    pub in_flight_writes: Vec<SequencedWrite>,
}

impl Transaction {
    /// A new pending transaction anchored at `key`.
    pub fn new(
        name: impl Into<String>,
        key: impl Into<Vec<u8>>,
        isolation: IsolationLevel,
        priority: i32,
        now: Timestamp,
    ) -> Self {
        Self {
            meta: TxnMeta {
                id: Uuid::new_v4(),
                key: key.into(),
                isolation,
                epoch: 0,
                write_timestamp: now,
                min_timestamp: now,
                priority,
                sequence: 0,
            },
            name: name.into(),
            status: TxnStatus::Pending,
            read_timestamp: now,
            last_heartbeat: Timestamp::ZERO,
            write_too_old: false,
            lock_spans: Vec::new(),
            in_flight_writes: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.meta.id
    }

    pub fn short_id(&self) -> String {
        self.meta.short_id()
    }

    pub fn write_timestamp(&self) -> Timestamp {
        self.meta.write_timestamp
    }

    pub fn is_finalized(&self) -> bool {
        self.status.is_finalized()
    }

    /// Next statement sequence.
    pub fn step(&mut self) -> i32 {
        self.meta.sequence += 1;
        self.meta.sequence
    }

    /// Restart at a new epoch from `ts`.
    pub fn restart(&mut self, ts: Timestamp) {
        self.meta.epoch += 1;
        self.meta.sequence = 0;
        self.meta.write_timestamp.forward(ts);
        self.read_timestamp = self.meta.write_timestamp;
        self.write_too_old = false;
        self.in_flight_writes.clear();
    }

    /// Liveness anchor: last heartbeat, or the minimum timestamp if none.
    pub fn last_active(&self) -> Timestamp {
        let mut ts = self.meta.min_timestamp;
        ts.forward(self.last_heartbeat);
        ts
    }

    /// Fold newer knowledge about the same transaction into `self`.
    pub fn update(&mut self, other: &Transaction) {
        if other.meta.id != self.meta.id {
            return;
        }
        if other.meta.epoch > self.meta.epoch {
            self.meta.epoch = other.meta.epoch;
            self.meta.sequence = other.meta.sequence;
            self.status = other.status;
            self.in_flight_writes = other.in_flight_writes.clone();
        } else if other.meta.epoch == self.meta.epoch {
            if !self.status.is_finalized() {
                self.status = other.status;
                if other.status == TxnStatus::Staging {
                    self.in_flight_writes = other.in_flight_writes.clone();
                }
            }
            self.meta.sequence = self.meta.sequence.max(other.meta.sequence);
        }
        self.meta.write_timestamp.forward(other.meta.write_timestamp);
        self.read_timestamp.forward(other.read_timestamp);
        self.last_heartbeat.forward(other.last_heartbeat);
        self.meta.min_timestamp.backward(other.meta.min_timestamp);
        self.meta.priority = self.meta.priority.max(other.meta.priority);
        self.write_too_old |= other.write_too_old;
        if !other.lock_spans.is_empty() {
            let mut spans = std::mem::take(&mut self.lock_spans);
            spans.extend(other.lock_spans.iter().cloned());
            self.lock_spans = merge_spans(spans);
        }
    }

    /// Record a span holding an intent.
    pub fn add_lock_span(&mut self, span: Span) {
        let mut spans = std::mem::take(&mut self.lock_spans);
        spans.push(span);
        self.lock_spans = merge_spans(spans);
    }

    /// The record as stored at the anchor key: no sequence-level detail.
    pub fn as_record(&self) -> Transaction {
        let mut record = self.clone();
        record.meta.sequence = 0;
        record.write_too_old = false;
        record
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.name.is_empty() {
            write!(f, "{:?} ", self.name)?;
        }
        write!(
            f,
            "meta={{{}}} stat={} rts={} wto={} lock={} inflight={}",
            self.meta,
            self.status,
            self.read_timestamp,
            self.write_too_old,
            !self.lock_spans.is_empty(),
            self.in_flight_writes.len()
        )
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// An intent on a key, as reported in conflicts.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub key: Vec<u8>,
    pub txn: TxnMeta,
}

impl Intent {
    pub fn new(key: Vec<u8>, txn: TxnMeta) -> Self {
        Self { key, txn }
    }
}

impl fmt::Debug for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{{}}}", crate::keys::pretty(&self.key), self.txn)
    }
}

/// The final (or pushed) state of a transaction, applied to its intents
/// in a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockUpdate {
    pub span: Span,
    pub txn: TxnMeta,
    pub status: TxnStatus,
}

impl LockUpdate {
    pub fn new(txn: &Transaction, span: Span) -> Self {
        Self {
            span,
            txn: txn.meta.clone(),
            status: txn.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_parsing() {
        assert_eq!(
            IsolationLevel::from_sql("read-committed"),
            Some(IsolationLevel::ReadCommitted)
        );
        assert_eq!(
            IsolationLevel::from_sql("serializable"),
            Some(IsolationLevel::Serializable)
        );
        assert_eq!(IsolationLevel::from_sql("REPEATABLE READ"), None);
        assert_eq!(IsolationLevel::Serializable.to_sql(), "SERIALIZABLE");
    }

    #[test]
    fn test_restart_bumps_epoch() {
        let mut txn = Transaction::new(
            "t",
            b"a".to_vec(),
            IsolationLevel::Serializable,
            1,
            Timestamp::from_wall(10),
        );
        txn.step();
        txn.restart(Timestamp::from_wall(20));
        assert_eq!(txn.meta.epoch, 1);
        assert_eq!(txn.meta.sequence, 0);
        assert_eq!(txn.read_timestamp, Timestamp::from_wall(20));
        assert_eq!(txn.meta.min_timestamp, Timestamp::from_wall(10));
    }

    #[test]
    fn test_update_keeps_finalized_status() {
        let now = Timestamp::from_wall(10);
        let mut txn = Transaction::new("t", b"a".to_vec(), IsolationLevel::Serializable, 1, now);
        let mut other = txn.clone();
        other.status = TxnStatus::Committed;
        other.meta.write_timestamp = Timestamp::from_wall(15);
        txn.update(&other);
        assert_eq!(txn.status, TxnStatus::Committed);
        assert_eq!(txn.write_timestamp(), Timestamp::from_wall(15));

        let mut stale = txn.clone();
        stale.status = TxnStatus::Pending;
        txn.update(&stale);
        assert_eq!(txn.status, TxnStatus::Committed);
    }

    #[test]
    fn test_lock_spans_merge() {
        let mut txn = Transaction::default();
        txn.add_lock_span(Span::new(b"a".to_vec(), b"c".to_vec()));
        txn.add_lock_span(Span::new(b"b".to_vec(), b"d".to_vec()));
        assert_eq!(txn.lock_spans, vec![Span::new(b"a".to_vec(), b"d".to_vec())]);
    }
}
