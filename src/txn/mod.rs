//! Transactions
//!
//! Provides the transaction record and its status machine, the intent and
//! lock-update types exchanged with the MVCC layer, the per-range abort span
//! and the wait queue pushers block on.

mod abort_span;
mod transaction;
mod wait_queue;

pub use abort_span::{abort_span_entry, AbortSpan, AbortSpanEntry};
pub use transaction::{
    Intent, IsolationLevel, LockUpdate, SequencedWrite, Transaction, TxnMeta, TxnStatus,
    MAX_TXN_PRIORITY, MIN_TXN_PRIORITY,
};
pub use wait_queue::TxnWaitQueue;
