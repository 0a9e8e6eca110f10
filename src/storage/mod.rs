//! Storage engine subsystem
//!
//! Provides an ordered key-value store with atomic batches, point-in-time
//! snapshots, a merge operator and an optional write-ahead log. Every write
//! goes through a [`Batch`] whose byte representation is reproducible, so a
//! batch evaluated on one replica applies identically on all of them.

mod batch;
pub mod batch_repr;
mod engine;
pub mod error;
mod iterator;
mod merge;
pub mod traits;
pub mod wal;

pub use batch::{Batch, Distinct};
pub use batch_repr::{BatchBuilder, BatchEntry, BatchOp, BatchReader};
pub use engine::{Engine, Snapshot};
pub use error::{StorageError, StorageResult};
pub use iterator::EngineIterator;
pub use merge::merge_values;
pub use traits::{KeyValue, ReadWriter, Reader, Writer};
pub use wal::WalConfig;
