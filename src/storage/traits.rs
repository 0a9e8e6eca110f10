//! Engine capability traits
//!
//! Readers, writers and the composite read-writer are separate capabilities:
//! a snapshot only reads, the engine reads and commits whole batches, a batch
//! reads its own pending writes on top of the engine.

use std::sync::Arc;

use crate::mvcc::LogicalOp;
use crate::storage::error::StorageResult;
use crate::storage::iterator::EngineIterator;

/// A key-value pair
pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Ordered read access to raw engine keys.
pub trait Reader {
    /// Get a value by key
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// First entry with `key <= k < upper`. An empty `upper` is unbounded.
    fn seek_ge(&self, key: &[u8], upper: &[u8]) -> StorageResult<Option<KeyValue>>;

    /// Last entry with `lower <= k < key`. An empty `key` is unbounded.
    fn seek_lt(&self, key: &[u8], lower: &[u8]) -> StorageResult<Option<KeyValue>>;

    /// Visits entries in `[start, end)` in order until `f` returns false.
    fn iterate(
        &self,
        start: &[u8],
        end: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> StorageResult<bool>,
    ) -> StorageResult<()> {
        let mut cursor = start.to_vec();
        while let Some((key, value)) = self.seek_ge(&cursor, end)? {
            if !f(&key, &value)? {
                break;
            }
            cursor = key;
            cursor.push(0);
        }
        Ok(())
    }

    /// Collects entries in `[start, end)`.
    fn scan(&self, start: &[u8], end: &[u8]) -> StorageResult<Vec<KeyValue>> {
        let mut out = Vec::new();
        self.iterate(start, end, &mut |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            Ok(true)
        })?;
        Ok(out)
    }

    /// Cursor over `[lower, upper)` borrowing this reader.
    fn new_iterator(&self, lower: &[u8], upper: &[u8]) -> EngineIterator<&Self>
    where
        Self: Sized,
    {
        EngineIterator::new(self, lower, upper)
    }
}

/// Mutation of raw engine keys.
pub trait Writer {
    fn put(&mut self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    fn delete(&mut self, key: &[u8]) -> StorageResult<()>;

    /// Deletes a key written exactly once since its last deletion.
    fn single_delete(&mut self, key: &[u8]) -> StorageResult<()>;

    /// Combines `operand` with the existing value through the merge operator.
    fn merge(&mut self, key: &[u8], operand: &[u8]) -> StorageResult<()>;

    /// Deletes every key in `[start, end)`.
    fn clear_range(&mut self, start: &[u8], end: &[u8]) -> StorageResult<()>;

    /// Records a logical MVCC operation alongside the physical writes.
    fn log_logical_op(&mut self, _op: LogicalOp) {}
}

/// Reader and writer over the same state.
pub trait ReadWriter: Reader + Writer {}

impl<T: Reader + Writer + ?Sized> ReadWriter for T {}

impl<T: Reader + ?Sized> Reader for &T {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn seek_ge(&self, key: &[u8], upper: &[u8]) -> StorageResult<Option<KeyValue>> {
        (**self).seek_ge(key, upper)
    }

    fn seek_lt(&self, key: &[u8], lower: &[u8]) -> StorageResult<Option<KeyValue>> {
        (**self).seek_lt(key, lower)
    }
}

impl<T: Reader + ?Sized> Reader for Arc<T> {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn seek_ge(&self, key: &[u8], upper: &[u8]) -> StorageResult<Option<KeyValue>> {
        (**self).seek_ge(key, upper)
    }

    fn seek_lt(&self, key: &[u8], lower: &[u8]) -> StorageResult<Option<KeyValue>> {
        (**self).seek_lt(key, lower)
    }
}
