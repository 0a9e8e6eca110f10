//! Write batches
//!
//! A [`Batch`] buffers writes over an engine. Reads through the batch see its
//! own pending writes layered on the engine's current state. Commit applies
//! the byte-exact representation to the engine in one step.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::mvcc::LogicalOp;
use crate::storage::batch_repr::{BatchBuilder, BatchOp, BatchReader};
use crate::storage::engine::Engine;
use crate::storage::error::StorageResult;
use crate::storage::merge::merge_values;
use crate::storage::traits::{KeyValue, Reader, Writer};

type Overlay = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Pending writes over an engine.
pub struct Batch {
    engine: Arc<Engine>,
    builder: BatchBuilder,
    pending: Overlay,
    logical_ops: Vec<LogicalOp>,
}

impl Batch {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            builder: BatchBuilder::new(),
            pending: Overlay::new(),
            logical_ops: Vec::new(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Byte-exact representation of the writes so far.
    pub fn repr(&self) -> Vec<u8> {
        self.builder.encode()
    }

    /// Number of write operations buffered
    pub fn count(&self) -> u32 {
        self.builder.count()
    }

    pub fn is_empty(&self) -> bool {
        self.builder.is_empty()
    }

    /// Replays an encoded batch into this batch.
    pub fn apply_repr(&mut self, repr: &[u8]) -> StorageResult<()> {
        for entry in BatchReader::new(repr)? {
            let entry = entry?;
            match entry.op {
                BatchOp::Value => self.put(entry.key, entry.value)?,
                BatchOp::Deletion => self.delete(entry.key)?,
                BatchOp::SingleDeletion => self.single_delete(entry.key)?,
                BatchOp::Merge => self.merge(entry.key, entry.value)?,
            }
        }
        Ok(())
    }

    /// Logical MVCC operations recorded so far
    pub fn logical_ops(&self) -> &[LogicalOp] {
        &self.logical_ops
    }

    pub fn take_logical_ops(&mut self) -> Vec<LogicalOp> {
        std::mem::take(&mut self.logical_ops)
    }

    /// Scoped read-writer over this batch. The borrow prevents any other use of
    /// the batch until the handle is dropped.
    pub fn distinct(&mut self) -> Distinct<'_> {
        Distinct { batch: self }
    }

    /// Applies the batch to the engine atomically.
    pub fn commit(self) -> StorageResult<()> {
        if self.builder.is_empty() {
            return Ok(());
        }
        self.engine.apply_batch_repr(&self.builder.encode())
    }

    fn overlay_ge(&self, key: &[u8], upper: &[u8]) -> Option<(&Vec<u8>, &Option<Vec<u8>>)> {
        let (k, v) = self
            .pending
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .next()?;
        if !upper.is_empty() && k.as_slice() >= upper {
            return None;
        }
        Some((k, v))
    }

    fn overlay_lt(&self, key: &[u8], lower: &[u8]) -> Option<(&Vec<u8>, &Option<Vec<u8>>)> {
        let end = if key.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(key)
        };
        let (k, v) = self
            .pending
            .range::<[u8], _>((Bound::Unbounded, end))
            .next_back()?;
        if k.as_slice() < lower {
            return None;
        }
        Some((k, v))
    }
}

impl Reader for Batch {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        match self.pending.get(key) {
            Some(v) => Ok(v.clone()),
            None => self.engine.get(key),
        }
    }

    fn seek_ge(&self, key: &[u8], upper: &[u8]) -> StorageResult<Option<KeyValue>> {
        let mut cursor = key.to_vec();
        loop {
            let base = self.engine.seek_ge(&cursor, upper)?;
            let Some((ok, ov)) = self.overlay_ge(&cursor, upper) else {
                return Ok(base);
            };
            if let Some((bk, bv)) = base {
                if bk < *ok {
                    return Ok(Some((bk, bv)));
                }
            }
            match ov {
                Some(v) => return Ok(Some((ok.clone(), v.clone()))),
                None => {
                    cursor = ok.clone();
                    cursor.push(0);
                }
            }
        }
    }

    fn seek_lt(&self, key: &[u8], lower: &[u8]) -> StorageResult<Option<KeyValue>> {
        let mut cursor = key.to_vec();
        loop {
            let base = self.engine.seek_lt(&cursor, lower)?;
            let Some((ok, ov)) = self.overlay_lt(&cursor, lower) else {
                return Ok(base);
            };
            if let Some((bk, bv)) = base {
                if bk > *ok {
                    return Ok(Some((bk, bv)));
                }
            }
            match ov {
                Some(v) => return Ok(Some((ok.clone(), v.clone()))),
                None => cursor = ok.clone(),
            }
        }
    }
}

impl Writer for Batch {
    fn put(&mut self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.builder.put(key, value);
        self.pending.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> StorageResult<()> {
        self.builder.delete(key);
        self.pending.insert(key.to_vec(), None);
        Ok(())
    }

    fn single_delete(&mut self, key: &[u8]) -> StorageResult<()> {
        self.builder.single_delete(key);
        self.pending.insert(key.to_vec(), None);
        Ok(())
    }

    fn merge(&mut self, key: &[u8], operand: &[u8]) -> StorageResult<()> {
        let existing = self.get(key)?;
        let merged = merge_values(existing.as_deref(), operand)?;
        self.builder.merge(key, operand);
        self.pending.insert(key.to_vec(), Some(merged));
        Ok(())
    }

    fn clear_range(&mut self, start: &[u8], end: &[u8]) -> StorageResult<()> {
        let keys: Vec<Vec<u8>> = self.scan(start, end)?.into_iter().map(|(k, _)| k).collect();
        for key in keys {
            self.delete(&key)?;
        }
        Ok(())
    }

    fn log_logical_op(&mut self, op: LogicalOp) {
        self.logical_ops.push(op);
    }
}

/// Short-lived read-writer borrowed from a [`Batch`].
pub struct Distinct<'a> {
    batch: &'a mut Batch,
}

impl Reader for Distinct<'_> {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.batch.get(key)
    }

    fn seek_ge(&self, key: &[u8], upper: &[u8]) -> StorageResult<Option<KeyValue>> {
        self.batch.seek_ge(key, upper)
    }

    fn seek_lt(&self, key: &[u8], lower: &[u8]) -> StorageResult<Option<KeyValue>> {
        self.batch.seek_lt(key, lower)
    }
}

impl Writer for Distinct<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.batch.put(key, value)
    }

    fn delete(&mut self, key: &[u8]) -> StorageResult<()> {
        self.batch.delete(key)
    }

    fn single_delete(&mut self, key: &[u8]) -> StorageResult<()> {
        self.batch.single_delete(key)
    }

    fn merge(&mut self, key: &[u8], operand: &[u8]) -> StorageResult<()> {
        self.batch.merge(key, operand)
    }

    fn clear_range(&mut self, start: &[u8], end: &[u8]) -> StorageResult<()> {
        self.batch.clear_range(start, end)
    }

    fn log_logical_op(&mut self, op: LogicalOp) {
        self.batch.log_logical_op(op)
    }
}
