//! Cursor iteration over an ordered reader
//!
//! The cursor owns (or borrows) its reader, so it can never outlive the state
//! it walks: a cursor over a snapshot keeps the snapshot alive, a cursor over
//! a batch borrows the batch.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::traits::{KeyValue, Reader};

/// Bidirectional cursor over raw keys in `[lower, upper)`.
pub struct EngineIterator<R> {
    reader: R,
    lower: Vec<u8>,
    upper: Vec<u8>,
    cur: Option<KeyValue>,
    err: Option<StorageError>,
}

impl<R: Reader> EngineIterator<R> {
    /// Create an unpositioned cursor. An empty `upper` is unbounded.
    pub fn new(reader: R, lower: &[u8], upper: &[u8]) -> Self {
        Self {
            reader,
            lower: lower.to_vec(),
            upper: upper.to_vec(),
            cur: None,
            err: None,
        }
    }

    /// Position at the first key `>= key`.
    pub fn seek_ge(&mut self, key: &[u8]) {
        let target = if key < self.lower.as_slice() {
            self.lower.clone()
        } else {
            key.to_vec()
        };
        self.set(self.reader.seek_ge(&target, &self.upper));
    }

    /// Position at the last key `< key`.
    pub fn seek_lt(&mut self, key: &[u8]) {
        let target = if !self.upper.is_empty() && (key.is_empty() || key > self.upper.as_slice()) {
            self.upper.clone()
        } else {
            key.to_vec()
        };
        self.set(self.reader.seek_lt(&target, &self.lower));
    }

    /// Position at the first key of the range.
    pub fn first(&mut self) {
        let lower = self.lower.clone();
        self.seek_ge(&lower);
    }

    /// Position at the last key of the range.
    pub fn last(&mut self) {
        let upper = self.upper.clone();
        self.set(self.reader.seek_lt(&upper, &self.lower));
    }

    /// True if positioned on an entry. Surfaces any error hit while moving.
    pub fn valid(&self) -> StorageResult<bool> {
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(self.cur.is_some()),
        }
    }

    pub fn next(&mut self) {
        if let Some((key, _)) = self.cur.take() {
            let mut next = key;
            next.push(0);
            self.set(self.reader.seek_ge(&next, &self.upper));
        }
    }

    pub fn prev(&mut self) {
        if let Some((key, _)) = self.cur.take() {
            self.set(self.reader.seek_lt(&key, &self.lower));
        }
    }

    /// Current key; empty when unpositioned.
    pub fn key(&self) -> &[u8] {
        self.cur.as_ref().map(|(k, _)| k.as_slice()).unwrap_or(&[])
    }

    /// Current value; empty when unpositioned.
    pub fn value(&self) -> &[u8] {
        self.cur.as_ref().map(|(_, v)| v.as_slice()).unwrap_or(&[])
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    fn set(&mut self, result: StorageResult<Option<KeyValue>>) {
        match result {
            Ok(cur) => self.cur = cur,
            Err(e) => {
                self.cur = None;
                self.err = Some(e);
            }
        }
    }
}
