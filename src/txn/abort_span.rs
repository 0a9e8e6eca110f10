//! Abort span
//!
//! Per-range record of transactions aborted while they had intents on the
//! range. A transaction that finds its own entry must not read further: its
//! earlier writes may already be gone.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::RangeId;
use crate::error::Result;
use crate::hlc::Timestamp;
use crate::keys;
use crate::mvcc::{
    decode_mvcc_key, engine_span, mvcc_delete, mvcc_get_record, mvcc_iterate_versions,
    mvcc_put_record, MvccMetadata, MvccStats,
};
use crate::storage::{ReadWriter, Reader};

/// One aborted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortSpanEntry {
    /// Anchor key of the transaction.
    pub key: Vec<u8>,
    pub timestamp: Timestamp,
    pub priority: i32,
}

/// The abort span of one range.
#[derive(Debug, Clone, Copy)]
pub struct AbortSpan {
    range_id: RangeId,
}

impl AbortSpan {
    pub fn new(range_id: RangeId) -> Self {
        Self { range_id }
    }

    pub fn range_id(&self) -> RangeId {
        self.range_id
    }

    /// Span of every entry key.
    pub fn span(&self) -> (Vec<u8>, Vec<u8>) {
        let prefix = keys::abort_span_prefix(self.range_id);
        let end = keys::prefix_end(&prefix);
        (prefix, end)
    }

    pub fn get<R: Reader + ?Sized>(&self, reader: &R, txn_id: Uuid) -> Result<Option<AbortSpanEntry>> {
        let key = keys::abort_span_key(self.range_id, txn_id);
        mvcc_get_record(reader, &key, Timestamp::ZERO, None)
    }

    pub fn put<RW: ReadWriter + ?Sized>(
        &self,
        rw: &mut RW,
        ms: Option<&mut MvccStats>,
        txn_id: Uuid,
        entry: &AbortSpanEntry,
    ) -> Result<()> {
        let key = keys::abort_span_key(self.range_id, txn_id);
        mvcc_put_record(rw, ms, &key, Timestamp::ZERO, entry, None)
    }

    pub fn del<RW: ReadWriter + ?Sized>(
        &self,
        rw: &mut RW,
        ms: Option<&mut MvccStats>,
        txn_id: Uuid,
    ) -> Result<()> {
        let key = keys::abort_span_key(self.range_id, txn_id);
        mvcc_delete(rw, ms, &key, Timestamp::ZERO, None)
    }

    /// Every entry with its transaction ID, in key order.
    pub fn entries<R: Reader + ?Sized>(&self, reader: &R) -> Result<Vec<(Uuid, AbortSpanEntry)>> {
        let (start, end) = self.span();
        let prefix_len = start.len();
        let mut out = Vec::new();
        let mut raw = Vec::new();
        mvcc_iterate_versions(reader, &start, &end, &mut |mk, v| {
            if !mk.is_value() {
                raw.push((mk.key.clone(), v.to_vec()));
            }
            Ok(true)
        })?;
        for (key, bytes) in raw {
            let meta = MvccMetadata::decode(&bytes)?;
            let Some(value) = meta.inline_value() else {
                continue;
            };
            let id_bytes = key.get(prefix_len..prefix_len + 16).ok_or_else(|| {
                crate::error::Error::ReplicaCorruption(format!(
                    "malformed abort span key {}",
                    keys::pretty(&key)
                ))
            })?;
            let mut id = [0u8; 16];
            id.copy_from_slice(id_bytes);
            out.push((Uuid::from_bytes(id), value.get_record()?));
        }
        Ok(out)
    }

    /// Copy every entry into `dest`'s abort span, accounting the new keys
    /// into `ms`. Returns the number of entries copied.
    pub fn copy_to<RW: ReadWriter + ?Sized>(
        &self,
        rw: &mut RW,
        mut ms: Option<&mut MvccStats>,
        dest: &AbortSpan,
    ) -> Result<usize> {
        let entries = self.entries(&*rw)?;
        for (txn_id, entry) in &entries {
            dest.put(rw, ms.as_deref_mut(), *txn_id, entry)?;
        }
        Ok(entries.len())
    }

    /// Delete every entry.
    pub fn clear<RW: ReadWriter + ?Sized>(
        &self,
        rw: &mut RW,
        mut ms: Option<&mut MvccStats>,
    ) -> Result<()> {
        for (txn_id, _) in self.entries(&*rw)? {
            self.del(rw, ms.as_deref_mut(), txn_id)?;
        }
        Ok(())
    }

    /// Raw size of the span's encoded contents.
    pub fn byte_size<R: Reader + ?Sized>(&self, reader: &R) -> Result<i64> {
        let (start, end) = self.span();
        let (lower, upper) = engine_span(&start, &end);
        let mut size = 0i64;
        reader.iterate(&lower, &upper, &mut |k, v| {
            if let Ok(mk) = decode_mvcc_key(k) {
                size += mk.encoded_size() + v.len() as i64;
            }
            Ok(true)
        })?;
        Ok(size)
    }
}

/// Entry written for an aborted transaction's anchor.
pub fn abort_span_entry(key: &[u8], timestamp: Timestamp, priority: i32) -> AbortSpanEntry {
    AbortSpanEntry {
        key: key.to_vec(),
        timestamp,
        priority,
    }
}
