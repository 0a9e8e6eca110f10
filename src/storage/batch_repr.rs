//! Write batch representation
//!
//! Layout:
//! ```text
//! +--------+--------+----------------------------------------+
//! | CRC32  | Count  |              Entries                   |
//! | 4 bytes| 4 bytes|                                        |
//! +--------+--------+----------------------------------------+
//!
//! Entry: | Op 1 byte | KeyLen 4 bytes | Key | [ValLen 4 bytes | Val] |
//! ```
//!
//! - CRC32: checksum of count + entries
//! - Count: number of entries
//! - Op: entry kind; deletions carry no value
//!
//! All integers are big-endian. The representation is a pure function of the
//! sequence of operations, so the same proposal yields the same bytes on
//! every replica.

use crate::storage::error::{StorageError, StorageResult};

/// Header size in bytes
pub const HEADER_SIZE: usize = 8;

/// Batch entry kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BatchOp {
    /// Key removed
    Deletion = 0,
    /// Key set to value
    Value = 1,
    /// Value merged into existing value
    Merge = 2,
    /// Key removed; it was written at most once
    SingleDeletion = 7,
}

impl BatchOp {
    fn has_value(self) -> bool {
        matches!(self, BatchOp::Value | BatchOp::Merge)
    }
}

impl TryFrom<u8> for BatchOp {
    type Error = StorageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Deletion),
            1 => Ok(Self::Value),
            2 => Ok(Self::Merge),
            7 => Ok(Self::SingleDeletion),
            _ => Err(StorageError::InvalidBatch(format!(
                "unknown op type {value}"
            ))),
        }
    }
}

/// Accumulates batch entries.
#[derive(Debug, Clone, Default)]
pub struct BatchBuilder {
    body: Vec<u8>,
    count: u32,
}

impl BatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.push(BatchOp::Value, key, Some(value));
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.push(BatchOp::Deletion, key, None);
    }

    pub fn single_delete(&mut self, key: &[u8]) {
        self.push(BatchOp::SingleDeletion, key, None);
    }

    pub fn merge(&mut self, key: &[u8], operand: &[u8]) {
        self.push(BatchOp::Merge, key, Some(operand));
    }

    fn push(&mut self, op: BatchOp, key: &[u8], value: Option<&[u8]>) {
        self.body.push(op as u8);
        self.body.extend_from_slice(&(key.len() as u32).to_be_bytes());
        self.body.extend_from_slice(key);
        if let Some(value) = value {
            self.body.extend_from_slice(&(value.len() as u32).to_be_bytes());
            self.body.extend_from_slice(value);
        }
        self.count += 1;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Encode the batch to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.body.len());

        // Reserve space for CRC (filled in at the end)
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&self.count.to_be_bytes());
        buf.extend_from_slice(&self.body);

        let crc = crc32fast::hash(&buf[4..]);
        buf[0..4].copy_from_slice(&crc.to_be_bytes());
        buf
    }
}

/// One decoded batch entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry<'a> {
    pub op: BatchOp,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// Validating reader over an encoded batch.
pub struct BatchReader<'a> {
    data: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl<'a> BatchReader<'a> {
    /// Verify the header and CRC of `data`.
    pub fn new(data: &'a [u8]) -> StorageResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(StorageError::InvalidBatch(format!(
                "batch of {} bytes shorter than header",
                data.len()
            )));
        }
        let stored_crc = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let computed_crc = crc32fast::hash(&data[4..]);
        if stored_crc != computed_crc {
            return Err(StorageError::CrcMismatch {
                offset: 0,
                expected: stored_crc,
                actual: computed_crc,
            });
        }
        let count = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        Ok(Self {
            data,
            offset: HEADER_SIZE,
            remaining: count,
        })
    }

    /// Number of entries declared in the header.
    pub fn entry_count(data: &'a [u8]) -> StorageResult<u32> {
        Ok(Self::new(data)?.remaining)
    }

    fn read_u32(&mut self) -> StorageResult<usize> {
        let end = self.offset + 4;
        let bytes = self
            .data
            .get(self.offset..end)
            .ok_or_else(|| StorageError::InvalidBatch("truncated length".to_string()))?;
        self.offset = end;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
    }

    fn read_slice(&mut self, len: usize) -> StorageResult<&'a [u8]> {
        let end = self.offset + len;
        let data: &'a [u8] = self.data;
        let bytes = data
            .get(self.offset..end)
            .ok_or_else(|| StorageError::InvalidBatch("truncated entry".to_string()))?;
        self.offset = end;
        Ok(bytes)
    }

    fn read_entry(&mut self) -> StorageResult<BatchEntry<'a>> {
        let op_byte = *self
            .data
            .get(self.offset)
            .ok_or_else(|| StorageError::InvalidBatch("truncated op".to_string()))?;
        self.offset += 1;
        let op = BatchOp::try_from(op_byte)?;
        let key_len = self.read_u32()?;
        let key = self.read_slice(key_len)?;
        let value = if op.has_value() {
            let val_len = self.read_u32()?;
            self.read_slice(val_len)?
        } else {
            &[]
        };
        Ok(BatchEntry { op, key, value })
    }
}

impl<'a> Iterator for BatchReader<'a> {
    type Item = StorageResult<BatchEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            if self.offset != self.data.len() {
                self.offset = self.data.len();
                return Some(Err(StorageError::InvalidBatch(
                    "trailing bytes after last entry".to_string(),
                )));
            }
            return None;
        }
        self.remaining -= 1;
        let entry = self.read_entry();
        if entry.is_err() {
            self.remaining = 0;
            self.offset = self.data.len();
        }
        Some(entry)
    }
}
