//! Write-ahead log of committed batches
//!
//! Record layout:
//! ```text
//! +--------+--------+-----------------+
//! | CRC32  |  Len   |      LSN        |
//! | 4 bytes| 4 bytes|    8 bytes      |
//! +--------+--------+-----------------+
//! |      Data (encoded batch)         |
//! +-----------------------------------+
//! ```
//!
//! - CRC32: checksum of len + lsn + data
//!
//! Segments are named by their first LSN: `wal_<lsn>.log`. Each segment starts
//! with an 8-byte header (magic + version). A torn record at the tail of a
//! segment ends replay of that segment.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::storage::error::{StorageError, StorageResult};

/// Record header size in bytes
pub const RECORD_HEADER_SIZE: usize = 16;

/// Maximum record data size (256MB)
pub const MAX_RECORD_SIZE: usize = 256 * 1024 * 1024;

/// Default segment size (16MB)
pub const DEFAULT_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Magic number for segment files
const SEGMENT_MAGIC: u32 = 0x52444257; // "RDBW"

/// Segment header version
const SEGMENT_VERSION: u32 = 1;

const SEGMENT_HEADER_SIZE: u64 = 8;

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Rotate to a new segment once the current one exceeds this size
    pub segment_size: u64,
    /// fsync after every append
    pub sync: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync: true,
        }
    }
}

/// Encode a record to bytes
pub fn encode_record(lsn: u64, data: &[u8]) -> StorageResult<Vec<u8>> {
    if data.len() > MAX_RECORD_SIZE {
        return Err(StorageError::RecordTooLarge {
            size: data.len(),
            max: MAX_RECORD_SIZE,
        });
    }
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + data.len());
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(&lsn.to_be_bytes());
    buf.extend_from_slice(data);
    let crc = crc32fast::hash(&buf[4..]);
    buf[0..4].copy_from_slice(&crc.to_be_bytes());
    Ok(buf)
}

/// Decode the record at the front of `buf`, returning `(lsn, data, size)`.
/// `Ok(None)` means the buffer ends in a partial record.
pub fn decode_record(buf: &[u8], offset: u64) -> StorageResult<Option<(u64, Vec<u8>, usize)>> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Ok(None);
    }
    let stored_crc = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let total = RECORD_HEADER_SIZE + len;
    if buf.len() < total {
        return Ok(None);
    }
    let computed_crc = crc32fast::hash(&buf[4..total]);
    if stored_crc != computed_crc {
        return Err(StorageError::CrcMismatch {
            offset,
            expected: stored_crc,
            actual: computed_crc,
        });
    }
    let mut lsn = [0u8; 8];
    lsn.copy_from_slice(&buf[8..16]);
    Ok(Some((
        u64::from_be_bytes(lsn),
        buf[RECORD_HEADER_SIZE..total].to_vec(),
        total,
    )))
}

/// Append-only log of committed batches.
pub struct Wal {
    dir: PathBuf,
    config: WalConfig,
    file: File,
    segment_id: u64,
    segment_size: u64,
    next_lsn: u64,
}

impl Wal {
    /// Open the log in `dir`, returning it with every intact record in LSN order.
    pub fn open(dir: &Path, config: WalConfig) -> StorageResult<(Self, Vec<Vec<u8>>)> {
        fs::create_dir_all(dir)?;
        let segments = list_segments(dir)?;

        let mut records = Vec::new();
        let mut next_lsn = 1;
        for &id in &segments {
            let path = segment_path(dir, id);
            let mut bytes = Vec::new();
            File::open(&path)?.read_to_end(&mut bytes)?;
            validate_segment_header(&bytes, &path)?;

            let mut offset = SEGMENT_HEADER_SIZE as usize;
            loop {
                match decode_record(&bytes[offset..], offset as u64) {
                    Ok(Some((lsn, data, size))) => {
                        next_lsn = lsn + 1;
                        records.push(data);
                        offset += size;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(segment = id, offset, error = %e, "Stopping WAL replay at damaged record");
                        break;
                    }
                }
            }
        }

        let segment_id = next_lsn;
        let (file, segment_size) = create_segment(dir, segment_id)?;
        tracing::info!(
            dir = %dir.display(),
            segments = segments.len(),
            records = records.len(),
            next_lsn,
            "Opened WAL"
        );

        Ok((
            Self {
                dir: dir.to_path_buf(),
                config,
                file,
                segment_id,
                segment_size,
                next_lsn,
            },
            records,
        ))
    }

    /// Append one record, returning its LSN.
    pub fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let lsn = self.next_lsn;
        let record = encode_record(lsn, data)?;
        if self.segment_size + record.len() as u64 > self.config.segment_size
            && self.segment_size > SEGMENT_HEADER_SIZE
        {
            self.rotate(lsn)?;
        }
        self.file.write_all(&record)?;
        if self.config.sync {
            self.file.sync_data()?;
        }
        self.segment_size += record.len() as u64;
        self.next_lsn += 1;
        Ok(lsn)
    }

    /// Replace every segment with one holding `snapshot` as its only record.
    pub fn checkpoint(&mut self, snapshot: &[u8]) -> StorageResult<()> {
        let old = list_segments(&self.dir)?;
        let lsn = self.next_lsn;
        self.rotate(lsn)?;
        self.append(snapshot)?;
        for id in old.into_iter().filter(|&id| id < lsn) {
            fs::remove_file(segment_path(&self.dir, id))?;
        }
        tracing::debug!(lsn, "WAL checkpoint written");
        Ok(())
    }

    pub fn next_lsn(&self) -> u64 {
        self.next_lsn
    }

    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    fn rotate(&mut self, lsn: u64) -> StorageResult<()> {
        self.file.sync_all()?;
        let (file, size) = create_segment(&self.dir, lsn)?;
        self.file = file;
        self.segment_id = lsn;
        self.segment_size = size;
        Ok(())
    }
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("wal_{id:016x}.log"))
}

fn list_segments(dir: &Path) -> StorageResult<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(hex) = name
            .strip_prefix("wal_")
            .and_then(|rest| rest.strip_suffix(".log"))
        {
            if let Ok(id) = u64::from_str_radix(hex, 16) {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn create_segment(dir: &Path, id: u64) -> StorageResult<(File, u64)> {
    let path = segment_path(dir, id);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        let mut header = Vec::with_capacity(SEGMENT_HEADER_SIZE as usize);
        header.extend_from_slice(&SEGMENT_MAGIC.to_be_bytes());
        header.extend_from_slice(&SEGMENT_VERSION.to_be_bytes());
        file.write_all(&header)?;
        file.sync_all()?;
        return Ok((file, SEGMENT_HEADER_SIZE));
    }
    Ok((file, len))
}

fn validate_segment_header(bytes: &[u8], path: &Path) -> StorageResult<()> {
    if bytes.len() < SEGMENT_HEADER_SIZE as usize {
        return Err(StorageError::Corrupted(format!(
            "segment {} shorter than header",
            path.display()
        )));
    }
    let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let version = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if magic != SEGMENT_MAGIC || version != SEGMENT_VERSION {
        return Err(StorageError::Corrupted(format!(
            "segment {} has bad header (magic {magic:#x}, version {version})",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let rec = encode_record(7, b"payload").unwrap();
        let (lsn, data, size) = decode_record(&rec, 0).unwrap().unwrap();
        assert_eq!(lsn, 7);
        assert_eq!(data, b"payload");
        assert_eq!(size, rec.len());
    }

    #[test]
    fn test_partial_record() {
        let rec = encode_record(1, b"payload").unwrap();
        assert!(decode_record(&rec[..rec.len() - 1], 0).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_record() {
        let mut rec = encode_record(1, b"payload").unwrap();
        rec[RECORD_HEADER_SIZE] ^= 0x01;
        assert!(matches!(
            decode_record(&rec, 0),
            Err(StorageError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_open_append_replay() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut wal, records) = Wal::open(dir.path(), WalConfig::default()).unwrap();
            assert!(records.is_empty());
            assert_eq!(wal.append(b"one").unwrap(), 1);
            assert_eq!(wal.append(b"two").unwrap(), 2);
        }
        let (wal, records) = Wal::open(dir.path(), WalConfig::default()).unwrap();
        assert_eq!(records, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(wal.next_lsn(), 3);
    }

    #[test]
    fn test_rotation_and_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = WalConfig {
            segment_size: 64,
            sync: false,
        };
        let (mut wal, _) = Wal::open(dir.path(), config.clone()).unwrap();
        for i in 0..10u8 {
            wal.append(&[i; 20]).unwrap();
        }
        assert!(list_segments(dir.path()).unwrap().len() > 1);

        wal.checkpoint(b"snapshot").unwrap();
        assert_eq!(list_segments(dir.path()).unwrap().len(), 1);
        drop(wal);

        let (_, records) = Wal::open(dir.path(), config).unwrap();
        assert_eq!(records, vec![b"snapshot".to_vec()]);
    }
}
