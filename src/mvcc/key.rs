//! MVCC key encoding
//!
//! ```text
//! escaped(user_key) 0x00 0x01 [ !wall (8 bytes BE) !logical (4 bytes BE) ]
//! ```
//!
//! The user key is escaped (`0x00` becomes `0x00 0xff`) and terminated by
//! `0x00 0x01`, so every version of a key sorts before any longer key. The
//! timestamp is stored bitwise-complemented, so versions of one key sort
//! newest first. A zero timestamp omits the suffix: the metadata key sorts
//! before every version of its user key.

use std::fmt;

use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::keys::{decode_bytes_ascending, encode_bytes_ascending, ESCAPED_PAST_TERM};

/// Length of the encoded timestamp suffix.
pub const MVCC_VERSION_TIMESTAMP_SIZE: usize = 12;

/// A user key at a timestamp.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MvccKey {
    pub key: Vec<u8>,
    pub timestamp: Timestamp,
}

impl MvccKey {
    pub fn new(key: impl Into<Vec<u8>>, timestamp: Timestamp) -> Self {
        Self {
            key: key.into(),
            timestamp,
        }
    }

    /// The unversioned (metadata) key.
    pub fn meta(key: impl Into<Vec<u8>>) -> Self {
        Self::new(key, Timestamp::ZERO)
    }

    pub fn is_value(&self) -> bool {
        !self.timestamp.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_mvcc_key(&self.key, self.timestamp)
    }

    /// Size this key is charged in stats: the user key plus one byte for the
    /// metadata key, twelve more for a version.
    pub fn encoded_size(&self) -> i64 {
        let mut n = self.key.len() as i64 + 1;
        if self.is_value() {
            n += MVCC_VERSION_TIMESTAMP_SIZE as i64;
        }
        n
    }
}

impl fmt::Display for MvccKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_value() {
            write!(f, "{}/{}", crate::keys::pretty(&self.key), self.timestamp)
        } else {
            write!(f, "{}", crate::keys::pretty(&self.key))
        }
    }
}

impl fmt::Debug for MvccKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Encode `(key, ts)` into an engine key.
pub fn encode_mvcc_key(key: &[u8], ts: Timestamp) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.len() + 2 + MVCC_VERSION_TIMESTAMP_SIZE);
    encode_bytes_ascending(&mut buf, key);
    if !ts.is_empty() {
        buf.extend_from_slice(&(!ts.wall_time).to_be_bytes());
        buf.extend_from_slice(&(!ts.logical).to_be_bytes());
    }
    buf
}

/// Decode an engine key into `(key, ts)`.
pub fn decode_mvcc_key(buf: &[u8]) -> Result<MvccKey> {
    let (key, rest) = decode_bytes_ascending(buf)?;
    let timestamp = match rest.len() {
        0 => Timestamp::ZERO,
        MVCC_VERSION_TIMESTAMP_SIZE => {
            let mut wall = [0u8; 8];
            wall.copy_from_slice(&rest[..8]);
            let mut logical = [0u8; 4];
            logical.copy_from_slice(&rest[8..]);
            Timestamp::new(!u64::from_be_bytes(wall), !u32::from_be_bytes(logical))
        }
        n => {
            return Err(Error::Codec(format!(
                "invalid mvcc key {:?}: {n} trailing timestamp bytes",
                buf.escape_ascii().to_string()
            )))
        }
    };
    Ok(MvccKey { key, timestamp })
}

/// First engine key past every version of `key`.
pub fn key_upper_bound(key: &[u8]) -> Vec<u8> {
    let mut buf = encode_mvcc_key(key, Timestamp::ZERO);
    if let Some(last) = buf.last_mut() {
        *last = ESCAPED_PAST_TERM;
    }
    buf
}

/// Engine bounds covering every version of every user key in `[start, end)`.
/// An empty `end` is unbounded.
pub fn engine_span(start: &[u8], end: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let lower = encode_mvcc_key(start, Timestamp::ZERO);
    let upper = if end.is_empty() {
        Vec::new()
    } else {
        encode_mvcc_key(end, Timestamp::ZERO)
    };
    (lower, upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        for (k, ts) in [
            (&b"a"[..], Timestamp::ZERO),
            (&b"a\x00b"[..], Timestamp::new(100, 3)),
            (&b""[..], Timestamp::new(1, 0)),
            (&b"\xff\xff"[..], Timestamp::MAX),
        ] {
            let enc = encode_mvcc_key(k, ts);
            let dec = decode_mvcc_key(&enc).unwrap();
            assert_eq!(dec.key, k);
            assert_eq!(dec.timestamp, ts);
        }
    }

    #[test]
    fn test_sort_order() {
        let ordered = [
            encode_mvcc_key(b"a", Timestamp::ZERO),
            encode_mvcc_key(b"a", Timestamp::new(200, 0)),
            encode_mvcc_key(b"a", Timestamp::new(100, 5)),
            encode_mvcc_key(b"a", Timestamp::new(100, 0)),
            encode_mvcc_key(b"a\x00", Timestamp::ZERO),
            encode_mvcc_key(b"a\x00", Timestamp::new(1, 0)),
            encode_mvcc_key(b"aa", Timestamp::ZERO),
            encode_mvcc_key(b"b", Timestamp::new(1, 0)),
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1], "{:?} !< {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_upper_bound_covers_versions_only() {
        let ub = key_upper_bound(b"a");
        assert!(encode_mvcc_key(b"a", Timestamp::new(1, 0)) < ub);
        assert!(encode_mvcc_key(b"a", Timestamp::MAX) < ub);
        assert!(ub < encode_mvcc_key(b"a\x00", Timestamp::ZERO));
        assert!(ub < encode_mvcc_key(b"aa", Timestamp::ZERO));
    }

    #[test]
    fn test_bad_suffix() {
        let mut enc = encode_mvcc_key(b"k", Timestamp::new(5, 0));
        enc.pop();
        assert!(decode_mvcc_key(&enc).is_err());
    }

    #[test]
    fn test_stats_size() {
        assert_eq!(MvccKey::meta(b"abc".to_vec()).encoded_size(), 4);
        assert_eq!(MvccKey::new(b"abc".to_vec(), Timestamp::new(1, 0)).encoded_size(), 16);
    }
}
