//! Key families of the global keyspace.
//!
//! Layout:
//! ```text
//! \x01i<range_id:8>r<suffix:4>[detail]   range-ID local, replicated
//! \x01i<range_id:8>u<suffix:4>[detail]   range-ID local, unreplicated
//! \x01k<escaped key><suffix:4>[detail]    range-local (descriptor, txn record)
//! \x01s<suffix:4>[detail]                  store-local (store Raft log, vote)
//! \x02...                                 meta1
//! \x03...                                 meta2
//! \x04tsd...                              timeseries
//! everything else                         user keys
//! ```

mod encoding;
mod printer;

pub use encoding::{decode_bytes_ascending, encode_bytes_ascending, encoded_len};
pub(crate) use encoding::ESCAPED_PAST_TERM;
pub use printer::pretty;

use uuid::Uuid;

use crate::api::{RangeId, Span};
use crate::error::{Error, Result};

pub const LOCAL_PREFIX: &[u8] = b"\x01";
/// End of the local keyspace; every user-addressable key sorts at or after it.
pub const LOCAL_MAX: &[u8] = b"\x02";

pub const LOCAL_RANGE_ID_PREFIX: &[u8] = b"\x01i";
pub const LOCAL_RANGE_ID_REPLICATED_INFIX: u8 = b'r';
pub const LOCAL_RANGE_ID_UNREPLICATED_INFIX: u8 = b'u';
pub const LOCAL_RANGE_PREFIX: &[u8] = b"\x01k";
pub const LOCAL_RANGE_MAX: &[u8] = b"\x01l";
pub const LOCAL_STORE_PREFIX: &[u8] = b"\x01s";

// Range-ID replicated suffixes.
pub const LOCAL_ABORT_SPAN_SUFFIX: &[u8] = b"abc-";
pub const LOCAL_RANGE_APPLIED_STATE_SUFFIX: &[u8] = b"rask";
pub const LOCAL_RAFT_APPLIED_INDEX_LEGACY_SUFFIX: &[u8] = b"rfta";
pub const LOCAL_RAFT_TRUNCATED_STATE_LEGACY_SUFFIX: &[u8] = b"rftt";
pub const LOCAL_RANGE_LEASE_SUFFIX: &[u8] = b"rll-";
pub const LOCAL_LEASE_APPLIED_INDEX_LEGACY_SUFFIX: &[u8] = b"rlla";
pub const LOCAL_RANGE_STATS_LEGACY_SUFFIX: &[u8] = b"stat";
pub const LOCAL_RANGE_GC_THRESHOLD_SUFFIX: &[u8] = b"lgc-";
pub const LOCAL_TXN_SPAN_GC_THRESHOLD_SUFFIX: &[u8] = b"tst-";

// Range-ID unreplicated suffixes.
pub const LOCAL_RAFT_TOMBSTONE_SUFFIX: &[u8] = b"rftb";
pub const LOCAL_RAFT_HARD_STATE_SUFFIX: &[u8] = b"rfth";
pub const LOCAL_RAFT_LAST_INDEX_SUFFIX: &[u8] = b"rfti";
pub const LOCAL_RAFT_LOG_SUFFIX: &[u8] = b"rftl";
pub const LOCAL_RAFT_TRUNCATED_STATE_SUFFIX: &[u8] = b"rftt";
pub const LOCAL_RAFT_VOTE_SUFFIX: &[u8] = b"rftv";
pub const LOCAL_RAFT_MEMBERSHIP_SUFFIX: &[u8] = b"rftm";
pub const LOCAL_RANGE_LAST_REPLICA_GC_TIMESTAMP_SUFFIX: &[u8] = b"rlrt";
pub const LOCAL_RANGE_LAST_VERIFICATION_TIMESTAMP_SUFFIX: &[u8] = b"rlvt";

// Range-local (key-addressed) suffixes.
pub const LOCAL_RANGE_DESCRIPTOR_SUFFIX: &[u8] = b"rdsc";
pub const LOCAL_TRANSACTION_SUFFIX: &[u8] = b"txn-";

// Store-local suffixes.
pub const LOCAL_STORE_IDENT_SUFFIX: &[u8] = b"iden";
pub const LOCAL_STORE_RAFT_LOG_SUFFIX: &[u8] = b"rftl";
pub const LOCAL_STORE_RAFT_VOTE_SUFFIX: &[u8] = b"rftv";
pub const LOCAL_STORE_RAFT_PURGED_SUFFIX: &[u8] = b"rftp";
pub const LOCAL_STORE_RAFT_APPLIED_SUFFIX: &[u8] = b"rfta";
pub const LOCAL_STORE_RAFT_MEMBERSHIP_SUFFIX: &[u8] = b"rftm";

pub const META1_PREFIX: &[u8] = b"\x02";
pub const META2_PREFIX: &[u8] = b"\x03";
pub const META_MAX: &[u8] = b"\x04";
pub const TIMESERIES_PREFIX: &[u8] = b"\x04tsd";

pub const KEY_MIN: &[u8] = b"";
pub const KEY_MAX: &[u8] = b"\xff\xff";

const SUFFIX_LEN: usize = 4;

/// True for keys in the local (non-addressable) keyspace.
pub fn is_local(key: &[u8]) -> bool {
    key.starts_with(LOCAL_PREFIX)
}

/// The first key sorting after every key with prefix `key`.
pub fn prefix_end(key: &[u8]) -> Vec<u8> {
    let mut end = key.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return end;
        }
        end.pop();
    }
    KEY_MAX.to_vec()
}

/// Prefix shared by all range-ID local keys of `range_id`.
pub fn make_range_id_prefix(range_id: RangeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(LOCAL_RANGE_ID_PREFIX.len() + 8);
    key.extend_from_slice(LOCAL_RANGE_ID_PREFIX);
    key.extend_from_slice(&range_id.to_be_bytes());
    key
}

pub fn make_range_id_replicated_prefix(range_id: RangeId) -> Vec<u8> {
    let mut key = make_range_id_prefix(range_id);
    key.push(LOCAL_RANGE_ID_REPLICATED_INFIX);
    key
}

pub fn make_range_id_unreplicated_prefix(range_id: RangeId) -> Vec<u8> {
    let mut key = make_range_id_prefix(range_id);
    key.push(LOCAL_RANGE_ID_UNREPLICATED_INFIX);
    key
}

fn replicated_key(range_id: RangeId, suffix: &[u8], detail: &[u8]) -> Vec<u8> {
    let mut key = make_range_id_replicated_prefix(range_id);
    key.extend_from_slice(suffix);
    key.extend_from_slice(detail);
    key
}

fn unreplicated_key(range_id: RangeId, suffix: &[u8], detail: &[u8]) -> Vec<u8> {
    let mut key = make_range_id_unreplicated_prefix(range_id);
    key.extend_from_slice(suffix);
    key.extend_from_slice(detail);
    key
}

pub fn abort_span_key(range_id: RangeId, txn_id: Uuid) -> Vec<u8> {
    replicated_key(range_id, LOCAL_ABORT_SPAN_SUFFIX, txn_id.as_bytes())
}

/// Prefix of every abort span entry of `range_id`.
pub fn abort_span_prefix(range_id: RangeId) -> Vec<u8> {
    replicated_key(range_id, LOCAL_ABORT_SPAN_SUFFIX, &[])
}

pub fn range_applied_state_key(range_id: RangeId) -> Vec<u8> {
    replicated_key(range_id, LOCAL_RANGE_APPLIED_STATE_SUFFIX, &[])
}

pub fn raft_applied_index_legacy_key(range_id: RangeId) -> Vec<u8> {
    replicated_key(range_id, LOCAL_RAFT_APPLIED_INDEX_LEGACY_SUFFIX, &[])
}

pub fn lease_applied_index_legacy_key(range_id: RangeId) -> Vec<u8> {
    replicated_key(range_id, LOCAL_LEASE_APPLIED_INDEX_LEGACY_SUFFIX, &[])
}

pub fn raft_truncated_state_legacy_key(range_id: RangeId) -> Vec<u8> {
    replicated_key(range_id, LOCAL_RAFT_TRUNCATED_STATE_LEGACY_SUFFIX, &[])
}

pub fn range_lease_key(range_id: RangeId) -> Vec<u8> {
    replicated_key(range_id, LOCAL_RANGE_LEASE_SUFFIX, &[])
}

pub fn range_stats_legacy_key(range_id: RangeId) -> Vec<u8> {
    replicated_key(range_id, LOCAL_RANGE_STATS_LEGACY_SUFFIX, &[])
}

pub fn range_gc_threshold_key(range_id: RangeId) -> Vec<u8> {
    replicated_key(range_id, LOCAL_RANGE_GC_THRESHOLD_SUFFIX, &[])
}

pub fn range_txn_span_gc_threshold_key(range_id: RangeId) -> Vec<u8> {
    replicated_key(range_id, LOCAL_TXN_SPAN_GC_THRESHOLD_SUFFIX, &[])
}

pub fn raft_tombstone_key(range_id: RangeId) -> Vec<u8> {
    unreplicated_key(range_id, LOCAL_RAFT_TOMBSTONE_SUFFIX, &[])
}

pub fn raft_hard_state_key(range_id: RangeId) -> Vec<u8> {
    unreplicated_key(range_id, LOCAL_RAFT_HARD_STATE_SUFFIX, &[])
}

pub fn raft_last_index_key(range_id: RangeId) -> Vec<u8> {
    unreplicated_key(range_id, LOCAL_RAFT_LAST_INDEX_SUFFIX, &[])
}

pub fn raft_truncated_state_key(range_id: RangeId) -> Vec<u8> {
    unreplicated_key(range_id, LOCAL_RAFT_TRUNCATED_STATE_SUFFIX, &[])
}

pub fn raft_vote_key(range_id: RangeId) -> Vec<u8> {
    unreplicated_key(range_id, LOCAL_RAFT_VOTE_SUFFIX, &[])
}

pub fn raft_membership_key(range_id: RangeId) -> Vec<u8> {
    unreplicated_key(range_id, LOCAL_RAFT_MEMBERSHIP_SUFFIX, &[])
}

pub fn range_last_replica_gc_timestamp_key(range_id: RangeId) -> Vec<u8> {
    unreplicated_key(range_id, LOCAL_RANGE_LAST_REPLICA_GC_TIMESTAMP_SUFFIX, &[])
}

pub fn range_last_verification_timestamp_key(range_id: RangeId) -> Vec<u8> {
    unreplicated_key(range_id, LOCAL_RANGE_LAST_VERIFICATION_TIMESTAMP_SUFFIX, &[])
}

/// Prefix of all Raft log entries of `range_id`.
pub fn raft_log_prefix(range_id: RangeId) -> Vec<u8> {
    unreplicated_key(range_id, LOCAL_RAFT_LOG_SUFFIX, &[])
}

/// Raft log entry key; the index is big-endian so entries sort by index.
pub fn raft_log_key(range_id: RangeId, index: u64) -> Vec<u8> {
    unreplicated_key(range_id, LOCAL_RAFT_LOG_SUFFIX, &index.to_be_bytes())
}

fn store_key(suffix: &[u8], detail: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(LOCAL_STORE_PREFIX.len() + suffix.len() + detail.len());
    key.extend_from_slice(LOCAL_STORE_PREFIX);
    key.extend_from_slice(suffix);
    key.extend_from_slice(detail);
    key
}

/// Identity of the store owning the engine.
pub fn store_ident_key() -> Vec<u8> {
    store_key(LOCAL_STORE_IDENT_SUFFIX, &[])
}

/// Prefix of the store-wide Raft log shared by all ranges of the store.
pub fn store_raft_log_prefix() -> Vec<u8> {
    store_key(LOCAL_STORE_RAFT_LOG_SUFFIX, &[])
}

pub fn store_raft_log_key(index: u64) -> Vec<u8> {
    store_key(LOCAL_STORE_RAFT_LOG_SUFFIX, &index.to_be_bytes())
}

pub fn store_raft_vote_key() -> Vec<u8> {
    store_key(LOCAL_STORE_RAFT_VOTE_SUFFIX, &[])
}

pub fn store_raft_purged_key() -> Vec<u8> {
    store_key(LOCAL_STORE_RAFT_PURGED_SUFFIX, &[])
}

pub fn store_raft_applied_key() -> Vec<u8> {
    store_key(LOCAL_STORE_RAFT_APPLIED_SUFFIX, &[])
}

pub fn store_raft_membership_key() -> Vec<u8> {
    store_key(LOCAL_STORE_RAFT_MEMBERSHIP_SUFFIX, &[])
}

/// Prefix of range-local keys addressed by `key`.
pub fn make_range_key_prefix(key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LOCAL_RANGE_PREFIX.len() + encoded_len(key));
    buf.extend_from_slice(LOCAL_RANGE_PREFIX);
    encode_bytes_ascending(&mut buf, key);
    buf
}

fn make_range_key(key: &[u8], suffix: &[u8], detail: &[u8]) -> Vec<u8> {
    let mut buf = make_range_key_prefix(key);
    buf.extend_from_slice(suffix);
    buf.extend_from_slice(detail);
    buf
}

pub fn range_descriptor_key(start_key: &[u8]) -> Vec<u8> {
    make_range_key(start_key, LOCAL_RANGE_DESCRIPTOR_SUFFIX, &[])
}

/// Key of the transaction record anchored at `anchor`. A range-local anchor
/// is replaced by its address so the record lives on the anchor's range.
pub fn transaction_key(anchor: &[u8], txn_id: Uuid) -> Vec<u8> {
    let addressed = addr(anchor).unwrap_or_else(|_| anchor.to_vec());
    make_range_key(&addressed, LOCAL_TRANSACTION_SUFFIX, txn_id.as_bytes())
}

/// Meta index key addressing the range whose end key is `key`.
pub fn range_meta_key(key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return KEY_MIN.to_vec();
    }
    if key.starts_with(META2_PREFIX) {
        let mut out = META1_PREFIX.to_vec();
        out.extend_from_slice(&key[META2_PREFIX.len()..]);
        return out;
    }
    if key.starts_with(META1_PREFIX) {
        return KEY_MIN.to_vec();
    }
    let mut out = META2_PREFIX.to_vec();
    out.extend_from_slice(key);
    out
}

/// Decoded range-ID local key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeIdKey<'a> {
    pub range_id: RangeId,
    pub replicated: bool,
    pub suffix: &'a [u8],
    pub detail: &'a [u8],
}

/// Splits a range-ID local key into its components.
pub fn decode_range_id_key(key: &[u8]) -> Result<RangeIdKey<'_>> {
    let rest = key
        .strip_prefix(LOCAL_RANGE_ID_PREFIX)
        .ok_or_else(|| Error::Codec(format!("key {} is not range-ID local", pretty(key))))?;
    if rest.len() < 8 + 1 + SUFFIX_LEN {
        return Err(Error::Codec(format!("range-ID key {} too short", pretty(key))));
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&rest[..8]);
    let replicated = match rest[8] {
        LOCAL_RANGE_ID_REPLICATED_INFIX => true,
        LOCAL_RANGE_ID_UNREPLICATED_INFIX => false,
        other => return Err(Error::Codec(format!("invalid range-ID infix {other:#04x}"))),
    };
    Ok(RangeIdKey {
        range_id: u64::from_be_bytes(id),
        replicated,
        suffix: &rest[9..9 + SUFFIX_LEN],
        detail: &rest[9 + SUFFIX_LEN..],
    })
}

/// Decoded range-local key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeKey<'a> {
    pub key: Vec<u8>,
    pub suffix: &'a [u8],
    pub detail: &'a [u8],
}

pub fn decode_range_key(key: &[u8]) -> Result<RangeKey<'_>> {
    let rest = key
        .strip_prefix(LOCAL_RANGE_PREFIX)
        .ok_or_else(|| Error::Codec(format!("key {} is not range-local", pretty(key))))?;
    let (addr, rest) = decode_bytes_ascending(rest)?;
    if rest.len() < SUFFIX_LEN {
        return Err(Error::Codec("range-local key missing suffix".to_string()));
    }
    Ok(RangeKey {
        key: addr,
        suffix: &rest[..SUFFIX_LEN],
        detail: &rest[SUFFIX_LEN..],
    })
}

/// The addressable key of `key`: the embedded key for range-local keys, the
/// key itself otherwise. Range-ID local keys have no address.
pub fn addr(key: &[u8]) -> Result<Vec<u8>> {
    if key.starts_with(LOCAL_RANGE_PREFIX) {
        return Ok(decode_range_key(key)?.key);
    }
    if is_local(key) {
        return Err(Error::InvalidArgument(format!(
            "local key {} is not addressable",
            pretty(key)
        )));
    }
    Ok(key.to_vec())
}

/// Addressable form of a span, mapping range-local keys to their addresses.
pub fn addr_span(span: &Span) -> Result<Span> {
    let key = addr(&span.key)?;
    if span.is_point() {
        return Ok(Span::point(key));
    }
    let end_key = addr(&span.end_key)?;
    Ok(Span::new(key, end_key))
}

/// Spans holding all replicated data of a range: range-ID replicated keys,
/// range-local keys and user keys.
pub fn replica_data_spans(range_id: RangeId, start: &[u8], end: &[u8]) -> Vec<Span> {
    let replicated = make_range_id_replicated_prefix(range_id);
    let user_start = if start < LOCAL_MAX { LOCAL_MAX } else { start };
    vec![
        Span::new(replicated.clone(), prefix_end(&replicated)),
        Span::new(make_range_key_prefix(start), make_range_key_prefix(end)),
        Span::new(user_start.to_vec(), end.to_vec()),
    ]
}

/// Span of user-addressable keys of a range `[start, end)`.
pub fn user_data_span(start: &[u8], end: &[u8]) -> Span {
    let user_start = if start < LOCAL_MAX { LOCAL_MAX } else { start };
    Span::new(user_start.to_vec(), end.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"a"), b"b".to_vec());
        assert_eq!(prefix_end(b"a\xff"), b"b".to_vec());
        assert_eq!(prefix_end(b"\xff\xff"), KEY_MAX.to_vec());
    }

    #[test]
    fn test_range_id_key_roundtrip() {
        let key = abort_span_key(42, Uuid::nil());
        let decoded = decode_range_id_key(&key).unwrap();
        assert_eq!(decoded.range_id, 42);
        assert!(decoded.replicated);
        assert_eq!(decoded.suffix, LOCAL_ABORT_SPAN_SUFFIX);
        assert_eq!(decoded.detail.len(), 16);

        let key = raft_log_key(7, 99);
        let decoded = decode_range_id_key(&key).unwrap();
        assert!(!decoded.replicated);
        assert_eq!(decoded.suffix, LOCAL_RAFT_LOG_SUFFIX);
        assert_eq!(decoded.detail, 99u64.to_be_bytes());
    }

    #[test]
    fn test_raft_log_keys_sort_by_index() {
        assert!(raft_log_key(1, 9) < raft_log_key(1, 10));
        assert!(raft_log_key(1, 255) < raft_log_key(1, 256));
        assert!(raft_log_key(1, u64::MAX) < prefix_end(&raft_log_prefix(1)));
    }

    #[test]
    fn test_range_key_addr() {
        let id = Uuid::new_v4();
        let key = transaction_key(b"anchor\x00x", id);
        assert!(is_local(&key));
        let decoded = decode_range_key(&key).unwrap();
        assert_eq!(decoded.key, b"anchor\x00x".to_vec());
        assert_eq!(decoded.suffix, LOCAL_TRANSACTION_SUFFIX);
        assert_eq!(decoded.detail, id.as_bytes());
        assert_eq!(addr(&key).unwrap(), b"anchor\x00x".to_vec());
        assert!(addr(&range_lease_key(1)).is_err());
        assert_eq!(addr(b"user").unwrap(), b"user".to_vec());
    }

    #[test]
    fn test_range_local_keys_ordered_by_address() {
        assert!(range_descriptor_key(b"a") < range_descriptor_key(b"b"));
        assert!(transaction_key(b"a", Uuid::nil()) < make_range_key_prefix(b"a\x00"));
        let span = Span::new(make_range_key_prefix(b"a"), make_range_key_prefix(b"m"));
        assert!(span.contains_key(&transaction_key(b"c", Uuid::new_v4())));
        assert!(!span.contains_key(&range_descriptor_key(b"m")));
        let id = Uuid::new_v4();
        assert_eq!(transaction_key(&range_descriptor_key(b"c"), id), transaction_key(b"c", id));
    }

    #[test]
    fn test_store_keys_outside_range_data() {
        let log = store_raft_log_key(3);
        assert!(is_local(&log));
        assert!(log > LOCAL_RANGE_MAX.to_vec() && log.as_slice() < LOCAL_MAX);
        for span in replica_data_spans(1, KEY_MIN, KEY_MAX) {
            assert!(!span.contains_key(&log));
            assert!(!span.contains_key(&store_raft_vote_key()));
        }
        assert!(store_raft_log_key(9) < store_raft_log_key(10));
        assert!(store_raft_log_key(u64::MAX) < prefix_end(&store_raft_log_prefix()));
    }

    #[test]
    fn test_meta_keys() {
        assert_eq!(range_meta_key(b"m"), b"\x03m".to_vec());
        assert_eq!(range_meta_key(b"\x03m"), b"\x02m".to_vec());
        assert_eq!(range_meta_key(b"\x02m"), KEY_MIN.to_vec());
    }

    #[test]
    fn test_replica_data_spans_skip_local() {
        let spans = replica_data_spans(1, KEY_MIN, KEY_MAX);
        assert_eq!(spans[2].key, LOCAL_MAX.to_vec());
        assert!(spans[0].contains_key(&range_lease_key(1)));
        assert!(!spans[0].contains_key(&raft_hard_state_key(1)));
    }
}
