//! Human-readable key rendering.

use uuid::Uuid;

use super::*;

const RANGE_ID_SUFFIX_NAMES: &[(&[u8], &str)] = &[
    (LOCAL_ABORT_SPAN_SUFFIX, "AbortSpan"),
    (LOCAL_RANGE_APPLIED_STATE_SUFFIX, "RangeAppliedState"),
    (LOCAL_RAFT_APPLIED_INDEX_LEGACY_SUFFIX, "RaftAppliedIndex"),
    (LOCAL_RANGE_LEASE_SUFFIX, "RangeLease"),
    (LOCAL_LEASE_APPLIED_INDEX_LEGACY_SUFFIX, "LeaseAppliedIndex"),
    (LOCAL_RANGE_STATS_LEGACY_SUFFIX, "RangeStats"),
    (LOCAL_RANGE_GC_THRESHOLD_SUFFIX, "RangeGCThreshold"),
    (LOCAL_TXN_SPAN_GC_THRESHOLD_SUFFIX, "TxnSpanGCThreshold"),
    (LOCAL_RAFT_TOMBSTONE_SUFFIX, "RaftTombstone"),
    (LOCAL_RAFT_HARD_STATE_SUFFIX, "RaftHardState"),
    (LOCAL_RAFT_LAST_INDEX_SUFFIX, "RaftLastIndex"),
    (LOCAL_RAFT_LOG_SUFFIX, "RaftLog"),
    (LOCAL_RAFT_VOTE_SUFFIX, "RaftVote"),
    (LOCAL_RAFT_MEMBERSHIP_SUFFIX, "RaftMembership"),
    (LOCAL_RANGE_LAST_REPLICA_GC_TIMESTAMP_SUFFIX, "RangeLastReplicaGCTimestamp"),
    (LOCAL_RANGE_LAST_VERIFICATION_TIMESTAMP_SUFFIX, "RangeLastVerificationTimestamp"),
];

/// Name of a range-ID local suffix. The truncated state suffix is shared by
/// the replicated legacy key and the unreplicated key.
pub(crate) fn range_id_suffix_name(suffix: &[u8]) -> Option<&'static str> {
    if suffix == LOCAL_RAFT_TRUNCATED_STATE_SUFFIX {
        return Some("RaftTruncatedState");
    }
    RANGE_ID_SUFFIX_NAMES
        .iter()
        .find(|(s, _)| *s == suffix)
        .map(|(_, name)| *name)
}

/// Renders `key` for logs and inspection output.
pub fn pretty(key: &[u8]) -> String {
    if key.is_empty() {
        return "/Min".to_string();
    }
    if key == KEY_MAX {
        return "/Max".to_string();
    }
    if key.starts_with(LOCAL_RANGE_ID_PREFIX) {
        if let Ok(decoded) = decode_range_id_key(key) {
            return pretty_range_id(&decoded);
        }
    } else if key.starts_with(LOCAL_RANGE_PREFIX) {
        if let Ok(decoded) = decode_range_key(key) {
            return pretty_range_key(&decoded);
        }
    } else if let Some(rest) = key.strip_prefix(LOCAL_STORE_PREFIX) {
        return pretty_store_key(rest);
    } else if let Some(rest) = key.strip_prefix(META1_PREFIX) {
        return format!("/Meta1/{}", quote(rest));
    } else if let Some(rest) = key.strip_prefix(META2_PREFIX) {
        return format!("/Meta2/{}", quote(rest));
    } else if let Some(rest) = key.strip_prefix(TIMESERIES_PREFIX) {
        return format!("/System/tsd/{}", quote(rest));
    }
    if is_local(key) {
        return format!("/Local/{}", quote(&key[LOCAL_PREFIX.len()..]));
    }
    quote(key)
}

fn pretty_store_key(rest: &[u8]) -> String {
    if rest.len() < SUFFIX_LEN {
        return format!("/Local/Store/{}", quote(rest));
    }
    let (suffix, detail) = rest.split_at(SUFFIX_LEN);
    let name = match suffix {
        s if s == LOCAL_STORE_IDENT_SUFFIX => "StoreIdent",
        s if s == LOCAL_STORE_RAFT_LOG_SUFFIX => "RaftLog",
        s if s == LOCAL_STORE_RAFT_VOTE_SUFFIX => "RaftVote",
        s if s == LOCAL_STORE_RAFT_PURGED_SUFFIX => "RaftPurged",
        s if s == LOCAL_STORE_RAFT_APPLIED_SUFFIX => "RaftApplied",
        s if s == LOCAL_STORE_RAFT_MEMBERSHIP_SUFFIX => "RaftMembership",
        other => return format!("/Local/Store/{}", quote(other)),
    };
    if suffix == LOCAL_STORE_RAFT_LOG_SUFFIX && detail.len() == 8 {
        let mut idx = [0u8; 8];
        idx.copy_from_slice(detail);
        return format!("/Local/Store/{name}/logIndex:{}", u64::from_be_bytes(idx));
    }
    format!("/Local/Store/{name}")
}

fn pretty_range_id(k: &RangeIdKey<'_>) -> String {
    let infix = if k.replicated { "r" } else { "u" };
    let name = range_id_suffix_name(k.suffix)
        .map(str::to_string)
        .unwrap_or_else(|| quote(k.suffix));
    let mut out = format!("/Local/RangeID/{}/{}/{}", k.range_id, infix, name);
    if k.suffix == LOCAL_ABORT_SPAN_SUFFIX {
        if let Ok(id) = Uuid::from_slice(k.detail) {
            out.push_str(&format!("/{id}"));
        }
    } else if k.suffix == LOCAL_RAFT_LOG_SUFFIX && k.detail.len() == 8 {
        let mut idx = [0u8; 8];
        idx.copy_from_slice(k.detail);
        out.push_str(&format!("/logIndex:{}", u64::from_be_bytes(idx)));
    } else if !k.detail.is_empty() {
        out.push_str(&format!("/{}", quote(k.detail)));
    }
    out
}

fn pretty_range_key(k: &RangeKey<'_>) -> String {
    let addr = pretty(&k.key);
    if k.suffix == LOCAL_RANGE_DESCRIPTOR_SUFFIX {
        format!("/Local/Range{addr}/RangeDescriptor")
    } else if k.suffix == LOCAL_TRANSACTION_SUFFIX {
        match Uuid::from_slice(k.detail) {
            Ok(id) => format!("/Local/Range{addr}/Transaction/{id}"),
            Err(_) => format!("/Local/Range{addr}/Transaction/{}", quote(k.detail)),
        }
    } else {
        format!("/Local/Range{addr}/{}", quote(k.suffix))
    }
}

/// Quotes raw bytes, escaping anything outside printable ASCII.
pub(crate) fn quote(bytes: &[u8]) -> String {
    format!("\"{}\"", bytes.escape_ascii())
}
