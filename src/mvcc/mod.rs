//! Multi-version concurrency control over the ordered engine
//!
//! Every user key is stored as a metadata record at its zero-timestamp key
//! (for intents and inline values) followed by its versions, newest first.
//! Reads pick the newest version at or below the read timestamp; writes
//! either write a committed version directly or a transaction's intent.

mod gc;
mod key;
mod logical_ops;
mod meta;
mod reader;
mod resolve;
mod split;
mod stats;
pub mod timeseries;
mod value;
mod writer;

pub use gc::{mvcc_garbage_collect, GcKey};
pub use key::{
    decode_mvcc_key, encode_mvcc_key, engine_span, key_upper_bound, MvccKey,
    MVCC_VERSION_TIMESTAMP_SIZE,
};
pub use logical_ops::LogicalOp;
pub use meta::{MvccMetadata, SequencedValue};
pub use reader::{
    mvcc_get, mvcc_get_record, mvcc_iterate_versions, mvcc_scan, MvccGetOptions, MvccGetResult,
    MvccScanOptions, MvccScanResult,
};
pub use resolve::{mvcc_resolve_write_intent, mvcc_resolve_write_intent_range};
pub use split::mvcc_find_split_key;
pub use stats::{compute_stats, key_stats, MvccStats};
pub use value::{Value, ValueType};
pub use writer::{
    mvcc_clear_range, mvcc_conditional_put, mvcc_delete, mvcc_delete_range, mvcc_increment,
    mvcc_merge, mvcc_put, mvcc_put_record,
};

pub(crate) use stats::with_key_stats;
pub(crate) use value::hex;

use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::keys;
use crate::storage::Reader;

/// Reads the metadata record of `key`, if any.
pub fn read_meta<R: Reader + ?Sized>(reader: &R, key: &[u8]) -> Result<Option<MvccMetadata>> {
    match reader.get(&encode_mvcc_key(key, Timestamp::ZERO))? {
        Some(bytes) => Ok(Some(MvccMetadata::decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Newest version of `key` at or below `ts`.
pub(crate) fn version_at_or_below<R: Reader + ?Sized>(
    reader: &R,
    key: &[u8],
    ts: Timestamp,
) -> Result<Option<(Timestamp, Vec<u8>)>> {
    if ts.is_empty() {
        return Ok(None);
    }
    let found = reader.seek_ge(&encode_mvcc_key(key, ts), &key_upper_bound(key))?;
    match found {
        Some((k, v)) => {
            let mk = decode_mvcc_key(&k)?;
            Ok(Some((mk.timestamp, v)))
        }
        None => Ok(None),
    }
}

/// Newest version of `key`.
pub(crate) fn latest_version<R: Reader + ?Sized>(
    reader: &R,
    key: &[u8],
) -> Result<Option<(Timestamp, Vec<u8>)>> {
    version_at_or_below(reader, key, Timestamp::MAX)
}

/// Raw bytes of the provisional value an intent points at.
pub(crate) fn provisional_value<R: Reader + ?Sized>(
    reader: &R,
    key: &[u8],
    meta: &MvccMetadata,
) -> Result<Vec<u8>> {
    reader
        .get(&encode_mvcc_key(key, meta.timestamp))?
        .ok_or_else(|| {
            Error::ReplicaCorruption(format!(
                "intent on {} has no provisional value at {}",
                keys::pretty(key),
                meta.timestamp
            ))
        })
}
