//! Garbage collection of old versions

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::keys;
use crate::mvcc::key::{decode_mvcc_key, encode_mvcc_key, key_upper_bound};
use crate::mvcc::read_meta;
use crate::mvcc::stats::{with_key_stats, MvccStats};
use crate::storage::ReadWriter;

/// A key whose versions at or below `timestamp` are garbage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcKey {
    pub key: Vec<u8>,
    pub timestamp: Timestamp,
}

/// Remove versions no read above `gc_key.timestamp` can observe: every
/// version shadowed by a newer one at or below that timestamp, plus the
/// newest such version if it is a deletion.
pub fn mvcc_garbage_collect<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    mut ms: Option<&mut MvccStats>,
    gc_keys: &[GcKey],
    now: Timestamp,
) -> Result<()> {
    for gc_key in gc_keys {
        let key = gc_key.key.as_slice();
        if let Some(meta) = read_meta(rw, key)? {
            if meta.is_inline() {
                continue;
            }
            if meta.is_intent() && meta.timestamp <= gc_key.timestamp {
                return Err(Error::InvalidArgument(format!(
                    "request to GC intent at {}",
                    keys::pretty(key)
                )));
            }
        }

        let lower = encode_mvcc_key(key, Timestamp::ZERO);
        let upper = key_upper_bound(key);
        let mut doomed = Vec::new();
        let mut found_visible = false;
        for (engine_key, value) in rw.scan(&lower, &upper)? {
            let mk = decode_mvcc_key(&engine_key)?;
            if mk.timestamp.is_empty() || mk.timestamp > gc_key.timestamp {
                continue;
            }
            if !found_visible {
                found_visible = true;
                if !value.is_empty() {
                    continue;
                }
            }
            doomed.push(engine_key);
        }
        if doomed.is_empty() {
            continue;
        }
        with_key_stats(rw, ms.as_deref_mut(), key, now.wall_time as i64, |rw| {
            for engine_key in &doomed {
                rw.delete(engine_key)?;
            }
            Ok(())
        })?;
        tracing::debug!(key = %keys::pretty(key), versions = doomed.len(), "Garbage collected versions");
    }
    Ok(())
}
