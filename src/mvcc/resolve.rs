//! Intent resolution
//!
//! Resolving an intent applies its transaction's final (or pushed) state:
//! a committed intent becomes a plain version at the commit timestamp, a
//! pushed pending intent moves to the pushed timestamp, an aborted intent
//! disappears.

use crate::api::Span;
use crate::error::Result;
use crate::hlc::Timestamp;
use crate::keys;
use crate::mvcc::key::{decode_mvcc_key, encode_mvcc_key, engine_span, key_upper_bound};
use crate::mvcc::logical_ops::LogicalOp;
use crate::mvcc::stats::{with_key_stats, MvccStats};
use crate::mvcc::value::Value;
use crate::mvcc::{provisional_value, read_meta};
use crate::storage::ReadWriter;
use crate::txn::{LockUpdate, TxnStatus};

/// Resolve the intent at `update.span.key`. Returns true if an intent of the
/// transaction was found and changed.
pub fn mvcc_resolve_write_intent<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ms: Option<&mut MvccStats>,
    update: &LockUpdate,
) -> Result<bool> {
    resolve_key(rw, ms, &update.span.key, update)
}

fn resolve_key<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ms: Option<&mut MvccStats>,
    key: &[u8],
    update: &LockUpdate,
) -> Result<bool> {
    let Some(meta) = read_meta(rw, key)? else {
        return Ok(false);
    };
    let Some(intent_txn) = meta.txn.clone() else {
        return Ok(false);
    };
    if intent_txn.id != update.txn.id {
        return Ok(false);
    }

    let epochs_match = intent_txn.epoch == update.txn.epoch;
    let in_progress = !update.status.is_finalized();
    let committed = update.status == TxnStatus::Committed && epochs_match;
    let pushed = in_progress && epochs_match && meta.timestamp < update.txn.write_timestamp;

    if in_progress && !pushed {
        return Ok(false);
    }

    let meta_key = encode_mvcc_key(key, Timestamp::ZERO);
    let old_version = encode_mvcc_key(key, meta.timestamp);

    if committed || pushed {
        let new_ts = update.txn.write_timestamp.max(meta.timestamp);
        let raw = provisional_value(rw, key, &meta)?;
        with_key_stats(rw, ms, key, new_ts.wall_time as i64, |rw| {
            if new_ts != meta.timestamp {
                rw.delete(&old_version)?;
                rw.put(&encode_mvcc_key(key, new_ts), &raw)?;
            }
            if committed {
                rw.delete(&meta_key)?;
            } else {
                let mut moved = meta.clone();
                moved.timestamp = new_ts;
                if let Some(t) = moved.txn.as_mut() {
                    t.write_timestamp = new_ts;
                }
                rw.put(&meta_key, &moved.encode()?)?;
            }
            Ok(())
        })?;
        if !keys::is_local(key) {
            let op = if committed {
                LogicalOp::CommitIntent {
                    txn_id: intent_txn.id,
                    key: key.to_vec(),
                    timestamp: new_ts,
                    value: Value {
                        raw_bytes: raw,
                        timestamp: new_ts,
                    },
                    prev_value: None,
                }
            } else {
                LogicalOp::UpdateIntent {
                    txn_id: intent_txn.id,
                    timestamp: new_ts,
                }
            };
            rw.log_logical_op(op);
        }
        return Ok(true);
    }

    // Aborted, or committed in a later epoch than the intent was written.
    with_key_stats(rw, ms, key, meta.timestamp.wall_time as i64, |rw| {
        rw.delete(&old_version)?;
        rw.delete(&meta_key)?;
        Ok(())
    })?;
    if !keys::is_local(key) {
        rw.log_logical_op(LogicalOp::AbortIntent {
            txn_id: intent_txn.id,
        });
    }
    Ok(true)
}

/// Resolve the transaction's intents in `update.span`, at most `max_keys`
/// of them (zero is unlimited). Returns the number resolved and the span
/// left to resolve.
pub fn mvcc_resolve_write_intent_range<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    mut ms: Option<&mut MvccStats>,
    update: &LockUpdate,
    max_keys: i64,
) -> Result<(i64, Option<Span>)> {
    if update.span.is_point() {
        let resolved = resolve_key(rw, ms, &update.span.key, update)?;
        return Ok((resolved as i64, None));
    }
    let (lower, upper) = engine_span(&update.span.key, &update.span.end_key);
    let mut cursor = lower;
    let mut resolved = 0;
    while let Some((engine_key, _)) = rw.seek_ge(&cursor, &upper)? {
        let mk = decode_mvcc_key(&engine_key)?;
        cursor = key_upper_bound(&mk.key);
        if mk.timestamp.is_empty() {
            if max_keys > 0 && resolved >= max_keys {
                return Ok((resolved, Some(Span::new(mk.key, update.span.end_key.clone()))));
            }
            if resolve_key(rw, ms.as_deref_mut(), &mk.key, update)? {
                resolved += 1;
            }
        }
    }
    Ok((resolved, None))
}
