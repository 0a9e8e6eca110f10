//! MVCC writes

use serde::Serialize;

use crate::api::Span;
use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::keys;
use crate::mvcc::key::{decode_mvcc_key, encode_mvcc_key, engine_span, key_upper_bound, MVCC_VERSION_TIMESTAMP_SIZE};
use crate::mvcc::logical_ops::LogicalOp;
use crate::mvcc::meta::{MvccMetadata, SequencedValue};
use crate::mvcc::reader::{mvcc_get, mvcc_scan, MvccGetOptions, MvccScanOptions};
use crate::mvcc::stats::{compute_stats, with_key_stats, MvccStats};
use crate::mvcc::value::Value;
use crate::mvcc::{latest_version, provisional_value, read_meta};
use crate::storage::ReadWriter;
use crate::txn::{Intent, Transaction};

fn log_op<RW: ReadWriter + ?Sized>(rw: &mut RW, key: &[u8], op: LogicalOp) {
    if !keys::is_local(key) {
        rw.log_logical_op(op);
    }
}

/// Write `value` at `key`@`ts`. A zero `ts` writes an inline value; with a
/// transaction the write becomes (or rewrites) the transaction's intent.
pub fn mvcc_put<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ms: Option<&mut MvccStats>,
    key: &[u8],
    ts: Timestamp,
    mut value: Value,
    txn: Option<&Transaction>,
) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("key must not be empty".to_string()));
    }
    if !value.is_tombstone() && value.checksum() == 0 {
        value.init_checksum(key);
    }
    value.timestamp = ts;
    if ts.is_empty() {
        if txn.is_some() {
            return Err(Error::InvalidArgument(format!(
                "transactional write to inline key {}",
                keys::pretty(key)
            )));
        }
        return with_key_stats(rw, ms, key, 0, |rw| put_inline(rw, key, &value));
    }
    with_key_stats(rw, ms, key, ts.wall_time as i64, |rw| match txn {
        Some(txn) => put_intent(rw, key, ts, &value, txn),
        None => put_value(rw, key, ts, &value),
    })
}

fn put_inline<RW: ReadWriter + ?Sized>(rw: &mut RW, key: &[u8], value: &Value) -> Result<()> {
    let meta_key = encode_mvcc_key(key, Timestamp::ZERO);
    if let Some(meta) = read_meta(rw, key)? {
        if !meta.is_inline() {
            return Err(Error::InvalidArgument(format!(
                "inline write to versioned key {}",
                keys::pretty(key)
            )));
        }
    } else if latest_version(rw, key)?.is_some() {
        return Err(Error::InvalidArgument(format!(
            "inline write to versioned key {}",
            keys::pretty(key)
        )));
    }
    if value.is_tombstone() {
        rw.delete(&meta_key)?;
    } else {
        let meta = MvccMetadata::inline(value.raw_bytes.clone());
        rw.put(&meta_key, &meta.encode()?)?;
    }
    Ok(())
}

fn check_write_too_old<RW: ReadWriter + ?Sized>(rw: &RW, key: &[u8], ts: Timestamp) -> Result<()> {
    if let Some((existing, _)) = latest_version(rw, key)? {
        if existing >= ts {
            return Err(Error::WriteTooOld {
                timestamp: ts,
                existing_timestamp: existing,
            });
        }
    }
    Ok(())
}

fn put_value<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    key: &[u8],
    ts: Timestamp,
    value: &Value,
) -> Result<()> {
    if let Some(meta) = read_meta(rw, key)? {
        if meta.is_inline() {
            return Err(Error::InvalidArgument(format!(
                "versioned write to inline key {}",
                keys::pretty(key)
            )));
        }
        if let Some(intent_txn) = meta.txn {
            return Err(Error::WriteIntentConflict {
                intents: vec![Intent::new(key.to_vec(), intent_txn)],
            });
        }
    }
    check_write_too_old(rw, key, ts)?;
    rw.put(&encode_mvcc_key(key, ts), &value.raw_bytes)?;
    log_op(
        rw,
        key,
        LogicalOp::WriteValue {
            key: key.to_vec(),
            timestamp: ts,
            value: value.clone(),
            prev_value: None,
        },
    );
    Ok(())
}

fn put_intent<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    key: &[u8],
    ts: Timestamp,
    value: &Value,
    txn: &Transaction,
) -> Result<()> {
    let mut history = Vec::new();
    let mut write_ts = ts;
    let mut rewrite = false;

    let meta = read_meta(rw, key)?;
    let existing = match meta {
        Some(meta) if meta.is_inline() => {
            return Err(Error::InvalidArgument(format!(
                "versioned write to inline key {}",
                keys::pretty(key)
            )));
        }
        Some(meta) => meta.txn.clone().map(|intent_txn| (meta, intent_txn)),
        None => None,
    };
    match existing {
        Some((meta, intent_txn)) => {
            if intent_txn.id != txn.id() {
                return Err(Error::WriteIntentConflict {
                    intents: vec![Intent::new(key.to_vec(), intent_txn)],
                });
            }
            if txn.meta.epoch < intent_txn.epoch {
                return Err(Error::assertion(format!(
                    "put with epoch {} came after put with epoch {} on {}",
                    txn.meta.epoch,
                    intent_txn.epoch,
                    keys::pretty(key)
                )));
            }
            let current = provisional_value(rw, key, &meta)?;
            if txn.meta.epoch == intent_txn.epoch {
                if txn.meta.sequence <= intent_txn.sequence {
                    return check_replay(key, value, txn, &meta, intent_txn.sequence, current);
                }
                history = meta.intent_history.clone();
                history.push(SequencedValue {
                    sequence: intent_txn.sequence,
                    value: current,
                });
            }
            write_ts = ts.max(meta.timestamp);
            if meta.timestamp != write_ts {
                rw.delete(&encode_mvcc_key(key, meta.timestamp))?;
            }
            rewrite = true;
        }
        None => check_write_too_old(rw, key, ts)?,
    }

    rw.put(&encode_mvcc_key(key, write_ts), &value.raw_bytes)?;
    let mut intent_txn = txn.meta.clone();
    intent_txn.write_timestamp = write_ts;
    let meta = MvccMetadata {
        txn: Some(intent_txn),
        timestamp: write_ts,
        deleted: value.is_tombstone(),
        key_bytes: MVCC_VERSION_TIMESTAMP_SIZE as i64,
        val_bytes: value.raw_bytes.len() as i64,
        raw_bytes: None,
        intent_history: history,
        merge_timestamp: None,
    };
    rw.put(&encode_mvcc_key(key, Timestamp::ZERO), &meta.encode()?)?;

    let op = if rewrite {
        LogicalOp::UpdateIntentTs {
            txn_id: txn.id(),
            key: key.to_vec(),
            timestamp: write_ts,
        }
    } else {
        LogicalOp::WriteIntent {
            txn_id: txn.id(),
            txn_key: txn.meta.key.clone(),
            txn_min_timestamp: txn.meta.min_timestamp,
            timestamp: write_ts,
        }
    };
    log_op(rw, key, op);
    Ok(())
}

/// A write at or below the intent's sequence is a replay: it must carry the
/// value written at that sequence.
fn check_replay(
    key: &[u8],
    value: &Value,
    txn: &Transaction,
    meta: &MvccMetadata,
    intent_seq: i32,
    current: Vec<u8>,
) -> Result<()> {
    let prior = if txn.meta.sequence == intent_seq {
        Some(current)
    } else {
        meta.intent_history
            .iter()
            .find(|sv| sv.sequence == txn.meta.sequence)
            .map(|sv| sv.value.clone())
    };
    match prior {
        Some(raw) if Value::from_raw(raw.clone()).tag_and_data() == value.tag_and_data() => Ok(()),
        Some(_) => Err(Error::assertion(format!(
            "transaction {} with sequence {} has a different value on key {}",
            txn.short_id(),
            txn.meta.sequence,
            keys::pretty(key)
        ))),
        None => Err(Error::assertion(format!(
            "transaction {} has no write at sequence {} on key {}",
            txn.short_id(),
            txn.meta.sequence,
            keys::pretty(key)
        ))),
    }
}

/// Write a deletion tombstone.
pub fn mvcc_delete<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ms: Option<&mut MvccStats>,
    key: &[u8],
    ts: Timestamp,
    txn: Option<&Transaction>,
) -> Result<()> {
    mvcc_put(rw, ms, key, ts, Value::tombstone(), txn)
}

/// Write `value` only if the current value matches `expected`.
#[allow(clippy::too_many_arguments)]
pub fn mvcc_conditional_put<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ms: Option<&mut MvccStats>,
    key: &[u8],
    ts: Timestamp,
    value: Value,
    expected: Option<&Value>,
    allow_if_does_not_exist: bool,
    txn: Option<&Transaction>,
) -> Result<()> {
    let opts = MvccGetOptions {
        txn,
        ..Default::default()
    };
    let existing = mvcc_get(rw, key, ts, &opts)?.value;
    let matches = match (&existing, expected) {
        (None, _) if allow_if_does_not_exist => true,
        (None, None) => true,
        (Some(e), Some(x)) => e.tag_and_data() == x.tag_and_data(),
        _ => false,
    };
    if !matches {
        return Err(Error::ConditionFailed {
            actual: existing.map(|v| v.raw_bytes),
        });
    }
    mvcc_put(rw, ms, key, ts, value, txn)
}

/// Add `inc` to the integer at `key`, treating a missing value as zero.
pub fn mvcc_increment<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ms: Option<&mut MvccStats>,
    key: &[u8],
    ts: Timestamp,
    txn: Option<&Transaction>,
    inc: i64,
) -> Result<i64> {
    let opts = MvccGetOptions {
        txn,
        ..Default::default()
    };
    let current = match mvcc_get(rw, key, ts, &opts)?.value {
        Some(v) => v.get_int().map_err(|e| e.context(format!("key {}", keys::pretty(key))))?,
        None => 0,
    };
    let new = current.checked_add(inc).ok_or_else(|| {
        Error::InvalidArgument(format!(
            "key {} with value {current} incremented by {inc} results in overflow",
            keys::pretty(key)
        ))
    })?;
    mvcc_put(rw, ms, key, ts, Value::from_int(new), txn)?;
    Ok(new)
}

/// Delete every live key in `[start, end)`, up to `max_keys`.
#[allow(clippy::too_many_arguments)]
pub fn mvcc_delete_range<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    mut ms: Option<&mut MvccStats>,
    start: &[u8],
    end: &[u8],
    max_keys: i64,
    ts: Timestamp,
    txn: Option<&Transaction>,
    return_keys: bool,
) -> Result<(Vec<Vec<u8>>, i64, Option<Span>)> {
    let opts = MvccScanOptions {
        txn,
        max_keys,
        ..Default::default()
    };
    let scan = mvcc_scan(rw, start, end, ts, &opts)?;
    let mut deleted = Vec::new();
    let num = scan.kvs.len() as i64;
    for (key, _) in scan.kvs {
        mvcc_delete(rw, ms.as_deref_mut(), &key, ts, txn)?;
        if return_keys {
            deleted.push(key);
        }
    }
    Ok((deleted, num, scan.resume_span))
}

/// Remove every version of every key in `[start, end)` without leaving
/// tombstones. With `max_keys` set, stops after that many user keys and
/// returns the remaining span.
pub fn mvcc_clear_range<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    mut ms: Option<&mut MvccStats>,
    start: &[u8],
    end: &[u8],
    max_keys: i64,
) -> Result<Option<Span>> {
    let (lower, upper) = engine_span(start, end);
    if max_keys <= 0 {
        if let Some(ms) = ms {
            let now = ms.last_update_nanos;
            let cleared = compute_stats(&*rw, start, end, now)?;
            ms.subtract(&cleared);
        }
        rw.clear_range(&lower, &upper)?;
        return Ok(None);
    }

    let mut cursor = lower;
    let mut count = 0;
    while let Some((engine_key, _)) = rw.seek_ge(&cursor, &upper)? {
        let mk = decode_mvcc_key(&engine_key)?;
        if count >= max_keys {
            return Ok(Some(Span::new(mk.key, end.to_vec())));
        }
        let now = ms.as_ref().map(|m| m.last_update_nanos).unwrap_or(0);
        let key_start = encode_mvcc_key(&mk.key, Timestamp::ZERO);
        let key_end = key_upper_bound(&mk.key);
        with_key_stats(rw, ms.as_deref_mut(), &mk.key, now, |rw| {
            rw.clear_range(&key_start, &key_end)?;
            Ok(())
        })?;
        count += 1;
        cursor = key_end;
    }
    Ok(None)
}

/// Merge `value` into the inline value at `key` through the merge operator.
pub fn mvcc_merge<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ms: Option<&mut MvccStats>,
    key: &[u8],
    ts: Timestamp,
    value: &Value,
) -> Result<()> {
    let mut operand = value.clone();
    operand.clear_checksum();
    let meta = MvccMetadata {
        raw_bytes: Some(operand.raw_bytes),
        merge_timestamp: (!ts.is_empty()).then_some(ts),
        ..Default::default()
    };
    let encoded = meta.encode()?;
    with_key_stats(rw, ms, key, ts.wall_time as i64, |rw| {
        rw.merge(&encode_mvcc_key(key, Timestamp::ZERO), &encoded)?;
        Ok(())
    })
}

/// Write a structured record at `key`.
pub fn mvcc_put_record<RW: ReadWriter + ?Sized, T: Serialize>(
    rw: &mut RW,
    ms: Option<&mut MvccStats>,
    key: &[u8],
    ts: Timestamp,
    record: &T,
    txn: Option<&Transaction>,
) -> Result<()> {
    mvcc_put(rw, ms, key, ts, Value::from_record(record)?, txn)
}
