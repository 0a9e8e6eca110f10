//! MVCC reads

use serde::de::DeserializeOwned;

use crate::api::{key_next, Span};
use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::mvcc::key::{decode_mvcc_key, encode_mvcc_key, engine_span, key_upper_bound, MvccKey};
use crate::mvcc::value::Value;
use crate::mvcc::{provisional_value, read_meta, version_at_or_below};
use crate::storage::Reader;
use crate::txn::{Intent, Transaction};

/// Options for [`mvcc_get`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MvccGetOptions<'a> {
    /// Reading transaction; its own intents are visible to it.
    pub txn: Option<&'a Transaction>,
    /// Return foreign intents as advisories instead of failing.
    pub inconsistent: bool,
    /// Return deletion tombstones as empty values.
    pub tombstones: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MvccGetResult {
    pub value: Option<Value>,
    /// Foreign intent below the read timestamp, for inconsistent reads.
    pub intent: Option<Intent>,
    /// The newest visible version is a deletion.
    pub tombstone_seen: bool,
}

/// Options for [`mvcc_scan`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MvccScanOptions<'a> {
    pub txn: Option<&'a Transaction>,
    pub inconsistent: bool,
    pub tombstones: bool,
    pub reverse: bool,
    /// Maximum number of keys returned; zero is unlimited.
    pub max_keys: i64,
}

impl<'a> MvccScanOptions<'a> {
    fn get_options(&self) -> MvccGetOptions<'a> {
        MvccGetOptions {
            txn: self.txn,
            inconsistent: self.inconsistent,
            tombstones: self.tombstones,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MvccScanResult {
    pub kvs: Vec<(Vec<u8>, Value)>,
    /// Foreign intents seen by an inconsistent scan.
    pub intents: Vec<Intent>,
    /// Remaining span when `max_keys` cut the scan short.
    pub resume_span: Option<Span>,
}

/// Read the newest version of `key` visible at `ts`.
pub fn mvcc_get<R: Reader + ?Sized>(
    reader: &R,
    key: &[u8],
    ts: Timestamp,
    opts: &MvccGetOptions<'_>,
) -> Result<MvccGetResult> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("key must not be empty".to_string()));
    }
    let res = get_internal(reader, key, ts, opts)?;
    if let Some(value) = &res.value {
        value.verify(key)?;
    }
    Ok(res)
}

fn visible(mut out: MvccGetResult, raw: Vec<u8>, ts: Timestamp, opts: &MvccGetOptions<'_>) -> MvccGetResult {
    if raw.is_empty() {
        out.tombstone_seen = true;
        if !opts.tombstones {
            return out;
        }
    }
    out.value = Some(Value {
        raw_bytes: raw,
        timestamp: ts,
    });
    out
}

fn get_internal<R: Reader + ?Sized>(
    reader: &R,
    key: &[u8],
    ts: Timestamp,
    opts: &MvccGetOptions<'_>,
) -> Result<MvccGetResult> {
    let out = MvccGetResult::default();
    let mut seek_ts = ts;

    if let Some(meta) = read_meta(reader, key)? {
        if meta.is_inline() {
            return Ok(MvccGetResult {
                value: meta.inline_value(),
                ..out
            });
        }
        if let Some(intent_txn) = &meta.txn {
            match opts.txn.filter(|t| t.id() == intent_txn.id) {
                Some(txn) => {
                    if txn.meta.epoch == intent_txn.epoch {
                        if txn.meta.sequence >= intent_txn.sequence {
                            let raw = provisional_value(reader, key, &meta)?;
                            return Ok(visible(out, raw, meta.timestamp, opts));
                        }
                        if let Some(sv) = meta.history_at(txn.meta.sequence) {
                            return Ok(visible(out, sv.value.clone(), meta.timestamp, opts));
                        }
                    } else if txn.meta.epoch < intent_txn.epoch {
                        return Err(Error::status(
                            format!(
                                "failed to read with epoch {} due to a write intent with epoch {}",
                                txn.meta.epoch, intent_txn.epoch
                            ),
                            Some(txn),
                        ));
                    }
                    // Read the committed history below our own intent.
                    seek_ts = seek_ts.min(meta.timestamp.prev());
                }
                None => {
                    let intent = Intent::new(key.to_vec(), intent_txn.clone());
                    if meta.timestamp > ts {
                        // Above the read timestamp: invisible.
                    } else if opts.inconsistent {
                        seek_ts = seek_ts.min(meta.timestamp.prev());
                        return match version_at_or_below(reader, key, seek_ts)? {
                            Some((vts, raw)) => {
                                let mut res = visible(out, raw, vts, opts);
                                res.intent = Some(intent);
                                Ok(res)
                            }
                            None => Ok(MvccGetResult {
                                intent: Some(intent),
                                ..out
                            }),
                        };
                    } else {
                        return Err(Error::WriteIntentConflict {
                            intents: vec![intent],
                        });
                    }
                }
            }
        }
    }

    match version_at_or_below(reader, key, seek_ts)? {
        Some((vts, raw)) => Ok(visible(out, raw, vts, opts)),
        None => Ok(out),
    }
}

/// Read a structured record stored at `key`.
pub fn mvcc_get_record<R: Reader + ?Sized, T: DeserializeOwned>(
    reader: &R,
    key: &[u8],
    ts: Timestamp,
    txn: Option<&Transaction>,
) -> Result<Option<T>> {
    let opts = MvccGetOptions {
        txn,
        ..Default::default()
    };
    match mvcc_get(reader, key, ts, &opts)?.value {
        Some(v) => Ok(Some(v.get_record()?)),
        None => Ok(None),
    }
}

/// Read every key in `[start, end)` visible at `ts`. Conflicting intents on
/// any key are collected and reported together.
pub fn mvcc_scan<R: Reader + ?Sized>(
    reader: &R,
    start: &[u8],
    end: &[u8],
    ts: Timestamp,
    opts: &MvccScanOptions<'_>,
) -> Result<MvccScanResult> {
    if end.is_empty() || start >= end {
        return Err(Error::InvalidArgument(format!(
            "invalid scan span [{}, {})",
            crate::keys::pretty(start),
            crate::keys::pretty(end)
        )));
    }
    let get_opts = opts.get_options();
    let (lower, upper) = engine_span(start, end);
    let mut out = MvccScanResult::default();
    let mut conflicts = Vec::new();

    let mut cursor = if opts.reverse { upper.clone() } else { lower.clone() };
    loop {
        let next = if opts.reverse {
            reader.seek_lt(&cursor, &lower)?
        } else {
            reader.seek_ge(&cursor, &upper)?
        };
        let Some((engine_key, _)) = next else {
            break;
        };
        let mk = decode_mvcc_key(&engine_key)?;
        if opts.max_keys > 0 && out.kvs.len() as i64 >= opts.max_keys {
            out.resume_span = Some(if opts.reverse {
                Span::new(start.to_vec(), key_next(&mk.key))
            } else {
                Span::new(mk.key.clone(), end.to_vec())
            });
            break;
        }
        match get_internal(reader, &mk.key, ts, &get_opts) {
            Ok(res) => {
                if let Some(intent) = res.intent {
                    out.intents.push(intent);
                }
                if let Some(value) = res.value {
                    value.verify(&mk.key)?;
                    out.kvs.push((mk.key.clone(), value));
                }
            }
            Err(Error::WriteIntentConflict { intents }) => conflicts.extend(intents),
            Err(e) => return Err(e),
        }
        cursor = if opts.reverse {
            encode_mvcc_key(&mk.key, Timestamp::ZERO)
        } else {
            key_upper_bound(&mk.key)
        };
    }

    if !conflicts.is_empty() {
        return Err(Error::WriteIntentConflict { intents: conflicts });
    }
    Ok(out)
}

/// Visit every raw engine entry in the user span `[start, end)` decoded as
/// MVCC keys, in engine order, until `f` returns false.
pub fn mvcc_iterate_versions<R: Reader + ?Sized>(
    reader: &R,
    start: &[u8],
    end: &[u8],
    f: &mut dyn FnMut(&MvccKey, &[u8]) -> Result<bool>,
) -> Result<()> {
    let (lower, upper) = engine_span(start, end);
    let mut cursor = lower;
    while let Some((k, v)) = reader.seek_ge(&cursor, &upper)? {
        let mk = decode_mvcc_key(&k)?;
        if !f(&mk, &v)? {
            break;
        }
        cursor = k;
        cursor.push(0);
    }
    Ok(())
}
