//! Human-readable rendering of raw engine key/value pairs
//!
//! Used by `rangedb debug print`. The key decides how the value is decoded:
//! store Raft log entries, range-ID local state, range-local records, meta
//! descriptors and time series all have dedicated renderings. Anything that
//! does not decode falls back to escaped bytes.

use std::fmt::Write as _;

use openraft::EntryPayload;

use crate::api::{
    HardState, Lease, RaftTombstone, RaftTruncatedState, RangeAppliedState, RangeDescriptor,
};
use crate::error::{Error, Result};
use crate::keys::{self, RangeIdKey};
use crate::mvcc::{decode_mvcc_key, MvccKey, MvccMetadata, MvccStats, Value, ValueType};
use crate::raft::{Command, Entry, RaftCommand};
use crate::store::StoreIdent;
use crate::storage::{BatchOp, BatchReader};
use crate::txn::{AbortSpanEntry, Transaction};

/// Renders one engine key/value pair as `key: value`. Fails when the pair
/// does not decode as what its key says it is.
pub fn print_kv(key: &[u8], value: &[u8]) -> Result<String> {
    if key.starts_with(&keys::store_raft_log_prefix()) {
        return Ok(format!("{}: {}", keys::pretty(key), print_raft_log_entry(value)?));
    }
    let mkey = decode_mvcc_key(key)?;
    let rendered = if mkey.timestamp.is_empty() {
        print_meta(&mkey, value)?
    } else {
        print_versioned(&mkey.key, &Value::from_raw(value.to_vec()))?
    };
    Ok(format!("{mkey}: {rendered}"))
}

/// Like [`print_kv`] but never fails: undecodable pairs are shown as
/// escaped bytes.
pub fn sprint_kv(key: &[u8], value: &[u8]) -> String {
    match print_kv(key, value) {
        Ok(s) => s,
        Err(_) => format!("{}: {}", quote(key), quote(value)),
    }
}

fn quote(bytes: &[u8]) -> String {
    format!("\"{}\"", bytes.escape_ascii())
}

/// `{entry header} by {lease}`, the command and its decoded write batch.
fn print_raft_log_entry(value: &[u8]) -> Result<String> {
    let entry: Entry =
        bincode::deserialize(value).map_err(|e| Error::Codec(format!("raft log entry: {e}")))?;
    let mut out = format!("{}", entry.log_id);
    match &entry.payload {
        EntryPayload::Blank => out.push_str(" blank"),
        EntryPayload::Membership(m) => {
            let _ = write!(out, " membership {m:?}");
        }
        EntryPayload::Normal(Command::Noop) => out.push_str(" noop"),
        EntryPayload::Normal(cmd) => {
            if let Some((range_id, cmd_id, raft_cmd)) = cmd.raft_command() {
                let _ = write!(
                    out,
                    " r{range_id} cmd={cmd_id:016x} by lease #{}\n{raft_cmd}",
                    raft_cmd.proposer_lease_sequence
                );
                if let Command::ConfChange { change, .. } = cmd {
                    let _ = write!(
                        out,
                        "\nconf change {:?} {}",
                        change.change_type, change.replica
                    );
                }
                out.push_str(&print_write_batch(raft_cmd)?);
            }
        }
    }
    Ok(out)
}

fn print_write_batch(cmd: &RaftCommand) -> Result<String> {
    let Some(wb) = &cmd.write_batch else {
        return Ok(String::new());
    };
    let mut out = String::from("\nwrite batch:");
    for entry in BatchReader::new(&wb.data)? {
        let entry = entry?;
        let _ = match entry.op {
            BatchOp::Value => write!(out, "\nPut: {}", sprint_kv(entry.key, entry.value)),
            BatchOp::Merge => write!(out, "\nMerge: {}", sprint_kv(entry.key, entry.value)),
            BatchOp::Deletion | BatchOp::SingleDeletion => {
                write!(out, "\nDelete: {}", print_engine_key(entry.key))
            }
        };
    }
    Ok(out)
}

fn print_engine_key(key: &[u8]) -> String {
    match decode_mvcc_key(key) {
        Ok(k) => k.to_string(),
        Err(_) => keys::pretty(key),
    }
}

/// Zero-timestamp values: inline records or intent metadata.
fn print_meta(mkey: &MvccKey, value: &[u8]) -> Result<String> {
    let meta = MvccMetadata::decode(value)?;
    let Some(raw) = &meta.raw_bytes else {
        return Ok(meta.to_string());
    };
    let inline = Value::from_raw(raw.clone());
    if inline.tag() == ValueType::TimeSeries {
        let mut out = format!("{}", inline.get_timeseries()?);
        if let Some(ts) = meta.merge_timestamp {
            let _ = write!(out, " mergeTS={ts}");
        }
        return Ok(out);
    }
    let key = &mkey.key;
    if key.starts_with(keys::LOCAL_RANGE_ID_PREFIX) {
        return print_range_id_local(&keys::decode_range_id_key(key)?, &inline);
    }
    if key.as_slice() == keys::store_ident_key().as_slice() {
        return Ok(format!("{:?}", inline.get_record::<StoreIdent>()?));
    }
    print_versioned(key, &inline)
}

fn print_range_id_local(k: &RangeIdKey<'_>, value: &Value) -> Result<String> {
    let s = match k.suffix {
        s if s == keys::LOCAL_ABORT_SPAN_SUFFIX => {
            format!("{:?}", value.get_record::<AbortSpanEntry>()?)
        }
        s if s == keys::LOCAL_RANGE_APPLIED_STATE_SUFFIX => {
            value.get_record::<RangeAppliedState>()?.to_string()
        }
        s if s == keys::LOCAL_RANGE_LEASE_SUFFIX => value.get_record::<Lease>()?.to_string(),
        s if s == keys::LOCAL_RANGE_STATS_LEGACY_SUFFIX => {
            value.get_record::<MvccStats>()?.to_string()
        }
        s if s == keys::LOCAL_RANGE_GC_THRESHOLD_SUFFIX
            || s == keys::LOCAL_TXN_SPAN_GC_THRESHOLD_SUFFIX
            || s == keys::LOCAL_RANGE_LAST_REPLICA_GC_TIMESTAMP_SUFFIX
            || s == keys::LOCAL_RANGE_LAST_VERIFICATION_TIMESTAMP_SUFFIX =>
        {
            value.get_record::<crate::hlc::Timestamp>()?.to_string()
        }
        s if s == keys::LOCAL_RAFT_TRUNCATED_STATE_SUFFIX => {
            value.get_record::<RaftTruncatedState>()?.to_string()
        }
        s if s == keys::LOCAL_RAFT_TOMBSTONE_SUFFIX => {
            value.get_record::<RaftTombstone>()?.to_string()
        }
        s if s == keys::LOCAL_RAFT_HARD_STATE_SUFFIX => {
            value.get_record::<HardState>()?.to_string()
        }
        _ => value.pretty_print(),
    };
    Ok(s)
}

/// Versioned values, and inline values whose key carries no special
/// meaning.
fn print_versioned(key: &[u8], value: &Value) -> Result<String> {
    if value.is_tombstone() {
        return Ok(value.pretty_print());
    }
    if key.starts_with(keys::LOCAL_RANGE_PREFIX) {
        let rk = keys::decode_range_key(key)?;
        if rk.suffix == keys::LOCAL_RANGE_DESCRIPTOR_SUFFIX {
            return print_descriptor(value);
        }
        if rk.suffix == keys::LOCAL_TRANSACTION_SUFFIX {
            return Ok(value.get_record::<Transaction>()?.to_string());
        }
    } else if key.starts_with(keys::META1_PREFIX) || key.starts_with(keys::META2_PREFIX) {
        return print_descriptor(value);
    } else if key.starts_with(keys::TIMESERIES_PREFIX) && value.tag() == ValueType::TimeSeries {
        return Ok(value.get_timeseries()?.to_string());
    }
    Ok(value.pretty_print())
}

fn print_descriptor(value: &Value) -> Result<String> {
    let desc: RangeDescriptor = value.get_record()?;
    Ok(format!(
        "[{}, {}) Raw:{desc}",
        keys::pretty(&desc.start_key),
        keys::pretty(&desc.end_key)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ReplicaDescriptor;
    use crate::hlc::Timestamp;
    use crate::mvcc::encode_mvcc_key;
    use crate::raft::WriteBatch;
    use crate::storage::BatchBuilder;
    use crate::txn::IsolationLevel;
    use openraft::{CommittedLeaderId, LogId};

    fn desc() -> RangeDescriptor {
        RangeDescriptor::new(
            3,
            b"a".to_vec(),
            b"m".to_vec(),
            vec![ReplicaDescriptor::new(1, 1, 1)],
        )
    }

    #[test]
    fn test_print_range_descriptor() {
        let key = encode_mvcc_key(&keys::range_descriptor_key(b"a"), Timestamp::from_wall(10));
        let value = Value::from_record(&desc()).unwrap();
        let out = print_kv(&key, &value.raw_bytes).unwrap();
        assert!(out.contains("r3:{"), "{out}");
        assert!(out.contains("[\"a\", \"m\") Raw:"), "{out}");
    }

    #[test]
    fn test_print_meta_descriptor() {
        let key = encode_mvcc_key(&keys::range_meta_key(b"m"), Timestamp::from_wall(10));
        let value = Value::from_record(&desc()).unwrap();
        let out = print_kv(&key, &value.raw_bytes).unwrap();
        assert!(out.contains("Raw:"), "{out}");
    }

    #[test]
    fn test_print_transaction_record() {
        let txn = Transaction::new(
            "print",
            b"k".to_vec(),
            IsolationLevel::Serializable,
            1,
            Timestamp::from_wall(5),
        );
        let key = encode_mvcc_key(
            &keys::transaction_key(b"k", txn.meta.id),
            Timestamp::from_wall(5),
        );
        let value = Value::from_record(&txn).unwrap();
        let out = print_kv(&key, &value.raw_bytes).unwrap();
        assert!(out.contains("\"print\""), "{out}");
    }

    #[test]
    fn test_print_inline_lease() {
        let lease = Lease {
            start: Timestamp::from_wall(7),
            epoch: 2,
            sequence: 4,
            ..Default::default()
        };
        let meta = MvccMetadata::inline(Value::from_record(&lease).unwrap().raw_bytes);
        let key = encode_mvcc_key(&keys::range_lease_key(3), Timestamp::ZERO);
        let out = print_kv(&key, &meta.encode().unwrap()).unwrap();
        assert_eq!(out, format!("{}: {lease}", keys::pretty(&keys::range_lease_key(3))));
    }

    #[test]
    fn test_print_raft_log_entry() {
        let mut b = BatchBuilder::new();
        b.put(&encode_mvcc_key(b"k", Timestamp::from_wall(9)), &Value::from_string("v").raw_bytes);
        let cmd = RaftCommand {
            proposer_lease_sequence: 4,
            max_lease_index: 12,
            write_batch: Some(WriteBatch::new(b.encode())),
            ..Default::default()
        };
        let entry = Entry {
            log_id: LogId::new(CommittedLeaderId::new(2, 1), 17),
            payload: EntryPayload::Normal(Command::Range {
                range_id: 3,
                cmd_id: 1,
                command: cmd,
            }),
        };
        let value = bincode::serialize(&entry).unwrap();
        let out = print_kv(&keys::store_raft_log_key(17), &value).unwrap();
        assert!(out.contains("by lease #4"), "{out}");
        assert!(out.contains("write batch:\nPut: \"k\"/"), "{out}");
        assert!(out.contains("/STRING/v"), "{out}");
    }

    #[test]
    fn test_print_garbage_fails() {
        let key = encode_mvcc_key(&keys::range_lease_key(3), Timestamp::ZERO);
        assert!(print_kv(&key, b"\x00\x01").is_err());
        assert!(sprint_kv(&key, b"\x00\x01").contains("\\x00\\x01"));
    }
}
