//! Ingestion of pre-encoded batches

use crate::api::{Response, WriteBatchRequest};
use crate::batcheval::{CommandArgs, EvalResult};
use crate::error::{Error, Result};
use crate::keys;
use crate::mvcc::{compute_stats, decode_mvcc_key, engine_span, MvccKey, MvccMetadata, MvccStats, Value};
use crate::storage::{BatchOp, BatchReader, ReadWriter};

/// Replaces everything in `data_span` with the contents of an encoded batch
/// of MVCC engine keys.
pub(super) fn write_batch<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &WriteBatchRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    if args.txn().is_some() {
        return Err(Error::InvalidArgument(
            "cannot execute WriteBatch within a transaction".to_string(),
        ));
    }
    let data_span = &req.data_span;
    if data_span.is_point() || !req.span.contains(data_span) {
        return Err(Error::InvalidArgument(format!(
            "data span {} must be a range within request span {}",
            data_span, req.span
        )));
    }
    let now = args.header.timestamp.wall_time as i64;

    let before = compute_stats(&*rw, &data_span.key, &data_span.end_key, now)?;
    let (lower, upper) = engine_span(&data_span.key, &data_span.end_key);
    rw.clear_range(&lower, &upper)?;

    let mut count = 0usize;
    for entry in BatchReader::new(&req.data)? {
        let entry = entry?;
        let mk = decode_mvcc_key(entry.key)?;
        if !data_span.contains_key(&mk.key) {
            return Err(Error::InvalidArgument(format!(
                "key {} outside of data span {}",
                keys::pretty(&mk.key),
                data_span
            )));
        }
        match entry.op {
            BatchOp::Value => {
                verify_put(&mk, entry.value)?;
                rw.put(entry.key, entry.value)?
            }
            BatchOp::Deletion => rw.delete(entry.key)?,
            BatchOp::SingleDeletion => rw.single_delete(entry.key)?,
            BatchOp::Merge => rw.merge(entry.key, entry.value)?,
        }
        count += 1;
    }

    let after = compute_stats(&*rw, &data_span.key, &data_span.end_key, now)?;
    ms.subtract(&before);
    ms.add(&after);
    tracing::debug!(
        range_id = args.ctx.range_id(),
        span = %data_span,
        entries = count,
        "ingested write batch"
    );
    Ok((Response::WriteBatch, EvalResult::default()))
}

/// Checks the checksum of a versioned value, or of the inline value held by
/// a metadata record.
fn verify_put(mk: &MvccKey, value: &[u8]) -> Result<()> {
    if !mk.timestamp.is_empty() {
        return Value::from_raw(value.to_vec()).verify(&mk.key);
    }
    match MvccMetadata::decode(value)?.raw_bytes {
        Some(raw) => Value::from_raw(raw).verify(&mk.key),
        None => Ok(()),
    }
}
