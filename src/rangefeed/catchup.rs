//! Catch-up scans
//!
//! A new registration first replays the committed history of its span above
//! its start timestamp from a snapshot taken when it registered. Versions of
//! one key are read newest first, so they are buffered and emitted oldest
//! first once the scan moves past the key. With diffs, each version's
//! predecessor is the next version the scan reads.

use tokio_util::sync::CancellationToken;

use crate::api::Span;
use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::mvcc::{
    decode_mvcc_key, encode_mvcc_key, engine_span, key_upper_bound, MvccMetadata, Value,
};
use crate::rangefeed::{EventSink, RangeFeedEvent, RangeFeedValue};
use crate::storage::{EngineIterator, Reader};

/// Emits every committed version in `span` newer than `start_ts`, plus all
/// inline values, to `sink`. Checks `cancel` and yields every `batch` keys.
pub async fn catch_up_scan<R: Reader>(
    reader: R,
    span: &Span,
    start_ts: Timestamp,
    with_diff: bool,
    batch: usize,
    cancel: &CancellationToken,
    sink: &dyn EventSink,
) -> Result<()> {
    let span = span.as_range();
    let (lower, upper) = engine_span(&span.key, &span.end_key);
    let mut iter = EngineIterator::new(reader, &lower, &upper);
    let batch = batch.max(1);

    let mut last_key: Option<Vec<u8>> = None;
    let mut reorder: Vec<RangeFeedValue> = Vec::new();
    let mut keys_seen = 0usize;

    iter.first();
    while iter.valid()? {
        let mvcc_key = decode_mvcc_key(iter.key())?;
        let mut raw = iter.value().to_vec();

        if !mvcc_key.is_value() {
            let meta = MvccMetadata::decode(&raw)
                .map_err(|e| e.context(format!("decoding mvcc meta of {mvcc_key}")))?;
            match meta.raw_bytes {
                Some(inline) => raw = inline,
                None => {
                    // An intent: skip its provisional value.
                    iter.seek_ge(&encode_mvcc_key(&mvcc_key.key, meta.timestamp.prev()));
                    continue;
                }
            }
        }

        if last_key.as_deref() != Some(mvcc_key.key.as_slice()) {
            flush(&mut reorder, sink).await?;
            last_key = Some(mvcc_key.key.clone());
            keys_seen += 1;
            if keys_seen % batch == 0 {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                tokio::task::yield_now().await;
            }
        }

        let ts = mvcc_key.timestamp;
        let ignore = !(ts.is_empty() || start_ts < ts);
        if with_diff {
            if let Some(newer) = reorder.last_mut() {
                if newer.prev_value.is_some() {
                    return Err(Error::assertion(format!(
                        "previous value of {} at {} already set",
                        crate::keys::pretty(&newer.key),
                        newer.value.timestamp
                    )));
                }
                newer.prev_value = (!raw.is_empty()).then(|| Value {
                    raw_bytes: raw.clone(),
                    timestamp: ts,
                });
            }
        }

        if ignore {
            iter.seek_ge(&key_upper_bound(&mvcc_key.key));
        } else {
            iter.next();
            reorder.push(RangeFeedValue {
                key: mvcc_key.key,
                value: Value {
                    raw_bytes: raw,
                    timestamp: ts,
                },
                prev_value: None,
            });
        }
    }
    flush(&mut reorder, sink).await
}

async fn flush(reorder: &mut Vec<RangeFeedValue>, sink: &dyn EventSink) -> Result<()> {
    while let Some(value) = reorder.pop() {
        sink.send(RangeFeedEvent::Value(value)).await?;
    }
    Ok(())
}
