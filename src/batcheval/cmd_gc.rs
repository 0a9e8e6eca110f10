//! Garbage collection

use crate::api::{GcRequest, Response};
use crate::batcheval::{CommandArgs, EvalResult};
use crate::error::{Error, Result};
use crate::keys;
use crate::mvcc::{mvcc_delete, mvcc_garbage_collect, mvcc_get_record, MvccStats};
use crate::hlc::Timestamp;
use crate::stateloader::StateLoader;
use crate::storage::ReadWriter;
use crate::txn::Transaction;

/// Removes old versions of the listed keys, deletes finalized transaction
/// records and advances the range's GC thresholds.
pub(super) fn gc<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &GcRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    if args.txn().is_some() {
        return Err(Error::InvalidArgument(
            "cannot execute GC within a transaction".to_string(),
        ));
    }
    let state = args.ctx.state;
    let mut threshold = state.gc_threshold;
    threshold.forward(req.threshold);
    let mut txn_threshold = state.txn_span_gc_threshold;
    txn_threshold.forward(req.txn_span_gc_threshold);

    for k in &req.keys {
        if !req.span.as_range().contains_key(&k.key) {
            return Err(Error::InvalidArgument(format!(
                "GC key {} outside of span {}",
                keys::pretty(&k.key),
                req.span
            )));
        }
        if k.timestamp > threshold {
            return Err(Error::InvalidArgument(format!(
                "GC of {} at {} above threshold {}",
                keys::pretty(&k.key),
                k.timestamp,
                threshold
            )));
        }
    }
    mvcc_garbage_collect(rw, Some(&mut *ms), &req.keys, args.header.timestamp)?;

    for key in &req.txn_records {
        let Some(record) = mvcc_get_record::<_, Transaction>(&*rw, key, Timestamp::ZERO, None)? else {
            continue;
        };
        if !record.is_finalized() {
            return Err(Error::InvalidArgument(format!(
                "cannot GC pending transaction record {}",
                record.short_id()
            )));
        }
        mvcc_delete(rw, Some(&mut *ms), key, Timestamp::ZERO, None)?;
    }

    let rsl = StateLoader::new(args.ctx.range_id());
    let mut res = EvalResult::default();
    if threshold > state.gc_threshold {
        rsl.set_gc_threshold(rw, Some(&mut *ms), threshold)?;
        res.replicated.gc_threshold = Some(threshold);
    }
    if txn_threshold > state.txn_span_gc_threshold {
        rsl.set_txn_span_gc_threshold(rw, Some(&mut *ms), txn_threshold)?;
        res.replicated.txn_span_gc_threshold = Some(txn_threshold);
    }
    tracing::debug!(
        range_id = args.ctx.range_id(),
        keys = req.keys.len(),
        txn_records = req.txn_records.len(),
        %threshold,
        "GC"
    );
    Ok((Response::Gc, res))
}

#[cfg(test)]
mod tests {
    use crate::api::{GcRequest, Request, Response, Span};
    use crate::batcheval::testutil::*;
    use crate::error::Error;
    use crate::keys;
    use crate::mvcc::{compute_stats, read_meta, GcKey, Value};
    use crate::txn::{IsolationLevel, Transaction};

    fn gc_req(keys: Vec<GcKey>, threshold: u64) -> Request {
        Request::Gc(GcRequest {
            span: Span::new(b"a".to_vec(), b"z".to_vec()),
            keys,
            threshold: ts(threshold),
            txn_span_gc_threshold: ts(0),
            txn_records: Vec::new(),
        })
    }

    #[test]
    fn test_gc_removes_shadowed_versions() {
        let mut r = TestRange::new(b"a", b"z");
        for (at, v) in [(10, "v1"), (20, "v2"), (30, "v3")] {
            r.send_one(header(at), Request::put(b"k".to_vec(), Value::from_string(v)))
                .unwrap();
        }
        r.send_one(
            header(40),
            gc_req(
                vec![GcKey {
                    key: b"k".to_vec(),
                    timestamp: ts(25),
                }],
                25,
            ),
        )
        .unwrap();
        assert_eq!(r.state.gc_threshold, ts(25));

        let user = compute_stats(r.engine.as_ref(), b"a", b"z", 0).unwrap();
        assert_eq!(user.val_count, 2);
        match r.send_one(header(26), Request::get(b"k".to_vec())).unwrap() {
            Response::Get { value: Some(v), .. } => assert_eq!(v.timestamp, ts(20)),
            other => panic!("unexpected {other:?}"),
        }

        // A lower threshold never moves the persisted one back.
        r.send_one(header(41), gc_req(Vec::new(), 5)).unwrap();
        assert_eq!(r.state.gc_threshold, ts(25));
    }

    #[test]
    fn test_gc_rejects_key_above_threshold() {
        let mut r = TestRange::new(b"a", b"z");
        let err = r
            .send_one(
                header(40),
                gc_req(
                    vec![GcKey {
                        key: b"k".to_vec(),
                        timestamp: ts(30),
                    }],
                    20,
                ),
            )
            .unwrap_err();
        assert!(matches!(err.root(), Error::InvalidArgument(_)));
    }

    #[test]
    fn test_gc_deletes_finalized_txn_records() {
        let mut r = TestRange::new(b"a", b"z");
        let txn = Transaction::new("t", b"b".to_vec(), IsolationLevel::Serializable, 1, ts(10));
        r.send_one(
            txn_header(&txn),
            Request::EndTxn(crate::api::EndTxnRequest::commit(
                b"b".to_vec(),
                vec![Span::point(b"zz".to_vec())],
            )),
        )
        .unwrap();
        let record_key = keys::transaction_key(b"b", txn.id());
        assert!(read_meta(r.engine.as_ref(), &record_key).unwrap().is_some());

        let mut req = GcRequest {
            span: Span::new(b"a".to_vec(), b"z".to_vec()),
            keys: Vec::new(),
            threshold: ts(0),
            txn_span_gc_threshold: ts(30),
            txn_records: vec![record_key.clone()],
        };
        r.send_one(header(40), Request::Gc(req.clone())).unwrap();
        assert!(read_meta(r.engine.as_ref(), &record_key).unwrap().is_none());
        assert_eq!(r.state.txn_span_gc_threshold, ts(30));

        let pending = Transaction::new("p", b"c".to_vec(), IsolationLevel::Serializable, 1, ts(10));
        r.send_one(
            txn_header(&pending),
            Request::HeartbeatTxn(crate::api::HeartbeatTxnRequest {
                key: b"c".to_vec(),
                now: ts(11),
            }),
        )
        .unwrap();
        req.txn_records = vec![keys::transaction_key(b"c", pending.id())];
        let err = r.send_one(header(41), Request::Gc(req)).unwrap_err();
        assert!(matches!(err.root(), Error::InvalidArgument(_)));
    }
}
