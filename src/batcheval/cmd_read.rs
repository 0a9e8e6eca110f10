//! Read-only commands

use crate::api::{GetRequest, QueryIntentRequest, ReadConsistency, Response, ScanRequest, ScanResponse};
use crate::batcheval::{CommandArgs, EvalResult};
use crate::error::{Error, Result, RetryReason};
use crate::hlc::Timestamp;
use crate::mvcc::{mvcc_get, mvcc_scan, MvccGetOptions, MvccScanOptions};
use crate::storage::Reader;
use crate::txn::IsolationLevel;

pub(super) fn get<R: Reader + ?Sized>(
    reader: &R,
    args: &CommandArgs<'_>,
    req: &GetRequest,
) -> Result<(Response, EvalResult)> {
    let opts = MvccGetOptions {
        txn: args.txn(),
        inconsistent: args.header.read_consistency == ReadConsistency::Inconsistent,
        tombstones: false,
    };
    let res = mvcc_get(reader, &req.key, args.read_ts(), &opts)?;
    Ok((
        Response::Get {
            value: res.value,
            intent: res.intent,
        },
        EvalResult::default(),
    ))
}

pub(super) fn scan<R: Reader + ?Sized>(
    reader: &R,
    args: &CommandArgs<'_>,
    req: &ScanRequest,
    reverse: bool,
) -> Result<(Response, EvalResult)> {
    let opts = MvccScanOptions {
        txn: args.txn(),
        inconsistent: args.header.read_consistency == ReadConsistency::Inconsistent,
        tombstones: false,
        reverse,
        max_keys: args.max_keys,
    };
    let res = mvcc_scan(reader, &req.span.key, &req.span.end_key, args.read_ts(), &opts)?;
    let resp = ScanResponse {
        rows: res.kvs,
        intents: res.intents,
        resume_span: res.resume_span,
    };
    let resp = if reverse {
        Response::ReverseScan(resp)
    } else {
        Response::Scan(resp)
    };
    Ok((resp, EvalResult::default()))
}

/// Checks that the intent a transaction expects to have written is still
/// present and unpushed.
pub(super) fn query_intent<R: Reader + ?Sized>(
    reader: &R,
    args: &CommandArgs<'_>,
    req: &QueryIntentRequest,
) -> Result<(Response, EvalResult)> {
    let own_txn = args
        .txn()
        .filter(|t| t.id() == req.txn.id);

    // Reading at the maximum timestamp sees the intent wherever it sits.
    let opts = MvccGetOptions {
        inconsistent: true,
        ..Default::default()
    };
    let intent = mvcc_get(reader, &req.key, Timestamp::MAX, &opts)?.intent;

    let mut found = false;
    let mut pushed = false;
    if let Some(intent) = &intent {
        found = intent.txn.id == req.txn.id
            && intent.txn.epoch == req.txn.epoch
            && intent.txn.sequence >= req.txn.sequence;
        if found {
            let mut cmp_ts = req.txn.write_timestamp;
            if let Some(txn) = own_txn {
                cmp_ts.forward(txn.write_timestamp());
            }
            if cmp_ts < intent.txn.write_timestamp {
                pushed = true;
                // A read-committed transaction may commit at the pushed
                // timestamp, so its intent still counts as found.
                found = req.txn.isolation == IsolationLevel::ReadCommitted;
            }
        }
    }

    if !found && req.error_if_missing {
        if own_txn.is_some() && pushed {
            return Err(Error::retry(RetryReason::Serializable, "intent pushed"));
        }
        return Err(Error::IntentMissing {
            key: req.key.clone(),
            intent,
        });
    }
    Ok((Response::QueryIntent { found_intent: found }, EvalResult::default()))
}

pub(super) fn lease_info(args: &CommandArgs<'_>) -> Result<(Response, EvalResult)> {
    Ok((
        Response::LeaseInfo {
            lease: args.ctx.state.lease.clone(),
        },
        EvalResult::default(),
    ))
}

#[cfg(test)]
mod tests {
    use crate::api::{QueryIntentRequest, Request, Response};
    use crate::batcheval::testutil::*;
    use crate::error::{Error, RetryReason};
    use crate::mvcc::Value;
    use crate::txn::{IsolationLevel, Transaction};

    fn query(txn: &Transaction, error_if_missing: bool) -> Request {
        Request::QueryIntent(QueryIntentRequest {
            key: b"k".to_vec(),
            txn: txn.meta.clone(),
            error_if_missing,
        })
    }

    #[test]
    fn test_get_reads_committed_value() {
        let mut r = TestRange::new(b"a", b"z");
        r.send_one(header(100), Request::put(b"k".to_vec(), Value::from_string("v1")))
            .unwrap();
        match r.send_one(header(200), Request::get(b"k".to_vec())).unwrap() {
            Response::Get { value: Some(v), .. } => {
                assert_eq!(v.get_bytes().unwrap(), b"v1");
                assert_eq!(v.timestamp, ts(100));
            }
            other => panic!("unexpected {other:?}"),
        }
        match r.send_one(header(99), Request::get(b"k".to_vec())).unwrap() {
            Response::Get { value, .. } => assert!(value.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_query_intent_found_and_missing() {
        let mut r = TestRange::new(b"a", b"z");
        let txn = Transaction::new("t", b"k".to_vec(), IsolationLevel::Serializable, 1, ts(50));
        r.send_one(txn_header(&txn), Request::put(b"k".to_vec(), Value::from_string("v")))
            .unwrap();

        match r.send_one(header(60), query(&txn, true)).unwrap() {
            Response::QueryIntent { found_intent } => assert!(found_intent),
            other => panic!("unexpected {other:?}"),
        }

        let other = Transaction::new("o", b"k".to_vec(), IsolationLevel::Serializable, 1, ts(50));
        match r.send_one(header(60), query(&other, false)).unwrap() {
            Response::QueryIntent { found_intent } => assert!(!found_intent),
            other => panic!("unexpected {other:?}"),
        }
        let err = r.send_one(header(60), query(&other, true)).unwrap_err();
        assert!(matches!(err.root(), Error::IntentMissing { intent: Some(_), .. }));
    }

    #[test]
    fn test_query_own_pushed_intent() {
        let mut r = TestRange::new(b"a", b"z");
        let mut txn = Transaction::new("t", b"k".to_vec(), IsolationLevel::Serializable, 1, ts(50));
        let mut pushed = txn.clone();
        pushed.meta.write_timestamp = ts(70);
        r.send_one(txn_header(&pushed), Request::put(b"k".to_vec(), Value::from_string("v")))
            .unwrap();

        let err = r.send_one(txn_header(&txn), query(&txn, true)).unwrap_err();
        assert!(matches!(
            err.root(),
            Error::TransactionRetry {
                reason: RetryReason::Serializable,
                ..
            }
        ));

        txn.meta.isolation = IsolationLevel::ReadCommitted;
        match r.send_one(header(60), query(&txn, true)).unwrap() {
            Response::QueryIntent { found_intent } => assert!(found_intent),
            other => panic!("unexpected {other:?}"),
        }
    }
}
