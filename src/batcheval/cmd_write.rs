//! Point and range writes

use crate::api::{
    ClearRangeRequest, ConditionalPutRequest, DeleteRangeRequest, DeleteRequest, IncrementRequest,
    MergeRequest, PutRequest, Response,
};
use crate::batcheval::{CommandArgs, EvalResult};
use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::mvcc::{
    mvcc_clear_range, mvcc_conditional_put, mvcc_delete, mvcc_delete_range, mvcc_increment,
    mvcc_merge, mvcc_put, MvccStats,
};
use crate::storage::ReadWriter;

pub(super) fn put<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &PutRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    let ts = if req.inline { Timestamp::ZERO } else { args.write_ts() };
    let txn = if req.inline { None } else { args.txn() };
    mvcc_put(rw, Some(&mut *ms), &req.key, ts, req.value.clone(), txn)?;
    Ok((Response::Put, EvalResult::default()))
}

pub(super) fn conditional_put<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &ConditionalPutRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    mvcc_conditional_put(
        rw,
        Some(&mut *ms),
        &req.key,
        args.write_ts(),
        req.value.clone(),
        req.exp_value.as_ref(),
        req.allow_if_does_not_exist,
        args.txn(),
    )?;
    Ok((Response::ConditionalPut, EvalResult::default()))
}

pub(super) fn increment<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &IncrementRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    let new_value = mvcc_increment(rw, Some(&mut *ms), &req.key, args.write_ts(), args.txn(), req.increment)?;
    Ok((Response::Increment { new_value }, EvalResult::default()))
}

pub(super) fn delete<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &DeleteRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    mvcc_delete(rw, Some(&mut *ms), &req.key, args.write_ts(), args.txn())?;
    Ok((Response::Delete, EvalResult::default()))
}

pub(super) fn delete_range<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &DeleteRangeRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    let (keys, _, resume_span) = mvcc_delete_range(
        rw,
        Some(&mut *ms),
        &req.span.key,
        &req.span.end_key,
        args.max_keys,
        args.write_ts(),
        args.txn(),
        req.return_keys,
    )?;
    Ok((Response::DeleteRange { keys, resume_span }, EvalResult::default()))
}

/// Removes every version in the span without leaving history.
pub(super) fn clear_range<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &ClearRangeRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    if args.txn().is_some() {
        return Err(Error::InvalidArgument(
            "cannot execute ClearRange within a transaction".to_string(),
        ));
    }
    mvcc_clear_range(rw, Some(&mut *ms), &req.span.key, &req.span.end_key, 0)?;
    tracing::debug!(range_id = args.ctx.range_id(), span = %req.span, "cleared range");
    Ok((Response::ClearRange, EvalResult::default()))
}

pub(super) fn merge<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &MergeRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    mvcc_merge(rw, Some(&mut *ms), &req.key, args.header.timestamp, &req.value)?;
    Ok((Response::Merge, EvalResult::default()))
}

#[cfg(test)]
mod tests {
    use crate::api::{
        ClearRangeRequest, ConditionalPutRequest, IncrementRequest, MergeRequest, Request,
        Response, Span,
    };
    use crate::batcheval::testutil::*;
    use crate::error::Error;
    use crate::mvcc::{compute_stats, Value};
    use crate::txn::{IsolationLevel, Transaction};

    #[test]
    fn test_write_too_old_then_retry_above() {
        let mut r = TestRange::new(b"a", b"z");
        r.send_one(header(100), Request::put(b"k".to_vec(), Value::from_string("v1")))
            .unwrap();

        let t2 = Transaction::new("t2", b"k".to_vec(), IsolationLevel::Serializable, 1, ts(90));
        let err = r
            .send_one(txn_header(&t2), Request::put(b"k".to_vec(), Value::from_string("v2")))
            .unwrap_err();
        match err.root() {
            Error::WriteTooOld {
                existing_timestamp, ..
            } => assert_eq!(*existing_timestamp, ts(100)),
            other => panic!("unexpected {other:?}"),
        }

        let t2 = Transaction::new("t2", b"k".to_vec(), IsolationLevel::Serializable, 1, ts(101));
        r.send_one(txn_header(&t2), Request::put(b"k".to_vec(), Value::from_string("v2")))
            .unwrap();
    }

    #[test]
    fn test_cput_and_increment() {
        let mut r = TestRange::new(b"a", b"z");
        let cput = |exp: Option<&str>, v: &str| {
            Request::ConditionalPut(ConditionalPutRequest {
                key: b"c".to_vec(),
                value: Value::from_string(v),
                exp_value: exp.map(Value::from_string),
                allow_if_does_not_exist: false,
            })
        };
        r.send_one(header(10), cput(None, "one")).unwrap();
        let err = r.send_one(header(11), cput(Some("two"), "three")).unwrap_err();
        assert!(matches!(err.root(), Error::ConditionFailed { .. }));
        r.send_one(header(12), cput(Some("one"), "two")).unwrap();

        let inc = |n| {
            Request::Increment(IncrementRequest {
                key: b"n".to_vec(),
                increment: n,
            })
        };
        r.send_one(header(10), inc(5)).unwrap();
        match r.send_one(header(11), inc(-2)).unwrap() {
            Response::Increment { new_value } => assert_eq!(new_value, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_clear_range_keeps_stats_consistent() {
        let mut r = TestRange::new(b"a", b"z");
        for k in ["b", "c", "d"] {
            r.send_one(header(10), Request::put(k.as_bytes().to_vec(), Value::from_string(k)))
                .unwrap();
        }
        r.send_one(
            header(20),
            Request::ClearRange(ClearRangeRequest {
                span: Span::new(b"b".to_vec(), b"d".to_vec()),
            }),
        )
        .unwrap();
        let user = compute_stats(r.engine.as_ref(), b"a", b"z", 0).unwrap();
        assert_eq!(user.key_count, 1);

        let t = Transaction::new("t", b"b".to_vec(), IsolationLevel::Serializable, 1, ts(30));
        let err = r
            .send_one(
                txn_header(&t),
                Request::ClearRange(ClearRangeRequest {
                    span: Span::new(b"a".to_vec(), b"z".to_vec()),
                }),
            )
            .unwrap_err();
        assert!(matches!(err.root(), Error::InvalidArgument(_)));
    }

    #[test]
    fn test_merge_appends_inline() {
        let mut r = TestRange::new(b"a", b"z");
        for part in ["ab", "cd"] {
            r.send_one(
                header(0),
                Request::Merge(MergeRequest {
                    key: b"m".to_vec(),
                    value: Value::from_bytes(part.as_bytes()),
                }),
            )
            .unwrap();
        }
        match r.send_one(header(5), Request::get(b"m".to_vec())).unwrap() {
            Response::Get { value: Some(v), .. } => assert_eq!(v.data_bytes(), b"abcd"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
