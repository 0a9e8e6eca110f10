//! Intent resolution commands

use crate::api::{ClearIntentRequest, ResolveIntentRangeRequest, ResolveIntentRequest, Response, Span};
use crate::batcheval::{CommandArgs, EvalResult};
use crate::error::{Error, Result};
use crate::keys;
use crate::mvcc::{mvcc_resolve_write_intent, mvcc_resolve_write_intent_range, MvccStats};
use crate::storage::ReadWriter;
use crate::txn::{abort_span_entry, LockUpdate, TxnMeta, TxnStatus};

/// Records or clears the abort span entry of a transaction whose intents an
/// aborted resolution removed. A poisoned entry stops the transaction from
/// reading its own missing writes on this range.
pub(super) fn set_abort_span<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    ms: &mut MvccStats,
    txn: &TxnMeta,
    poison: bool,
) -> Result<()> {
    let span = args.ctx.abort_span();
    if !poison {
        return span.del(rw, Some(&mut *ms), txn.id);
    }
    let entry = abort_span_entry(&txn.key, txn.write_timestamp, txn.priority);
    span.put(rw, Some(&mut *ms), txn.id, &entry)
}

pub(super) fn resolve_intent<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &ResolveIntentRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    let update = LockUpdate {
        span: Span::point(req.key.clone()),
        txn: req.intent_txn.clone(),
        status: req.status,
    };
    let resolved = mvcc_resolve_write_intent(rw, Some(&mut *ms), &update)?;
    if req.status == TxnStatus::Aborted {
        set_abort_span(rw, args, ms, &req.intent_txn, req.poison)?;
    }

    let mut res = EvalResult::default();
    if resolved {
        res.local.resolved_locks.push(update);
    }
    Ok((Response::ResolveIntent, res))
}

pub(super) fn resolve_intent_range<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &ResolveIntentRangeRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    let update = LockUpdate {
        span: req.span.clone(),
        txn: req.intent_txn.clone(),
        status: req.status,
    };
    let (num, resume_span) = mvcc_resolve_write_intent_range(rw, Some(&mut *ms), &update, args.max_keys)?;
    if req.status == TxnStatus::Aborted {
        set_abort_span(rw, args, ms, &req.intent_txn, req.poison)?;
    }
    tracing::trace!(
        range_id = args.ctx.range_id(),
        txn = %req.intent_txn.short_id(),
        span = %req.span,
        resolved = num,
        "resolved intent range"
    );

    let mut res = EvalResult::default();
    if num > 0 {
        let mut done = update;
        if let Some(resume) = &resume_span {
            done.span.end_key = resume.key.clone();
        }
        res.local.resolved_locks.push(done);
    }
    Ok((Response::ResolveIntentRange { resume_span }, res))
}

/// Removes the listed intents no matter what their transactions' status is.
/// Intents no longer on their keys are returned as unknown.
pub(super) fn clear_intent<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &ClearIntentRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    let mut reverted = 0i64;
    let mut unknown_intents = Vec::new();
    let mut resume_span = None;
    let mut res = EvalResult::default();

    for intent in &req.intents {
        if !req.span.as_range().contains_key(&intent.key) {
            return Err(Error::InvalidArgument(format!(
                "intent on {} outside of span {}",
                keys::pretty(&intent.key),
                req.span
            )));
        }
        if args.max_keys > 0 && reverted >= args.max_keys {
            resume_span = Some(Span::new(intent.key.clone(), req.span.exclusive_end()));
            break;
        }
        let update = LockUpdate {
            span: Span::point(intent.key.clone()),
            txn: intent.txn.clone(),
            status: TxnStatus::Aborted,
        };
        if mvcc_resolve_write_intent(rw, Some(&mut *ms), &update)? {
            reverted += 1;
            res.local.resolved_locks.push(update);
        } else {
            unknown_intents.push(intent.clone());
        }
    }

    Ok((
        Response::ClearIntent {
            reverted,
            unknown_intents,
            resume_span,
        },
        res,
    ))
}

#[cfg(test)]
mod tests {
    use crate::api::{ClearIntentRequest, Request, ResolveIntentRangeRequest, ResolveIntentRequest, Response, Span};
    use crate::batcheval::testutil::*;
    use crate::error::{AbortReason, Error};
    use crate::mvcc::Value;
    use crate::txn::{Intent, IsolationLevel, Transaction, TxnStatus};

    fn write_intent(r: &mut TestRange, txn: &Transaction, key: &str) {
        r.send_one(txn_header(txn), Request::put(key.as_bytes().to_vec(), Value::from_string(key)))
            .unwrap();
    }

    fn get(r: &mut TestRange, key: &str, at: u64) -> Option<Value> {
        match r.send_one(header(at), Request::get(key.as_bytes().to_vec())).unwrap() {
            Response::Get { value, .. } => value,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_resolve_commit_makes_value_visible() {
        let mut r = TestRange::new(b"a", b"z");
        let mut txn = Transaction::new("t", b"k".to_vec(), IsolationLevel::Serializable, 1, ts(10));
        write_intent(&mut r, &txn, "k");

        txn.meta.write_timestamp = ts(15);
        r.send_one(
            header(20),
            Request::ResolveIntent(ResolveIntentRequest {
                key: b"k".to_vec(),
                intent_txn: txn.meta.clone(),
                status: TxnStatus::Committed,
                poison: false,
            }),
        )
        .unwrap();
        assert_eq!(get(&mut r, "k", 20).unwrap().timestamp, ts(15));
        assert!(get(&mut r, "k", 14).is_none());
    }

    #[test]
    fn test_poisoned_abort_writes_abort_span() {
        let mut r = TestRange::new(b"a", b"z");
        let txn = Transaction::new("t", b"k".to_vec(), IsolationLevel::Serializable, 1, ts(10));
        write_intent(&mut r, &txn, "b");
        write_intent(&mut r, &txn, "c");

        match r
            .send_one(
                header(20),
                Request::ResolveIntentRange(ResolveIntentRangeRequest {
                    span: Span::new(b"a".to_vec(), b"z".to_vec()),
                    intent_txn: txn.meta.clone(),
                    status: TxnStatus::Aborted,
                    poison: true,
                }),
            )
            .unwrap()
        {
            Response::ResolveIntentRange { resume_span } => assert!(resume_span.is_none()),
            other => panic!("unexpected {other:?}"),
        }
        assert!(get(&mut r, "b", 20).is_none());

        let err = r
            .send_one(txn_header(&txn), Request::get(b"b".to_vec()))
            .unwrap_err();
        assert!(matches!(
            err.root(),
            Error::TransactionAborted {
                reason: AbortReason::AbortSpan,
                ..
            }
        ));
    }

    #[test]
    fn test_clear_intent_reports_unknown() {
        let mut r = TestRange::new(b"a", b"z");
        let txn = Transaction::new("t", b"k".to_vec(), IsolationLevel::Serializable, 1, ts(10));
        let other = Transaction::new("o", b"k".to_vec(), IsolationLevel::Serializable, 1, ts(10));
        write_intent(&mut r, &txn, "b");

        let resp = r
            .send_one(
                header(20),
                Request::ClearIntent(ClearIntentRequest {
                    span: Span::new(b"a".to_vec(), b"z".to_vec()),
                    intents: vec![
                        Intent::new(b"b".to_vec(), txn.meta.clone()),
                        Intent::new(b"c".to_vec(), other.meta.clone()),
                    ],
                }),
            )
            .unwrap();
        match resp {
            Response::ClearIntent {
                reverted,
                unknown_intents,
                resume_span,
            } => {
                assert_eq!(reverted, 1);
                assert_eq!(unknown_intents.len(), 1);
                assert_eq!(unknown_intents[0].key, b"c".to_vec());
                assert!(resume_span.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(get(&mut r, "b", 20).is_none());
    }
}
