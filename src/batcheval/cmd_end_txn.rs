//! Transaction commit and rollback
//!
//! EndTxn finalizes the transaction record on the anchor's range, resolves
//! whatever intents live on that same range synchronously and hands the
//! rest back for asynchronous resolution. A commit carrying in-flight writes
//! only moves the record to staging (a parallel commit). A commit carrying a
//! trigger runs it inside the same batch.

use crate::api::{
    CommitTrigger, EndTxnRequest, EndTxnResponse, RangeDescriptor, Response, Span,
};
use crate::batcheval::cmd_intent::set_abort_span;
use crate::batcheval::cmd_txn::{
    delete_txn_record, load_txn_record, verify_transaction, write_txn_record,
};
use crate::batcheval::triggers::{change_replicas_trigger, merge_trigger, split_trigger};
use crate::batcheval::{CommandArgs, EvalResult};
use crate::error::{AbortReason, Error, Result, RetryReason};
use crate::keys;
use crate::mvcc::{mvcc_resolve_write_intent, mvcc_resolve_write_intent_range, MvccStats};
use crate::storage::ReadWriter;
use crate::txn::{IsolationLevel, LockUpdate, Transaction, TxnStatus};

pub(super) fn end_txn<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &EndTxnRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    let h_txn = verify_transaction(
        args.header,
        &req.key,
        "EndTxn",
        &[TxnStatus::Pending, TxnStatus::Staging, TxnStatus::Aborted],
    )?;

    let mut reply = match load_txn_record(&*rw, &h_txn.meta)? {
        None => {
            let mut reply = h_txn.clone();
            if req.commit {
                let (ok, min_commit, reason) = args.ctx.tscache.can_create_txn_record(
                    h_txn.id(),
                    &h_txn.meta.key,
                    h_txn.meta.min_timestamp,
                );
                if !ok {
                    return Err(Error::TransactionAborted {
                        reason: reason.unwrap_or(AbortReason::Unknown),
                        txn: Some(Box::new(h_txn.clone())),
                    });
                }
                reply.meta.write_timestamp.forward(min_commit);
            }
            reply
        }
        Some(record) => match record.status {
            TxnStatus::Committed => {
                return Err(Error::status(
                    "already committed",
                    Some(&record),
                ));
            }
            TxnStatus::Aborted if req.commit => {
                return Err(Error::TransactionAborted {
                    reason: AbortReason::AbortedRecordFound,
                    txn: Some(Box::new(record)),
                });
            }
            TxnStatus::Aborted => record,
            TxnStatus::Pending | TxnStatus::Staging => {
                if h_txn.meta.epoch < record.meta.epoch {
                    return Err(Error::assertion(format!(
                        "programming error: epoch regression: {}",
                        h_txn.meta.epoch
                    )));
                }
                let mut reply = record;
                reply.update(h_txn);
                reply
            }
        },
    };
    reply.lock_spans = crate::api::merge_spans(req.lock_spans.clone());

    if req.commit && reply.status != TxnStatus::Aborted {
        check_commit(&reply, req)?;

        if !req.in_flight_writes.is_empty() {
            if req.commit_trigger.is_some() {
                return Err(Error::InvalidArgument(
                    "cannot stage a transaction carrying a commit trigger".to_string(),
                ));
            }
            reply.status = TxnStatus::Staging;
            reply.in_flight_writes = req.in_flight_writes.clone();
            write_txn_record(rw, ms, &reply)?;
            tracing::debug!(
                range_id = args.ctx.range_id(),
                txn = %reply.short_id(),
                in_flight = reply.in_flight_writes.len(),
                "staged transaction"
            );
            return Ok((
                Response::EndTxn(EndTxnResponse {
                    txn: Some(reply.clone()),
                    one_phase_commit: false,
                    external_lock_spans: Vec::new(),
                }),
                EvalResult::with_updated_txn(reply),
            ));
        }
        reply.status = TxnStatus::Committed;
    } else {
        reply.status = TxnStatus::Aborted;
    }
    reply.in_flight_writes.clear();

    // A merge resolves intents against the post-merge bounds so the
    // subsumed range's descriptor intent is resolved here.
    let desc = match req.merge_trigger() {
        Some(merge) => &merge.left_desc,
        None => args.ctx.desc(),
    };
    let budget = if req.commit_trigger.is_some() {
        i64::MAX
    } else {
        args.ctx.config.intent_resolution_batch as i64
    };
    let (external, resolved) = resolve_local_intents(rw, ms, &reply, desc, budget)?;
    if reply.status == TxnStatus::Aborted && !resolved.is_empty() {
        set_abort_span(rw, args, ms, &reply.meta, req.poison)?;
    }
    update_finalized_txn(rw, ms, &reply, &external)?;

    let mut res = EvalResult::default();
    if reply.status == TxnStatus::Committed {
        if let Some(trigger) = &req.commit_trigger {
            let trigger_res = run_commit_trigger(rw, args, ms, trigger)
                .map_err(|e| Error::ReplicaCorruption(format!("failed to run commit trigger: {e}")))?;
            res.merge(trigger_res)?;
        }
    }

    tracing::debug!(
        range_id = args.ctx.range_id(),
        txn = %reply.short_id(),
        status = %reply.status,
        resolved = resolved.len(),
        external = external.len(),
        "finalized transaction"
    );
    res.local.updated_txns.push(reply.clone());
    res.local.resolved_locks = resolved;
    res.local.external_locks = external
        .iter()
        .map(|span| LockUpdate::new(&reply, span.clone()))
        .collect();
    Ok((
        Response::EndTxn(EndTxnResponse {
            txn: Some(reply),
            one_phase_commit: false,
            external_lock_spans: external,
        }),
        res,
    ))
}

/// Refuses a commit the transaction's timestamps do not allow.
fn check_commit(txn: &Transaction, req: &EndTxnRequest) -> Result<()> {
    if txn.write_too_old {
        return Err(Error::retry(
            RetryReason::WriteTooOld,
            format!("txn {} wrote below a newer value", txn.short_id()),
        ));
    }
    if txn.write_timestamp() != txn.read_timestamp {
        return Err(Error::retry(
            RetryReason::Serializable,
            format!(
                "txn {} read at {} but must commit at {}",
                txn.short_id(),
                txn.read_timestamp,
                txn.write_timestamp()
            ),
        ));
    }
    // Read-committed transactions may commit past their deadline.
    if let Some(deadline) = req.deadline {
        if txn.meta.isolation != IsolationLevel::ReadCommitted && deadline <= txn.write_timestamp() {
            return Err(Error::retry(
                RetryReason::DeadlineExceeded,
                format!(
                    "txn timestamp pushed too much; deadline exceeded by {}ns ({} > {})",
                    txn.write_timestamp().wall_time.saturating_sub(deadline.wall_time),
                    txn.write_timestamp(),
                    deadline
                ),
            ));
        }
    }
    Ok(())
}

/// Resolves the lock spans of `txn` that fall inside `desc`, at most
/// `budget` keys. Returns the spans left over and the updates applied.
fn resolve_local_intents<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ms: &mut MvccStats,
    txn: &Transaction,
    desc: &RangeDescriptor,
    budget: i64,
) -> Result<(Vec<Span>, Vec<LockUpdate>)> {
    let mut remaining = budget;
    let mut external = Vec::new();
    let mut resolved = Vec::new();

    for span in &txn.lock_spans {
        if span.is_point() {
            if !desc.contains_key(&keys::addr(&span.key)?) || remaining <= 0 {
                external.push(span.clone());
                continue;
            }
            let update = LockUpdate::new(txn, span.clone());
            if mvcc_resolve_write_intent(rw, Some(&mut *ms), &update)? {
                remaining -= 1;
                resolved.push(update);
            }
            continue;
        }

        if keys::is_local(&span.key) {
            let addressed = keys::addr_span(span)?;
            if !desc.contains_key_range(&addressed.key, &addressed.end_key) || remaining <= 0 {
                external.push(span.clone());
                continue;
            }
            resolve_range(rw, ms, txn, span.clone(), &mut remaining, &mut external, &mut resolved)?;
            continue;
        }

        let range = desc.span();
        if span.key < desc.start_key {
            let end = std::cmp::min(span.end_key.clone(), desc.start_key.clone());
            external.push(Span::new(span.key.clone(), end));
        }
        if span.end_key > desc.end_key {
            let start = std::cmp::max(span.key.clone(), desc.end_key.clone());
            external.push(Span::new(start, span.end_key.clone()));
        }
        if let Some(inside) = span.intersect(&range) {
            if remaining <= 0 {
                external.push(inside);
                continue;
            }
            resolve_range(rw, ms, txn, inside, &mut remaining, &mut external, &mut resolved)?;
        }
    }
    Ok((external, resolved))
}

fn resolve_range<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ms: &mut MvccStats,
    txn: &Transaction,
    span: Span,
    remaining: &mut i64,
    external: &mut Vec<Span>,
    resolved: &mut Vec<LockUpdate>,
) -> Result<()> {
    let mut update = LockUpdate::new(txn, span);
    let (num, resume) = mvcc_resolve_write_intent_range(rw, Some(&mut *ms), &update, *remaining)?;
    *remaining -= num;
    if let Some(resume) = resume {
        update.span.end_key = resume.key.clone();
        external.push(resume);
    }
    if num > 0 {
        resolved.push(update);
    }
    Ok(())
}

/// Deletes the record of a finalized transaction with nothing left to
/// resolve; otherwise persists it with the spans still outstanding.
fn update_finalized_txn<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ms: &mut MvccStats,
    txn: &Transaction,
    external: &[Span],
) -> Result<()> {
    if external.is_empty() {
        return delete_txn_record(rw, ms, &txn.meta);
    }
    let mut record = txn.clone();
    record.lock_spans = external.to_vec();
    record.in_flight_writes.clear();
    write_txn_record(rw, ms, &record)
}

fn run_commit_trigger<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    ms: &mut MvccStats,
    trigger: &CommitTrigger,
) -> Result<EvalResult> {
    let ts = args.header.timestamp;
    match trigger {
        CommitTrigger::Split(split) => split_trigger(rw, args.ctx, ms, split, ts),
        CommitTrigger::Merge(merge) => merge_trigger(rw, args.ctx, ms, merge, ts),
        CommitTrigger::ChangeReplicas(change) => Ok(change_replicas_trigger(args.ctx, change)),
    }
}

#[cfg(test)]
mod tests {
    use crate::api::{BatchRequest, EndTxnRequest, Request, Response, Span};
    use crate::batcheval::testutil::*;
    use crate::error::{AbortReason, Error, RetryReason};
    use crate::keys;
    use crate::mvcc::{read_meta, Value};
    use crate::txn::{IsolationLevel, Transaction, TxnStatus};

    fn write(r: &mut TestRange, txn: &Transaction, key: &str) {
        r.send_one(txn_header(txn), Request::put(key.as_bytes().to_vec(), Value::from_string(key)))
            .unwrap();
    }

    fn end(r: &mut TestRange, txn: &Transaction, req: EndTxnRequest) -> crate::error::Result<(Transaction, Vec<Span>)> {
        match r.send_one(txn_header(txn), Request::EndTxn(req))? {
            Response::EndTxn(resp) => Ok((resp.txn.unwrap(), resp.external_lock_spans)),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn record_exists(r: &TestRange, txn: &Transaction) -> bool {
        read_meta(r.engine.as_ref(), &keys::transaction_key(&txn.meta.key, txn.id()))
            .unwrap()
            .is_some()
    }

    fn has_intent(r: &TestRange, key: &str) -> bool {
        read_meta(r.engine.as_ref(), key.as_bytes())
            .unwrap()
            .is_some_and(|m| m.txn.is_some())
    }

    #[test]
    fn test_commit_resolves_local_intents() {
        let mut r = TestRange::new(b"a", b"m");
        let txn = Transaction::new("t", b"b".to_vec(), IsolationLevel::Serializable, 1, ts(10));
        write(&mut r, &txn, "b");
        write(&mut r, &txn, "c");

        let spans = vec![Span::point(b"b".to_vec()), Span::new(b"c".to_vec(), b"d".to_vec())];
        let (reply, external) = end(&mut r, &txn, EndTxnRequest::commit(b"b".to_vec(), spans)).unwrap();
        assert_eq!(reply.status, TxnStatus::Committed);
        assert!(external.is_empty());
        assert!(!has_intent(&r, "b"));
        assert!(!has_intent(&r, "c"));
        assert!(!record_exists(&r, &txn));
    }

    #[test]
    fn test_commit_keeps_external_spans() {
        let mut r = TestRange::new(b"a", b"m");
        let txn = Transaction::new("t", b"b".to_vec(), IsolationLevel::Serializable, 1, ts(10));
        write(&mut r, &txn, "b");

        let spans = vec![
            Span::point(b"b".to_vec()),
            Span::point(b"x".to_vec()),
            Span::new(b"k".to_vec(), b"q".to_vec()),
        ];
        let (reply, external) = end(&mut r, &txn, EndTxnRequest::commit(b"b".to_vec(), spans)).unwrap();
        assert_eq!(reply.status, TxnStatus::Committed);
        assert_eq!(
            external,
            vec![Span::new(b"m".to_vec(), b"q".to_vec()), Span::point(b"x".to_vec())]
        );
        // The record outlives the commit until the remote intents resolve.
        assert!(record_exists(&r, &txn));
        assert!(!has_intent(&r, "b"));
    }

    #[test]
    fn test_pushed_serializable_txn_must_retry() {
        let mut r = TestRange::new(b"a", b"z");
        let mut txn = Transaction::new("t", b"b".to_vec(), IsolationLevel::Serializable, 1, ts(10));
        write(&mut r, &txn, "b");
        txn.meta.write_timestamp = ts(20);
        let err = end(&mut r, &txn, EndTxnRequest::commit(b"b".to_vec(), vec![])).unwrap_err();
        assert!(matches!(
            err.root(),
            Error::TransactionRetry {
                reason: RetryReason::Serializable,
                ..
            }
        ));

        let mut deadline = EndTxnRequest::commit(b"b".to_vec(), vec![]);
        deadline.deadline = Some(ts(10));
        let txn = Transaction::new("t", b"b".to_vec(), IsolationLevel::Serializable, 1, ts(10));
        let err = end(&mut r, &txn, deadline).unwrap_err();
        assert!(matches!(
            err.root(),
            Error::TransactionRetry {
                reason: RetryReason::DeadlineExceeded,
                ..
            }
        ));
    }

    #[test]
    fn test_read_committed_commit_checks() {
        let mut r = TestRange::new(b"a", b"z");

        // A pushed read-committed txn retries like a serializable one.
        let mut txn = Transaction::new("rc", b"b".to_vec(), IsolationLevel::ReadCommitted, 1, ts(10));
        write(&mut r, &txn, "b");
        txn.meta.write_timestamp = ts(20);
        let err = end(&mut r, &txn, EndTxnRequest::commit(b"b".to_vec(), vec![])).unwrap_err();
        assert!(matches!(
            err.root(),
            Error::TransactionRetry {
                reason: RetryReason::Serializable,
                ..
            }
        ));

        // The deadline does not bind it.
        let txn = Transaction::new("rc2", b"c".to_vec(), IsolationLevel::ReadCommitted, 1, ts(10));
        write(&mut r, &txn, "c");
        let mut et = EndTxnRequest::commit(b"c".to_vec(), vec![Span::point(b"c".to_vec())]);
        et.deadline = Some(ts(10));
        let (reply, _) = end(&mut r, &txn, et).unwrap();
        assert_eq!(reply.status, TxnStatus::Committed);
        assert!(!has_intent(&r, "c"));
    }

    #[test]
    fn test_poisoned_rollback_records_abort_span() {
        let mut r = TestRange::new(b"a", b"z");
        let txn = Transaction::new("t", b"b".to_vec(), IsolationLevel::Serializable, 1, ts(10));
        write(&mut r, &txn, "c");
        let mut rollback = EndTxnRequest::abort(b"b".to_vec(), vec![Span::point(b"c".to_vec())]);
        rollback.poison = true;
        let (reply, _) = end(&mut r, &txn, rollback).unwrap();
        assert_eq!(reply.status, TxnStatus::Aborted);
        assert!(!has_intent(&r, "c"));
        assert!(r.ctx().abort_span().get(r.engine.as_ref(), txn.id()).unwrap().is_some());
    }

    #[test]
    fn test_finalized_records() {
        let mut r = TestRange::new(b"a", b"z");
        let mut txn = Transaction::new("t", b"b".to_vec(), IsolationLevel::Serializable, 1, ts(10));
        write(&mut r, &txn, "x");
        r.send_one(
            txn_header(&txn),
            Request::HeartbeatTxn(crate::api::HeartbeatTxnRequest {
                key: b"b".to_vec(),
                now: ts(11),
            }),
        )
        .unwrap();

        // Abort the record with a forced push.
        let pusher = Transaction::new("p", b"p".to_vec(), IsolationLevel::Serializable, 1, ts(12));
        r.send_one(
            header(12),
            Request::PushTxn(crate::api::PushTxnRequest {
                key: b"b".to_vec(),
                pusher_txn: pusher,
                pushee_txn: txn.meta.clone(),
                push_to: ts(12),
                push_type: crate::api::PushTxnType::Abort,
                force: true,
            }),
        )
        .unwrap();

        let err = end(&mut r, &txn, EndTxnRequest::commit(b"b".to_vec(), vec![])).unwrap_err();
        assert!(matches!(
            err.root(),
            Error::TransactionAborted {
                reason: AbortReason::AbortedRecordFound,
                ..
            }
        ));
        // Rolling back an aborted record is allowed and cleans it up.
        let (reply, _) = end(&mut r, &txn, EndTxnRequest::abort(b"b".to_vec(), vec![Span::point(b"x".to_vec())])).unwrap();
        assert_eq!(reply.status, TxnStatus::Aborted);
        assert!(!record_exists(&r, &txn));

        // A committed record with outstanding spans refuses a second EndTxn.
        txn = Transaction::new("t2", b"b".to_vec(), IsolationLevel::Serializable, 1, ts(20));
        end(&mut r, &txn, EndTxnRequest::commit(b"b".to_vec(), vec![Span::point(b"zz".to_vec())])).unwrap();
        let err = end(&mut r, &txn, EndTxnRequest::commit(b"b".to_vec(), vec![])).unwrap_err();
        assert!(matches!(err.root(), Error::TransactionStatus { .. }));
    }

    #[test]
    fn test_intent_resolution_budget() {
        let mut r = TestRange::new(b"a", b"z");
        r.config.intent_resolution_batch = 1;
        let txn = Transaction::new("t", b"b".to_vec(), IsolationLevel::Serializable, 1, ts(10));
        for k in ["c", "d", "e"] {
            write(&mut r, &txn, k);
        }
        let (_, external) = end(
            &mut r,
            &txn,
            EndTxnRequest::commit(b"b".to_vec(), vec![Span::new(b"c".to_vec(), b"f".to_vec())]),
        )
        .unwrap();
        assert!(!has_intent(&r, "c"));
        assert!(has_intent(&r, "d"));
        assert_eq!(external, vec![Span::new(b"d".to_vec(), b"f".to_vec())]);
        assert!(record_exists(&r, &txn));
    }

    #[test]
    fn test_parallel_commit_stages_record() {
        let mut r = TestRange::new(b"a", b"z");
        let txn = Transaction::new("t", b"b".to_vec(), IsolationLevel::Serializable, 1, ts(10));
        write(&mut r, &txn, "c");
        let mut et = EndTxnRequest::commit(b"b".to_vec(), vec![]);
        et.in_flight_writes = vec![crate::txn::SequencedWrite {
            key: b"c".to_vec(),
            sequence: 1,
        }];
        let ba = BatchRequest::new(1, ts(10)).with_txn(txn.clone()).add(Request::EndTxn(et));
        let (resp, res) = r.send(ba).unwrap();
        assert_eq!(resp.txn.unwrap().status, TxnStatus::Staging);
        assert_eq!(res.local.updated_txns[0].in_flight_writes.len(), 1);
        assert!(has_intent(&r, "c"));
        assert!(record_exists(&r, &txn));
    }
}
