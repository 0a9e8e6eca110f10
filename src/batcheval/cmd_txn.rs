//! Transaction record commands
//!
//! Heartbeat, push and recovery all operate on the record stored at the
//! transaction's anchor key. A missing record is synthesized from the
//! transaction's metadata, consulting the timestamp cache to decide whether
//! the record could still be created.

use crate::api::{
    Header, HeartbeatTxnRequest, PushTxnRequest, PushTxnType, RecoverTxnRequest, Response, Span,
};
use crate::batcheval::{CommandArgs, EvalContext, EvalResult};
use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::keys;
use crate::mvcc::{mvcc_delete, mvcc_get_record, mvcc_put_record, MvccStats};
use crate::storage::{ReadWriter, Reader};
use crate::txn::{Transaction, TxnMeta, TxnStatus, MAX_TXN_PRIORITY, MIN_TXN_PRIORITY};

pub(super) fn txn_record_key(meta: &TxnMeta) -> Vec<u8> {
    keys::transaction_key(&meta.key, meta.id)
}

pub(super) fn load_txn_record<R: Reader + ?Sized>(
    reader: &R,
    meta: &TxnMeta,
) -> Result<Option<Transaction>> {
    mvcc_get_record(reader, &txn_record_key(meta), Timestamp::ZERO, None)
}

pub(super) fn write_txn_record<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ms: &mut MvccStats,
    txn: &Transaction,
) -> Result<()> {
    mvcc_put_record(rw, Some(&mut *ms), &txn_record_key(&txn.meta), Timestamp::ZERO, &txn.as_record(), None)
}

pub(super) fn delete_txn_record<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ms: &mut MvccStats,
    meta: &TxnMeta,
) -> Result<()> {
    mvcc_delete(rw, Some(&mut *ms), &txn_record_key(meta), Timestamp::ZERO, None)
}

/// Checks that the batch carries a transaction anchored at `key` whose
/// status is one of `permitted`.
pub(super) fn verify_transaction<'a>(
    header: &'a Header,
    key: &[u8],
    method: &str,
    permitted: &[TxnStatus],
) -> Result<&'a Transaction> {
    let Some(txn) = header.txn.as_ref() else {
        return Err(Error::InvalidArgument(format!("{method} must be transactional")));
    };
    if txn.meta.key != key {
        return Err(Error::InvalidArgument(format!(
            "request key {} should match txn key {}",
            keys::pretty(key),
            keys::pretty(&txn.meta.key)
        )));
    }
    if !permitted.contains(&txn.status) {
        return Err(Error::status(
            format!("cannot perform {method} with txn status {}", txn.status),
            Some(txn),
        ));
    }
    Ok(txn)
}

fn reject_transactional(header: &Header, method: &str) -> Result<()> {
    if header.txn.is_some() {
        return Err(Error::InvalidArgument(format!(
            "{method} cannot be sent within a transaction"
        )));
    }
    Ok(())
}

/// The record a transaction would have if it has none. It is aborted if the
/// timestamp cache proves the record can no longer be created.
pub(super) fn synthesize_txn_from_meta(ctx: &EvalContext<'_>, meta: &TxnMeta) -> Transaction {
    let mut txn = Transaction {
        meta: meta.clone(),
        status: TxnStatus::Pending,
        read_timestamp: meta.min_timestamp,
        last_heartbeat: meta.min_timestamp,
        ..Default::default()
    };
    let (ok, min_commit, _) = ctx.tscache.can_create_txn_record(meta.id, &meta.key, meta.min_timestamp);
    if !ok {
        txn.status = TxnStatus::Aborted;
        return txn;
    }
    txn.meta.write_timestamp.forward(min_commit);
    txn
}

/// A transaction not heartbeated within the liveness threshold may be
/// aborted by anyone.
pub(super) fn is_expired(ctx: &EvalContext<'_>, now: Timestamp, txn: &Transaction) -> bool {
    let threshold = ctx.config.txn_liveness_threshold.as_nanos() as u64;
    txn.last_active().add_nanos(threshold) < now
}

pub(super) fn can_push_with_priority(pusher: i32, pushee: i32) -> bool {
    (pusher == MAX_TXN_PRIORITY && pushee < MAX_TXN_PRIORITY)
        || (pusher > MIN_TXN_PRIORITY && pushee == MIN_TXN_PRIORITY)
        || pusher > pushee
}

pub(super) fn heartbeat_txn<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &HeartbeatTxnRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    let txn = verify_transaction(
        args.header,
        &req.key,
        "HeartbeatTxn",
        &[TxnStatus::Pending, TxnStatus::Staging],
    )?;
    if txn.write_timestamp() < txn.meta.min_timestamp {
        return Err(Error::assertion(format!(
            "txn {} write timestamp {} below its minimum {}",
            txn.short_id(),
            txn.write_timestamp(),
            txn.meta.min_timestamp
        )));
    }

    let mut record = match load_txn_record(&*rw, &txn.meta)? {
        Some(record) => record,
        None => {
            let (ok, min_commit, reason) = args.ctx.tscache.can_create_txn_record(
                txn.id(),
                &txn.meta.key,
                txn.meta.min_timestamp,
            );
            if !ok {
                return Err(Error::TransactionAborted {
                    reason: reason.unwrap_or(crate::error::AbortReason::Unknown),
                    txn: Some(Box::new(txn.clone())),
                });
            }
            let mut record = txn.as_record();
            record.meta.write_timestamp.forward(min_commit);
            record
        }
    };

    if record.is_finalized() {
        return Ok((Response::HeartbeatTxn { txn: record }, EvalResult::default()));
    }
    record.last_heartbeat.forward(req.now);
    write_txn_record(rw, ms, &record)?;
    Ok((
        Response::HeartbeatTxn { txn: record.clone() },
        EvalResult::with_updated_txn(record),
    ))
}

pub(super) fn push_txn<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &PushTxnRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    reject_transactional(args.header, "PushTxn")?;
    if req.key != req.pushee_txn.key {
        return Err(Error::InvalidArgument(format!(
            "request key {} should match pushee txn key {}",
            keys::pretty(&req.key),
            keys::pretty(&req.pushee_txn.key)
        )));
    }
    let mut now = args.ctx.now();
    now.forward(args.header.timestamp);

    let (mut pushee, record_exists) = match load_txn_record(&*rw, &req.pushee_txn)? {
        Some(record) => (record, true),
        None => {
            let synthesized = synthesize_txn_from_meta(args.ctx, &req.pushee_txn);
            if synthesized.status == TxnStatus::Aborted {
                // The record can never be created, so the transaction is as
                // good as aborted without writing anything.
                return Ok((
                    Response::PushTxn {
                        pushee_txn: synthesized.clone(),
                    },
                    EvalResult::with_updated_txn(synthesized),
                ));
            }
            (synthesized, false)
        }
    };

    if pushee.is_finalized() {
        return Ok((Response::PushTxn { pushee_txn: pushee }, EvalResult::default()));
    }
    if pushee.meta.epoch < req.pushee_txn.epoch {
        pushee.meta.epoch = req.pushee_txn.epoch;
    }
    pushee.meta.write_timestamp.forward(req.pushee_txn.write_timestamp);

    if req.push_type == PushTxnType::Timestamp && req.push_to <= pushee.write_timestamp() {
        return Ok((Response::PushTxn { pushee_txn: pushee }, EvalResult::default()));
    }

    let expired = is_expired(args.ctx, now, &pushee);
    let (pusher_wins, reason) = if expired {
        (true, "pushee is expired")
    } else if req.push_type == PushTxnType::Touch {
        (false, "pushee is active")
    } else if pushee.status == TxnStatus::Staging {
        (false, "pushee is staging")
    } else if req.force {
        (true, "forced push")
    } else if can_push_with_priority(req.pusher_txn.meta.priority, pushee.meta.priority) {
        (true, "pusher has priority")
    } else {
        (false, "pushee has priority")
    };
    tracing::debug!(
        range_id = args.ctx.range_id(),
        pusher = %req.pusher_txn.short_id(),
        pushee = %pushee.short_id(),
        push_type = ?req.push_type,
        pusher_wins,
        reason,
        "push"
    );
    if !pusher_wins {
        return Err(Error::TransactionPushFailed {
            pushee: Box::new(pushee),
        });
    }

    let mut push_type = req.push_type;
    if push_type == PushTxnType::Timestamp && pushee.status == TxnStatus::Staging {
        push_type = PushTxnType::Abort;
    }
    match push_type {
        PushTxnType::Abort => {
            pushee.status = TxnStatus::Aborted;
            let last_active = pushee.last_active();
            pushee.meta.write_timestamp.forward(last_active);
            pushee.in_flight_writes.clear();
        }
        PushTxnType::Timestamp => {
            pushee.meta.write_timestamp.forward(req.push_to);
        }
        PushTxnType::Touch => {}
    }

    // Without a record the timestamp cache carries the push.
    if record_exists {
        write_txn_record(rw, ms, &pushee)?;
    }
    Ok((
        Response::PushTxn {
            pushee_txn: pushee.clone(),
        },
        EvalResult::with_updated_txn(pushee),
    ))
}

/// Finalizes a staging transaction once it is known whether every
/// in-flight write succeeded.
pub(super) fn recover_txn<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &RecoverTxnRequest,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    reject_transactional(args.header, "RecoverTxn")?;
    if req.key != req.txn.key {
        return Err(Error::InvalidArgument(format!(
            "request key {} should match txn key {}",
            keys::pretty(&req.key),
            keys::pretty(&req.txn.key)
        )));
    }

    let Some(mut txn) = load_txn_record(&*rw, &req.txn)? else {
        // The record was removed after finalization. Only an abort can have
        // left no trace in the timestamp cache.
        let synthesized = synthesize_txn_from_meta(args.ctx, &req.txn);
        if synthesized.status != TxnStatus::Aborted {
            return Err(Error::assertion(format!(
                "txn record {} synthesized with non-ABORTED status",
                synthesized.short_id()
            )));
        }
        return Ok((
            Response::RecoverTxn {
                recovered_txn: synthesized,
            },
            EvalResult::default(),
        ));
    };

    let noop = |txn: Transaction| -> Result<(Response, EvalResult)> {
        Ok((Response::RecoverTxn { recovered_txn: txn }, EvalResult::default()))
    };
    match txn.status {
        TxnStatus::Committed => {
            if !req.implicitly_committed {
                return Err(Error::assertion(format!(
                    "found COMMITTED record for prevented implicit commit of {}",
                    txn.short_id()
                )));
            }
            return noop(txn);
        }
        TxnStatus::Aborted => {
            if req.implicitly_committed {
                return Err(Error::assertion(format!(
                    "found ABORTED record for implicitly committed {}",
                    txn.short_id()
                )));
            }
            return noop(txn);
        }
        TxnStatus::Pending => {
            if req.txn.epoch < txn.meta.epoch {
                return noop(txn);
            }
            if req.txn.epoch == txn.meta.epoch && req.txn.write_timestamp < txn.write_timestamp() {
                return noop(txn);
            }
            return Err(Error::assertion(format!(
                "cannot recover PENDING transaction {} in the same epoch",
                txn.short_id()
            )));
        }
        TxnStatus::Staging => {
            if req.txn.epoch < txn.meta.epoch {
                if req.implicitly_committed {
                    return Err(Error::assertion("epoch change by implicitly committed transaction"));
                }
                return noop(txn);
            }
            if req.txn.epoch > txn.meta.epoch {
                return Err(Error::assertion("unexpected epoch regression of staging record"));
            }
            if req.txn.write_timestamp < txn.write_timestamp() {
                if req.implicitly_committed {
                    return Err(Error::assertion(
                        "timestamp change by implicitly committed transaction",
                    ));
                }
                return noop(txn);
            }
            if txn.write_timestamp() < req.txn.write_timestamp {
                return Err(Error::assertion("unexpected timestamp regression of staging record"));
            }
        }
    }

    if req.implicitly_committed {
        txn.status = TxnStatus::Committed;
        let writes = std::mem::take(&mut txn.in_flight_writes);
        for w in writes {
            txn.add_lock_span(Span::point(w.key));
        }
    } else {
        txn.status = TxnStatus::Aborted;
    }
    write_txn_record(rw, ms, &txn)?;
    tracing::info!(
        range_id = args.ctx.range_id(),
        txn = %txn.short_id(),
        status = %txn.status,
        "recovered staging transaction"
    );
    Ok((
        Response::RecoverTxn {
            recovered_txn: txn.clone(),
        },
        EvalResult::with_updated_txn(txn),
    ))
}
