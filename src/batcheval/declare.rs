//! Latch span declaration
//!
//! Every command declares, before it evaluates, the spans it reads and
//! writes. The replica acquires latches over the union for the whole batch.

use crate::api::{BatchRequest, CommitTrigger, Header, RangeDescriptor, Request, Span};
use crate::concurrency::SpanSet;
use crate::keys;
use crate::txn::TxnStatus;

fn point(key: Vec<u8>) -> Span {
    Span::point(key)
}

/// Range-ID replicated keys of `range_id`, as one span.
fn range_id_span(range_id: crate::api::RangeId) -> Span {
    let prefix = keys::make_range_id_replicated_prefix(range_id);
    let end = keys::prefix_end(&prefix);
    Span::new(prefix, end)
}

/// Declares the spans `req` touches when evaluated against `desc` as part
/// of a batch with `header`.
pub fn declare_keys(desc: &RangeDescriptor, header: &Header, req: &Request, spans: &mut SpanSet) {
    let ts = header.timestamp;
    let range_id = desc.range_id;
    match req {
        Request::Get(_)
        | Request::Scan(_)
        | Request::ReverseScan(_)
        | Request::QueryIntent(_) => spans.read_only(req.span(), ts),

        Request::Put(r) if r.inline => spans.non_mvcc_write(req.span()),
        Request::Put(_)
        | Request::ConditionalPut(_)
        | Request::Increment(_)
        | Request::Delete(_)
        | Request::DeleteRange(_) => spans.read_write(req.span(), ts),

        Request::Merge(_) | Request::ClearRange(_) => spans.non_mvcc_write(req.span()),
        Request::WriteBatch(r) => spans.non_mvcc_write(r.data_span.clone()),

        Request::ClearIntent(r) => {
            spans.read_write(r.span.clone(), ts);
            for intent in &r.intents {
                spans.non_mvcc_write(point(keys::abort_span_key(range_id, intent.txn.id)));
            }
        }
        Request::ResolveIntent(r) => {
            spans.read_write(req.span(), ts);
            if r.status == TxnStatus::Aborted {
                spans.non_mvcc_write(point(keys::abort_span_key(range_id, r.intent_txn.id)));
            }
        }
        Request::ResolveIntentRange(r) => {
            spans.read_write(r.span.clone(), ts);
            if r.status == TxnStatus::Aborted {
                spans.non_mvcc_write(point(keys::abort_span_key(range_id, r.intent_txn.id)));
            }
        }

        Request::HeartbeatTxn(r) => {
            if let Some(txn) = &header.txn {
                spans.non_mvcc_write(point(keys::transaction_key(&r.key, txn.id())));
            }
        }
        Request::PushTxn(r) => {
            spans.non_mvcc_write(point(keys::transaction_key(&r.key, r.pushee_txn.id)));
            spans.non_mvcc_write(point(keys::abort_span_key(range_id, r.pushee_txn.id)));
        }
        Request::RecoverTxn(r) => {
            spans.non_mvcc_write(point(keys::transaction_key(&r.key, r.txn.id)));
        }
        Request::EndTxn(r) => declare_end_txn(desc, header, r, spans),

        Request::Gc(r) => {
            for k in &r.keys {
                spans.non_mvcc_write(point(k.key.clone()));
            }
            for key in &r.txn_records {
                spans.non_mvcc_write(point(key.clone()));
            }
            spans.non_mvcc_write(point(keys::range_gc_threshold_key(range_id)));
            spans.non_mvcc_write(point(keys::range_txn_span_gc_threshold_key(range_id)));
        }

        Request::LeaseInfo(_) => spans.non_mvcc_read(point(keys::range_lease_key(range_id))),
        Request::RequestLease(_) => spans.non_mvcc_write(point(keys::range_lease_key(range_id))),
        Request::TransferLease(_) => {
            // Serializes with every in-flight command on the range.
            spans.non_mvcc_write(point(keys::range_lease_key(range_id)));
            spans.non_mvcc_read(desc.span());
        }

        Request::AdminSplit(_) => spans.read_only(desc.span(), ts),
        Request::AdminMerge(_) | Request::AdminChangeReplicas(_) => {
            spans.non_mvcc_read(point(keys::range_descriptor_key(&desc.start_key)))
        }
    }
}

fn declare_end_txn(
    desc: &RangeDescriptor,
    header: &Header,
    req: &crate::api::EndTxnRequest,
    spans: &mut SpanSet,
) {
    let ts = header.timestamp;
    if let Some(txn) = &header.txn {
        spans.non_mvcc_write(point(keys::transaction_key(&req.key, txn.id())));
        spans.non_mvcc_write(point(keys::abort_span_key(desc.range_id, txn.id())));
    }
    // Intents resolved synchronously.
    for span in &req.lock_spans {
        let Ok(addressed) = keys::addr_span(span) else {
            continue;
        };
        if desc.span().overlaps(&addressed) {
            spans.read_write(span.clone(), ts);
        }
    }

    match &req.commit_trigger {
        Some(CommitTrigger::Split(split)) => {
            // The LHS stats are recomputed over the left half; the RHS state
            // is written from scratch.
            spans.non_mvcc_read(split.left_desc.span());
            spans.non_mvcc_read(range_id_span(desc.range_id));
            for span in keys::replica_data_spans(
                split.right_desc.range_id,
                &split.right_desc.start_key,
                &split.right_desc.end_key,
            ) {
                spans.non_mvcc_write(span);
            }
            spans.non_mvcc_write(Span::new(
                keys::make_range_id_unreplicated_prefix(split.right_desc.range_id),
                keys::prefix_end(&keys::make_range_id_unreplicated_prefix(split.right_desc.range_id)),
            ));
        }
        Some(CommitTrigger::Merge(merge)) => {
            spans.non_mvcc_read(range_id_span(merge.right_desc.range_id));
            spans.non_mvcc_write(Span::new(
                keys::abort_span_prefix(desc.range_id),
                keys::prefix_end(&keys::abort_span_prefix(desc.range_id)),
            ));
        }
        Some(CommitTrigger::ChangeReplicas(_)) => {
            spans.non_mvcc_write(point(keys::range_descriptor_key(&desc.start_key)));
        }
        None => {}
    }
}

/// Spans of every request in `ba`, plus the abort span entry any
/// transactional batch consults before evaluating.
pub fn declare_batch_keys(desc: &RangeDescriptor, ba: &BatchRequest) -> SpanSet {
    let mut spans = SpanSet::new();
    if let Some(txn) = &ba.header.txn {
        spans.non_mvcc_read(point(keys::abort_span_key(desc.range_id, txn.id())));
    }
    for req in &ba.requests {
        declare_keys(desc, &ba.header, req, &mut spans);
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{EndTxnRequest, ReplicaDescriptor, SplitTrigger};
    use crate::concurrency::SpanAccess;
    use crate::hlc::Timestamp;
    use crate::mvcc::Value;
    use crate::txn::{IsolationLevel, Transaction};

    fn desc() -> RangeDescriptor {
        RangeDescriptor::new(1, b"a".to_vec(), b"z".to_vec(), vec![ReplicaDescriptor::new(1, 1, 1)])
    }

    #[test]
    fn test_reads_and_writes() {
        let ba = BatchRequest::new(1, Timestamp::from_wall(10))
            .add(Request::get(b"c".to_vec()))
            .add(Request::put(b"d".to_vec(), Value::from_string("v")));
        let spans = declare_batch_keys(&desc(), &ba);
        assert_eq!(spans.len(), 2);
        assert!(spans.covers(SpanAccess::ReadOnly, b"c"));
        assert!(!spans.covers(SpanAccess::ReadWrite, b"c"));
        assert!(spans.covers(SpanAccess::ReadWrite, b"d"));
    }

    #[test]
    fn test_end_txn_declares_record_and_local_locks() {
        let txn = Transaction::new("t", b"b".to_vec(), IsolationLevel::Serializable, 1, Timestamp::from_wall(10));
        let mut et = EndTxnRequest::commit(
            b"b".to_vec(),
            vec![Span::point(b"c".to_vec()), Span::point(b"zz".to_vec())],
        );
        let (left, right) = {
            let mut l = desc();
            l.end_key = b"m".to_vec();
            let mut r = desc();
            r.range_id = 2;
            r.start_key = b"m".to_vec();
            (l, r)
        };
        et.commit_trigger = Some(CommitTrigger::Split(SplitTrigger {
            left_desc: left,
            right_desc: right,
        }));
        let ba = BatchRequest::new(1, Timestamp::from_wall(10))
            .with_txn(txn.clone())
            .add(Request::EndTxn(et));
        let spans = declare_batch_keys(&desc(), &ba);

        assert!(spans.covers(SpanAccess::ReadWrite, &keys::transaction_key(b"b", txn.id())));
        assert!(spans.covers(SpanAccess::ReadWrite, b"c"));
        assert!(!spans.covers(SpanAccess::ReadWrite, b"zz"));
        assert!(spans.covers(SpanAccess::ReadWrite, &keys::range_lease_key(2)));
        assert!(spans.covers(SpanAccess::ReadOnly, &keys::abort_span_key(1, txn.id())));
    }
}
