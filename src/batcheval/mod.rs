//! Batch evaluation
//!
//! Turns a [`BatchRequest`] into writes on a staging batch plus an
//! [`EvalResult`] describing what applying those writes implies. Evaluation
//! runs on the leaseholder under latches for the spans [`declare_keys`]
//! reports; nothing it does is visible until the Raft command applies.

mod cmd_admin;
mod cmd_end_txn;
mod cmd_gc;
mod cmd_intent;
mod cmd_lease;
mod cmd_read;
mod cmd_txn;
mod cmd_write;
mod cmd_write_batch;
mod declare;
mod result;
mod triggers;

pub use cmd_admin::plan_change_replicas;
pub use declare::{declare_batch_keys, declare_keys};
pub use result::{EvalResult, LocalResult, ReplicatedResult, SplitResult};
pub use triggers::{merge_trigger, split_trigger};

use uuid::Uuid;

use crate::api::{BatchRequest, BatchResponse, Header, RangeDescriptor, RangeId, Request, Response, StoreId};
use crate::concurrency::TimestampCache;
use crate::config::StoreConfig;
use crate::error::{AbortReason, Error, Result};
use crate::hlc::{Clock, Timestamp};
use crate::mvcc::MvccStats;
use crate::stateloader::ReplicaState;
use crate::storage::ReadWriter;
use crate::txn::{AbortSpan, Transaction};

/// What a command may observe about the replica evaluating it.
pub struct EvalContext<'a> {
    pub state: &'a ReplicaState,
    pub store_id: StoreId,
    pub tscache: &'a TimestampCache,
    pub clock: &'a dyn Clock,
    pub config: &'a StoreConfig,
}

impl<'a> EvalContext<'a> {
    pub fn desc(&self) -> &RangeDescriptor {
        &self.state.desc
    }

    pub fn range_id(&self) -> RangeId {
        self.state.desc.range_id
    }

    pub fn abort_span(&self) -> AbortSpan {
        AbortSpan::new(self.range_id())
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }
}

/// Per-command arguments shared by every command implementation.
pub struct CommandArgs<'a> {
    pub ctx: &'a EvalContext<'a>,
    pub header: &'a Header,
    /// Remaining key budget of the batch; zero is unlimited.
    pub max_keys: i64,
}

impl<'a> CommandArgs<'a> {
    pub fn txn(&self) -> Option<&'a Transaction> {
        self.header.txn.as_ref()
    }

    /// Timestamp reads observe.
    pub fn read_ts(&self) -> Timestamp {
        match &self.header.txn {
            Some(txn) => txn.read_timestamp,
            None => self.header.timestamp,
        }
    }

    /// Timestamp writes land at.
    pub fn write_ts(&self) -> Timestamp {
        match &self.header.txn {
            Some(txn) => txn.write_timestamp(),
            None => self.header.timestamp,
        }
    }

    pub fn txn_id(&self) -> Option<Uuid> {
        self.header.txn_id()
    }
}

/// Evaluates every request of `ba` against `rw`, returning the batch
/// response and the combined result. On error the caller must discard `rw`.
pub fn evaluate_batch<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    ctx: &EvalContext<'_>,
    ba: &BatchRequest,
) -> Result<(BatchResponse, EvalResult)> {
    let mut header = ba.header.clone();

    if let Some(txn) = &header.txn {
        if !is_single_rollback(ba) {
            check_if_txn_aborted(&*rw, ctx, txn)?;
        }
    }

    let mut result = EvalResult::default();
    // Stats delta of the whole batch. Commit triggers rewrite it wholesale.
    let mut ms = MvccStats::default();
    let mut responses = Vec::with_capacity(ba.requests.len());
    let limited = header.max_span_request_keys > 0;
    let mut remaining = header.max_span_request_keys;

    for req in &ba.requests {
        if limited && remaining <= 0 {
            if let Some(resp) = exhausted_response(req) {
                responses.push(resp);
                continue;
            }
        }

        let args = CommandArgs {
            ctx,
            header: &header,
            max_keys: if limited { remaining } else { 0 },
        };
        let (resp, res) = evaluate_command(rw, &args, req, &mut ms)
            .map_err(|e| e.context(format!("evaluating {}", req.method())))?;

        if limited {
            remaining -= num_keys(&resp);
        }
        if let (Some(txn), Some(updated)) = (header.txn.as_mut(), response_txn(&resp)) {
            txn.update(updated);
        }
        result.merge(res)?;
        responses.push(resp);
    }

    result.replicated.delta.add(&ms);
    tracing::debug!(
        range_id = ctx.range_id(),
        batch = %ba.summary(),
        delta_live_bytes = result.replicated.delta.live_bytes,
        "evaluated batch"
    );
    let timestamp = header.timestamp;
    Ok((
        BatchResponse {
            txn: header.txn,
            timestamp,
            responses,
        },
        result,
    ))
}

fn is_single_rollback(ba: &BatchRequest) -> bool {
    matches!(ba.requests.as_slice(), [Request::EndTxn(et)] if !et.commit)
}

/// A transaction aborted while it had intents here must not read or write
/// any further: its intents may already be gone.
fn check_if_txn_aborted<RW: ReadWriter + ?Sized>(
    rw: &RW,
    ctx: &EvalContext<'_>,
    txn: &Transaction,
) -> Result<()> {
    if let Some(entry) = ctx.abort_span().get(rw, txn.id())? {
        tracing::debug!(
            range_id = ctx.range_id(),
            txn = %txn.short_id(),
            aborted_at = %entry.timestamp,
            "found abort span entry"
        );
        let mut aborted = txn.clone();
        aborted.status = crate::txn::TxnStatus::Aborted;
        return Err(Error::TransactionAborted {
            reason: AbortReason::AbortSpan,
            txn: Some(Box::new(aborted)),
        });
    }
    Ok(())
}

fn evaluate_command<RW: ReadWriter + ?Sized>(
    rw: &mut RW,
    args: &CommandArgs<'_>,
    req: &Request,
    ms: &mut MvccStats,
) -> Result<(Response, EvalResult)> {
    match req {
        Request::Get(r) => cmd_read::get(&*rw, args, r),
        Request::Scan(r) => cmd_read::scan(&*rw, args, r, false),
        Request::ReverseScan(r) => cmd_read::scan(&*rw, args, r, true),
        Request::QueryIntent(r) => cmd_read::query_intent(&*rw, args, r),
        Request::LeaseInfo(_) => cmd_read::lease_info(args),
        Request::Put(r) => cmd_write::put(rw, args, r, ms),
        Request::ConditionalPut(r) => cmd_write::conditional_put(rw, args, r, ms),
        Request::Increment(r) => cmd_write::increment(rw, args, r, ms),
        Request::Delete(r) => cmd_write::delete(rw, args, r, ms),
        Request::DeleteRange(r) => cmd_write::delete_range(rw, args, r, ms),
        Request::ClearRange(r) => cmd_write::clear_range(rw, args, r, ms),
        Request::Merge(r) => cmd_write::merge(rw, args, r, ms),
        Request::ClearIntent(r) => cmd_intent::clear_intent(rw, args, r, ms),
        Request::ResolveIntent(r) => cmd_intent::resolve_intent(rw, args, r, ms),
        Request::ResolveIntentRange(r) => cmd_intent::resolve_intent_range(rw, args, r, ms),
        Request::HeartbeatTxn(r) => cmd_txn::heartbeat_txn(rw, args, r, ms),
        Request::PushTxn(r) => cmd_txn::push_txn(rw, args, r, ms),
        Request::RecoverTxn(r) => cmd_txn::recover_txn(rw, args, r, ms),
        Request::EndTxn(r) => cmd_end_txn::end_txn(rw, args, r, ms),
        Request::Gc(r) => cmd_gc::gc(rw, args, r, ms),
        Request::RequestLease(r) => cmd_lease::request_lease(rw, args, r, ms),
        Request::TransferLease(r) => cmd_lease::transfer_lease(rw, args, r, ms),
        Request::AdminSplit(r) => cmd_admin::admin_split(&*rw, args, r),
        Request::AdminMerge(r) => cmd_admin::admin_merge(args, r),
        Request::AdminChangeReplicas(r) => cmd_admin::admin_change_replicas(args, r),
        Request::WriteBatch(r) => cmd_write_batch::write_batch(rw, args, r, ms),
    }
}

/// Response for a span request the exhausted key budget keeps from running.
fn exhausted_response(req: &Request) -> Option<Response> {
    let resume_span = Some(req.span());
    match req {
        Request::Scan(_) => Some(Response::Scan(crate::api::ScanResponse {
            resume_span,
            ..Default::default()
        })),
        Request::ReverseScan(_) => Some(Response::ReverseScan(crate::api::ScanResponse {
            resume_span,
            ..Default::default()
        })),
        Request::DeleteRange(_) => Some(Response::DeleteRange {
            keys: Vec::new(),
            resume_span,
        }),
        Request::ResolveIntentRange(_) => Some(Response::ResolveIntentRange { resume_span }),
        Request::ClearIntent(_) => Some(Response::ClearIntent {
            reverted: 0,
            unknown_intents: Vec::new(),
            resume_span,
        }),
        _ => None,
    }
}

/// Keys a span response consumed from the batch budget.
fn num_keys(resp: &Response) -> i64 {
    match resp {
        Response::Scan(r) | Response::ReverseScan(r) => r.rows.len() as i64,
        Response::DeleteRange { keys, .. } => keys.len() as i64,
        Response::ClearIntent { reverted, .. } => *reverted,
        _ => 0,
    }
}

fn response_txn(resp: &Response) -> Option<&Transaction> {
    match resp {
        Response::EndTxn(r) => r.txn.as_ref(),
        Response::HeartbeatTxn { txn } => Some(txn),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use super::*;
    use crate::api::{Lease, ReplicaDescriptor};
    use crate::hlc::ManualClock;
    use crate::stateloader::{write_initial_state, StateLoader, VERSION_RANGE_APPLIED_STATE_KEY};
    use crate::storage::{Batch, Engine};

    /// A single replica's worth of evaluation state over an in-memory engine.
    pub struct TestRange {
        pub engine: Arc<Engine>,
        pub state: ReplicaState,
        pub tscache: TimestampCache,
        pub clock: ManualClock,
        pub config: StoreConfig,
    }

    impl TestRange {
        pub fn new(start: &[u8], end: &[u8]) -> Self {
            let engine = Engine::in_memory();
            let desc = RangeDescriptor::new(1, start.to_vec(), end.to_vec(), vec![ReplicaDescriptor::new(1, 1, 1)]);
            let lease = Lease {
                start: Timestamp::from_wall(1),
                replica: ReplicaDescriptor::new(1, 1, 1),
                sequence: 1,
                ..Default::default()
            };
            let mut batch = engine.new_batch();
            let mut ms = MvccStats::default();
            crate::mvcc::mvcc_put_record(
                &mut batch,
                Some(&mut ms),
                &crate::keys::range_descriptor_key(&desc.start_key),
                Timestamp::from_wall(1),
                &desc,
                None,
            )
            .unwrap();
            write_initial_state(
                &mut batch,
                ms,
                &desc,
                lease,
                Timestamp::ZERO,
                Timestamp::ZERO,
                VERSION_RANGE_APPLIED_STATE_KEY,
                Default::default(),
            )
            .unwrap();
            batch.commit().unwrap();
            let state = StateLoader::new(1).load(engine.as_ref(), &desc).unwrap();
            Self {
                engine,
                state,
                tscache: TimestampCache::default(),
                clock: ManualClock::new(1_000),
                config: StoreConfig::default(),
            }
        }

        pub fn ctx(&self) -> EvalContext<'_> {
            EvalContext {
                state: &self.state,
                store_id: 1,
                tscache: &self.tscache,
                clock: &self.clock,
                config: &self.config,
            }
        }

        /// Evaluates `ba` and commits its writes, folding the stats delta and
        /// replicated state changes into `self.state`.
        pub fn send(&mut self, ba: BatchRequest) -> Result<(BatchResponse, EvalResult)> {
            let mut batch: Batch = self.engine.new_batch();
            let (resp, res) = evaluate_batch(&mut batch, &self.ctx(), &ba)?;
            batch.commit()?;
            self.state.stats.add(&res.replicated.delta);
            if let Some(desc) = &res.replicated.desc {
                self.state.desc = desc.clone();
            }
            if let Some(lease) = &res.replicated.lease {
                self.state.lease = lease.clone();
            }
            if let Some(ts) = res.replicated.gc_threshold {
                self.state.gc_threshold.forward(ts);
            }
            if let Some(ts) = res.replicated.txn_span_gc_threshold {
                self.state.txn_span_gc_threshold.forward(ts);
            }
            Ok((resp, res))
        }

        pub fn send_one(&mut self, header: Header, req: Request) -> Result<Response> {
            let ba = BatchRequest {
                header,
                requests: vec![req],
            };
            let (mut resp, _) = self.send(ba)?;
            Ok(resp.responses.remove(0))
        }
    }

    pub fn ts(n: u64) -> Timestamp {
        Timestamp::from_wall(n)
    }

    pub fn header(at: u64) -> Header {
        Header {
            timestamp: ts(at),
            range_id: 1,
            ..Default::default()
        }
    }

    pub fn txn_header(txn: &Transaction) -> Header {
        Header {
            timestamp: txn.read_timestamp,
            txn: Some(txn.clone()),
            range_id: 1,
            ..Default::default()
        }
    }
}
