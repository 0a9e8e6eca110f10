//! Request path of the leaseholder
//!
//! Admission, latching, timestamp forwarding, evaluation and proposal. Reads
//! and admin requests are served directly from evaluation; everything else
//! becomes a Raft command and completes when that command applies.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::api::{BatchRequest, BatchResponse, PushTxnType, RangeDescriptor, Request, Response};
use crate::batcheval::{declare_batch_keys, evaluate_batch, EvalContext, LocalResult};
use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::keys;
use crate::raft::{Command, ConfChange, ConfChangeType, RaftCommand, WriteBatch};
use crate::replica::Replica;
use crate::stateloader::ReplicaState;
use crate::txn::TxnStatus;

impl Replica {
    /// Executes `ba` against this range.
    pub async fn send(self: &Arc<Self>, mut ba: BatchRequest) -> Result<BatchResponse> {
        if ba.requests.is_empty() {
            return Err(Error::InvalidArgument("empty batch".to_string()));
        }
        self.check_admission(&ba)?;

        let spans = declare_batch_keys(&self.desc(), &ba);
        let _latches = self.latches.acquire(spans).await;
        // The range may have changed shape while we waited.
        self.check_admission(&ba)?;

        if ba.is_read_only() || ba.is_admin() {
            return self.execute_without_proposal(&ba);
        }
        self.forward_write_timestamp(&mut ba);
        self.execute_write(&ba).await
    }

    fn check_admission(&self, ba: &BatchRequest) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::MergedRange {
                range_id: self.range_id,
            });
        }
        let state = self.state.read();
        for req in &ba.requests {
            let span = keys::addr_span(&req.span())?;
            if !state.desc.contains_key_range(&span.key, &span.end_key) {
                return Err(Error::RangeKeyMismatch {
                    requested_start: span.key,
                    requested_end: span.end_key,
                    desc: Some(Box::new(state.desc.clone())),
                });
            }
        }

        let lease_exempt = ba.requests.iter().all(|r| {
            matches!(
                r,
                Request::RequestLease(_) | Request::TransferLease(_) | Request::LeaseInfo(_)
            )
        });
        if !lease_exempt {
            let now = self.clock.now();
            if !state.lease.owned_by(self.store_id) || !state.lease.covers(now) {
                return Err(Error::NotLeaseHolder {
                    range_id: self.range_id,
                    lease: (!state.lease.is_empty()).then(|| Box::new(state.lease.clone())),
                });
            }
        }

        let mvcc = ba
            .requests
            .iter()
            .any(|r| r.updates_read_cache() || r.applies_timestamp_cache());
        if mvcc && !state.gc_threshold.is_empty() && ba.header.timestamp <= state.gc_threshold {
            return Err(Error::BelowGcThreshold {
                timestamp: ba.header.timestamp,
                threshold: state.gc_threshold,
            });
        }
        Ok(())
    }

    pub(super) fn eval_context<'a>(&'a self, state: &'a ReplicaState) -> EvalContext<'a> {
        EvalContext {
            state,
            store_id: self.store_id,
            tscache: &self.tscache,
            clock: self.clock.as_ref(),
            config: &self.config,
        }
    }

    fn execute_without_proposal(&self, ba: &BatchRequest) -> Result<BatchResponse> {
        let state = self.state.read().clone();
        let mut batch = self.engine.new_batch();
        let (br, _) = evaluate_batch(&mut batch, &self.eval_context(&state), ba)?;
        if !batch.is_empty() {
            return Err(Error::assertion(format!(
                "r{}: {} wrote without proposing",
                self.range_id,
                ba.summary()
            )));
        }
        self.update_timestamp_cache(ba, &br);
        Ok(br)
    }

    /// Moves the write timestamp above earlier reads of the written spans and
    /// above the closed timestamp.
    fn forward_write_timestamp(&self, ba: &mut BatchRequest) {
        let txn_id = ba.header.txn_id();
        let orig = match &ba.header.txn {
            Some(txn) => txn.write_timestamp(),
            None => ba.header.timestamp,
        };
        let mut ts = orig;
        for req in ba.requests.iter().filter(|r| r.applies_timestamp_cache()) {
            let (max, owner) = self.tscache.get_max(&req.span());
            if txn_id.is_some() && owner == txn_id {
                continue;
            }
            if ts <= max {
                ts = max.next();
            }
        }
        let closed = self.closed_timestamp();
        if !closed.is_empty() && ts <= closed {
            ts = closed.next();
        }
        if ts == orig {
            return;
        }
        tracing::debug!(
            range_id = self.range_id,
            from = %orig,
            to = %ts,
            "write timestamp forwarded"
        );
        match ba.header.txn.as_mut() {
            Some(txn) => {
                txn.meta.write_timestamp.forward(ts);
            }
            None => ba.header.timestamp = ts,
        }
    }

    async fn execute_write(self: &Arc<Self>, ba: &BatchRequest) -> Result<BatchResponse> {
        let state = self.state.read().clone();
        let mut batch = self.engine.new_batch();
        let (br, result) = evaluate_batch(&mut batch, &self.eval_context(&state), ba)?;

        let cmd = RaftCommand {
            proposer_lease_sequence: state.lease.sequence,
            max_lease_index: 0,
            logical_ops: batch.take_logical_ops(),
            write_batch: (!batch.is_empty()).then(|| WriteBatch::new(batch.repr())),
            replicated: result.replicated,
        };
        self.propose(cmd, &state.desc).await?;

        self.update_timestamp_cache(ba, &br);
        self.handle_local_result(result.local);
        Ok(br)
    }

    /// Proposes `cmd` and waits for it to apply. Lease indexes are assigned
    /// under the proposal lock so commands reach the log in index order.
    async fn propose(&self, mut cmd: RaftCommand, desc: &RangeDescriptor) -> Result<()> {
        let proposer = self.store()?.proposer()?;
        let (tx, rx) = oneshot::channel();
        {
            let _order = self.propose_lock.lock().await;
            let cmd_id = self.next_cmd_id.fetch_add(1, Ordering::AcqRel) + 1;
            cmd.max_lease_index = self.state.read().lease_applied_index + 1;
            tracing::debug!(range_id = self.range_id, cmd_id, %cmd, "proposing command");
            let command = envelope(self.range_id, cmd_id, cmd, desc);
            self.proposals.lock().insert(cmd_id, tx);
            if let Err(e) = proposer.propose(command).await {
                self.proposals.lock().remove(&cmd_id);
                return Err(e);
            }
        }
        rx.await
            .unwrap_or_else(|_| Err(Error::AmbiguousResult("proposal abandoned".to_string())))
    }

    fn update_timestamp_cache(&self, ba: &BatchRequest, br: &BatchResponse) {
        let txn_id = ba.header.txn_id();
        let write_ts = match &ba.header.txn {
            Some(txn) => txn.write_timestamp(),
            None => ba.header.timestamp,
        };
        for (req, resp) in ba.requests.iter().zip(&br.responses) {
            if req.updates_read_cache() {
                let ts = if req.is_read_only() {
                    ba.header.timestamp
                } else {
                    write_ts
                };
                self.tscache.add(&req.span(), ts, txn_id);
            }
            match (req, resp) {
                (Request::EndTxn(_), Response::EndTxn(r)) => {
                    if let Some(txn) = r.txn.as_ref().filter(|t| t.is_finalized()) {
                        self.tscache.add_txn_tombstone(
                            &txn.meta.key,
                            txn.id(),
                            txn.write_timestamp(),
                            Some(txn.id()),
                        );
                    }
                }
                (Request::PushTxn(r), Response::PushTxn { pushee_txn }) => {
                    if pushee_txn.status == TxnStatus::Aborted {
                        self.tscache.add_txn_tombstone(
                            &pushee_txn.meta.key,
                            pushee_txn.id(),
                            pushee_txn.write_timestamp(),
                            Some(r.pusher_txn.id()),
                        );
                    } else if r.push_type == PushTxnType::Timestamp {
                        self.tscache.add_txn_push(
                            &pushee_txn.meta.key,
                            pushee_txn.id(),
                            pushee_txn.write_timestamp(),
                        );
                    }
                }
                (Request::RecoverTxn(_), Response::RecoverTxn { recovered_txn })
                    if recovered_txn.is_finalized() =>
                {
                    self.tscache.add_txn_tombstone(
                        &recovered_txn.meta.key,
                        recovered_txn.id(),
                        recovered_txn.write_timestamp(),
                        None,
                    );
                }
                _ => {}
            }
        }
    }

    fn handle_local_result(self: &Arc<Self>, local: LocalResult) {
        for txn in &local.updated_txns {
            self.txn_wait_queue.update_txn(txn);
        }
        if !local.resolved_locks.is_empty() {
            tracing::debug!(
                range_id = self.range_id,
                resolved = local.resolved_locks.len(),
                "resolved local intents"
            );
        }
        if local.maybe_add_to_split_queue {
            tracing::trace!(range_id = self.range_id, "range may need splitting");
        }
        if local.external_locks.is_empty() {
            return;
        }
        match self.store() {
            Ok(store) => store.resolve_intents_async(local.external_locks),
            Err(e) => tracing::warn!(
                range_id = self.range_id,
                error = %e,
                "dropping asynchronous intent resolution"
            ),
        }
    }

    /// Lowest timestamp a write may still land at, minus one.
    pub fn closed_timestamp(&self) -> Timestamp {
        self.store
            .upgrade()
            .and_then(|store| store.closed_timestamp_source())
            .map(|source| source.closed_timestamp(self.range_id))
            .unwrap_or(Timestamp::ZERO)
    }
}

/// Wraps a command for the log. Replica set changes travel as membership
/// changes carrying the command as context.
fn envelope(
    range_id: crate::api::RangeId,
    cmd_id: crate::raft::CommandId,
    command: RaftCommand,
    prev: &RangeDescriptor,
) -> Command {
    let change = command.replicated.change_replicas.as_ref().and_then(|t| {
        let added = t
            .desc
            .replicas()
            .iter()
            .find(|r| prev.replica_for_store(r.store_id).is_none())
            .map(|r| {
                let kind = if r.replica_type.is_voter() {
                    ConfChangeType::AddNode
                } else {
                    ConfChangeType::AddLearnerNode
                };
                (kind, *r)
            });
        added.or_else(|| {
            prev.replicas()
                .iter()
                .find(|r| t.desc.replica_for_store(r.store_id).is_none())
                .map(|r| (ConfChangeType::RemoveNode, *r))
        })
    });
    match change {
        Some((change_type, replica)) => Command::ConfChange {
            range_id,
            cmd_id,
            change: ConfChange {
                change_type,
                replica,
                context: command,
            },
        },
        None => Command::Range {
            range_id,
            cmd_id,
            command,
        },
    }
}
