//! Command application
//!
//! Commands apply one at a time per range in log order. A command evaluated
//! under a lease that has since changed, or one whose lease index was
//! already applied, is rejected and applies as an empty command. Logical ops
//! are handed to the rangefeed processor only after the batch commits.

use std::sync::Arc;

use crate::api::Lease;
use crate::error::{Error, RangeFeedRetryReason, Result};
use crate::keys;
use crate::mvcc::{engine_span, mvcc_get, LogicalOp, MvccGetOptions};
use crate::raft::{CommandId, CommandResponse, RaftCommand};
use crate::replica::Replica;
use crate::stateloader::{ReplicaState, StateLoader};
use crate::storage::{Batch, Writer};

impl Replica {
    /// Applies a committed command of this range.
    pub(crate) async fn apply_command(
        self: &Arc<Self>,
        cmd_id: CommandId,
        cmd: &RaftCommand,
    ) -> Result<CommandResponse> {
        let _apply = self.apply_lock.lock().await;
        if self.is_destroyed() {
            tracing::debug!(range_id = self.range_id, cmd_id, "dropping command of destroyed replica");
            return Ok(CommandResponse::Rejected("replica destroyed".to_string()));
        }
        match self.apply_locked(cmd_id, cmd).await {
            Ok(resp) => Ok(resp),
            Err(e) if e.is_fatal() => {
                tracing::error!(range_id = self.range_id, cmd_id, error = %e, "fatal error applying command");
                panic!("r{}: fatal error applying command {cmd_id}: {e}", self.range_id);
            }
            Err(e) => {
                tracing::error!(range_id = self.range_id, cmd_id, error = %e, "failed to apply command");
                self.finish_proposal(cmd_id, Err(e.clone()));
                Err(e)
            }
        }
    }

    async fn apply_locked(
        self: &Arc<Self>,
        cmd_id: CommandId,
        cmd: &RaftCommand,
    ) -> Result<CommandResponse> {
        let prev = self.state.read().clone();
        let rejection = self.check_forced_error(&prev, cmd);

        let mut state = prev.clone();
        state.raft_applied_index += 1;
        let mut batch = self.engine.new_batch();
        if rejection.is_none() {
            if let Some(wb) = &cmd.write_batch {
                batch.apply_repr(&wb.data)?;
            }
            self.stage_replicated_result(&mut batch, &mut state, cmd)?;
        }
        self.stage_applied_state(&mut batch, &state)?;
        batch.commit()?;
        *self.state.write() = state;

        if let Some(err) = rejection {
            tracing::debug!(range_id = self.range_id, cmd_id, error = %err, "command rejected");
            let resp = CommandResponse::Rejected(err.to_string());
            self.finish_proposal(cmd_id, Err(err));
            return Ok(resp);
        }
        tracing::debug!(
            range_id = self.range_id,
            cmd_id,
            applied = prev.raft_applied_index + 1,
            ops = cmd.logical_ops.len(),
            "applied command"
        );
        self.handle_applied(&prev, cmd).await?;
        self.finish_proposal(cmd_id, Ok(()));
        Ok(CommandResponse::Ok)
    }

    fn check_forced_error(&self, state: &ReplicaState, cmd: &RaftCommand) -> Option<Error> {
        if let Some(lease) = &cmd.replicated.lease {
            // Evaluated against a lease that has since been replaced.
            if cmd.proposer_lease_sequence != state.lease.sequence {
                return Some(Error::LeaseRejected {
                    message: "lease changed since the request was evaluated".to_string(),
                    requested: Box::new(lease.clone()),
                    existing: Box::new(state.lease.clone()),
                });
            }
            return None;
        }
        if cmd.proposer_lease_sequence != state.lease.sequence {
            return Some(Error::NotLeaseHolder {
                range_id: self.range_id,
                lease: Some(Box::new(state.lease.clone())),
            });
        }
        if cmd.max_lease_index <= state.lease_applied_index {
            return Some(Error::AmbiguousResult(format!(
                "command lease index {} not above applied index {}",
                cmd.max_lease_index, state.lease_applied_index
            )));
        }
        None
    }

    fn stage_replicated_result(
        &self,
        batch: &mut Batch,
        state: &mut ReplicaState,
        cmd: &RaftCommand,
    ) -> Result<()> {
        let rr = &cmd.replicated;
        state.stats.add(&rr.delta);
        if !cmd.is_lease_request() {
            state.lease_applied_index = cmd.max_lease_index;
        }
        if let Some(split) = &rr.split {
            state.desc = split.trigger.left_desc.clone();
        }
        if let Some(merge) = &rr.merge {
            state.desc = merge.left_desc.clone();
            // Range-ID keys of the subsumed range go with it; its stats were
            // already folded in by the trigger.
            let prefix = keys::make_range_id_prefix(merge.right_desc.range_id);
            let (lower, upper) = engine_span(&prefix, &keys::prefix_end(&prefix));
            batch.clear_range(&lower, &upper)?;
        }
        if let Some(cr) = &rr.change_replicas {
            state.desc = cr.desc.clone();
        }
        if let Some(desc) = &rr.desc {
            state.desc = desc.clone();
        }
        if let Some(lease) = &rr.lease {
            state.lease = lease.clone();
        }
        if let Some(ts) = rr.gc_threshold {
            state.gc_threshold.forward(ts);
        }
        if let Some(ts) = rr.txn_span_gc_threshold {
            state.txn_span_gc_threshold.forward(ts);
        }
        Ok(())
    }

    fn stage_applied_state(&self, batch: &mut Batch, state: &ReplicaState) -> Result<()> {
        let loader = StateLoader::new(self.range_id);
        if state.using_applied_state_key {
            return loader.set_range_applied_state(
                batch,
                state.raft_applied_index,
                state.lease_applied_index,
                &state.stats,
            );
        }
        loader.set_legacy_applied_index(batch, state.raft_applied_index, state.lease_applied_index)?;
        loader.set_mvcc_stats(batch, &state.stats)
    }

    /// Effects of an applied command beyond the engine.
    async fn handle_applied(self: &Arc<Self>, prev: &ReplicaState, cmd: &RaftCommand) -> Result<()> {
        let rr = &cmd.replicated;
        if !cmd.logical_ops.is_empty() {
            self.publish_logical_ops(cmd.logical_ops.clone()).await;
        }
        if let Some(lease) = &rr.lease {
            self.lease_applied(&prev.lease, lease);
        }
        if let Some(split) = &rr.split {
            tracing::info!(
                range_id = self.range_id,
                left = %split.trigger.left_desc,
                right = %split.trigger.right_desc,
                "split applied"
            );
            self.stop_processor(Error::RangefeedRetry {
                reason: RangeFeedRetryReason::RangeSplit,
            });
            self.store()?.split_applied(self, &split.trigger)?;
        }
        if let Some(merge) = &rr.merge {
            tracing::info!(
                range_id = self.range_id,
                subsumed = merge.right_desc.range_id,
                desc = %merge.left_desc,
                "merge applied"
            );
            self.stop_processor(Error::RangefeedRetry {
                reason: RangeFeedRetryReason::RangeMerged,
            });
            self.store()?.merge_applied(self, merge);
        }
        if let Some(cr) = &rr.change_replicas {
            tracing::info!(range_id = self.range_id, desc = %cr.desc, "replica change applied");
            if cr.desc.replica_for_store(self.store_id).is_none() {
                self.store()?.remove_replica(
                    self.range_id,
                    Error::RangefeedRetry {
                        reason: RangeFeedRetryReason::ReplicaRemoved,
                    },
                );
            }
        }
        Ok(())
    }

    fn lease_applied(&self, prev: &Lease, lease: &Lease) {
        let held = prev.owned_by(self.store_id) && !prev.is_empty();
        let holds = lease.owned_by(self.store_id);
        if holds {
            // Reads served under earlier leases are unknown here.
            self.tscache.set_low_water(lease.start);
        }
        if held && !holds {
            self.txn_wait_queue.clear();
        }
        if !prev.equivalent(lease) {
            tracing::info!(range_id = self.range_id, %lease, prev = %prev, "new lease applied");
        }
    }

    /// Fills in previous values wanted by with-diff registrations, then hands
    /// `ops` to the processor.
    async fn publish_logical_ops(&self, mut ops: Vec<LogicalOp>) {
        let Some(processor) = self.processor() else {
            return;
        };
        let filter = processor.filter();
        for op in &mut ops {
            let Some((key, ts)) = op.committed_value() else {
                continue;
            };
            if ts.is_empty() || !filter.needs_prev_value(key) {
                continue;
            }
            let key = key.to_vec();
            let opts = MvccGetOptions {
                inconsistent: true,
                tombstones: true,
                ..Default::default()
            };
            let prev = match mvcc_get(self.engine.as_ref(), &key, ts.prev(), &opts) {
                Ok(res) => res.value.filter(|v| !v.is_tombstone()),
                Err(e) => {
                    tracing::warn!(range_id = self.range_id, key = %keys::pretty(&key), error = %e, "reading previous value");
                    None
                }
            };
            if let Some(slot) = op.prev_value_mut() {
                *slot = prev;
            }
        }
        if !processor.consume_logical_ops(ops).await {
            tracing::warn!(range_id = self.range_id, "rangefeed processor fell behind");
            self.stop_processor_if(
                &processor,
                Error::RangefeedRetry {
                    reason: RangeFeedRetryReason::SlowProcessor,
                },
            );
        }
    }

    fn finish_proposal(&self, cmd_id: CommandId, result: Result<()>) {
        if let Some(tx) = self.proposals.lock().remove(&cmd_id) {
            let _ = tx.send(result);
        }
    }
}
