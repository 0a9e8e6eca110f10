//! Admin transactions
//!
//! Splits, merges and replica changes are planned by an admin command on
//! the range and then installed by a transaction that rewrites the affected
//! range descriptors and commits with the matching trigger. The trigger
//! runs inside the committing batch, so the descriptor writes and the
//! replica state change apply together.

use std::sync::Arc;

use crate::api::{
    AdminChangeReplicasRequest, AdminMergeRequest, AdminSplitRequest, BatchRequest,
    BatchResponse, ChangeReplicasTrigger, CommitTrigger, EndTxnRequest, MergeTrigger,
    RangeDescriptor, RangeId, ReplicationChange, Request, Response, Span, SplitTrigger,
};
use crate::error::{Error, Result};
use crate::keys;
use crate::mvcc::Value;
use crate::replica::Replica;
use crate::store::Store;
use crate::txn::{IsolationLevel, Transaction};

/// Attempts at an admin transaction before giving up on retry errors.
const MAX_ADMIN_TXN_ATTEMPTS: usize = 3;

const ADMIN_TXN_PRIORITY: i32 = 1;

impl Store {
    /// Splits range `range_id` at `split_key`, or at the key dividing its
    /// data in half when none is given. Returns the new left and right
    /// descriptors.
    pub async fn admin_split(
        &self,
        range_id: RangeId,
        split_key: Option<Vec<u8>>,
    ) -> Result<(RangeDescriptor, RangeDescriptor)> {
        let _admin = self.admin_lock.lock().await;
        let replica = self.replica(range_id)?;
        let new_range_id = self.allocate_range_id();
        let planned = admin_request(
            &replica,
            Request::AdminSplit(AdminSplitRequest {
                key: replica.desc().start_key,
                split_key,
                new_range_id,
            }),
        )
        .await?;
        let (left_desc, right_desc) = match planned {
            Response::AdminSplit {
                left_desc,
                right_desc,
            } => (left_desc, right_desc),
            other => return Err(unexpected(&other)),
        };

        let left_key = keys::range_descriptor_key(&left_desc.start_key);
        let right_key = keys::range_descriptor_key(&right_desc.start_key);
        let mut end = EndTxnRequest::commit(
            left_key.clone(),
            vec![Span::point(left_key.clone()), Span::point(right_key.clone())],
        );
        end.commit_trigger = Some(CommitTrigger::Split(SplitTrigger {
            left_desc: left_desc.clone(),
            right_desc: right_desc.clone(),
        }));
        let requests = vec![
            put_desc(&left_key, &left_desc)?,
            put_desc(&right_key, &right_desc)?,
            Request::EndTxn(end),
        ];
        self.run_admin_txn("split", &left_key, vec![(replica, requests)])
            .await?;
        tracing::info!(left = %left_desc, right = %right_desc, "split complete");
        Ok((left_desc, right_desc))
    }

    /// Merges range `range_id` with its right-hand neighbor. Returns the
    /// merged descriptor.
    pub async fn admin_merge(&self, range_id: RangeId) -> Result<RangeDescriptor> {
        let _admin = self.admin_lock.lock().await;
        let lhs = self.replica(range_id)?;
        let planned = admin_request(
            &lhs,
            Request::AdminMerge(AdminMergeRequest {
                key: lhs.desc().start_key,
            }),
        )
        .await?;
        let left_desc = match planned {
            Response::AdminMerge { desc } => desc,
            other => return Err(unexpected(&other)),
        };
        let rhs = self
            .replicas()
            .into_iter()
            .find(|r| r.desc().start_key == left_desc.end_key)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("no right-hand neighbor of {left_desc} on this store"))
            })?;
        let right_desc = rhs.desc();

        let mut merged = left_desc.clone();
        merged.end_key = right_desc.end_key.clone();
        merged.generation = left_desc.generation.max(right_desc.generation) + 1;
        let left_key = keys::range_descriptor_key(&left_desc.start_key);
        let right_key = keys::range_descriptor_key(&right_desc.start_key);

        let mut txn = self.new_admin_txn("merge", &left_key);
        let result = self
            .merge_txn(&mut txn, &lhs, &rhs, &merged, &right_desc, &left_key, &right_key)
            .await;
        if let Err(e) = result {
            self.rollback(&lhs, &txn, vec![Span::point(left_key), Span::point(right_key)])
                .await;
            return Err(e);
        }
        tracing::info!(desc = %merged, subsumed = right_desc.range_id, "merge complete");
        Ok(merged)
    }

    #[allow(clippy::too_many_arguments)]
    async fn merge_txn(
        &self,
        txn: &mut Transaction,
        lhs: &Arc<Replica>,
        rhs: &Arc<Replica>,
        merged: &RangeDescriptor,
        right_desc: &RangeDescriptor,
        left_key: &[u8],
        right_key: &[u8],
    ) -> Result<()> {
        // Remove the subsumed descriptor while the right-hand range still
        // accepts writes.
        self.send_txn(rhs, txn, vec![Request::delete(right_key.to_vec())])
            .await?;

        let (_freeze, right_stats, freeze_start) = rhs.subsume().await?;
        if rhs.desc() != *right_desc {
            return Err(Error::ConditionFailed { actual: None });
        }
        let mut end = EndTxnRequest::commit(
            left_key.to_vec(),
            vec![Span::point(left_key.to_vec()), Span::point(right_key.to_vec())],
        );
        end.commit_trigger = Some(CommitTrigger::Merge(MergeTrigger {
            left_desc: merged.clone(),
            right_desc: right_desc.clone(),
            right_stats,
            freeze_start,
        }));
        self.send_txn(lhs, txn, vec![put_desc(left_key, merged)?, Request::EndTxn(end)])
            .await?;
        Ok(())
    }

    /// Applies `changes` to the replica set of range `range_id`. Returns the
    /// new descriptor.
    pub async fn admin_change_replicas(
        &self,
        range_id: RangeId,
        changes: Vec<ReplicationChange>,
    ) -> Result<RangeDescriptor> {
        let _admin = self.admin_lock.lock().await;
        let replica = self.replica(range_id)?;
        let exp_desc = replica.desc();
        let planned = admin_request(
            &replica,
            Request::AdminChangeReplicas(AdminChangeReplicasRequest {
                key: exp_desc.start_key.clone(),
                changes,
                exp_desc: exp_desc.clone(),
            }),
        )
        .await?;
        let desc = match planned {
            Response::AdminChangeReplicas { desc } => desc,
            other => return Err(unexpected(&other)),
        };

        let desc_key = keys::range_descriptor_key(&desc.start_key);
        let mut end = EndTxnRequest::commit(desc_key.clone(), vec![Span::point(desc_key.clone())]);
        end.commit_trigger = Some(CommitTrigger::ChangeReplicas(ChangeReplicasTrigger {
            desc: desc.clone(),
        }));
        let requests = vec![put_desc(&desc_key, &desc)?, Request::EndTxn(end)];
        self.run_admin_txn("change-replicas", &desc_key, vec![(replica, requests)])
            .await?;
        tracing::info!(prev = %exp_desc, %desc, "replica change complete");
        Ok(desc)
    }

    fn allocate_range_id(&self) -> RangeId {
        self.next_range_id
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel)
    }

    fn new_admin_txn(&self, name: &str, anchor: &[u8]) -> Transaction {
        Transaction::new(
            name,
            anchor.to_vec(),
            IsolationLevel::Serializable,
            ADMIN_TXN_PRIORITY,
            self.clock.now(),
        )
    }

    /// Runs `batches` in order as one transaction, restarting it on retry
    /// errors. The last batch must end the transaction.
    async fn run_admin_txn(
        &self,
        name: &str,
        anchor: &[u8],
        batches: Vec<(Arc<Replica>, Vec<Request>)>,
    ) -> Result<()> {
        let mut txn = self.new_admin_txn(name, anchor);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut result = Ok(());
            let mut touched = Vec::new();
            for (replica, requests) in &batches {
                touched.extend(requests.iter().filter(|r| writes_intent(r)).map(Request::span));
                if let Err(e) = self.send_txn(replica, &mut txn, requests.clone()).await {
                    result = Err((replica.clone(), e));
                    break;
                }
            }
            let (replica, err) = match result {
                Ok(()) => return Ok(()),
                Err(failed) => failed,
            };
            if err.is_retriable() && attempt < MAX_ADMIN_TXN_ATTEMPTS {
                tracing::debug!(txn = %txn.short_id(), attempt, error = %err, "retrying admin transaction");
                let now = self.clock.now();
                txn.restart(now);
                continue;
            }
            self.rollback(&replica, &txn, touched).await;
            return Err(err);
        }
    }

    /// Sends `requests` as the next statement of `txn` and folds the
    /// response's view of the transaction back into it.
    async fn send_txn(
        &self,
        replica: &Arc<Replica>,
        txn: &mut Transaction,
        requests: Vec<Request>,
    ) -> Result<BatchResponse> {
        txn.step();
        let mut ba = BatchRequest::new(replica.range_id(), txn.read_timestamp).with_txn(txn.clone());
        for req in requests {
            if writes_intent(&req) {
                txn.add_lock_span(req.span());
            }
            ba = ba.add(req);
        }
        let br = replica.send(ba).await?;
        if let Some(updated) = &br.txn {
            txn.update(updated);
        }
        Ok(br)
    }

    /// Best-effort abort of a failed admin transaction.
    async fn rollback(&self, replica: &Arc<Replica>, txn: &Transaction, lock_spans: Vec<Span>) {
        let mut txn = txn.clone();
        let anchor = txn.meta.key.clone();
        let target = match self.replica_for_key(&anchor) {
            Ok(r) => r,
            Err(_) => replica.clone(),
        };
        let end = EndTxnRequest::abort(anchor, lock_spans);
        if let Err(e) = self.send_txn(&target, &mut txn, vec![Request::EndTxn(end)]).await {
            tracing::warn!(txn = %txn.short_id(), error = %e, "rolling back admin transaction");
        }
    }
}

async fn admin_request(replica: &Arc<Replica>, req: Request) -> Result<Response> {
    let ba = BatchRequest::new(replica.range_id(), replica.now()).add(req);
    let mut br = replica.send(ba).await?;
    br.responses
        .pop()
        .ok_or_else(|| Error::assertion("admin request returned no response"))
}

fn unexpected(resp: &Response) -> Error {
    Error::assertion(format!("unexpected {} response to admin request", resp.method()))
}

fn writes_intent(req: &Request) -> bool {
    matches!(
        req,
        Request::Put(_)
            | Request::ConditionalPut(_)
            | Request::Increment(_)
            | Request::Delete(_)
            | Request::DeleteRange(_)
    )
}

fn put_desc(key: &[u8], desc: &RangeDescriptor) -> Result<Request> {
    Ok(Request::put(key.to_vec(), Value::from_record(desc)?))
}
