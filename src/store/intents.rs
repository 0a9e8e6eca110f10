//! Pushing transactions and resolving their intents
//!
//! Rangefeed processors and ending transactions hand the store intents that
//! live on other ranges. Each lock update is split at range boundaries and
//! resolved by the range holding it.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::api::{
    BatchRequest, PushTxnRequest, PushTxnType, Request, ResolveIntentRangeRequest,
    ResolveIntentRequest, Response, Span,
};
use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::keys;
use crate::rangefeed::TxnPusher;
use crate::replica::Replica;
use crate::store::Store;
use crate::txn::{IsolationLevel, LockUpdate, Transaction, TxnMeta, MAX_TXN_PRIORITY};

/// Pushes and resolves through the store's own ranges.
pub struct StoreTxnPusher {
    store: Weak<Store>,
}

impl StoreTxnPusher {
    pub fn new(store: Weak<Store>) -> Self {
        Self { store }
    }

    fn store(&self) -> Result<Arc<Store>> {
        self.store
            .upgrade()
            .ok_or_else(|| Error::AmbiguousResult("store is shutting down".to_string()))
    }
}

#[async_trait]
impl TxnPusher for StoreTxnPusher {
    async fn push_txns(&self, txns: Vec<TxnMeta>, ts: Timestamp) -> Result<Vec<Transaction>> {
        self.store()?.push_txns(txns, ts).await
    }

    async fn resolve_intents(&self, intents: Vec<LockUpdate>) -> Result<()> {
        self.store()?.resolve_intents(intents).await
    }
}

impl Store {
    /// Pushes the write timestamp of each of `txns` to at least `ts`.
    /// Returns their records as of the push.
    pub async fn push_txns(&self, txns: Vec<TxnMeta>, ts: Timestamp) -> Result<Vec<Transaction>> {
        let now = self.clock.now();
        let pusher = Transaction::new(
            "push",
            Vec::new(),
            IsolationLevel::Serializable,
            MAX_TXN_PRIORITY,
            now,
        );
        let mut pushed = Vec::with_capacity(txns.len());
        for pushee in txns {
            let replica = self.replica_for_key(&pushee.key)?;
            let req = Request::PushTxn(PushTxnRequest {
                key: pushee.key.clone(),
                pusher_txn: pusher.clone(),
                pushee_txn: pushee,
                push_to: ts,
                push_type: PushTxnType::Timestamp,
                force: false,
            });
            match send_one(&replica, now, 0, req).await? {
                Response::PushTxn { pushee_txn } => {
                    tracing::debug!(
                        txn = %pushee_txn.short_id(),
                        status = %pushee_txn.status,
                        ts = %pushee_txn.write_timestamp(),
                        "pushed transaction"
                    );
                    pushed.push(pushee_txn);
                }
                other => {
                    return Err(Error::assertion(format!(
                        "unexpected {} response to PushTxn",
                        other.method()
                    )));
                }
            }
        }
        Ok(pushed)
    }

    /// Resolves every update, range by range.
    pub async fn resolve_intents(&self, updates: Vec<LockUpdate>) -> Result<()> {
        for update in updates {
            if update.span.is_point() {
                self.resolve_point(update).await?;
            } else {
                self.resolve_range(update).await?;
            }
        }
        Ok(())
    }

    /// Resolves `updates` in the background, logging failures.
    pub(crate) fn resolve_intents_async(self: &Arc<Self>, updates: Vec<LockUpdate>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let count = updates.len();
            match store.resolve_intents(updates).await {
                Ok(()) => tracing::debug!(count, "resolved external intents"),
                Err(e) => tracing::warn!(count, error = %e, "asynchronous intent resolution failed"),
            }
        });
    }

    async fn resolve_point(&self, update: LockUpdate) -> Result<()> {
        let replica = self.replica_for_key(&update.span.key)?;
        let req = Request::ResolveIntent(ResolveIntentRequest {
            key: update.span.key,
            intent_txn: update.txn,
            status: update.status,
            poison: false,
        });
        send_one(&replica, self.clock.now(), 0, req).await?;
        Ok(())
    }

    async fn resolve_range(&self, update: LockUpdate) -> Result<()> {
        let limit = self.config.intent_resolution_batch as i64;
        let mut remaining = Some(update.span.clone());
        while let Some(span) = remaining.take() {
            let replica = self.replica_for_key(&span.key)?;
            let desc = replica.desc();
            // Range-local spans address a single range.
            let (piece, rest) = if keys::is_local(&span.key) || span.end_key <= desc.end_key {
                (span.clone(), None)
            } else {
                (
                    Span::new(span.key.clone(), desc.end_key.clone()),
                    Some(Span::new(desc.end_key.clone(), span.end_key.clone())),
                )
            };
            let req = Request::ResolveIntentRange(ResolveIntentRangeRequest {
                span: piece,
                intent_txn: update.txn.clone(),
                status: update.status,
                poison: false,
            });
            remaining = match send_one(&replica, self.clock.now(), limit, req).await? {
                Response::ResolveIntentRange {
                    resume_span: Some(resume),
                } => Some(Span::new(resume.key, span.end_key.clone())),
                _ => rest,
            };
        }
        Ok(())
    }
}

async fn send_one(replica: &Arc<Replica>, ts: Timestamp, max_keys: i64, req: Request) -> Result<Response> {
    let mut ba = BatchRequest::new(replica.range_id(), ts).add(req);
    ba.header.max_span_request_keys = max_keys;
    let mut br = replica.send(ba).await?;
    br.responses
        .pop()
        .ok_or_else(|| Error::assertion("batch returned no response"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Span;
    use crate::config::StoreConfig;
    use crate::hlc::{Clock, HlcClock};
    use crate::mvcc::{mvcc_get, MvccGetOptions, Value};
    use crate::storage::Engine;
    use crate::txn::TxnStatus;

    async fn write_intent(store: &Store, txn: &Transaction, key: &str) {
        let ba = BatchRequest::new(0, txn.read_timestamp)
            .with_txn(txn.clone())
            .add(Request::put(key.as_bytes().to_vec(), Value::from_string("v")));
        store.send(ba).await.unwrap();
    }

    fn has_intent(store: &Store, key: &str) -> bool {
        let opts = MvccGetOptions {
            inconsistent: true,
            ..Default::default()
        };
        mvcc_get(store.engine().as_ref(), key.as_bytes(), Timestamp::MAX, &opts)
            .unwrap()
            .intent
            .is_some()
    }

    #[tokio::test]
    async fn test_resolve_intents_across_ranges() {
        let clock: Arc<dyn Clock> = Arc::new(HlcClock::new());
        let store = Store::new_local(1, 1, Engine::in_memory(), clock.clone(), StoreConfig::default()).unwrap();
        store.admin_split(1, Some(b"m".to_vec())).await.unwrap();

        let mut txn = Transaction::new("t", b"a".to_vec(), IsolationLevel::Serializable, 1, clock.now());
        for key in ["a", "c", "p", "x"] {
            write_intent(&store, &txn, key).await;
        }
        assert!(has_intent(&store, "c") && has_intent(&store, "x"));

        txn.status = TxnStatus::Committed;
        store
            .resolve_intents(vec![
                LockUpdate::new(&txn, Span::point(b"a".to_vec())),
                LockUpdate::new(&txn, Span::new(b"b".to_vec(), b"z".to_vec())),
            ])
            .await
            .unwrap();
        for key in ["a", "c", "p", "x"] {
            assert!(!has_intent(&store, key), "intent left on {key}");
        }
    }

    #[tokio::test]
    async fn test_push_txns_moves_timestamp() {
        let clock: Arc<dyn Clock> = Arc::new(HlcClock::new());
        let store = Store::new_local(1, 1, Engine::in_memory(), clock.clone(), StoreConfig::default()).unwrap();
        let txn = Transaction::new("t", b"k".to_vec(), IsolationLevel::Serializable, 1, clock.now());
        write_intent(&store, &txn, "k").await;

        let target = clock.now().add_nanos(1_000);
        let pushed = store.push_txns(vec![txn.meta.clone()], target).await.unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].status, TxnStatus::Pending);
        assert!(pushed[0].write_timestamp() >= target);
    }
}
