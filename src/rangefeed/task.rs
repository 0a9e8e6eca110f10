//! Processor background tasks
//!
//! The initial resolved timestamp scan reports every intent already in the
//! range, after which the resolved timestamp may start advancing. Push
//! attempts move old transactions out of the way of the resolved timestamp
//! and help clean up the intents of finished ones.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::api::Span;
use crate::error::{Error, Result};
use crate::hlc::Timestamp;
use crate::mvcc::{decode_mvcc_key, engine_span, key_upper_bound, LogicalOp, MvccMetadata};
use crate::rangefeed::processor::Event;
use crate::storage::{EngineIterator, Reader};
use crate::txn::{LockUpdate, Transaction, TxnMeta, TxnStatus};

/// Pushes and cleans up transactions on behalf of a processor.
#[async_trait]
pub trait TxnPusher: Send + Sync {
    /// Pushes each transaction to at least `ts`, returning their records
    /// after the push.
    async fn push_txns(&self, txns: Vec<TxnMeta>, ts: Timestamp) -> Result<Vec<Transaction>>;

    /// Resolves the given intents.
    async fn resolve_intents(&self, intents: Vec<LockUpdate>) -> Result<()>;
}

/// Reports every intent in `span` as a `WriteIntent` op. The reader must
/// observe every intent present when the processor started.
pub(crate) async fn init_resolved_ts_scan<R: Reader>(
    reader: R,
    span: &Span,
    events: &mpsc::Sender<Event>,
) -> Result<()> {
    let (lower, upper) = engine_span(&span.key, &span.end_key);
    let mut iter = EngineIterator::new(reader, &lower, &upper);
    let mut ops = Vec::new();
    iter.first();
    while iter.valid()? {
        let mvcc_key = decode_mvcc_key(iter.key())?;
        if !mvcc_key.is_value() {
            let meta = MvccMetadata::decode(iter.value())
                .map_err(|e| e.context(format!("decoding mvcc meta of {mvcc_key}")))?;
            if let Some(txn) = meta.txn {
                ops.push(LogicalOp::WriteIntent {
                    txn_id: txn.id,
                    txn_key: txn.key,
                    txn_min_timestamp: txn.min_timestamp,
                    timestamp: txn.write_timestamp,
                });
            }
        }
        // Only the first entry of each key can be a metadata record.
        iter.seek_ge(&key_upper_bound(&mvcc_key.key));
    }
    tracing::debug!(%span, intents = ops.len(), "initial resolved timestamp scan complete");
    if !ops.is_empty() {
        send(events, Event::Ops(ops)).await?;
    }
    Ok(())
}

/// Pushes `txns` to `ts` and reports the outcome to the processor.
pub(crate) async fn txn_push_attempt(
    pusher: Arc<dyn TxnPusher>,
    txns: Vec<TxnMeta>,
    ts: Timestamp,
    events: &mpsc::Sender<Event>,
) -> Result<()> {
    let pushed = pusher.push_txns(txns, ts).await?;

    let mut ops = Vec::with_capacity(pushed.len());
    let mut cleanup = Vec::new();
    for txn in &pushed {
        match txn.status {
            TxnStatus::Pending | TxnStatus::Staging => ops.push(LogicalOp::UpdateIntent {
                txn_id: txn.id(),
                timestamp: txn.write_timestamp(),
            }),
            TxnStatus::Committed => {
                // The intents still need resolving before the resolved
                // timestamp can pass the commit timestamp.
                ops.push(LogicalOp::UpdateIntent {
                    txn_id: txn.id(),
                    timestamp: txn.write_timestamp(),
                });
                cleanup.extend(lock_updates(txn));
            }
            TxnStatus::Aborted => {
                ops.push(LogicalOp::AbortTxn { txn_id: txn.id() });
                cleanup.extend(lock_updates(txn));
            }
        }
    }
    tracing::debug!(
        pushed = pushed.len(),
        cleanup = cleanup.len(),
        "rangefeed push attempt complete"
    );
    send(events, Event::Ops(ops)).await?;
    if cleanup.is_empty() {
        return Ok(());
    }
    pusher.resolve_intents(cleanup).await
}

fn lock_updates(txn: &Transaction) -> impl Iterator<Item = LockUpdate> + '_ {
    txn.lock_spans
        .iter()
        .map(move |span| LockUpdate::new(txn, span.clone()))
}

async fn send(events: &mpsc::Sender<Event>, event: Event) -> Result<()> {
    events.send(event).await.map_err(|_| Error::Cancelled)
}
