//! Replicas
//!
//! A [`Replica`] is one range's copy of state on this store. On the
//! leaseholder, requests are admitted against the descriptor and lease,
//! evaluated under latches and proposed as Raft commands. Every replica
//! applies the same commands in log order and feeds their logical ops to an
//! attached rangefeed processor.
//!
//! ```text
//! send ─▶ admit ─▶ latches ─▶ tscache/closed ts ─▶ evaluate ─▶ propose
//!                                                                │
//! apply_command ◀── Raft log ◀───────────────────────────────────┘
//!      │ write batch, side effects, applied state
//!      └─▶ rangefeed processor
//! ```

mod apply;
mod rangefeed;
mod send;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use crate::api::{Lease, RangeDescriptor, RangeId, StoreId};
use crate::concurrency::{LatchGuard, LatchManager, SpanSet, TimestampCache};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::hlc::{Clock, Timestamp};
use crate::keys;
use crate::mvcc::MvccStats;
use crate::raft::CommandId;
use crate::rangefeed::Processor;
use crate::stateloader::{ReplicaState, StateLoader};
use crate::storage::Engine;
use crate::store::Store;
use crate::txn::TxnWaitQueue;

pub use rangefeed::{ClockClosedTimestamps, ClosedTimestampSource};

/// Outcome of a proposal, delivered when its command applies.
type ProposalResult = Result<()>;

pub struct Replica {
    range_id: RangeId,
    store_id: StoreId,
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    config: Arc<StoreConfig>,
    store: Weak<Store>,
    state: RwLock<ReplicaState>,
    latches: Arc<LatchManager>,
    tscache: TimestampCache,
    txn_wait_queue: TxnWaitQueue,
    /// Held while assigning a lease index and proposing, so that proposals
    /// reach the log in lease index order.
    propose_lock: tokio::sync::Mutex<()>,
    /// Held while applying a command or attaching a rangefeed.
    apply_lock: tokio::sync::Mutex<()>,
    proposals: Mutex<HashMap<CommandId, oneshot::Sender<ProposalResult>>>,
    next_cmd_id: AtomicU64,
    processor: Mutex<Option<Arc<Processor>>>,
    destroyed: AtomicBool,
}

impl Replica {
    /// Loads the replica of `desc` from the engine.
    pub(crate) fn load(
        store: &Arc<Store>,
        desc: &RangeDescriptor,
    ) -> Result<Arc<Self>> {
        let engine = store.engine().clone();
        let state = StateLoader::new(desc.range_id).load(engine.as_ref(), desc)?;
        if !state.desc.is_initialized() {
            return Err(Error::ReplicaCorruption(format!(
                "r{}: loaded uninitialized descriptor {}",
                desc.range_id, state.desc
            )));
        }
        let config = store.config().clone();
        let replica = Arc::new(Self {
            range_id: desc.range_id,
            store_id: store.store_id(),
            engine,
            clock: store.clock().clone(),
            tscache: TimestampCache::new(config.tscache_capacity),
            config,
            store: Arc::downgrade(store),
            state: RwLock::new(state),
            latches: Arc::new(LatchManager::new()),
            txn_wait_queue: TxnWaitQueue::new(),
            propose_lock: tokio::sync::Mutex::new(()),
            apply_lock: tokio::sync::Mutex::new(()),
            proposals: Mutex::new(HashMap::new()),
            // Distinct from ids of commands still in the log from a previous run.
            next_cmd_id: AtomicU64::new(u64::from(rand::random::<u32>()) << 32),
            processor: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });
        {
            let state = replica.state.read();
            if state.lease.owned_by(replica.store_id) {
                replica.tscache.set_low_water(state.lease.start);
            }
            tracing::info!(
                range_id = replica.range_id,
                desc = %state.desc,
                lease = %state.lease,
                applied = state.raft_applied_index,
                "replica loaded"
            );
        }
        Ok(replica)
    }

    pub fn range_id(&self) -> RangeId {
        self.range_id
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn desc(&self) -> RangeDescriptor {
        self.state.read().desc.clone()
    }

    pub fn lease(&self) -> Lease {
        self.state.read().lease.clone()
    }

    /// Consistent copy of the in-memory replicated state.
    pub fn state(&self) -> ReplicaState {
        self.state.read().clone()
    }

    pub fn tscache(&self) -> &TimestampCache {
        &self.tscache
    }

    pub fn txn_wait_queue(&self) -> &TxnWaitQueue {
        &self.txn_wait_queue
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn store(&self) -> Result<Arc<Store>> {
        self.store
            .upgrade()
            .ok_or_else(|| Error::AmbiguousResult("store is shutting down".to_string()))
    }

    /// Freezes the range ahead of a merge into its left neighbor. Every
    /// later request blocks on the returned latches until the merge applies
    /// and destroys this replica, or the guard is dropped because the merge
    /// failed. Returns the guard, the final stats and the freeze timestamp.
    pub(crate) async fn subsume(&self) -> Result<(LatchGuard, MvccStats, Timestamp)> {
        let desc = self.desc();
        let mut spans = SpanSet::new();
        for span in keys::replica_data_spans(self.range_id, &desc.start_key, &desc.end_key) {
            spans.non_mvcc_write(span);
        }
        let guard = self.latches.acquire(spans).await;
        if self.is_destroyed() {
            return Err(Error::MergedRange {
                range_id: self.range_id,
            });
        }
        let stats = self.state.read().stats;
        let freeze_start = self.clock.now();
        tracing::info!(range_id = self.range_id, %freeze_start, "range subsumed");
        Ok((guard, stats, freeze_start))
    }

    /// Marks the replica removed after its range merged away. In-flight and
    /// future requests fail with `MergedRange`.
    pub(crate) fn destroy(&self, err: Error) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(range_id = self.range_id, reason = %err, "replica destroyed");
        for (_, tx) in self.proposals.lock().drain() {
            let _ = tx.send(Err(Error::MergedRange {
                range_id: self.range_id,
            }));
        }
        self.txn_wait_queue.clear();
        self.stop_processor(err);
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Replica(r{} s{})", self.range_id, self.store_id)
    }
}
