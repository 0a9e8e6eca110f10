//! Stores
//!
//! A [`Store`] owns one engine and the replicas of every range with a copy
//! on it. It routes batches to replicas, runs the admin transactions that
//! split, merge and re-replicate ranges, and applies committed commands on
//! behalf of the Raft pipeline.

mod admin;
mod intents;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{
    BatchRequest, BatchResponse, Lease, MergeTrigger, NodeId, RaftTombstone, RangeDescriptor,
    RangeId, ReplicaDescriptor, SplitTrigger, StoreId, TruncatedStateType,
};
use crate::config::StoreConfig;
use crate::error::{Error, RangeFeedRetryReason, Result};
use crate::hlc::{Clock, Timestamp};
use crate::keys;
use crate::mvcc::{engine_span, mvcc_get_record, mvcc_put_record, mvcc_scan, MvccScanOptions, MvccStats};
use crate::raft::{CommandApplier, CommandId, CommandResponse, LocalProposer, Proposer, RaftCommand};
use crate::rangefeed::TxnPusher;
use crate::replica::{ClosedTimestampSource, Replica};
use crate::stateloader::{write_initial_state, StateLoader};
use crate::storage::{Batch, Engine, Writer};

pub use intents::StoreTxnPusher;

/// Identity persisted in the engine when the store is bootstrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreIdent {
    pub node_id: NodeId,
    pub store_id: StoreId,
}

pub struct Store {
    ident: StoreIdent,
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    config: Arc<StoreConfig>,
    replicas: RwLock<BTreeMap<RangeId, Arc<Replica>>>,
    proposer: RwLock<Option<Arc<dyn Proposer>>>,
    closed_ts: RwLock<Option<Arc<dyn ClosedTimestampSource>>>,
    txn_pusher: RwLock<Option<Arc<dyn TxnPusher>>>,
    next_range_id: AtomicU64,
    /// Serializes admin transactions on this store.
    admin_lock: tokio::sync::Mutex<()>,
    self_ref: Weak<Store>,
}

impl Store {
    /// Opens the store over `engine`, loading a replica for every range
    /// descriptor that names this store.
    pub fn open(
        node_id: NodeId,
        store_id: StoreId,
        engine: Arc<Engine>,
        clock: Arc<dyn Clock>,
        config: StoreConfig,
    ) -> Result<Arc<Self>> {
        let ident = StoreIdent { node_id, store_id };
        if let Some(existing) =
            mvcc_get_record::<_, StoreIdent>(engine.as_ref(), &keys::store_ident_key(), Timestamp::ZERO, None)?
        {
            if existing != ident {
                return Err(Error::InvalidArgument(format!(
                    "engine belongs to n{},s{}, not n{},s{}",
                    existing.node_id, existing.store_id, node_id, store_id
                )));
            }
        }
        let store = Arc::new_cyclic(|self_ref| Self {
            ident,
            engine,
            clock,
            config: Arc::new(config),
            replicas: RwLock::new(BTreeMap::new()),
            proposer: RwLock::new(None),
            closed_ts: RwLock::new(None),
            txn_pusher: RwLock::new(None),
            next_range_id: AtomicU64::new(1),
            admin_lock: tokio::sync::Mutex::new(()),
            self_ref: self_ref.clone(),
        });
        let loaded = store.load_replicas()?;
        tracing::info!(node_id, store_id, replicas = loaded, "store opened");
        Ok(store)
    }

    /// Opens and bootstraps a store that applies its own proposals without
    /// replicating them.
    pub fn new_local(
        node_id: NodeId,
        store_id: StoreId,
        engine: Arc<Engine>,
        clock: Arc<dyn Clock>,
        config: StoreConfig,
    ) -> Result<Arc<Self>> {
        let store = Self::open(node_id, store_id, engine, clock, config)?;
        store.bootstrap()?;
        store.start_local();
        Ok(store)
    }

    /// Writes the store identity and the first range, spanning the whole
    /// keyspace, into an empty engine. Returns false if the engine was
    /// already bootstrapped.
    pub fn bootstrap(self: &Arc<Self>) -> Result<bool> {
        let ident_key = keys::store_ident_key();
        if mvcc_get_record::<_, StoreIdent>(self.engine.as_ref(), &ident_key, Timestamp::ZERO, None)?.is_some() {
            return Ok(false);
        }
        let replica = ReplicaDescriptor::new(self.ident.node_id, self.ident.store_id, 1);
        let desc = RangeDescriptor::new(1, keys::KEY_MIN, keys::KEY_MAX, vec![replica]);
        let lease = Lease {
            start: Timestamp::ZERO,
            replica,
            epoch: 1,
            sequence: 1,
            ..Default::default()
        };

        let mut batch = self.engine.new_batch();
        mvcc_put_record(&mut batch, None, &ident_key, Timestamp::ZERO, &self.ident, None)?;
        let mut ms = MvccStats::default();
        mvcc_put_record(
            &mut batch,
            Some(&mut ms),
            &keys::range_descriptor_key(&desc.start_key),
            self.clock.now(),
            &desc,
            None,
        )?;
        write_initial_state(
            &mut batch,
            ms,
            &desc,
            lease,
            Timestamp::ZERO,
            Timestamp::ZERO,
            self.config.cluster_version,
            TruncatedStateType::default(),
        )?;
        batch.commit()?;

        let replica = Replica::load(self, &desc)?;
        self.replicas.write().insert(desc.range_id, replica);
        self.next_range_id.fetch_max(desc.range_id + 1, Ordering::AcqRel);
        tracing::info!(node_id = self.ident.node_id, store_id = self.ident.store_id, %desc, "store bootstrapped");
        Ok(true)
    }

    /// Routes proposals straight back into this store.
    pub fn start_local(self: &Arc<Self>) {
        let applier: Arc<dyn CommandApplier> = self.clone();
        self.set_proposer(Arc::new(LocalProposer::new(Arc::downgrade(&applier))));
    }

    pub fn set_proposer(&self, proposer: Arc<dyn Proposer>) {
        *self.proposer.write() = Some(proposer);
    }

    pub fn set_closed_timestamp_source(&self, source: Arc<dyn ClosedTimestampSource>) {
        *self.closed_ts.write() = Some(source);
    }

    /// Replaces the pusher handed to rangefeed processors started from now
    /// on.
    pub fn set_txn_pusher(&self, pusher: Arc<dyn TxnPusher>) {
        *self.txn_pusher.write() = Some(pusher);
    }

    pub fn ident(&self) -> StoreIdent {
        self.ident
    }

    pub fn store_id(&self) -> StoreId {
        self.ident.store_id
    }

    pub fn node_id(&self) -> NodeId {
        self.ident.node_id
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &Arc<StoreConfig> {
        &self.config
    }

    pub(crate) fn proposer(&self) -> Result<Arc<dyn Proposer>> {
        self.proposer
            .read()
            .clone()
            .ok_or_else(|| Error::InvalidArgument(format!("s{} is not started", self.ident.store_id)))
    }

    pub(crate) fn closed_timestamp_source(&self) -> Option<Arc<dyn ClosedTimestampSource>> {
        self.closed_ts.read().clone()
    }

    pub(crate) fn rangefeed_txn_pusher(&self) -> Arc<dyn TxnPusher> {
        match self.txn_pusher.read().clone() {
            Some(pusher) => pusher,
            None => Arc::new(StoreTxnPusher::new(self.self_ref.clone())),
        }
    }

    /// Executes `ba` on the range named by its header, or on the range
    /// containing its first key when no range is named.
    pub async fn send(&self, mut ba: BatchRequest) -> Result<BatchResponse> {
        self.clock.update(ba.header.timestamp);
        if let Some(txn) = &ba.header.txn {
            self.clock.update(txn.write_timestamp());
        }
        let replica = if ba.header.range_id == 0 {
            let span = ba
                .span()
                .ok_or_else(|| Error::InvalidArgument("empty batch".to_string()))?;
            self.replica_for_key(&span.key)?
        } else {
            self.replica(ba.header.range_id)?
        };
        ba.header.range_id = replica.range_id();
        replica.send(ba).await
    }

    pub fn replica(&self, range_id: RangeId) -> Result<Arc<Replica>> {
        self.replicas
            .read()
            .get(&range_id)
            .cloned()
            .ok_or(Error::RangeNotFound { range_id })
    }

    /// The replica whose range contains the address of `key`.
    pub fn replica_for_key(&self, key: &[u8]) -> Result<Arc<Replica>> {
        let addr = keys::addr(key)?;
        self.replicas
            .read()
            .values()
            .find(|r| r.desc().contains_key(&addr))
            .cloned()
            .ok_or_else(|| Error::RangeKeyMismatch {
                requested_start: addr,
                requested_end: Vec::new(),
                desc: None,
            })
    }

    pub fn replicas(&self) -> Vec<Arc<Replica>> {
        self.replicas.read().values().cloned().collect()
    }

    fn load_replicas(self: &Arc<Self>) -> Result<usize> {
        let descs = self.scan_descriptors()?;
        let mut loaded = BTreeMap::new();
        for desc in descs {
            self.next_range_id.fetch_max(desc.range_id + 1, Ordering::AcqRel);
            let Some(replica) = desc.replica_for_store(self.ident.store_id).copied() else {
                continue;
            };
            if StateLoader::new(desc.range_id)
                .load_raft_tombstone(self.engine.as_ref())?
                .is_some_and(|t| replica.replica_id < t.next_replica_id)
            {
                tracing::debug!(range_id = desc.range_id, "skipping removed replica");
                continue;
            }
            loaded.insert(desc.range_id, Replica::load(self, &desc)?);
        }
        let count = loaded.len();
        *self.replicas.write() = loaded;
        Ok(count)
    }

    /// Newest committed descriptor of every range in the engine.
    fn scan_descriptors(&self) -> Result<Vec<RangeDescriptor>> {
        let opts = MvccScanOptions {
            inconsistent: true,
            ..Default::default()
        };
        let scanned = mvcc_scan(
            self.engine.as_ref(),
            keys::LOCAL_RANGE_PREFIX,
            keys::LOCAL_RANGE_MAX,
            Timestamp::MAX,
            &opts,
        )?;
        let mut descs = Vec::new();
        for (key, value) in scanned.kvs {
            if keys::decode_range_key(&key)?.suffix != keys::LOCAL_RANGE_DESCRIPTOR_SUFFIX {
                continue;
            }
            descs.push(value.get_record::<RangeDescriptor>()?);
        }
        Ok(descs)
    }

    /// Creates the right-hand replica of a split applied by `lhs`.
    pub(crate) fn split_applied(&self, lhs: &Arc<Replica>, split: &SplitTrigger) -> Result<()> {
        let store = self
            .self_ref
            .upgrade()
            .ok_or_else(|| Error::AmbiguousResult("store is shutting down".to_string()))?;
        let right = &split.right_desc;
        let rhs = Replica::load(&store, right)?;
        // Reads the left side served over the new range still bound writes.
        let (max, _) = lhs.tscache().get_max(&right.span());
        rhs.tscache().set_low_water(max);
        self.replicas.write().insert(right.range_id, rhs);
        self.next_range_id.fetch_max(right.range_id + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Retires the subsumed replica of a merge applied by `lhs`.
    pub(crate) fn merge_applied(&self, lhs: &Arc<Replica>, merge: &MergeTrigger) {
        let right = &merge.right_desc;
        let Some(rhs) = self.replicas.write().remove(&right.range_id) else {
            tracing::warn!(range_id = lhs.range_id(), subsumed = right.range_id, "subsumed replica not found");
            return;
        };
        let span = right.span();
        let (max, _) = rhs.tscache().get_max(&span);
        lhs.tscache().add(&span, max, None);
        if let Err(e) = self.write_tombstone(right) {
            tracing::warn!(range_id = right.range_id, error = %e, "writing tombstone of subsumed range");
        }
        rhs.destroy(Error::RangefeedRetry {
            reason: RangeFeedRetryReason::RangeMerged,
        });
    }

    /// Drops the replica of a range that no longer lists this store, and its
    /// data.
    pub(crate) fn remove_replica(&self, range_id: RangeId, err: Error) {
        let Some(replica) = self.replicas.write().remove(&range_id) else {
            return;
        };
        let desc = replica.desc();
        let cleared = (|| -> Result<()> {
            let mut batch = self.engine.new_batch();
            clear_replica_data(&mut batch, &desc)?;
            StateLoader::new(range_id).set_raft_tombstone(
                &mut batch,
                &RaftTombstone {
                    next_replica_id: desc.next_replica_id,
                },
            )?;
            batch.commit()?;
            Ok(())
        })();
        if let Err(e) = cleared {
            tracing::error!(range_id, error = %e, "clearing data of removed replica");
        }
        tracing::info!(range_id, store_id = self.ident.store_id, "replica removed");
        replica.destroy(err);
    }

    fn write_tombstone(&self, desc: &RangeDescriptor) -> Result<()> {
        let mut batch = self.engine.new_batch();
        StateLoader::new(desc.range_id).set_raft_tombstone(
            &mut batch,
            &RaftTombstone {
                next_replica_id: desc.next_replica_id,
            },
        )?;
        batch.commit()?;
        Ok(())
    }

    /// Periodically forwards closed timestamps to every rangefeed processor
    /// until `cancel` fires.
    pub fn spawn_closed_timestamp_updates(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(store) = store.upgrade() else {
                    break;
                };
                for replica in store.replicas() {
                    replica.handle_closed_timestamp_update().await;
                }
            }
            tracing::debug!("closed timestamp updates stopped");
        })
    }
}

/// Clears every key a replica of `desc` owns on this store.
fn clear_replica_data(batch: &mut Batch, desc: &RangeDescriptor) -> Result<()> {
    let prefix = keys::make_range_id_prefix(desc.range_id);
    let mut spans = vec![(prefix.clone(), keys::prefix_end(&prefix))];
    spans.extend(
        keys::replica_data_spans(desc.range_id, &desc.start_key, &desc.end_key)
            .into_iter()
            .skip(1)
            .map(|s| (s.key, s.end_key)),
    );
    for (start, end) in spans {
        let (lower, upper) = engine_span(&start, &end);
        batch.clear_range(&lower, &upper)?;
    }
    Ok(())
}

#[async_trait]
impl CommandApplier for Store {
    async fn apply_command(
        &self,
        range_id: RangeId,
        cmd_id: CommandId,
        cmd: &RaftCommand,
    ) -> Result<CommandResponse> {
        let replica = self.replicas.read().get(&range_id).cloned();
        match replica {
            Some(replica) => replica.apply_command(cmd_id, cmd).await,
            None => {
                tracing::debug!(range_id, cmd_id, "dropping command for unknown range");
                Ok(CommandResponse::Rejected(format!(
                    "r{range_id} not found on s{}",
                    self.ident.store_id
                )))
            }
        }
    }

    async fn reload(&self) -> Result<()> {
        let store = self
            .self_ref
            .upgrade()
            .ok_or_else(|| Error::AmbiguousResult("store is shutting down".to_string()))?;
        let previous = std::mem::take(&mut *self.replicas.write());
        for replica in previous.into_values() {
            replica.destroy(Error::RangefeedRetry {
                reason: RangeFeedRetryReason::ReplicaRemoved,
            });
        }
        let loaded = store.load_replicas()?;
        tracing::info!(store_id = self.ident.store_id, replicas = loaded, "store reloaded from snapshot");
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Store(n{} s{})", self.ident.node_id, self.ident.store_id)
    }
}
