//! Engine-backed Raft storage for OpenRaft 0.9 (storage-v2)
//!
//! The store's Raft log, vote and state machine metadata live in the same
//! engine as the range data, under store-local keys:
//! - Log entries: `/Local/Store/RaftLog/{BE u64 index}`
//! - Vote: `/Local/Store/RaftVote`
//! - Last purged: `/Local/Store/RaftPurged`
//! - Last applied: `/Local/Store/RaftApplied`
//! - Membership: `/Local/Store/RaftMembership`
//!
//! Applying an entry hands its command to the [`CommandApplier`]. The range
//! batch and the applied log ID are written separately; an entry replayed
//! after a crash is rejected by the range's lease applied index.

use std::fmt::Debug;
use std::io::Cursor;
use std::ops::{Bound, RangeBounds};
use std::sync::{Arc, Weak};

use openraft::storage::{LogFlushed, RaftLogStorage, RaftStateMachine};
use openraft::{EntryPayload, ErrorSubject, ErrorVerb, OptionalSend, RaftLogReader, RaftSnapshotBuilder};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::keys;
use crate::raft::command::CommandResponse;
use crate::raft::proposer::CommandApplier;
use crate::raft::types::{
    Entry, LogId, LogState, Snapshot, SnapshotMeta, StorageError, StoredMembership, TypeConfig,
    Vote,
};
use crate::storage::{Engine, Reader, Writer};

fn read_err(msg: impl ToString) -> StorageError {
    StorageError::from_io_error(
        ErrorSubject::Store,
        ErrorVerb::Read,
        std::io::Error::other(msg.to_string()),
    )
}

fn write_err(msg: impl ToString) -> StorageError {
    StorageError::from_io_error(
        ErrorSubject::Store,
        ErrorVerb::Write,
        std::io::Error::other(msg.to_string()),
    )
}

fn apply_err(msg: impl ToString) -> StorageError {
    StorageError::from_io_error(
        ErrorSubject::StateMachine,
        ErrorVerb::Write,
        std::io::Error::other(msg.to_string()),
    )
}

/// Keys that belong to this node's Raft log rather than to the replicated
/// state, and so are neither shipped in nor replaced by snapshots.
fn is_log_state_key(key: &[u8]) -> bool {
    key.starts_with(&keys::store_raft_log_prefix())
        || key == keys::store_raft_vote_key().as_slice()
        || key == keys::store_raft_purged_key().as_slice()
}

/// Snapshot payload: every replicated engine entry.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotData {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Raft log and state machine over a store's engine.
#[derive(Clone)]
pub struct EngineRaftStorage {
    engine: Arc<Engine>,
    applier: Weak<dyn CommandApplier>,
    cached_vote: Arc<RwLock<Option<Vote>>>,
    cached_last_applied: Arc<RwLock<Option<LogId>>>,
    cached_membership: Arc<RwLock<StoredMembership>>,
    cached_last_log_id: Arc<RwLock<Option<LogId>>>,
    cached_last_purged: Arc<RwLock<Option<LogId>>>,
}

impl std::fmt::Debug for EngineRaftStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRaftStorage")
            .field("cached_vote", &*self.cached_vote.read())
            .field("cached_last_applied", &*self.cached_last_applied.read())
            .field("cached_last_log_id", &*self.cached_last_log_id.read())
            .finish()
    }
}

impl EngineRaftStorage {
    /// Opens the Raft state persisted in `engine`.
    pub fn new(engine: Arc<Engine>, applier: Weak<dyn CommandApplier>) -> Result<Self, StorageError> {
        let this = Self {
            engine,
            applier,
            cached_vote: Arc::new(RwLock::new(None)),
            cached_last_applied: Arc::new(RwLock::new(None)),
            cached_membership: Arc::new(RwLock::new(StoredMembership::default())),
            cached_last_log_id: Arc::new(RwLock::new(None)),
            cached_last_purged: Arc::new(RwLock::new(None)),
        };
        this.load_cached_state()?;
        Ok(this)
    }

    fn load_cached_state(&self) -> Result<(), StorageError> {
        *self.cached_vote.write() = self.get_record(&keys::store_raft_vote_key())?;
        *self.cached_last_purged.write() = self.get_record(&keys::store_raft_purged_key())?;
        *self.cached_last_applied.write() = self.get_record(&keys::store_raft_applied_key())?;
        if let Some(membership) = self.get_record(&keys::store_raft_membership_key())? {
            *self.cached_membership.write() = membership;
        }

        let prefix = keys::store_raft_log_prefix();
        let last = self
            .engine
            .seek_lt(&keys::prefix_end(&prefix), &prefix)
            .map_err(read_err)?;
        if let Some((_, data)) = last {
            let entry: Entry = bincode::deserialize(&data).map_err(read_err)?;
            *self.cached_last_log_id.write() = Some(entry.log_id);
        } else {
            *self.cached_last_log_id.write() = *self.cached_last_purged.read();
        }

        tracing::info!(
            vote = ?*self.cached_vote.read(),
            last_purged = ?*self.cached_last_purged.read(),
            last_log = ?*self.cached_last_log_id.read(),
            last_applied = ?*self.cached_last_applied.read(),
            "Loaded Raft state from engine"
        );
        Ok(())
    }

    fn get_record<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StorageError> {
        match self.engine.get(key).map_err(read_err)? {
            Some(data) => Ok(Some(bincode::deserialize(&data).map_err(read_err)?)),
            None => Ok(None),
        }
    }

    fn put_record<T: Serialize>(&self, key: &[u8], record: &T) -> Result<(), StorageError> {
        let data = bincode::serialize(record).map_err(write_err)?;
        let mut batch = self.engine.new_batch();
        batch.put(key, &data).map_err(write_err)?;
        batch.commit().map_err(write_err)
    }

    fn delete_log_range(&self, start: u64, end: Option<u64>) -> Result<(), StorageError> {
        let start_key = keys::store_raft_log_key(start);
        let end_key = match end {
            Some(end) => keys::store_raft_log_key(end),
            None => keys::prefix_end(&keys::store_raft_log_prefix()),
        };
        let mut batch = self.engine.new_batch();
        batch.clear_range(&start_key, &end_key).map_err(write_err)?;
        batch.commit().map_err(write_err)
    }

    fn applier(&self) -> Result<Arc<dyn CommandApplier>, StorageError> {
        self.applier
            .upgrade()
            .ok_or_else(|| apply_err("command applier is gone"))
    }

    fn build(&self) -> Result<Snapshot, StorageError> {
        let snap = self.engine.new_snapshot().map_err(read_err)?;
        let mut data = SnapshotData::default();
        snap.iterate(b"", b"", &mut |k, v| {
            if !is_log_state_key(k) {
                data.entries.push((k.to_vec(), v.to_vec()));
            }
            Ok(true)
        })
        .map_err(read_err)?;
        let bytes = bincode::serialize(&data).map_err(read_err)?;

        let last_applied = *self.cached_last_applied.read();
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: self.cached_membership.read().clone(),
            snapshot_id: format!(
                "{}-{}",
                last_applied.map(|l| l.to_string()).unwrap_or_default(),
                data.entries.len()
            ),
        };
        tracing::debug!(?meta, keys = data.entries.len(), "Built snapshot");
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(bytes)),
        })
    }
}

impl RaftLogReader<TypeConfig> for EngineRaftStorage {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry>, StorageError> {
        let start_index = match range.start_bound() {
            Bound::Included(&i) => i,
            Bound::Excluded(&i) => i + 1,
            Bound::Unbounded => 0,
        };
        let end_key = match range.end_bound() {
            Bound::Included(&i) => keys::store_raft_log_key(i + 1),
            Bound::Excluded(&i) => keys::store_raft_log_key(i),
            Bound::Unbounded => keys::prefix_end(&keys::store_raft_log_prefix()),
        };

        let mut result = Vec::new();
        self.engine
            .iterate(&keys::store_raft_log_key(start_index), &end_key, &mut |_, data| {
                match bincode::deserialize::<Entry>(data) {
                    Ok(entry) => {
                        result.push(entry);
                        Ok(true)
                    }
                    Err(e) => Err(crate::storage::StorageError::Corrupted(e.to_string())),
                }
            })
            .map_err(read_err)?;
        Ok(result)
    }
}

impl RaftLogStorage<TypeConfig> for EngineRaftStorage {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState, StorageError> {
        Ok(LogState {
            last_purged_log_id: *self.cached_last_purged.read(),
            last_log_id: *self.cached_last_log_id.read(),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote) -> Result<(), StorageError> {
        self.put_record(&keys::store_raft_vote_key(), vote)?;
        *self.cached_vote.write() = Some(*vote);
        tracing::debug!(?vote, "Saved vote");
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote>, StorageError> {
        Ok(*self.cached_vote.read())
    }

    async fn save_committed(&mut self, _committed: Option<LogId>) -> Result<(), StorageError> {
        Ok(())
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = Entry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut batch = self.engine.new_batch();
        let mut last_log_id = None;
        for entry in entries {
            let data = bincode::serialize(&entry).map_err(write_err)?;
            batch
                .put(&keys::store_raft_log_key(entry.log_id.index), &data)
                .map_err(write_err)?;
            last_log_id = Some(entry.log_id);
        }
        batch.commit().map_err(write_err)?;
        if let Some(log_id) = last_log_id {
            *self.cached_last_log_id.write() = Some(log_id);
        }
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId) -> Result<(), StorageError> {
        self.delete_log_range(log_id.index, None)?;

        let prefix = keys::store_raft_log_prefix();
        let last = self
            .engine
            .seek_lt(&keys::store_raft_log_key(log_id.index), &prefix)
            .map_err(read_err)?;
        let last_log_id = match last {
            Some((_, data)) => Some(bincode::deserialize::<Entry>(&data).map_err(read_err)?.log_id),
            None => *self.cached_last_purged.read(),
        };
        *self.cached_last_log_id.write() = last_log_id;
        tracing::debug!(?log_id, "Truncated log");
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId) -> Result<(), StorageError> {
        self.delete_log_range(0, Some(log_id.index + 1))?;
        self.put_record(&keys::store_raft_purged_key(), &log_id)?;
        *self.cached_last_purged.write() = Some(log_id);
        let mut last = self.cached_last_log_id.write();
        if last.map_or(true, |l| l.index < log_id.index) {
            *last = Some(log_id);
        }
        tracing::debug!(?log_id, "Purged log");
        Ok(())
    }
}

impl RaftStateMachine<TypeConfig> for EngineRaftStorage {
    type SnapshotBuilder = Self;

    async fn applied_state(&mut self) -> Result<(Option<LogId>, StoredMembership), StorageError> {
        Ok((
            *self.cached_last_applied.read(),
            self.cached_membership.read().clone(),
        ))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<CommandResponse>, StorageError>
    where
        I: IntoIterator<Item = Entry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let applier = self.applier()?;
        let mut results = Vec::new();
        for entry in entries {
            let log_id = entry.log_id;
            let resp = match entry.payload {
                EntryPayload::Blank => CommandResponse::Ok,
                EntryPayload::Normal(cmd) => match cmd.raft_command() {
                    Some((range_id, cmd_id, raft_cmd)) => applier
                        .apply_command(range_id, cmd_id, raft_cmd)
                        .await
                        .map_err(apply_err)?,
                    None => CommandResponse::Ok,
                },
                EntryPayload::Membership(m) => {
                    let membership = StoredMembership::new(Some(log_id), m);
                    self.put_record(&keys::store_raft_membership_key(), &membership)?;
                    *self.cached_membership.write() = membership;
                    CommandResponse::Ok
                }
            };
            self.put_record(&keys::store_raft_applied_key(), &log_id)?;
            *self.cached_last_applied.write() = Some(log_id);
            results.push(resp);
        }
        Ok(results)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(&mut self) -> Result<Box<Cursor<Vec<u8>>>, StorageError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError> {
        let data: SnapshotData = bincode::deserialize(snapshot.get_ref()).map_err(read_err)?;

        let mut batch = self.engine.new_batch();
        let existing = self.engine.scan(b"", b"").map_err(read_err)?;
        for (key, _) in existing {
            if !is_log_state_key(&key) {
                batch.delete(&key).map_err(write_err)?;
            }
        }
        for (key, value) in &data.entries {
            batch.put(key, value).map_err(write_err)?;
        }
        if let Some(log_id) = meta.last_log_id {
            let encoded = bincode::serialize(&log_id).map_err(write_err)?;
            batch
                .put(&keys::store_raft_applied_key(), &encoded)
                .map_err(write_err)?;
        }
        let membership = bincode::serialize(&meta.last_membership).map_err(write_err)?;
        batch
            .put(&keys::store_raft_membership_key(), &membership)
            .map_err(write_err)?;
        batch.commit().map_err(write_err)?;

        *self.cached_last_applied.write() = meta.last_log_id;
        *self.cached_membership.write() = meta.last_membership.clone();

        self.applier()?.reload().await.map_err(apply_err)?;
        tracing::info!(?meta, keys = data.entries.len(), "Installed snapshot");
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot>, StorageError> {
        if self.cached_last_applied.read().is_none() {
            return Ok(None);
        }
        self.build().map(Some)
    }
}

impl RaftSnapshotBuilder<TypeConfig> for EngineRaftStorage {
    async fn build_snapshot(&mut self) -> Result<Snapshot, StorageError> {
        self.build()
    }
}
