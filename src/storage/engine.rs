//! Ordered key-value engine
//!
//! Keys and values live in a BTreeMap behind an `Arc`, so snapshots are a
//! reference count bump; the next write after a snapshot copies the map.
//! All mutation goes through encoded batches, applied atomically and, for
//! durable engines, logged to the WAL first.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::storage::batch::Batch;
use crate::storage::batch_repr::{BatchBuilder, BatchOp, BatchReader};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::merge::merge_values;
use crate::storage::traits::{KeyValue, Reader};
use crate::storage::wal::{Wal, WalConfig};

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// The ordered byte store shared by all replicas of a store.
pub struct Engine {
    data: RwLock<Arc<Map>>,
    wal: Option<Mutex<Wal>>,
    closed: AtomicBool,
}

impl Engine {
    /// Create a volatile engine.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            data: RwLock::new(Arc::new(Map::new())),
            wal: None,
            closed: AtomicBool::new(false),
        })
    }

    /// Open a durable engine in `dir`, replaying its log.
    pub fn open(dir: &Path, config: WalConfig) -> StorageResult<Arc<Self>> {
        let (wal, records) = Wal::open(dir, config)?;
        let mut map = Map::new();
        for record in &records {
            apply_to_map(&mut map, record)?;
        }
        tracing::info!(
            dir = %dir.display(),
            batches = records.len(),
            keys = map.len(),
            "Recovered engine from WAL"
        );
        Ok(Arc::new(Self {
            data: RwLock::new(Arc::new(map)),
            wal: Some(Mutex::new(wal)),
            closed: AtomicBool::new(false),
        }))
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Start a batch reading through to this engine.
    pub fn new_batch(self: &Arc<Self>) -> Batch {
        Batch::new(Arc::clone(self))
    }

    /// Point-in-time view of the engine.
    pub fn new_snapshot(&self) -> StorageResult<Snapshot> {
        self.check_open()?;
        Ok(Snapshot {
            data: Arc::clone(&self.data.read()),
        })
    }

    /// Atomically apply an encoded batch.
    pub fn apply_batch_repr(&self, repr: &[u8]) -> StorageResult<()> {
        self.check_open()?;
        let mut wal = self.wal.as_ref().map(|w| w.lock());
        let mut data = self.data.write();

        // Stage against the current map so a bad entry leaves no partial state.
        let staged = stage(&data, repr)?;
        if let Some(wal) = wal.as_mut() {
            wal.append(repr)?;
        }
        let map = Arc::make_mut(&mut data);
        for (key, value) in staged {
            match value {
                Some(v) => {
                    map.insert(key, v);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    /// Rewrite the log as a single batch holding the current contents.
    pub fn checkpoint(&self) -> StorageResult<()> {
        self.check_open()?;
        let Some(wal) = self.wal.as_ref() else {
            return Ok(());
        };
        let mut wal = wal.lock();
        let data = self.data.read();
        let mut builder = BatchBuilder::new();
        for (k, v) in data.iter() {
            builder.put(k, v);
        }
        wal.checkpoint(&builder.encode())
    }

    /// Number of keys stored
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }

    /// Close the engine; later operations fail with [`StorageError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Reader for Engine {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.data.read().get(key).cloned())
    }

    fn seek_ge(&self, key: &[u8], upper: &[u8]) -> StorageResult<Option<KeyValue>> {
        self.check_open()?;
        Ok(map_seek_ge(&self.data.read(), key, upper))
    }

    fn seek_lt(&self, key: &[u8], lower: &[u8]) -> StorageResult<Option<KeyValue>> {
        self.check_open()?;
        Ok(map_seek_lt(&self.data.read(), key, lower))
    }
}

/// Immutable point-in-time view. Owns its data, so it may move across tasks.
#[derive(Clone)]
pub struct Snapshot {
    data: Arc<Map>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Reader for Snapshot {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn seek_ge(&self, key: &[u8], upper: &[u8]) -> StorageResult<Option<KeyValue>> {
        Ok(map_seek_ge(&self.data, key, upper))
    }

    fn seek_lt(&self, key: &[u8], lower: &[u8]) -> StorageResult<Option<KeyValue>> {
        Ok(map_seek_lt(&self.data, key, lower))
    }
}

fn map_seek_ge(map: &Map, key: &[u8], upper: &[u8]) -> Option<KeyValue> {
    let (k, v) = map
        .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
        .next()?;
    if !upper.is_empty() && k.as_slice() >= upper {
        return None;
    }
    Some((k.clone(), v.clone()))
}

fn map_seek_lt(map: &Map, key: &[u8], lower: &[u8]) -> Option<KeyValue> {
    let end = if key.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(key)
    };
    let (k, v) = map
        .range::<[u8], _>((Bound::Unbounded, end))
        .next_back()?;
    if k.as_slice() < lower {
        return None;
    }
    Some((k.clone(), v.clone()))
}

/// Resolve every entry of `repr` against `map` without mutating it.
fn stage(map: &Map, repr: &[u8]) -> StorageResult<BTreeMap<Vec<u8>, Option<Vec<u8>>>> {
    let mut staged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
    for entry in BatchReader::new(repr)? {
        let entry = entry?;
        match entry.op {
            BatchOp::Value => {
                staged.insert(entry.key.to_vec(), Some(entry.value.to_vec()));
            }
            BatchOp::Deletion | BatchOp::SingleDeletion => {
                staged.insert(entry.key.to_vec(), None);
            }
            BatchOp::Merge => {
                let existing = match staged.get(entry.key) {
                    Some(v) => v.clone(),
                    None => map.get(entry.key).cloned(),
                };
                let merged = merge_values(existing.as_deref(), entry.value)?;
                staged.insert(entry.key.to_vec(), Some(merged));
            }
        }
    }
    Ok(staged)
}

fn apply_to_map(map: &mut Map, repr: &[u8]) -> StorageResult<()> {
    for (key, value) in stage(map, repr)? {
        match value {
            Some(v) => {
                map.insert(key, v);
            }
            None => {
                map.remove(&key);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::traits::Writer;
    use crate::storage::WalConfig;

    #[test]
    fn test_batch_commit_visible() {
        let engine = Engine::in_memory();
        let mut batch = engine.new_batch();
        batch.put(b"a", b"1").unwrap();
        batch.put(b"b", b"2").unwrap();
        assert_eq!(engine.get(b"a").unwrap(), None);
        batch.commit().unwrap();
        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.len(), 2);
    }

    #[test]
    fn test_seek() {
        let engine = Engine::in_memory();
        let mut batch = engine.new_batch();
        for k in [b"a", b"c", b"e"] {
            batch.put(k, b"v").unwrap();
        }
        batch.commit().unwrap();

        assert_eq!(engine.seek_ge(b"b", b"").unwrap().unwrap().0, b"c".to_vec());
        assert!(engine.seek_ge(b"b", b"c").unwrap().is_none());
        assert_eq!(engine.seek_lt(b"e", b"").unwrap().unwrap().0, b"c".to_vec());
        assert_eq!(engine.seek_lt(b"", b"").unwrap().unwrap().0, b"e".to_vec());
        assert!(engine.seek_lt(b"c", b"b").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_isolation() {
        let engine = Engine::in_memory();
        let mut batch = engine.new_batch();
        batch.put(b"k", b"old").unwrap();
        batch.commit().unwrap();

        let snap = engine.new_snapshot().unwrap();
        let mut batch = engine.new_batch();
        batch.put(b"k", b"new").unwrap();
        batch.put(b"k2", b"x").unwrap();
        batch.commit().unwrap();

        assert_eq!(snap.get(b"k").unwrap(), Some(b"old".to_vec()));
        assert_eq!(snap.len(), 1);
        assert_eq!(engine.get(b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_closed_engine() {
        let engine = Engine::in_memory();
        engine.close();
        assert!(matches!(engine.get(b"a"), Err(StorageError::Closed)));
        assert!(engine.new_snapshot().is_err());
    }

    #[test]
    fn test_bad_batch_leaves_no_state() {
        let engine = Engine::in_memory();
        let mut builder = BatchBuilder::new();
        builder.put(b"a", b"1");
        let mut repr = builder.encode();
        repr[9] ^= 0xff;
        assert!(engine.apply_batch_repr(&repr).is_err());
        assert!(engine.is_empty());
    }

    #[test]
    fn test_durable_recovery() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = Engine::open(dir.path(), WalConfig::default()).unwrap();
            let mut batch = engine.new_batch();
            batch.put(b"a", b"1").unwrap();
            batch.put(b"b", b"2").unwrap();
            batch.commit().unwrap();
            let mut batch = engine.new_batch();
            batch.delete(b"a").unwrap();
            batch.commit().unwrap();
        }
        let engine = Engine::open(dir.path(), WalConfig::default()).unwrap();
        assert_eq!(engine.get(b"a").unwrap(), None);
        assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));

        engine.checkpoint().unwrap();
        drop(engine);
        let engine = Engine::open(dir.path(), WalConfig::default()).unwrap();
        assert_eq!(engine.len(), 1);
    }
}
