//! Shared test utilities
//!
//! Note: clippy reports false-positive dead_code warnings because it can't
//! trace usage across test binaries. These utilities are used by multiple tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rangedb::api::{BatchRequest, BatchResponse, Request, Response};
use rangedb::config::StoreConfig;
use rangedb::error::Result;
use rangedb::hlc::{Clock, ManualClock, Timestamp};
use rangedb::mvcc::Value;
use rangedb::rangefeed::RangeFeedEvent;
use rangedb::storage::Engine;
use rangedb::store::Store;
use rangedb::txn::Transaction;
use tokio::sync::mpsc;

pub fn ts(wall: u64) -> Timestamp {
    Timestamp::from_wall(wall)
}

/// A bootstrapped single-store cluster on an in-memory engine, driven by a
/// manual clock starting at 10.
pub struct TestStore {
    pub clock: Arc<ManualClock>,
    pub store: Arc<Store>,
}

impl TestStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        let clock = Arc::new(ManualClock::new(10));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let store = Store::new_local(1, 1, Engine::in_memory(), dyn_clock, config)
            .expect("bootstrapping test store");
        Self { clock, store }
    }

    /// Carves `[start, end)` out of the first range. Each split runs above
    /// every descriptor written so far.
    pub async fn with_range(self, start: &str, end: &str) -> Self {
        self.clock.increment(10);
        self.store
            .admin_split(1, Some(start.as_bytes().to_vec()))
            .await
            .expect("splitting at range start");
        self.clock.increment(10);
        let rhs = self.store.replica_for_key(start.as_bytes()).unwrap().range_id();
        self.store
            .admin_split(rhs, Some(end.as_bytes().to_vec()))
            .await
            .expect("splitting at range end");
        self
    }

    pub async fn send_one(&self, ba: BatchRequest) -> Result<Response> {
        let mut br = self.store.send(ba).await?;
        Ok(br.responses.remove(0))
    }

    /// Non-transactional put at `wall`.
    pub async fn put(&self, key: &str, value: &str, wall: u64) -> Result<()> {
        let ba = BatchRequest::new(0, ts(wall))
            .add(Request::put(key.as_bytes().to_vec(), Value::from_string(value)));
        self.send_one(ba).await.map(|_| ())
    }

    pub async fn get(&self, key: &str, wall: u64) -> Option<Value> {
        let ba = BatchRequest::new(0, ts(wall)).add(Request::get(key.as_bytes().to_vec()));
        match self.send_one(ba).await.unwrap() {
            Response::Get { value, .. } => value,
            other => panic!("unexpected {other:?}"),
        }
    }

    /// Sends `requests` in `txn`, folding the returned transaction back in.
    pub async fn send_txn(&self, txn: &mut Transaction, requests: Vec<Request>) -> Result<BatchResponse> {
        let mut ba = BatchRequest::new(0, txn.read_timestamp).with_txn(txn.clone());
        for req in requests {
            ba = ba.add(req);
        }
        let br = self.store.send(ba).await?;
        if let Some(updated) = &br.txn {
            txn.update(updated);
        }
        Ok(br)
    }
}

pub async fn next_event(rx: &mut mpsc::Receiver<RangeFeedEvent>) -> RangeFeedEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for rangefeed event")
        .expect("rangefeed sink closed")
}

pub fn string_value(v: &Value) -> String {
    String::from_utf8_lossy(v.data_bytes()).into_owned()
}
