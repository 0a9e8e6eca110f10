//! Rangefeeds attached to store replicas

mod test_utils;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rangedb::api::{RangeId, Request, Span};
use rangedb::config::StoreConfig;
use rangedb::error::Result;
use rangedb::hlc::Timestamp;
use rangedb::mvcc::Value;
use rangedb::rangefeed::{EventSink, RangeFeedEvent, TxnPusher};
use rangedb::replica::ClosedTimestampSource;
use rangedb::store::{Store, StoreTxnPusher};
use rangedb::txn::{IsolationLevel, LockUpdate, Transaction, TxnMeta, TxnStatus};
use test_utils::{next_event, string_value, ts, TestStore};
use tokio::sync::{mpsc, Notify};

/// Closed timestamp set by the test.
#[derive(Default)]
struct FixedClosedTimestamp(AtomicU64);

impl ClosedTimestampSource for FixedClosedTimestamp {
    fn closed_timestamp(&self, _range_id: RangeId) -> Timestamp {
        Timestamp::from_wall(self.0.load(Ordering::SeqCst))
    }
}

/// Reports a fixed record for every push once released, and resolves
/// intents through the store.
struct CommittedRecordPusher {
    record: Transaction,
    resolver: StoreTxnPusher,
    gate: Notify,
    pushed: AtomicBool,
}

impl CommittedRecordPusher {
    fn new(record: Transaction, store: Weak<Store>) -> Self {
        Self {
            record,
            resolver: StoreTxnPusher::new(store),
            gate: Notify::new(),
            pushed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TxnPusher for CommittedRecordPusher {
    async fn push_txns(&self, txns: Vec<TxnMeta>, _ts: Timestamp) -> Result<Vec<Transaction>> {
        assert!(txns.iter().all(|t| t.id == self.record.id()));
        self.gate.notified().await;
        self.pushed.store(true, Ordering::SeqCst);
        Ok(vec![self.record.clone()])
    }

    async fn resolve_intents(&self, intents: Vec<LockUpdate>) -> Result<()> {
        self.resolver.resolve_intents(intents).await
    }
}

#[tokio::test]
async fn test_intent_push_unblocks_resolved_timestamp() {
    let config = StoreConfig {
        push_interval: Duration::from_millis(10),
        push_txns_age: Duration::ZERO,
        ..Default::default()
    };
    let t = TestStore::with_config(config).with_range("a", "z").await;
    let closed = Arc::new(FixedClosedTimestamp::default());
    t.store.set_closed_timestamp_source(closed.clone());

    let mut t3 = Transaction::new("t3", b"m".to_vec(), IsolationLevel::Serializable, 1, ts(100));
    let mut record = t3.clone();
    record.status = TxnStatus::Committed;
    record.meta.write_timestamp = ts(110);
    record.lock_spans = vec![Span::point("m")];
    let pusher = Arc::new(CommittedRecordPusher::new(record, Arc::downgrade(&t.store)));
    t.store.set_txn_pusher(pusher.clone());

    let replica = t.store.replica_for_key(b"m").unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    let sink: Arc<dyn EventSink> = Arc::new(tx);
    let _done = replica
        .range_feed(Span::new("a", "z"), ts(50), false, sink)
        .await
        .unwrap();

    t.send_txn(&mut t3, vec![Request::put(b"m".to_vec(), Value::from_string("v"))])
        .await
        .unwrap();
    t.clock.set(200);
    closed.0.store(150, Ordering::SeqCst);
    replica.handle_closed_timestamp_update().await;

    // Stalled below the intent.
    assert_eq!(
        next_event(&mut rx).await,
        RangeFeedEvent::checkpoint(Span::new("a", "z"), ts(99))
    );

    pusher.gate.notify_one();
    loop {
        match next_event(&mut rx).await {
            RangeFeedEvent::Checkpoint { resolved_ts, .. } => assert!(resolved_ts < ts(110)),
            RangeFeedEvent::Value(v) => {
                assert_eq!(v.key, b"m");
                assert_eq!(string_value(&v.value), "v");
                assert_eq!(v.value.timestamp, ts(110));
                break;
            }
        }
    }
    replica.handle_closed_timestamp_update().await;
    assert_eq!(
        next_event(&mut rx).await,
        RangeFeedEvent::checkpoint(Span::new("a", "z"), ts(149))
    );
    assert!(pusher.pushed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_catch_up_scan_with_diff() {
    let t = TestStore::new().with_range("a", "z").await;
    for (v, wall) in [("v1", 60), ("v2", 80), ("v3", 120)] {
        t.put("k", v, wall).await.unwrap();
    }
    // Outside the registration.
    t.put("l", "x", 90).await.unwrap();

    let replica = t.store.replica_for_key(b"k").unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    let sink: Arc<dyn EventSink> = Arc::new(tx);
    let _done = replica
        .range_feed(Span::new("k", "l"), ts(50), true, sink)
        .await
        .unwrap();

    let mut expected_prev: Option<&str> = None;
    for (v, wall) in [("v1", 60), ("v2", 80), ("v3", 120)] {
        match next_event(&mut rx).await {
            RangeFeedEvent::Value(ev) => {
                assert_eq!(ev.key, b"k");
                assert_eq!(string_value(&ev.value), v);
                assert_eq!(ev.value.timestamp, ts(wall));
                assert_eq!(ev.prev_value.as_ref().map(string_value).as_deref(), expected_prev);
            }
            other => panic!("unexpected {other:?}"),
        }
        expected_prev = Some(v);
    }
}

#[tokio::test]
async fn test_split_disconnects_rangefeed() {
    let t = TestStore::new().with_range("a", "z").await;
    let replica = t.store.replica_for_key(b"c").unwrap();
    let (tx, _rx) = mpsc::channel(64);
    let sink: Arc<dyn EventSink> = Arc::new(tx);
    let done = replica
        .range_feed(Span::new("a", "z"), ts(50), false, sink)
        .await
        .unwrap();

    t.clock.increment(100);
    t.store
        .admin_split(replica.range_id(), Some(b"m".to_vec()))
        .await
        .unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), done)
        .await
        .expect("rangefeed not disconnected")
        .unwrap();
    assert!(matches!(
        err,
        rangedb::error::Error::RangefeedRetry {
            reason: rangedb::error::RangeFeedRetryReason::RangeSplit
        }
    ));
}
