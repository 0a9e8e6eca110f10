//! Garbage collection through a store

mod test_utils;

use rangedb::api::{BatchRequest, GcRequest, Request, Response, Span};
use rangedb::error::Error;
use rangedb::mvcc::{mvcc_get, GcKey, MvccGetOptions};
use test_utils::{string_value, ts, TestStore};

fn gc(key: &str, version: u64, threshold: u64) -> Request {
    Request::Gc(GcRequest {
        span: Span::new(b"a".to_vec(), b"z".to_vec()),
        keys: vec![GcKey {
            key: key.as_bytes().to_vec(),
            timestamp: ts(version),
        }],
        threshold: ts(threshold),
        txn_span_gc_threshold: ts(0),
        txn_records: Vec::new(),
    })
}

async fn read(t: &TestStore, key: &str, wall: u64) -> rangedb::error::Result<Response> {
    t.send_one(BatchRequest::new(0, ts(wall)).add(Request::get(key.as_bytes().to_vec())))
        .await
}

#[tokio::test]
async fn test_reads_below_gc_threshold_rejected() {
    let t = TestStore::new();
    t.put("k", "v1", 10).await.unwrap();
    t.put("k", "v2", 20).await.unwrap();
    t.put("k", "v3", 40).await.unwrap();
    t.clock.set(100);

    t.send_one(BatchRequest::new(0, ts(100)).add(gc("k", 30, 30)))
        .await
        .unwrap();
    let replica = t.store.replica_for_key(b"k").unwrap();
    assert_eq!(replica.state().gc_threshold, ts(30));

    for wall in [15, 30] {
        let err = read(&t, "k", wall).await.unwrap_err();
        assert!(
            matches!(err.root(), Error::BelowGcThreshold { threshold, .. } if *threshold == ts(30)),
            "read at {wall}: {err}"
        );
        assert!(!err.is_retriable());
    }

    // v1 is collected; v2 stays visible just above the threshold.
    let engine = t.store.engine().as_ref();
    let below = mvcc_get(engine, b"k", ts(15), &MvccGetOptions::default()).unwrap();
    assert!(below.value.is_none());
    assert_eq!(string_value(&t.get("k", 31).await.unwrap()), "v2");
    assert_eq!(string_value(&t.get("k", 50).await.unwrap()), "v3");
}

#[tokio::test]
async fn test_gc_threshold_never_regresses() {
    let t = TestStore::new();
    t.put("k", "v1", 20).await.unwrap();
    t.put("k", "v2", 40).await.unwrap();
    t.clock.set(100);

    t.send_one(BatchRequest::new(0, ts(100)).add(gc("k", 20, 30)))
        .await
        .unwrap();
    t.send_one(BatchRequest::new(0, ts(101)).add(gc("k", 15, 15)))
        .await
        .unwrap();
    let replica = t.store.replica_for_key(b"k").unwrap();
    assert_eq!(replica.state().gc_threshold, ts(30));
}
