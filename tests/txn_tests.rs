//! Transactional reads and writes through a store

mod test_utils;

use rangedb::api::{
    EndTxnRequest, QueryIntentRequest, RecoverTxnRequest, Request, Response, Span,
};
use rangedb::error::Error;
use rangedb::mvcc::Value;
use rangedb::txn::{IsolationLevel, SequencedWrite, Transaction, TxnStatus};
use test_utils::{string_value, ts, TestStore};

fn txn(name: &str, anchor: &str, wall: u64) -> Transaction {
    Transaction::new(name, anchor.as_bytes().to_vec(), IsolationLevel::Serializable, 1, ts(wall))
}

fn put(key: &str, value: &str) -> Request {
    Request::put(key.as_bytes().to_vec(), Value::from_string(value))
}

#[tokio::test]
async fn test_simple_put_get() {
    let t = TestStore::new().with_range("a", "z").await;
    let mut t1 = txn("t1", "k", 100);
    t.send_txn(&mut t1, vec![put("k", "v1")]).await.unwrap();

    let br = t
        .send_txn(
            &mut t1,
            vec![Request::EndTxn(EndTxnRequest::commit("k", vec![Span::point("k")]))],
        )
        .await
        .unwrap();
    match &br.responses[0] {
        Response::EndTxn(resp) => {
            let record = resp.txn.as_ref().unwrap();
            assert_eq!(record.status, TxnStatus::Committed);
            assert_eq!(record.write_timestamp(), ts(100));
        }
        other => panic!("unexpected {other:?}"),
    }

    let v = t.get("k", 200).await.expect("committed value");
    assert_eq!(string_value(&v), "v1");
    assert_eq!(v.timestamp, ts(100));
    assert!(t.get("k", 99).await.is_none());
}

#[tokio::test]
async fn test_write_too_old_then_retry_above() {
    let t = TestStore::new().with_range("a", "z").await;
    t.put("k", "v1", 100).await.unwrap();

    let mut t2 = txn("t2", "k", 90);
    let err = t.send_txn(&mut t2, vec![put("k", "v2")]).await.unwrap_err();
    assert!(err.is_retriable());
    match err.root() {
        Error::WriteTooOld {
            existing_timestamp, ..
        } => assert_eq!(*existing_timestamp, ts(100)),
        other => panic!("unexpected {other:?}"),
    }

    let mut t2 = txn("t2", "k", 101);
    t.send_txn(&mut t2, vec![put("k", "v2")]).await.unwrap();
    let br = t
        .send_txn(
            &mut t2,
            vec![Request::EndTxn(EndTxnRequest::commit("k", vec![Span::point("k")]))],
        )
        .await
        .unwrap();
    assert!(matches!(&br.responses[0], Response::EndTxn(_)));
    assert_eq!(string_value(&t.get("k", 200).await.unwrap()), "v2");
}

#[tokio::test]
async fn test_parallel_commit_recovery() {
    let t = TestStore::new().with_range("a", "z").await;
    let mut t4 = txn("t4", "k1", 200);
    t4.meta.sequence = 1;
    t.send_txn(&mut t4, vec![put("k1", "v")]).await.unwrap();

    let mut et = EndTxnRequest::commit("k1", vec![]);
    et.in_flight_writes = vec![SequencedWrite {
        key: b"k1".to_vec(),
        sequence: 1,
    }];
    let br = t.send_txn(&mut t4, vec![Request::EndTxn(et)]).await.unwrap();
    match &br.responses[0] {
        Response::EndTxn(resp) => {
            assert_eq!(resp.txn.as_ref().unwrap().status, TxnStatus::Staging)
        }
        other => panic!("unexpected {other:?}"),
    }

    // The coordinator is gone; another party finds the in-flight write.
    let query = rangedb::api::BatchRequest::new(0, ts(250)).add(Request::QueryIntent(
        QueryIntentRequest {
            key: b"k1".to_vec(),
            txn: t4.meta.clone(),
            error_if_missing: false,
        },
    ));
    match t.send_one(query).await.unwrap() {
        Response::QueryIntent { found_intent } => assert!(found_intent),
        other => panic!("unexpected {other:?}"),
    }

    let recover = || {
        rangedb::api::BatchRequest::new(0, ts(300)).add(Request::RecoverTxn(RecoverTxnRequest {
            key: b"k1".to_vec(),
            txn: t4.meta.clone(),
            implicitly_committed: true,
        }))
    };
    let first = match t.send_one(recover()).await.unwrap() {
        Response::RecoverTxn { recovered_txn } => recovered_txn,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(first.status, TxnStatus::Committed);
    assert_eq!(first.write_timestamp(), ts(200));
    assert!(first.in_flight_writes.is_empty());

    let second = match t.send_one(recover()).await.unwrap() {
        Response::RecoverTxn { recovered_txn } => recovered_txn,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(second.status, TxnStatus::Committed);
    assert_eq!(second.write_timestamp(), first.write_timestamp());
    assert_eq!(second.lock_spans, first.lock_spans);
}
