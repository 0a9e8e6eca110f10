//! Range splits and merges through a store

mod test_utils;

use rangedb::api::{BatchRequest, Request};
use rangedb::error::Error;
use rangedb::mvcc::{compute_stats, MvccStats, Value};
use rangedb::txn::{IsolationLevel, Transaction};
use test_utils::{string_value, ts, TestStore};

/// The counters that describe user data, independent of range bookkeeping.
fn user_stats(ms: &MvccStats) -> [i64; 8] {
    [
        ms.live_bytes,
        ms.live_count,
        ms.key_bytes,
        ms.key_count,
        ms.val_bytes,
        ms.val_count,
        ms.intent_bytes,
        ms.intent_count,
    ]
}

fn sum(a: &MvccStats, b: &MvccStats) -> [i64; 8] {
    let (a, b) = (user_stats(a), user_stats(b));
    std::array::from_fn(|i| a[i] + b[i])
}

async fn populate(t: &TestStore) {
    for (i, key) in ["b", "d", "k", "n", "q", "w"].iter().enumerate() {
        t.put(key, &format!("value-{i}"), 100 + i as u64).await.unwrap();
    }
    // Shadowed version and a deletion on each side of "m".
    t.put("d", "newer", 120).await.unwrap();
    t.put("q", "newer", 121).await.unwrap();
    let ba = BatchRequest::new(0, ts(130)).add(Request::delete(b"k".to_vec()));
    t.send_one(ba).await.unwrap();

    let mut pending = Transaction::new("pending", b"r".to_vec(), IsolationLevel::Serializable, 1, ts(140));
    t.send_txn(&mut pending, vec![Request::put(b"r".to_vec(), Value::from_string("intent"))])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_split_conserves_stats() {
    let t = TestStore::new().with_range("a", "z").await;
    populate(&t).await;
    let engine = t.store.engine().clone();
    let now = 1_000_000_000_000_i64;

    let range = t.store.replica_for_key(b"a").unwrap();
    let before_mem = range.state().stats;
    let before = compute_stats(engine.as_ref(), b"a", b"z", now).unwrap();
    assert_eq!(before.intent_count, 1);

    t.clock.set(200);
    let (left, right) = t.store.admin_split(range.range_id(), Some(b"m".to_vec())).await.unwrap();
    assert_eq!((left.start_key.as_slice(), left.end_key.as_slice()), (&b"a"[..], &b"m"[..]));
    assert_eq!((right.start_key.as_slice(), right.end_key.as_slice()), (&b"m"[..], &b"z"[..]));

    let l = compute_stats(engine.as_ref(), b"a", b"m", now).unwrap();
    let r = compute_stats(engine.as_ref(), b"m", b"z", now).unwrap();
    assert_eq!(sum(&l, &r), user_stats(&before));

    let l_mem = t.store.replica(left.range_id).unwrap().state().stats;
    let r_mem = t.store.replica(right.range_id).unwrap().state().stats;
    assert_eq!(sum(&l_mem, &r_mem), user_stats(&before_mem));
    assert_eq!(l_mem.key_count, l.key_count);
    assert_eq!(r_mem.key_count, r.key_count);
    assert_eq!(r_mem.intent_count, 1);
}

#[tokio::test]
async fn test_split_at_boundary_rejected() {
    let t = TestStore::new().with_range("a", "z").await;
    let range = t.store.replica_for_key(b"c").unwrap();
    t.clock.increment(10);
    for key in [&b"a"[..], &b"z"[..]] {
        let err = t
            .store
            .admin_split(range.range_id(), Some(key.to_vec()))
            .await
            .unwrap_err();
        assert!(!err.is_retriable(), "{err}");
    }
    assert_eq!(t.store.replica_for_key(b"c").unwrap().desc(), range.desc());
}

#[tokio::test]
async fn test_merge_after_split_restores_range() {
    let t = TestStore::new().with_range("a", "z").await;
    t.put("c", "left", 100).await.unwrap();
    t.put("x", "right", 100).await.unwrap();
    let range_id = t.store.replica_for_key(b"c").unwrap().range_id();

    t.clock.set(200);
    let (_, right) = t.store.admin_split(range_id, Some(b"m".to_vec())).await.unwrap();
    let rhs = t.store.replica(right.range_id).unwrap();

    t.clock.set(300);
    let merged = t.store.admin_merge(range_id).await.unwrap();
    assert_eq!(merged.start_key, b"a".to_vec());
    assert_eq!(merged.end_key, b"z".to_vec());
    assert!(rhs.is_destroyed());
    assert!(matches!(
        t.store.replica(right.range_id).unwrap_err(),
        Error::RangeNotFound { .. }
    ));
    assert_eq!(t.store.replica_for_key(b"x").unwrap().range_id(), range_id);
    assert_eq!(string_value(&t.get("x", 400).await.unwrap()), "right");
    assert_eq!(string_value(&t.get("c", 400).await.unwrap()), "left");
}
