//! Asynchronous write path integration tests
//!
//! - Visibility of queued values after flush
//! - Per-series ordering across workers
//! - Overflow policies under a stalled backend
//! - Failure accounting and shutdown

use kuba_pointvalues::engine::{MemoryStore, PointValueDb};
use kuba_pointvalues::error::IngestionError;
use kuba_pointvalues::ingestion::{OverflowPolicy, WriterConfig};
use kuba_pointvalues::types::{PointRef, PointValueTime};
use kuba_pointvalues::Error;
use std::sync::Arc;
use std::time::Duration;

fn async_db(store: &Arc<MemoryStore>, config: WriterConfig) -> PointValueDb {
    PointValueDb::builder()
        .with_store_arc(store.clone())
        .with_async_writes(config)
        .build()
        .unwrap()
}

fn small_queue(overflow: OverflowPolicy) -> WriterConfig {
    WriterConfig {
        num_workers: 1,
        max_batch_size: 2,
        max_batch_delay_ms: 5,
        queue_capacity: 4,
        overflow,
    }
}

/// Wait until a worker is parked inside the backend batch insert
async fn wait_for_stalled_writer(db: &PointValueDb) {
    for _ in 0..500 {
        if db.thread_count() > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("writer never reached the backend");
}

/// Fill a stalled single-worker queue to its capacity of 4
async fn fill_stalled_queue(db: &PointValueDb, store: &MemoryStore, point: &PointRef) {
    store.pause_writes();
    db.save_async(point, PointValueTime::numeric(0, 0.0)).await.unwrap();
    wait_for_stalled_writer(db).await;
    for t in 1..4 {
        db.save_async(point, PointValueTime::numeric(t, t as f64)).await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_flush_makes_queued_values_visible() {
    let store = Arc::new(MemoryStore::new());
    let db = async_db(&store, WriterConfig::default());
    let points: Vec<PointRef> = (0..10).map(|i| PointRef::new(i, i as u64)).collect();

    for t in 0..100 {
        for p in &points {
            db.save_async(p, PointValueTime::numeric(t, t as f64)).await.unwrap();
        }
    }
    db.flush().await;

    assert_eq!(store.value_count(), 1_000);
    assert_eq!(db.queue_size(), 0);
    for p in &points {
        assert_eq!(db.count(p, None, None).unwrap(), 100);
    }

    let metrics = db.write_metrics().unwrap().snapshot();
    assert_eq!(metrics.enqueued, 1_000);
    assert_eq!(metrics.written, 1_000);
    assert_eq!(metrics.failed, 0);
    db.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_series_order_preserved() {
    let store = Arc::new(MemoryStore::new());
    let db = async_db(
        &store,
        WriterConfig {
            num_workers: 4,
            max_batch_size: 7,
            ..Default::default()
        },
    );
    let point = PointRef::new(1, 77);

    // Same timestamp rewritten: only the last enqueued value may survive
    for v in 0..500 {
        db.save_async(&point, PointValueTime::numeric(42, v as f64)).await.unwrap();
    }
    db.flush().await;

    let stored = db.latest_value(&point).unwrap().unwrap();
    assert_eq!(stored.value.as_f64(), Some(499.0));
    assert!(store.batch_calls() > 1);
    db.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reject_policy_under_backpressure() {
    let store = Arc::new(MemoryStore::new());
    let db = async_db(&store, small_queue(OverflowPolicy::Reject));
    let point = PointRef::new(1, 1);

    fill_stalled_queue(&db, &store, &point).await;
    let rejected = db.save_async(&point, PointValueTime::numeric(10, 10.0)).await;
    assert!(matches!(
        rejected,
        Err(Error::Ingestion(IngestionError::Backpressure(_)))
    ));
    assert_eq!(db.write_metrics().unwrap().rejected(), 1);

    store.resume_writes();
    db.flush().await;
    assert_eq!(store.series_len(1), 4);
    db.save_async(&point, PointValueTime::numeric(10, 10.0)).await.unwrap();
    db.shutdown().await.unwrap();
    assert_eq!(store.series_len(1), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drop_newest_policy_under_backpressure() {
    let store = Arc::new(MemoryStore::new());
    let db = async_db(&store, small_queue(OverflowPolicy::DropNewest));
    let point = PointRef::new(1, 1);

    fill_stalled_queue(&db, &store, &point).await;
    for t in 10..13 {
        db.save_async(&point, PointValueTime::numeric(t, 0.0)).await.unwrap();
    }
    assert_eq!(db.write_metrics().unwrap().dropped(), 3);

    store.resume_writes();
    db.flush().await;
    let kept: Vec<i64> = db.range(&point, 0, 100).unwrap().iter().map(|v| v.timestamp).collect();
    assert_eq!(kept, vec![0, 1, 2, 3]);
    db.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_block_policy_waits_for_room() {
    let store = Arc::new(MemoryStore::new());
    let db = Arc::new(async_db(&store, small_queue(OverflowPolicy::Block)));
    let point = PointRef::new(1, 1);

    fill_stalled_queue(&db, &store, &point).await;
    let producer = {
        let db = db.clone();
        tokio::spawn(async move { db.save_async(&point, PointValueTime::numeric(10, 10.0)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!producer.is_finished());
    assert_eq!(db.queue_size(), 4);

    store.resume_writes();
    producer.await.unwrap().unwrap();
    db.flush().await;
    assert_eq!(store.series_len(1), 5);
    db.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_batch_is_counted_not_retried() {
    let store = Arc::new(MemoryStore::new());
    let db = async_db(
        &store,
        WriterConfig {
            num_workers: 1,
            max_batch_size: 100,
            max_batch_delay_ms: 20,
            ..Default::default()
        },
    );
    let point = PointRef::new(1, 1);

    store.fail_next_writes(1);
    for t in 0..3 {
        db.save_async(&point, PointValueTime::numeric(t, 0.0)).await.unwrap();
    }
    db.flush().await;

    let metrics = db.write_metrics().unwrap();
    assert_eq!(metrics.failed(), 3);
    assert_eq!(metrics.written(), 0);
    assert_eq!(store.series_len(1), 0);

    db.save_async(&point, PointValueTime::numeric(5, 0.0)).await.unwrap();
    db.flush().await;
    assert_eq!(store.series_len(1), 1);
    db.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_drains_and_closes() {
    let store = Arc::new(MemoryStore::new());
    let db = async_db(
        &store,
        WriterConfig {
            max_batch_delay_ms: 1_000,
            ..Default::default()
        },
    );
    let point = PointRef::new(3, 3);
    for t in 0..25 {
        db.save_async(&point, PointValueTime::numeric(t, 0.0)).await.unwrap();
    }

    db.shutdown().await.unwrap();
    assert_eq!(store.series_len(3), 25);
    assert!(matches!(
        db.save_async(&point, PointValueTime::numeric(99, 0.0)).await,
        Err(Error::Ingestion(IngestionError::ChannelClosed(_)))
    ));
    // second shutdown is a no-op
    db.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sync_only_db_rejects_async_writes() {
    let store = Arc::new(MemoryStore::new());
    let db = PointValueDb::builder().with_store_arc(store.clone()).build().unwrap();
    assert!(matches!(
        db.save_async(&PointRef::new(1, 1), PointValueTime::numeric(1, 1.0)).await,
        Err(Error::Ingestion(IngestionError::AsyncWritesDisabled))
    ));
    assert_eq!(db.queue_size(), 0);
    assert_eq!(db.thread_count(), 0);
    assert_eq!(db.write_speed(), 0.0);
}
