//! Coalescer Behaviour Tests
//!
//! These tests drive the ingest coalescer against a recording tree
//! engine and a stub block provider, verifying the two commit
//! triggers, their interaction, and the ordering guarantees around
//! flush, delete-range and shutdown.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use quasar_core::{Error, Record, Result, SoloCluster, StorageConfig};
use quasar_ingest::{IngestCoalescer, TreeEngine};
use quasar_storage::{BlockProvider, Segment};
use uuid::Uuid;

// ============================================================================
// Test Doubles
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Insert { uuid: Uuid, count: usize },
    Delete { uuid: Uuid, start: i64, end: i64 },
}

/// Tree engine that records every call.
#[derive(Default)]
struct RecordingEngine {
    events: Mutex<Vec<Event>>,
}

impl RecordingEngine {
    fn events(&self) -> Vec<Event> {
        self.events.lock().expect("events").clone()
    }

    fn commit_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Insert { .. }))
            .count()
    }
}

#[async_trait]
impl TreeEngine for RecordingEngine {
    async fn insert_values(&self, uuid: Uuid, records: Vec<Record>) -> Result<()> {
        self.events.lock().expect("events").push(Event::Insert {
            uuid,
            count: records.len(),
        });
        Ok(())
    }

    async fn delete_range(&self, uuid: Uuid, start: i64, end: i64) -> Result<()> {
        self.events
            .lock()
            .expect("events")
            .push(Event::Delete { uuid, start, end });
        Ok(())
    }
}

/// Block provider stub: only `stream_exists` matters to the coalescer.
struct StubProvider {
    known: Mutex<HashSet<Uuid>>,
}

impl StubProvider {
    fn with_streams(uuids: &[Uuid]) -> Arc<Self> {
        Arc::new(Self {
            known: Mutex::new(uuids.iter().copied().collect()),
        })
    }
}

#[async_trait]
impl BlockProvider for StubProvider {
    async fn lock_segment(&self, _uuid: Uuid) -> Result<Box<dyn Segment>> {
        unimplemented!("not used by the coalescer")
    }
    async fn read(&self, _uuid: Uuid, _address: u64) -> Result<Bytes> {
        unimplemented!("not used by the coalescer")
    }
    async fn read_superblock(&self, _uuid: Uuid, _version: u64) -> Result<Bytes> {
        unimplemented!("not used by the coalescer")
    }
    async fn write_superblock(&self, _uuid: Uuid, _version: u64, _data: &[u8]) -> Result<()> {
        unimplemented!("not used by the coalescer")
    }
    async fn get_stream_version(&self, uuid: Uuid) -> Result<u64> {
        Ok(if self.known.lock().expect("known").contains(&uuid) {
            1
        } else {
            0
        })
    }
    async fn set_stream_version(&self, _uuid: Uuid, _version: u64) -> Result<()> {
        unimplemented!("not used by the coalescer")
    }
    async fn stream_exists(&self, uuid: Uuid) -> Result<bool> {
        Ok(self.get_stream_version(uuid).await? != 0)
    }
}

fn records(n: usize) -> Vec<Record> {
    (0..n).map(|i| Record::new(i as i64, i as f64)).collect()
}

fn coalescer(
    engine: &Arc<RecordingEngine>,
    provider: Arc<StubProvider>,
    max_points: usize,
    max_interval_ms: u64,
) -> IngestCoalescer {
    let config = StorageConfig {
        coalesce_max_points: max_points,
        coalesce_max_interval_ms: max_interval_ms,
        ..Default::default()
    };
    IngestCoalescer::new(
        Arc::clone(engine) as Arc<dyn TreeEngine>,
        provider,
        Arc::new(SoloCluster),
        &config,
    )
}

// ============================================================================
// Commit Triggers
// ============================================================================

/// A small insert sits until the interval lapses, then commits exactly
/// once via the timer.
#[tokio::test(start_paused = true)]
async fn timer_commits_small_batch_once() {
    let engine = Arc::new(RecordingEngine::default());
    let uuid = Uuid::new_v4();
    let c = coalescer(&engine, StubProvider::with_streams(&[uuid]), 1000, 100);

    c.insert_values(uuid, records(10)).await.expect("insert");
    assert_eq!(engine.commit_count(), 0, "no commit before the interval");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        engine.events(),
        vec![Event::Insert { uuid, count: 10 }],
        "exactly one timed commit"
    );

    // Long after, still exactly one.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(engine.commit_count(), 1);
}

/// Crossing the point threshold commits synchronously, and the timer
/// never produces a second commit.
#[tokio::test(start_paused = true)]
async fn point_threshold_commits_synchronously() {
    let engine = Arc::new(RecordingEngine::default());
    let uuid = Uuid::new_v4();
    let c = coalescer(&engine, StubProvider::with_streams(&[uuid]), 1000, 100);

    c.insert_values(uuid, records(1500)).await.expect("insert");
    assert_eq!(
        engine.events(),
        vec![Event::Insert { uuid, count: 1500 }],
        "commit happened before insert_values returned"
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.commit_count(), 1, "timer was a no-op");
}

/// Appends accumulate into one batch; the commit that crosses the
/// threshold carries everything.
#[tokio::test(start_paused = true)]
async fn appends_accumulate_into_one_batch() {
    let engine = Arc::new(RecordingEngine::default());
    let uuid = Uuid::new_v4();
    let c = coalescer(&engine, StubProvider::with_streams(&[uuid]), 100, 10_000);

    c.insert_values(uuid, records(40)).await.expect("insert");
    c.insert_values(uuid, records(40)).await.expect("insert");
    assert_eq!(engine.commit_count(), 0);
    c.insert_values(uuid, records(40)).await.expect("insert");
    assert_eq!(engine.events(), vec![Event::Insert { uuid, count: 120 }]);
}

/// Streams coalesce independently.
#[tokio::test(start_paused = true)]
async fn streams_batch_independently() {
    let engine = Arc::new(RecordingEngine::default());
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let c = coalescer(&engine, StubProvider::with_streams(&[a, b]), 50, 100);

    c.insert_values(a, records(60)).await.expect("insert");
    c.insert_values(b, records(10)).await.expect("insert");
    assert_eq!(engine.events(), vec![Event::Insert { uuid: a, count: 60 }]);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        engine.events(),
        vec![
            Event::Insert { uuid: a, count: 60 },
            Event::Insert { uuid: b, count: 10 },
        ]
    );
}

// ============================================================================
// Gatekeeping
// ============================================================================

#[tokio::test]
async fn insert_into_unknown_stream_fails() {
    let engine = Arc::new(RecordingEngine::default());
    let c = coalescer(&engine, StubProvider::with_streams(&[]), 1000, 100);
    let err = c
        .insert_values(Uuid::new_v4(), records(1))
        .await
        .expect_err("must fail");
    assert_eq!(err, Error::NoSuchStream);
    assert_eq!(engine.commit_count(), 0);
}

#[tokio::test]
async fn insert_on_wrong_endpoint_fails() {
    struct NotOurs;
    impl quasar_core::ClusterState for NotOurs {
        fn we_hold_write_lock_for(&self, _uuid: &Uuid) -> bool {
            false
        }
    }

    let engine = Arc::new(RecordingEngine::default());
    let uuid = Uuid::new_v4();
    let config = StorageConfig::default();
    let c = IngestCoalescer::new(
        Arc::clone(&engine) as Arc<dyn TreeEngine>,
        StubProvider::with_streams(&[uuid]),
        Arc::new(NotOurs),
        &config,
    );
    let err = c.insert_values(uuid, records(1)).await.expect_err("must fail");
    assert_eq!(err, Error::WrongEndpoint);
}

// ============================================================================
// Flush / Delete / Shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn flush_commits_pending_and_disarms_timer() {
    let engine = Arc::new(RecordingEngine::default());
    let uuid = Uuid::new_v4();
    let c = coalescer(&engine, StubProvider::with_streams(&[uuid]), 1000, 100);

    c.insert_values(uuid, records(5)).await.expect("insert");
    c.flush(uuid).await.expect("flush");
    assert_eq!(engine.events(), vec![Event::Insert { uuid, count: 5 }]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.commit_count(), 1, "timer did not double-commit");
}

#[tokio::test]
async fn flush_with_nothing_pending_is_a_noop() {
    let engine = Arc::new(RecordingEngine::default());
    let uuid = Uuid::new_v4();
    let c = coalescer(&engine, StubProvider::with_streams(&[uuid]), 1000, 10_000);
    c.flush(uuid).await.expect("flush");
    assert_eq!(engine.commit_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn delete_range_commits_pending_first() {
    let engine = Arc::new(RecordingEngine::default());
    let uuid = Uuid::new_v4();
    let c = coalescer(&engine, StubProvider::with_streams(&[uuid]), 1000, 10_000);

    c.insert_values(uuid, records(7)).await.expect("insert");
    c.delete_range(uuid, 100, 200).await.expect("delete");

    assert_eq!(
        engine.events(),
        vec![
            Event::Insert { uuid, count: 7 },
            Event::Delete {
                uuid,
                start: 100,
                end: 200
            },
        ],
        "pending batch lands before the delete"
    );
}

#[tokio::test]
async fn delete_range_without_pending_only_deletes() {
    let engine = Arc::new(RecordingEngine::default());
    let uuid = Uuid::new_v4();
    let c = coalescer(&engine, StubProvider::with_streams(&[uuid]), 1000, 10_000);
    c.delete_range(uuid, -5, 5).await.expect("delete");
    assert_eq!(
        engine.events(),
        vec![Event::Delete {
            uuid,
            start: -5,
            end: 5
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_commits_every_open_tree() {
    let engine = Arc::new(RecordingEngine::default());
    let uuids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
    let c = coalescer(&engine, StubProvider::with_streams(&uuids), 1000, 60_000);

    for (i, u) in uuids.iter().enumerate() {
        c.insert_values(*u, records(i + 1)).await.expect("insert");
    }
    // One stream is already clean.
    c.flush(uuids[0]).await.expect("flush");
    assert_eq!(engine.commit_count(), 1);

    c.initiate_shutdown().await.expect("shutdown completes");
    assert_eq!(engine.commit_count(), 4, "every pending batch committed");
}

/// A failing engine surfaces the error to the synchronous caller and
/// leaves no half-committed batch behind.
#[tokio::test]
async fn engine_failure_propagates_on_synchronous_commit() {
    struct FailingEngine;
    #[async_trait]
    impl TreeEngine for FailingEngine {
        async fn insert_values(&self, _uuid: Uuid, _records: Vec<Record>) -> Result<()> {
            Err(Error::Unrecoverable("tree write failed".into()))
        }
        async fn delete_range(&self, _uuid: Uuid, _start: i64, _end: i64) -> Result<()> {
            Ok(())
        }
    }

    let uuid = Uuid::new_v4();
    let config = StorageConfig {
        coalesce_max_points: 10,
        ..Default::default()
    };
    let c = IngestCoalescer::new(
        Arc::new(FailingEngine),
        StubProvider::with_streams(&[uuid]),
        Arc::new(SoloCluster),
        &config,
    );
    let err = c.insert_values(uuid, records(20)).await.expect_err("fails");
    assert!(matches!(err, Error::Unrecoverable(_)));
}
