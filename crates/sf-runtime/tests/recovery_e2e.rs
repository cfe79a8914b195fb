//! Checkpointing, crash recovery and graceful shutdown.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use sf_core::record::{Record, WindowResult};
use sf_core::retry::RetryPolicy;
use sf_core::sink::{MemorySink, Sink};
use sf_core::transform::{Stage, StageError, TransformPipeline};
use sf_core::window::WindowStatus;
use sf_runtime::lifecycle::Pipeline;

use common::{Harness, config, eventually, results_for, stop, value_of};

const WAIT: Duration = Duration::from_secs(5);

/// `(key, window_start) -> (value, record_count)` over every result written.
fn aggregates(results: &[WindowResult]) -> BTreeMap<(String, i64), (f64, u64)> {
    results
        .iter()
        .filter(|r| !r.correction)
        .map(|r| {
            (
                (r.key.clone(), r.window_start),
                (r.value.as_f64().unwrap(), r.record_count),
            )
        })
        .collect()
}

const FIRST: [(&str, i64, f64); 4] = [("a", 5, 1.0), ("b", 10, 2.0), ("a", 20, 3.0), ("b", 30, 4.0)];
const SECOND: [(&str, i64, f64); 3] = [("a", 40, 5.0), ("b", 45, 6.0), ("a", 50, 7.0)];
const THIRD: [(&str, i64, f64); 2] = [("a", 70, 8.0), ("b", 130, 9.0)];

#[tokio::test]
async fn restart_replays_uncheckpointed_records_and_matches_reference_run() {
    // Reference: one uninterrupted run.
    let reference = Harness::new(1);
    let pipeline = reference.start(config()).await;
    for (k, t, v) in FIRST.iter().chain(&SECOND).chain(&THIRD) {
        reference.push(k, *t, *v);
    }
    assert!(eventually(WAIT, || async { reference.sink.results().len() == 3 }).await);
    stop(pipeline).await;
    let expected = aggregates(&reference.sink.results());
    assert_eq!(expected.len(), 3);

    // Crashing run: checkpoint after four merges, then lose everything after.
    let mut cfg = config();
    cfg.checkpoint.every_records = 4;
    let h = Harness::new(1);
    let pipeline = h.start(cfg.clone()).await;
    for (k, t, v) in FIRST {
        h.push(k, t, v);
    }
    assert!(eventually(WAIT, || async { h.checkpoints.len() == 1 }).await);
    let checkpointed = h.checkpoints.all()[0].offsets.clone();

    h.checkpoints.set_failing(true);
    for (k, t, v) in SECOND {
        h.push(k, t, v);
    }
    assert!(eventually(WAIT, || async { pipeline.in_flight() == 0 && h.source.remaining() == 0 }).await);
    assert!(eventually(WAIT, || async { pipeline.metrics().merged() == 7 }).await);
    // Nothing has closed yet, so no result escaped before the crash.
    assert!(h.sink.results().is_empty());
    stop(pipeline).await;
    assert_eq!(h.checkpoints.len(), 1);
    assert_eq!(h.source.committed(), checkpointed);

    // Restart from the surviving checkpoint.
    h.checkpoints.set_failing(false);
    let restarted = h.restarted();
    let pipeline = restarted.start(cfg).await;
    assert_eq!(pipeline.recovered_checkpoint(), Some(1));
    for (k, t, v) in THIRD {
        restarted.push(k, t, v);
    }
    assert!(eventually(WAIT, || async { restarted.sink.results().len() == 3 }).await);
    let metrics = pipeline.metrics();
    stop(pipeline).await;

    assert_eq!(aggregates(&restarted.sink.results()), expected);
    // Only the records after the checkpointed offset were read again. Any of
    // them already in the snapshot is recognised as a duplicate.
    let replayed = (FIRST.len() + SECOND.len()) as u64 - (checkpointed[&0] + 1);
    assert_eq!(metrics.source_records(), replayed + THIRD.len() as u64);
    assert_eq!(
        metrics.merged() + metrics.duplicates(),
        replayed + THIRD.len() as u64
    );
}

#[tokio::test]
async fn replaying_an_offset_range_twice_does_not_double_count() {
    let mut cfg = config();
    cfg.checkpoint.every_records = 2;
    let h = Harness::new(1);
    let pipeline = h.start(cfg.clone()).await;
    h.push("a", 5, 1.0);
    h.push("b", 10, 2.0);
    assert!(eventually(WAIT, || async { h.checkpoints.len() == 1 }).await);

    // Nothing after the first checkpoint becomes durable.
    h.checkpoints.set_failing(true);
    h.push("a", 20, 3.0);
    h.push("b", 30, 4.0);
    assert!(eventually(WAIT, || async { pipeline.metrics().merged() == 4 }).await);
    stop(pipeline).await;

    // Two restarts replay the same tail from the same checkpoint.
    cfg.checkpoint.every_records = 0;
    for _ in 0..2 {
        let run = h.restarted();
        let pipeline = run.start(cfg.clone()).await;
        assert_eq!(pipeline.recovered_checkpoint(), Some(1));
        assert!(eventually(WAIT, || async { run.source.remaining() == 0 && pipeline.in_flight() == 0 }).await);
        assert!(pipeline.metrics().source_records() > 0);
        stop(pipeline).await;
    }

    h.checkpoints.set_failing(false);
    let run = h.restarted();
    let pipeline = run.start(cfg).await;
    run.push("a", 200, 0.0);
    assert!(eventually(WAIT, || async { run.sink.results().len() == 2 }).await);
    stop(pipeline).await;

    let a = results_for(&run.sink.results(), "a");
    let b = results_for(&run.sink.results(), "b");
    assert_eq!((a[0].value.as_f64(), a[0].record_count), (Some(4.0), 2));
    assert_eq!((b[0].value.as_f64(), b[0].record_count), (Some(6.0), 2));
}

#[tokio::test]
async fn shutdown_takes_a_final_checkpoint_and_commits_offsets() {
    let h = Harness::new(2);
    let pipeline = h.start(config()).await;
    let mut last = BTreeMap::new();
    for i in 0..20 {
        let pos = h.push(&format!("k{i}"), i, 1.0);
        last.insert(pos.partition, pos.offset);
    }
    assert!(eventually(WAIT, || async { pipeline.in_flight() == 0 && h.source.remaining() == 0 }).await);
    assert!(h.checkpoints.is_empty());
    let metrics = pipeline.metrics();
    stop(pipeline).await;

    assert_eq!(metrics.checkpoints(), 1);
    let latest = h.checkpoints.all().pop().unwrap();
    assert_eq!(latest.offsets, last);
    assert_eq!(h.source.committed(), last);
    // Open windows were carried in the checkpoint rather than flushed.
    assert!(!latest.state.window_states.is_empty());
}

/// Holds every write until `open` is called.
struct GatedSink {
    gate: Semaphore,
    inner: MemorySink,
}

#[async_trait]
impl Sink for GatedSink {
    async fn write(&self, batch: &[WindowResult]) -> anyhow::Result<()> {
        let _permit = self.gate.acquire().await?;
        self.inner.write(batch).await
    }
}

#[tokio::test]
async fn results_unacknowledged_at_the_last_checkpoint_are_re_emitted() {
    let mut cfg = config();
    cfg.checkpoint.interval = "20ms".parse().unwrap();
    let h = Harness::new(1);
    let sink = Arc::new(GatedSink {
        gate: Semaphore::new(0),
        inner: MemorySink::new(),
    });
    let mut parts = h.collaborators();
    parts.sink = sink.clone();
    let pipeline = Pipeline::start(cfg.clone(), parts).await.unwrap();

    h.push("a", 5, 1.0);
    h.push("a", 70, 2.0);
    // A checkpoint captures [0, 60) while the sink still holds it.
    let captured_closing = || async {
        h.checkpoints.all().last().is_some_and(|c| {
            c.state
                .window_states
                .iter()
                .any(|w| w.start == 0 && w.status == WindowStatus::Closing)
        })
    };
    assert!(eventually(WAIT, captured_closing).await);

    // Crash: the acknowledgement never reaches a durable checkpoint.
    h.checkpoints.set_failing(true);
    sink.gate.add_permits(64);
    assert!(eventually(WAIT, || async { !sink.inner.results().is_empty() }).await);
    stop(pipeline).await;

    h.checkpoints.set_failing(false);
    let run = h.restarted();
    let pipeline = run.start(cfg).await;
    assert!(eventually(WAIT, || async { !run.sink.results().is_empty() }).await);
    stop(pipeline).await;

    let again = results_for(&run.sink.results(), "a");
    assert_eq!(again.len(), 1);
    assert_eq!((again[0].window_start, again[0].value.as_f64()), (0, Some(1.0)));
}

/// Never finishes a record keyed `stuck`; everything else passes through.
struct StuckStage {
    parked: Arc<AtomicBool>,
}

#[async_trait]
impl Stage for StuckStage {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn apply(&self, record: &Record) -> Result<Option<Record>, StageError> {
        if record.key == "stuck" {
            self.parked.store(true, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
        Ok(Some(record.clone()))
    }
}

#[tokio::test]
async fn drain_timeout_aborts_workers_and_still_checkpoints() {
    let mut cfg = config();
    cfg.shutdown.drain_timeout = "50ms".parse().unwrap();
    let parked = Arc::new(AtomicBool::new(false));
    let transform = TransformPipeline::new(RetryPolicy::new(
        0,
        Duration::from_millis(1),
        Duration::from_millis(1),
    ))
    .with_stage(StuckStage {
        parked: Arc::clone(&parked),
    });

    let h = Harness::new(1);
    let parts = h.collaborators().with_transform(transform);
    let pipeline = Pipeline::start(cfg.clone(), parts).await.unwrap();

    h.push("a", 5, 1.0);
    assert!(eventually(WAIT, || async { pipeline.metrics().merged() == 1 }).await);
    let stuck = h.push("stuck", 6, 4.0);
    assert!(eventually(WAIT, || async { parked.load(Ordering::SeqCst) }).await);
    // Queued behind the parked worker.
    h.push("a", 7, 2.0);
    assert!(eventually(WAIT, || async { h.source.remaining() == 0 }).await);

    pipeline.shutdown();
    tokio::time::timeout(WAIT, pipeline.wait())
        .await
        .expect("shutdown must finish once the drain timeout passes")
        .unwrap();

    // The final checkpoint was taken and stops short of the parked record.
    let last = h.checkpoints.all().last().cloned().expect("final checkpoint");
    assert_eq!(last.offsets, BTreeMap::from([(0, stuck.offset - 1)]));
    assert_eq!(h.source.committed(), last.offsets);
    assert!(h.sink.results().is_empty());

    // A plain restart replays the parked record and the one queued behind it.
    let restarted = h.restarted();
    let pipeline = restarted.start(cfg).await;
    assert_eq!(pipeline.recovered_checkpoint(), Some(last.id));
    restarted.push("a", 70, 0.0);
    assert!(eventually(WAIT, || async { restarted.sink.results().len() == 2 }).await);
    let metrics = pipeline.metrics();
    stop(pipeline).await;

    assert_eq!(metrics.source_records(), 3);
    let a = results_for(&restarted.sink.results(), "a");
    assert_eq!((a[0].window_start, value_of(&a[0]), a[0].record_count), (0, 3.0, 2));
    let replayed = results_for(&restarted.sink.results(), "stuck");
    assert_eq!((value_of(&replayed[0]), replayed[0].record_count), (4.0, 1));
}
