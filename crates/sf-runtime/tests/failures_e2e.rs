//! Per-record failures, backpressure and fatal conditions.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use sf_config::BackpressureStrategy;
use sf_core::dead_letter::{DeadLetterSubject, ErrorKind};
use sf_core::record::Record;
use sf_core::retry::RetryPolicy;
use sf_core::transform::{FnStage, Stage, StageError, TransformPipeline};
use sf_runtime::lifecycle::Pipeline;

use common::{Harness, config, eventually, results_for, stop, value_of};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn retryable_failure_is_retried_with_backoff_then_dead_lettered() {
    let calls = Arc::new(Mutex::new(Vec::<Instant>::new()));
    let seen = Arc::clone(&calls);
    let transform = TransformPipeline::new(RetryPolicy::new(
        3,
        Duration::from_millis(10),
        Duration::from_secs(1),
    ))
    .with_stage(FnStage::new("lookup", move |_| {
        seen.lock().unwrap().push(Instant::now());
        Err(StageError::retryable("upstream timeout"))
    }));

    let h = Harness::new(1);
    let parts = h.collaborators().with_transform(transform);
    let pipeline = Pipeline::start(config(), parts).await.unwrap();
    let position = h.push("a", 5, 1.0);

    assert!(eventually(WAIT, || async { h.dead_letters.len() == 1 }).await);
    assert!(eventually(WAIT, || async { pipeline.in_flight() == 0 }).await);
    let stats_resubmitted = pipeline.dead_letter_stats().resubmitted();
    stop(pipeline).await;

    let entry = &h.dead_letters.entries()[0];
    assert_eq!(entry.error_kind, ErrorKind::Retryable);
    assert_eq!(entry.retry_count, 3);
    assert_eq!(entry.position(), Some(position));
    assert!(entry.message.contains("lookup"));
    assert_eq!(stats_resubmitted, 0);

    // One initial attempt plus three retries, each backing off further.
    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 4);
    for (i, pair) in calls.windows(2).enumerate() {
        let min = Duration::from_millis(10 << i);
        assert!(pair[1] - pair[0] >= min, "retry {i} came too early");
    }
}

#[tokio::test]
async fn dead_letter_resubmission_gives_a_record_another_pass() {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);
    let transform = TransformPipeline::new(RetryPolicy::new(
        3,
        Duration::from_millis(1),
        Duration::from_millis(10),
    ))
    .with_stage(FnStage::new("flaky", move |record| {
        if seen.fetch_add(1, Ordering::SeqCst) < 4 {
            Err(StageError::retryable("busy"))
        } else {
            Ok(Some(record.clone()))
        }
    }));

    let mut cfg = config();
    cfg.dead_letter.max_retries = 5;
    let h = Harness::new(1);
    let parts = h.collaborators().with_transform(transform);
    let pipeline = Pipeline::start(cfg, parts).await.unwrap();
    h.push("a", 5, 1.0);
    assert!(eventually(WAIT, || async { pipeline.metrics().merged() == 1 }).await);
    h.push("a", 70, 2.0);

    assert!(eventually(WAIT, || async { !h.sink.results().is_empty() }).await);
    assert_eq!(pipeline.dead_letter_stats().resubmitted(), 1);
    stop(pipeline).await;

    let results = results_for(&h.sink.results(), "a");
    assert_eq!(value_of(&results[0]), 1.0);
    assert!(h.dead_letters.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn permanent_failures_and_filtered_records_are_not_retried() {
    let mut cfg = config();
    cfg.pipeline.filter = Some(sf_config::FilterConfig {
        field: "region".into(),
        equals: "eu".into(),
    });
    let h = Harness::new(1);
    let pipeline = h.start(cfg).await;

    h.source.push("a", 5, json!({ "value": 1.0, "region": "eu" }));
    h.source.push("a", 6, json!({ "value": 2.0, "region": "us" }));
    let malformed = h.source.push("a", 7, json!([1, 2, 3]));
    h.source.push("a", 70, json!({ "value": 0.0, "region": "eu" }));

    assert!(eventually(WAIT, || async { !h.sink.results().is_empty() }).await);
    assert!(eventually(WAIT, || async { h.dead_letters.len() == 1 }).await);
    stop(pipeline).await;

    let entry = &h.dead_letters.entries()[0];
    assert_eq!(entry.error_kind, ErrorKind::Permanent);
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.position(), Some(malformed));

    let results = results_for(&h.sink.results(), "a");
    assert_eq!((value_of(&results[0]), results[0].record_count), (1.0, 1));
}

/// Parks every record until released, reporting how many are parked.
struct HoldStage {
    release: Semaphore,
    held: AtomicU32,
}

#[async_trait]
impl Stage for HoldStage {
    fn name(&self) -> &str {
        "hold"
    }

    async fn apply(&self, record: &Record) -> Result<Option<Record>, StageError> {
        self.held.fetch_add(1, Ordering::SeqCst);
        let _permit = self
            .release
            .acquire()
            .await
            .map_err(|e| StageError::permanent(e.to_string()))?;
        Ok(Some(record.clone()))
    }
}

#[tokio::test]
async fn drop_oldest_evicts_the_queue_head_once() {
    let mut cfg = config();
    cfg.queue.capacity = 2;
    cfg.queue.backpressure = BackpressureStrategy::DropOldest;
    cfg.queue.forward_dropped = true;

    let hold = Arc::new(HoldStage {
        release: Semaphore::new(0),
        held: AtomicU32::new(0),
    });
    let transform = TransformPipeline::new(RetryPolicy::new(
        0,
        Duration::from_millis(1),
        Duration::from_millis(1),
    ))
    .with_stage(SharedStage(Arc::clone(&hold)));

    let h = Harness::new(1);
    let parts = h.collaborators().with_transform(transform);
    let pipeline = Pipeline::start(cfg, parts).await.unwrap();

    // The single worker parks on the first record; the queue fills behind it.
    h.push("a", 1, 1.0);
    assert!(eventually(WAIT, || async { hold.held.load(Ordering::SeqCst) == 1 }).await);
    let evicted = h.push("a", 2, 2.0);
    h.push("a", 3, 3.0);
    h.push("a", 4, 4.0);
    assert!(eventually(WAIT, || async { h.dead_letters.len() == 1 }).await);

    hold.release.add_permits(64);
    h.push("a", 70, 0.0);
    assert!(eventually(WAIT, || async { !h.sink.results().is_empty() }).await);
    let metrics = pipeline.metrics();
    stop(pipeline).await;

    assert_eq!(metrics.evicted(), 1);
    let entry = &h.dead_letters.entries()[0];
    assert_eq!(entry.error_kind, ErrorKind::Dropped);
    assert_eq!(entry.position(), Some(evicted));
    let results = results_for(&h.sink.results(), "a");
    assert_eq!(value_of(&results[0]), 8.0);
}

struct SharedStage(Arc<HoldStage>);

#[async_trait]
impl Stage for SharedStage {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn apply(&self, record: &Record) -> Result<Option<Record>, StageError> {
        self.0.apply(record).await
    }
}

#[tokio::test]
async fn checkpoint_store_failure_halts_intake_until_a_checkpoint_succeeds() {
    let mut cfg = config();
    cfg.checkpoint.interval = "20ms".parse().unwrap();
    let h = Harness::new(1);
    h.checkpoints.set_failing(true);
    let pipeline = h.start(cfg).await;

    assert!(eventually(WAIT, || async { pipeline.gate_state().checkpoint_failed }).await);
    h.push("a", 5, 1.0);
    h.push("a", 6, 1.0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.source.remaining(), 2);
    assert!(pipeline.committed_offsets().is_empty());

    h.checkpoints.set_failing(false);
    assert!(eventually(WAIT, || async { pipeline.gate_state().is_open() }).await);
    assert!(eventually(WAIT, || async { h.source.remaining() == 0 && pipeline.in_flight() == 0 }).await);
    assert!(eventually(WAIT, || async { pipeline.committed_offsets().get(&0) == Some(&1) }).await);
    let metrics = pipeline.metrics();
    stop(pipeline).await;
    assert!(metrics.checkpoint_failures() >= 1);
}

#[tokio::test]
async fn exhausted_sink_batch_is_dead_lettered_and_halts_intake() {
    let h = Harness::new(1);
    h.sink.fail_next(u32::MAX);
    let pipeline = h.start(config()).await;

    h.push("a", 5, 1.0);
    h.push("a", 35, 2.0);
    h.push("a", 70, 0.0);
    assert!(eventually(WAIT, || async { pipeline.gate_state().sink_exhausted }).await);
    assert!(eventually(WAIT, || async { h.dead_letters.len() == 1 }).await);

    // Intake stays halted.
    h.push("a", 80, 0.0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.source.remaining(), 1);

    let metrics = pipeline.metrics();
    stop(pipeline).await;

    // max_retries = 2: three attempts in all.
    assert_eq!(h.sink.attempts(), 3);
    assert_eq!(metrics.sink_failures(), 1);
    let entry = &h.dead_letters.entries()[0];
    assert_eq!(entry.error_kind, ErrorKind::SinkExhausted);
    assert_eq!(entry.retry_count, 2);
    match &entry.original {
        DeadLetterSubject::Batch(batch) => {
            assert_eq!(batch.len(), 1);
            assert_eq!((batch[0].window_start, value_of(&batch[0])), (0, 3.0));
        }
        other => panic!("expected a batch, got {other:?}"),
    }
}

#[tokio::test]
async fn exhausted_batch_stays_closing_when_the_dead_letter_store_is_down() {
    let mut cfg = config();
    cfg.dead_letter.persist_retries = 1;
    let h = Harness::new(1);
    h.sink.fail_next(u32::MAX);
    h.dead_letters.fail_next(u32::MAX);
    let pipeline = h.start(cfg.clone()).await;

    h.push("a", 5, 1.0);
    h.push("a", 35, 2.0);
    h.push("a", 70, 0.0);
    let metrics = pipeline.metrics();
    assert!(eventually(WAIT, || async { pipeline.gate_state().sink_exhausted }).await);
    assert!(eventually(WAIT, || async { metrics.dead_letter_persist_failures() == 1 }).await);
    // [0,60) is still held as CLOSING next to the open [60,120).
    assert_eq!(pipeline.window_counts(), (1, 1));
    stop(pipeline).await;
    assert!(h.dead_letters.is_empty());

    // The shutdown checkpoint carried the unwritten result.
    let restarted = h.restarted();
    let pipeline = restarted.start(cfg).await;
    assert!(eventually(WAIT, || async { !restarted.sink.results().is_empty() }).await);
    stop(pipeline).await;

    let results = results_for(&restarted.sink.results(), "a");
    assert_eq!(
        (results[0].window_start, value_of(&results[0]), results[0].record_count),
        (0, 3.0, 2)
    );
}

#[tokio::test]
async fn unpersisted_dead_letter_is_retried_and_stops_pinning_commits() {
    let mut cfg = config();
    cfg.dead_letter.persist_retries = 1;
    cfg.checkpoint.interval = "20ms".parse().unwrap();
    let h = Harness::new(1);
    h.dead_letters.fail_next(3);
    let pipeline = h.start(cfg).await;

    let malformed = h.source.push("a", 5, json!([1, 2, 3]));
    h.push("a", 6, 1.0);
    h.push("a", 7, 2.0);

    assert!(eventually(WAIT, || async { h.dead_letters.len() == 1 }).await);
    assert!(eventually(WAIT, || async { pipeline.in_flight() == 0 }).await);
    assert!(eventually(WAIT, || async { pipeline.committed_offsets().get(&0) == Some(&2) }).await);
    let metrics = pipeline.metrics();
    stop(pipeline).await;

    assert_eq!(metrics.dead_letter_persist_failures(), 3);
    let entry = &h.dead_letters.entries()[0];
    assert_eq!(entry.error_kind, ErrorKind::Permanent);
    assert_eq!(entry.position(), Some(malformed));
}
