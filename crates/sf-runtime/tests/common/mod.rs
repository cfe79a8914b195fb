//! Shared fixtures for the pipeline integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sf_config::EngineConfig;
use sf_core::checkpoint::MemoryCheckpointStore;
use sf_core::dead_letter::MemoryDeadLetterStore;
use sf_core::record::{SourcePosition, WindowResult};
use sf_core::sink::MemorySink;
use sf_core::source::MemorySource;
use sf_runtime::lifecycle::{Collaborators, Pipeline};

/// Millisecond windows so tests can use small integer event times.
pub const BASE_TOML: &str = r#"
[window]
kind = "tumbling"
size = "60ms"
allowed_lateness = "10ms"
late_data_policy = "drop"

[queue]
capacity = 100
backpressure = "block"

[pipeline]
parallelism = 1
max_retries = 3
retry_base = "1ms"
retry_max = "10ms"
poll_batch_size = 16
poll_interval = "5ms"

[accumulator]
kind = "sum"
field = "value"

[checkpoint]
dir = "unused/checkpoints"
interval = "1h"
every_records = 0

[sink]
path = "unused/results.jsonl"
batch_size = 16
linger = "5ms"
max_retries = 2
retry_base = "1ms"

[dead_letter]
path = "unused/dead_letter.jsonl"
max_retries = 3
retry_base = "1ms"

[source]
path = "unused/events.jsonl"
partitions = 1

[shutdown]
drain_timeout = "2s"
"#;

pub fn config() -> EngineConfig {
    BASE_TOML.parse().expect("base config must parse")
}

/// In-memory collaborators, kept around so tests can inspect them.
pub struct Harness {
    pub source: Arc<MemorySource>,
    pub sink: Arc<MemorySink>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub dead_letters: Arc<MemoryDeadLetterStore>,
}

impl Harness {
    pub fn new(partitions: u32) -> Self {
        Self {
            source: Arc::new(MemorySource::new(partitions)),
            sink: Arc::new(MemorySink::new()),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            dead_letters: Arc::new(MemoryDeadLetterStore::new()),
        }
    }

    /// Same source and checkpoint store, fresh sink and dead-letter store:
    /// what a restarted process sees.
    pub fn restarted(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            sink: Arc::new(MemorySink::new()),
            checkpoints: Arc::clone(&self.checkpoints),
            dead_letters: Arc::new(MemoryDeadLetterStore::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.source.clone(),
            self.sink.clone(),
            self.checkpoints.clone(),
            self.dead_letters.clone(),
        )
    }

    pub async fn start(&self, config: EngineConfig) -> Pipeline {
        Pipeline::start(config, self.collaborators())
            .await
            .expect("pipeline start failed")
    }

    pub fn push(&self, key: &str, event_time: i64, value: f64) -> SourcePosition {
        self.source
            .push(key, event_time, serde_json::json!({ "value": value }))
    }
}

pub async fn stop(pipeline: Pipeline) {
    pipeline.shutdown();
    pipeline.wait().await.expect("pipeline shutdown failed");
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Results for `key`, sorted by window start.
pub fn results_for(results: &[WindowResult], key: &str) -> Vec<WindowResult> {
    let mut out: Vec<WindowResult> = results.iter().filter(|r| r.key == key).cloned().collect();
    out.sort_by_key(|r| (r.window_start, r.correction));
    out
}

pub fn value_of(result: &WindowResult) -> f64 {
    result.value.as_f64().expect("numeric aggregate")
}
