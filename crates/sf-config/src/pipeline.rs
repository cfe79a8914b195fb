use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{BackpressureStrategy, HumanDuration};

// ---------------------------------------------------------------------------
// QueueConfig — [queue]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    pub capacity: usize,
    pub backpressure: BackpressureStrategy,
    /// Forward evicted / rejected records to the dead-letter handler as `dropped`.
    #[serde(default)]
    pub forward_dropped: bool,
}

// ---------------------------------------------------------------------------
// PipelineConfig — [pipeline]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Number of concurrent transform workers.
    pub parallelism: usize,
    pub max_retries: u32,
    #[serde(default = "default_retry_base")]
    pub retry_base: HumanDuration,
    #[serde(default = "default_retry_max")]
    pub retry_max: HumanDuration,
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: HumanDuration,
    /// Payload fields the parse stage requires on every record.
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
    /// Static fields merged into every payload by the enrich stage.
    #[serde(default)]
    pub enrich: BTreeMap<String, String>,
}

/// Keep only records whose payload `field` equals `equals`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FilterConfig {
    pub field: String,
    pub equals: String,
}

fn default_retry_base() -> HumanDuration {
    "100ms".parse().expect("hardcoded duration must parse")
}

fn default_retry_max() -> HumanDuration {
    "10s".parse().expect("hardcoded duration must parse")
}

fn default_poll_batch_size() -> usize {
    256
}

fn default_poll_interval() -> HumanDuration {
    "50ms".parse().expect("hardcoded duration must parse")
}

// ---------------------------------------------------------------------------
// AccumulatorConfig — [accumulator]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccumulatorConfig {
    /// Built-in (`sum`, `count`, `avg`, `min`, `max`, `set`) or a registered
    /// custom accumulator name.
    pub kind: String,
    /// Payload field the accumulator reads. Ignored by `count`.
    #[serde(default)]
    pub field: Option<String>,
    /// Skip merges of source positions a window has already absorbed.
    #[serde(default = "default_true")]
    pub dedup_by_offset: bool,
}

fn default_true() -> bool {
    true
}
