use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::HumanDuration;

// ---------------------------------------------------------------------------
// CheckpointConfig — [checkpoint]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    /// Directory holding checkpoint files. Relative paths resolve against the
    /// config file's parent directory.
    pub dir: PathBuf,
    pub interval: HumanDuration,
    /// Also checkpoint after this many merged records; `0` disables.
    #[serde(default)]
    pub every_records: u64,
    /// Number of checkpoints kept on disk for rollback.
    #[serde(default = "default_retain")]
    pub retain: usize,
}

fn default_retain() -> usize {
    2
}

// ---------------------------------------------------------------------------
// SinkConfig — [sink]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    /// JSON-lines output for finalized window results.
    pub path: PathBuf,
    /// Late-output sink; required when `late_data_policy = "correct"`.
    #[serde(default)]
    pub late_path: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_linger")]
    pub linger: HumanDuration,
    /// Maximum concurrent batch writes.
    #[serde(default = "default_fanout")]
    pub fanout: usize,
    pub max_retries: u32,
    #[serde(default = "default_retry_base")]
    pub retry_base: HumanDuration,
}

fn default_batch_size() -> usize {
    64
}

fn default_linger() -> HumanDuration {
    "200ms".parse().expect("hardcoded duration must parse")
}

fn default_fanout() -> usize {
    4
}

fn default_retry_base() -> HumanDuration {
    "100ms".parse().expect("hardcoded duration must parse")
}

// ---------------------------------------------------------------------------
// DeadLetterConfig — [dead_letter]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeadLetterConfig {
    /// JSON-lines dead-letter store.
    pub path: PathBuf,
    /// Re-submission budget for retryable failures.
    pub max_retries: u32,
    #[serde(default = "default_retry_base")]
    pub retry_base: HumanDuration,
    /// Attempts made to append one entry to the store before giving up.
    #[serde(default = "default_persist_retries")]
    pub persist_retries: u32,
}

fn default_persist_retries() -> u32 {
    5
}

// ---------------------------------------------------------------------------
// SourceConfig — [source]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// JSON-lines input replayed as a partitioned log.
    pub path: PathBuf,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
}

fn default_partitions() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// ShutdownConfig — [shutdown]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShutdownConfig {
    /// Upper bound on draining in-flight records after a stop signal.
    pub drain_timeout: HumanDuration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: "10s".parse().expect("hardcoded duration must parse"),
        }
    }
}
