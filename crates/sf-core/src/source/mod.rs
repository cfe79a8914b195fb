mod file;
mod memory;
mod partitioned;

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::record::Record;

pub use file::FileSource;
pub use memory::MemorySource;

/// Upstream log the engine reads from.
///
/// Offsets are only committed on instruction, after the records up to them
/// are fully handled and checkpointed.
#[async_trait]
pub trait Source: Send + Sync {
    /// Up to `max` records, each carrying its `(partition, offset)`. An empty
    /// batch means nothing is available right now.
    async fn poll(&self, max: usize) -> anyhow::Result<Vec<Record>>;

    async fn commit(&self, partition: u32, offset: u64) -> anyhow::Result<()>;

    /// Resume each listed partition just after its committed offset.
    /// Unlisted partitions restart from the beginning.
    async fn seek(&self, committed: &BTreeMap<u32, u64>) -> anyhow::Result<()>;
}

/// One input line of a JSON-lines source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLine {
    pub key: String,
    pub event_time: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Partition a key is assigned to: `hash(key) % partitions`.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(partitions.max(1))) as u32
}
