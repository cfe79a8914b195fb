use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::Source;
use super::partitioned::PartitionedLog;
use crate::record::{Record, SourcePosition};

/// Replayable in-memory log. Commits are recorded, and `seek` rewinds the
/// cursors, so a restarted pipeline sees exactly the records after its
/// recovered offsets.
#[derive(Debug)]
pub struct MemorySource {
    log: Mutex<PartitionedLog>,
}

impl MemorySource {
    pub fn new(partitions: u32) -> Self {
        Self {
            log: Mutex::new(PartitionedLog::new(partitions)),
        }
    }

    /// Append to the partition `key` hashes to.
    pub fn push(&self, key: &str, event_time: i64, payload: Value) -> SourcePosition {
        self.lock().append(key.to_string(), event_time, payload)
    }

    pub fn push_to(&self, partition: u32, key: &str, event_time: i64, payload: Value) -> SourcePosition {
        self.lock()
            .append_to(partition, key.to_string(), event_time, payload)
    }

    pub fn partitions(&self) -> u32 {
        self.lock().partitions()
    }

    /// Highest committed offset per partition.
    pub fn committed(&self) -> BTreeMap<u32, u64> {
        self.lock().committed()
    }

    pub fn remaining(&self) -> usize {
        self.lock().remaining()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PartitionedLog> {
        self.log.lock().expect("memory source lock poisoned")
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn poll(&self, max: usize) -> anyhow::Result<Vec<Record>> {
        Ok(self.lock().poll(max))
    }

    async fn commit(&self, partition: u32, offset: u64) -> anyhow::Result<()> {
        self.lock().commit(partition, offset);
        Ok(())
    }

    async fn seek(&self, committed: &BTreeMap<u32, u64>) -> anyhow::Result<()> {
        self.lock().seek(committed);
        Ok(())
    }
}
