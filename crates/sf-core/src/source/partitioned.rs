use std::collections::BTreeMap;

use serde_json::Value;

use super::partition_for;
use crate::record::{Record, SourcePosition};

/// Append-only partitioned log with a read cursor per partition.
#[derive(Debug, Default)]
pub(super) struct PartitionedLog {
    partitions: u32,
    records: BTreeMap<u32, Vec<Record>>,
    /// Next offset to hand out per partition.
    cursors: BTreeMap<u32, u64>,
    committed: BTreeMap<u32, u64>,
    /// Partition the next round-robin poll starts from.
    next_partition: u32,
}

impl PartitionedLog {
    pub(super) fn new(partitions: u32) -> Self {
        let partitions = partitions.max(1);
        Self {
            partitions,
            records: (0..partitions).map(|p| (p, Vec::new())).collect(),
            cursors: (0..partitions).map(|p| (p, 0)).collect(),
            ..Self::default()
        }
    }

    pub(super) fn partitions(&self) -> u32 {
        self.partitions
    }

    pub(super) fn append(&mut self, key: String, event_time: i64, payload: Value) -> SourcePosition {
        let partition = partition_for(&key, self.partitions);
        self.append_to(partition, key, event_time, payload)
    }

    pub(super) fn append_to(
        &mut self,
        partition: u32,
        key: String,
        event_time: i64,
        payload: Value,
    ) -> SourcePosition {
        let log = self.records.entry(partition).or_default();
        let position = SourcePosition::new(partition, log.len() as u64);
        log.push(Record::new(key, event_time, payload, position));
        self.cursors.entry(partition).or_insert(0);
        position
    }

    /// Round-robin across partitions, one record at a time, so no partition
    /// starves the others.
    pub(super) fn poll(&mut self, max: usize) -> Vec<Record> {
        let partitions: Vec<u32> = self.records.keys().copied().collect();
        if partitions.is_empty() {
            return Vec::new();
        }
        let start = partitions
            .iter()
            .position(|&p| p >= self.next_partition)
            .unwrap_or(0);

        let mut out = Vec::new();
        let mut idle = 0;
        let mut i = start;
        while out.len() < max && idle < partitions.len() {
            let partition = partitions[i % partitions.len()];
            let cursor = self.cursors.entry(partition).or_insert(0);
            match self.records[&partition].get(*cursor as usize) {
                Some(record) => {
                    out.push(record.clone());
                    *cursor += 1;
                    idle = 0;
                }
                None => idle += 1,
            }
            i += 1;
        }
        self.next_partition = partitions[i % partitions.len()];
        out
    }

    pub(super) fn commit(&mut self, partition: u32, offset: u64) {
        let entry = self.committed.entry(partition).or_insert(offset);
        *entry = (*entry).max(offset);
    }

    pub(super) fn seek(&mut self, committed: &BTreeMap<u32, u64>) {
        for (partition, cursor) in self.cursors.iter_mut() {
            *cursor = committed.get(partition).map_or(0, |o| o + 1);
        }
        for (&partition, &offset) in committed {
            self.cursors.entry(partition).or_insert(offset + 1);
        }
    }

    pub(super) fn committed(&self) -> BTreeMap<u32, u64> {
        self.committed.clone()
    }

    /// Records not yet handed out.
    pub(super) fn remaining(&self) -> usize {
        self.records
            .iter()
            .map(|(p, log)| {
                let cursor = self.cursors.get(p).copied().unwrap_or(0) as usize;
                log.len().saturating_sub(cursor)
            })
            .sum()
    }

    pub(super) fn len(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }
}
