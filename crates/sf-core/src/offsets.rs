use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::record::SourcePosition;

#[derive(Debug, Default)]
struct PartitionProgress {
    /// Offsets handed downstream but not yet finally handled.
    in_flight: BTreeSet<u64>,
    /// Highest offset ever begun on this partition.
    highest_begun: Option<u64>,
    /// Offset known to be durable before tracking began (recovery point).
    floor: Option<u64>,
}

impl PartitionProgress {
    fn committable(&self) -> Option<u64> {
        match self.in_flight.first() {
            // Offsets are begun in source order, so everything below the
            // oldest in-flight offset is done.
            Some(&oldest) => oldest.checked_sub(1),
            None => self.highest_begun.or(self.floor),
        }
    }
}

/// Tracks which source offsets are still being processed so commits never
/// run ahead of an earlier, unfinished record on the same partition.
///
/// A record is *begun* when it is read from the source and *completed* once
/// its outcome is final: merged into window state, filtered, recognised as a
/// duplicate, or persisted to the dead-letter store. Resubmissions for retry
/// keep the offset in flight.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: Mutex<BTreeMap<u32, PartitionProgress>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the tracker with offsets recovered from a checkpoint.
    pub fn restore(&self, committed: &BTreeMap<u32, u64>) {
        let mut parts = self.lock();
        for (&partition, &offset) in committed {
            parts.entry(partition).or_default().floor = Some(offset);
        }
    }

    pub fn begin(&self, pos: SourcePosition) {
        let mut parts = self.lock();
        let p = parts.entry(pos.partition).or_default();
        p.in_flight.insert(pos.offset);
        p.highest_begun = Some(p.highest_begun.map_or(pos.offset, |h| h.max(pos.offset)));
    }

    /// Mark a record as finally handled. Completing an unknown position is a
    /// no-op, so duplicate completions are harmless.
    pub fn complete(&self, pos: SourcePosition) {
        if let Some(p) = self.lock().get_mut(&pos.partition) {
            p.in_flight.remove(&pos.offset);
        }
    }

    /// Highest offset per partition such that it and every earlier begun
    /// offset have completed. Partitions with nothing committable are absent.
    pub fn committable(&self) -> BTreeMap<u32, u64> {
        self.lock()
            .iter()
            .filter_map(|(&partition, p)| p.committable().map(|o| (partition, o)))
            .collect()
    }

    /// Number of records begun but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.lock().values().map(|p| p.in_flight.len()).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u32, PartitionProgress>> {
        self.partitions.lock().expect("offset tracker lock poisoned")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
