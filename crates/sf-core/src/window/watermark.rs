use std::collections::BTreeMap;

/// Per-partition event-time progress.
///
/// Each partition's watermark is `max(observed event_time) − allowed_lateness`
/// and never moves backwards. The global watermark is the minimum over the
/// partitions that have observed at least one record, so a slow partition
/// holds back window closure for everyone.
#[derive(Debug, Clone, Default)]
pub struct WatermarkTracker {
    allowed_lateness: i64,
    max_event_time: BTreeMap<u32, i64>,
}

impl WatermarkTracker {
    pub fn new(allowed_lateness_ms: i64) -> Self {
        Self {
            allowed_lateness: allowed_lateness_ms.max(0),
            max_event_time: BTreeMap::new(),
        }
    }

    /// Record an event time. Returns `true` when the partition's watermark
    /// advanced.
    pub fn observe(&mut self, partition: u32, event_time: i64) -> bool {
        match self.max_event_time.get_mut(&partition) {
            Some(max) if event_time > *max => {
                *max = event_time;
                true
            }
            Some(_) => false,
            None => {
                self.max_event_time.insert(partition, event_time);
                true
            }
        }
    }

    pub fn partition(&self, partition: u32) -> Option<i64> {
        self.max_event_time
            .get(&partition)
            .map(|max| max.saturating_sub(self.allowed_lateness))
    }

    pub fn global(&self) -> Option<i64> {
        self.max_event_time
            .values()
            .min()
            .map(|max| max.saturating_sub(self.allowed_lateness))
    }

    /// Highest event time seen per partition, for checkpointing.
    pub fn snapshot(&self) -> BTreeMap<u32, i64> {
        self.max_event_time.clone()
    }

    pub fn restore(&mut self, max_event_time: BTreeMap<u32, i64>) {
        for (partition, t) in max_event_time {
            self.observe(partition, t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_trails_max_by_lateness_and_never_decreases() {
        let mut wm = WatermarkTracker::new(10);
        assert_eq!(wm.global(), None);
        assert!(wm.observe(0, 65));
        assert_eq!(wm.global(), Some(55));
        assert!(!wm.observe(0, 20));
        assert_eq!(wm.global(), Some(55));
        assert!(wm.observe(0, 95));
        assert_eq!(wm.partition(0), Some(85));
    }

    #[test]
    fn global_is_min_of_observed_partitions() {
        let mut wm = WatermarkTracker::new(0);
        wm.observe(0, 100);
        wm.observe(1, 40);
        assert_eq!(wm.global(), Some(40));
        wm.observe(1, 150);
        assert_eq!(wm.global(), Some(100));
        assert_eq!(wm.partition(7), None);
    }

    #[test]
    fn restore_keeps_monotonicity() {
        let mut wm = WatermarkTracker::new(0);
        wm.observe(0, 500);
        wm.restore(BTreeMap::from([(0, 300), (1, 200)]));
        assert_eq!(wm.partition(0), Some(500));
        assert_eq!(wm.partition(1), Some(200));
    }
}
