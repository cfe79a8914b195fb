use sf_config::{WindowConfig, WindowKind};

/// Maps an event time onto the start times of the windows containing it.
///
/// All times are epoch milliseconds. Window starts are aligned to multiples
/// of `slide` (equal to `size` for tumbling windows), so negative event
/// times bucket the same way as positive ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAssigner {
    kind: WindowKind,
    size: i64,
    slide: i64,
}

impl WindowAssigner {
    pub fn new(kind: WindowKind, size_ms: i64, slide_ms: i64) -> Self {
        let size = size_ms.max(1);
        let slide = match kind {
            WindowKind::Tumbling => size,
            WindowKind::Sliding => slide_ms.clamp(1, size),
        };
        Self { kind, size, slide }
    }

    pub fn from_config(config: &WindowConfig) -> Self {
        Self::new(
            config.kind,
            config.size.as_millis_i64(),
            config.slide.as_millis_i64(),
        )
    }

    pub fn kind(&self) -> WindowKind {
        self.kind
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn slide(&self) -> i64 {
        self.slide
    }

    /// End of the window starting at `start`.
    pub fn end_of(&self, start: i64) -> i64 {
        start.saturating_add(self.size)
    }

    /// Starts of every window whose `[start, start + size)` contains
    /// `event_time`, oldest first.
    pub fn assign(&self, event_time: i64) -> Vec<i64> {
        let last = event_time.div_euclid(self.slide) * self.slide;
        match self.kind {
            WindowKind::Tumbling => vec![last],
            WindowKind::Sliding => {
                let mut starts = Vec::with_capacity(self.fanout());
                let mut start = last;
                while self.end_of(start) > event_time {
                    starts.push(start);
                    match start.checked_sub(self.slide) {
                        Some(prev) => start = prev,
                        None => break,
                    }
                }
                starts.reverse();
                starts
            }
        }
    }

    /// Upper bound on windows per record: `ceil(size / slide)`.
    pub fn fanout(&self) -> usize {
        ((self.size + self.slide - 1) / self.slide) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tumbling_floors_to_size() {
        let a = WindowAssigner::new(WindowKind::Tumbling, 60_000, 0);
        assert_eq!(a.assign(5_000), vec![0]);
        assert_eq!(a.assign(59_999), vec![0]);
        assert_eq!(a.assign(60_000), vec![60_000]);
        assert_eq!(a.end_of(60_000), 120_000);
    }

    #[test]
    fn tumbling_negative_time_uses_floor() {
        let a = WindowAssigner::new(WindowKind::Tumbling, 60_000, 0);
        assert_eq!(a.assign(-1), vec![-60_000]);
    }

    #[test]
    fn sliding_fans_out_to_every_covering_window() {
        let a = WindowAssigner::new(WindowKind::Sliding, 60_000, 20_000);
        assert_eq!(a.fanout(), 3);
        assert_eq!(a.assign(65_000), vec![20_000, 40_000, 60_000]);
        // On a slide boundary the window ending there is excluded.
        assert_eq!(a.assign(60_000), vec![20_000, 40_000, 60_000]);
        assert_eq!(a.assign(59_999), vec![0, 20_000, 40_000]);
    }

    #[test]
    fn sliding_uneven_slide_rounds_up() {
        let a = WindowAssigner::new(WindowKind::Sliding, 60_000, 25_000);
        assert_eq!(a.fanout(), 3);
        for t in [0, 10_000, 49_999, 74_000] {
            let starts = a.assign(t);
            assert!(!starts.is_empty() && starts.len() <= a.fanout());
            assert!(starts.iter().all(|&s| s <= t && t < a.end_of(s)));
        }
    }
}
