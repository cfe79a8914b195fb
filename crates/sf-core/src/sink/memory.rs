use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use super::Sink;
use crate::record::WindowResult;

/// Collects results in memory. `fail_next(n)` makes the next `n` writes fail.
#[derive(Debug, Default)]
pub struct MemorySink {
    results: Mutex<Vec<WindowResult>>,
    failures: AtomicU32,
    attempts: AtomicU32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn results(&self) -> Vec<WindowResult> {
        self.results.lock().expect("memory sink lock poisoned").clone()
    }

    /// Total write calls, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn write(&self, batch: &[WindowResult]) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("sink unavailable");
        }
        self.results
            .lock()
            .expect("memory sink lock poisoned")
            .extend_from_slice(batch);
        Ok(())
    }
}
