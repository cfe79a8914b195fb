use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::{Checkpoint, CheckpointStore};

/// In-process checkpoint store keeping every checkpoint it was given.
///
/// `set_failing(true)` makes `put` fail until reset, to exercise the
/// unreachable-store path.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<Vec<Checkpoint>>,
    failing: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn all(&self) -> Vec<Checkpoint> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Checkpoint>> {
        self.checkpoints.lock().expect("checkpoint store lock poisoned")
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("checkpoint store unavailable");
        }
        self.lock().push(checkpoint.clone());
        Ok(())
    }

    async fn get_latest(&self) -> anyhow::Result<Option<Checkpoint>> {
        Ok(self.lock().iter().max_by_key(|c| c.id).cloned())
    }
}
