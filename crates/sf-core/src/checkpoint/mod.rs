mod coordinator;
mod file;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::window::StateSnapshot;

pub use coordinator::{CheckpointCoordinator, CheckpointReport, RecoveryReport};
pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

/// Atomic snapshot of processing progress: committed source offsets plus the
/// window state that reflects exactly those offsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: u64,
    pub taken_at: DateTime<Utc>,
    /// Highest fully handled offset per partition.
    pub offsets: BTreeMap<u32, u64>,
    pub state: StateSnapshot,
}

/// Durable checkpoint storage.
///
/// `put` must be atomic: after a failed or interrupted `put`, `get_latest`
/// still returns the previous checkpoint.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn put(&self, checkpoint: &Checkpoint) -> anyhow::Result<()>;

    async fn get_latest(&self) -> anyhow::Result<Option<Checkpoint>>;
}
