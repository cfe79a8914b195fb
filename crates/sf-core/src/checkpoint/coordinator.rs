use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use orion_error::ErrorOweBase;
use orion_error::prelude::*;

use super::{Checkpoint, CheckpointStore};
use crate::error::{CoreReason, CoreResult};
use crate::gate::IntakeGate;
use crate::offsets::OffsetTracker;
use crate::source::Source;
use crate::window::{Emission, WindowManager};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointReport {
    pub id: u64,
    pub offsets: BTreeMap<u32, u64>,
    pub windows: usize,
    pub elapsed: Duration,
}

/// What a restart resumed from.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub checkpoint_id: u64,
    pub offsets: BTreeMap<u32, u64>,
    pub windows: usize,
    /// Finalized results the sink had not acknowledged; they must be
    /// emitted again.
    pub pending: Vec<Emission>,
}

// ---------------------------------------------------------------------------
// CheckpointCoordinator
// ---------------------------------------------------------------------------

/// Takes consistent snapshots of window state and source offsets and drives
/// recovery from them.
///
/// A checkpoint pauses merges at an epoch boundary, snapshots state and the
/// committable offsets, writes the snapshot durably and only then commits
/// the offsets to the source. A failed write leaves the previous checkpoint
/// authoritative, commits nothing and halts intake until a later checkpoint
/// succeeds.
pub struct CheckpointCoordinator {
    store: Arc<dyn CheckpointStore>,
    manager: Arc<WindowManager>,
    tracker: Arc<OffsetTracker>,
    source: Arc<dyn Source>,
    gate: Arc<IntakeGate>,
    next_id: AtomicU64,
    committed: std::sync::Mutex<BTreeMap<u32, u64>>,
}

impl CheckpointCoordinator {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        manager: Arc<WindowManager>,
        tracker: Arc<OffsetTracker>,
        source: Arc<dyn Source>,
        gate: Arc<IntakeGate>,
    ) -> Self {
        Self {
            store,
            manager,
            tracker,
            source,
            gate,
            next_id: AtomicU64::new(1),
            committed: std::sync::Mutex::new(BTreeMap::new()),
        }
    }

    /// Offsets acknowledged to the source by the last successful checkpoint.
    pub fn committed(&self) -> BTreeMap<u32, u64> {
        self.committed_lock().clone()
    }

    /// Load the newest durable checkpoint, rehydrate window state from it
    /// and rewind the source to just after its offsets. Returns `None` on a
    /// fresh start.
    pub async fn recover(&self) -> CoreResult<Option<RecoveryReport>> {
        let Some(checkpoint) = self
            .store
            .get_latest()
            .await
            .owe(CoreReason::Checkpoint)?
        else {
            log::info!("no checkpoint found, starting from the beginning");
            self.source
                .seek(&BTreeMap::new())
                .await
                .owe(CoreReason::Source)?;
            return Ok(None);
        };

        let id = checkpoint.id;
        let offsets = checkpoint.offsets.clone();
        let windows = checkpoint.state.window_states.len();

        self.tracker.restore(&offsets);
        self.source.seek(&offsets).await.owe(CoreReason::Source)?;
        self.manager.restore(checkpoint.state).await;
        self.next_id.store(id + 1, Ordering::SeqCst);
        *self.committed_lock() = offsets.clone();

        let pending = self.manager.pending();
        log::info!(
            "recovered checkpoint {id} taken at {}: {} windows, {} pending results, offsets {:?}",
            checkpoint.taken_at,
            windows,
            pending.len(),
            offsets
        );
        Ok(Some(RecoveryReport {
            checkpoint_id: id,
            offsets,
            windows,
            pending,
        }))
    }

    /// Take one checkpoint.
    pub async fn checkpoint(&self) -> CoreResult<CheckpointReport> {
        let started = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let epoch = self.manager.pause().await;
        let offsets = self.tracker.committable();
        let checkpoint = Checkpoint {
            id,
            taken_at: Utc::now(),
            offsets: offsets.clone(),
            state: self.manager.snapshot(&epoch),
        };
        let windows = checkpoint.state.window_states.len();

        if let Err(e) = self.store.put(&checkpoint).await {
            drop(epoch);
            self.gate.halt_for_checkpoint();
            return StructError::from(CoreReason::Checkpoint)
                .with_detail(format!("checkpoint {id} write failed: {e:#}"))
                .err();
        }

        let previous = self.committed();
        for (&partition, &offset) in &offsets {
            if previous.get(&partition).is_some_and(|&p| p >= offset) {
                continue;
            }
            // The checkpoint is durable, so a failed commit only widens the
            // replay window.
            if let Err(e) = self.source.commit(partition, offset).await {
                log::warn!("commit {partition}@{offset} failed after checkpoint {id}: {e:#}");
            }
        }
        self.manager.prune_committed(&epoch, &offsets);
        drop(epoch);

        *self.committed_lock() = offsets.clone();
        self.gate.clear_checkpoint();

        Ok(CheckpointReport {
            id,
            offsets,
            windows,
            elapsed: started.elapsed(),
        })
    }

    fn committed_lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u32, u64>> {
        self.committed.lock().expect("committed offsets lock poisoned")
    }
}
