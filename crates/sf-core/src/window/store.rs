use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use orion_error::prelude::*;
use serde::{Deserialize, Serialize};

use crate::accumulator::{AccValue, Accumulator};
use crate::error::{CoreReason, CoreResult};
use crate::record::{Record, SourcePosition, WindowKey};

// ---------------------------------------------------------------------------
// WindowStatus / WindowSlot
// ---------------------------------------------------------------------------

/// Lifecycle of a window held by the store. A window that has been written
/// to the sink and released is CLOSED and no longer held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    Open,
    /// Finalized and immutable; waiting for the sink to acknowledge it.
    Closing,
}

/// Mutable state of one window instance.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSlot {
    pub end: i64,
    pub acc: AccValue,
    pub record_count: u64,
    pub status: WindowStatus,
    /// Positions already folded in; empty when dedup is off.
    pub applied: BTreeSet<SourcePosition>,
}

impl WindowSlot {
    pub fn new(end: i64, acc: AccValue) -> Self {
        Self {
            end,
            acc,
            record_count: 0,
            status: WindowStatus::Open,
            applied: BTreeSet::new(),
        }
    }

    /// Fold `record` in unless it was already applied or the slot is final.
    pub fn fold(
        &mut self,
        accumulator: &Accumulator,
        record: &Record,
        dedup: bool,
    ) -> CoreResult<MergeOutcome> {
        if dedup && self.applied.contains(&record.position) {
            return Ok(MergeOutcome::Duplicate);
        }
        if self.status == WindowStatus::Closing {
            return Ok(MergeOutcome::Finalized);
        }
        self.acc = accumulator
            .merge(&self.acc, record)
            .map_err(|e| {
                StructError::from(CoreReason::DataFormat).with_detail(format!(
                    "{} merge failed for record {}: {e:#}",
                    accumulator.name(),
                    record.position
                ))
            })?;
        self.record_count += 1;
        if dedup {
            self.applied.insert(record.position);
        }
        Ok(MergeOutcome::Merged(self.acc.clone()))
    }

    fn prune(&mut self, committed: &BTreeMap<u32, u64>) {
        self.applied.retain(|p| !is_committed(committed, *p));
    }
}

/// Result of merging one record into one window.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged(AccValue),
    /// The position was already applied to this window.
    Duplicate,
    /// The window is closing and cannot change.
    Finalized,
}

/// Serialisable view of a window slot, used by checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowState {
    pub key: String,
    pub start: i64,
    pub end: i64,
    pub acc: AccValue,
    pub record_count: u64,
    pub status: WindowStatus,
    #[serde(default)]
    pub applied: Vec<SourcePosition>,
}

impl WindowState {
    pub fn from_slot(key: &WindowKey, slot: &WindowSlot) -> Self {
        Self {
            key: key.key.clone(),
            start: key.start,
            end: slot.end,
            acc: slot.acc.clone(),
            record_count: slot.record_count,
            status: slot.status,
            applied: slot.applied.iter().copied().collect(),
        }
    }

    pub fn window_key(&self) -> WindowKey {
        WindowKey::new(self.key.clone(), self.start)
    }

    pub fn into_slot(self) -> (WindowKey, WindowSlot) {
        let key = WindowKey::new(self.key, self.start);
        let slot = WindowSlot {
            end: self.end,
            acc: self.acc,
            record_count: self.record_count,
            status: self.status,
            applied: self.applied.into_iter().collect(),
        };
        (key, slot)
    }
}

/// A `(window, position)` pair whose merge has already been emitted and
/// released. Kept until the position's offset is committed so a replay
/// recognises it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RetiredPosition {
    pub position: SourcePosition,
    pub window: WindowKey,
}

pub(crate) fn is_committed(committed: &BTreeMap<u32, u64>, pos: SourcePosition) -> bool {
    committed
        .get(&pos.partition)
        .is_some_and(|&offset| pos.offset <= offset)
}

// ---------------------------------------------------------------------------
// KeyedStateStore
// ---------------------------------------------------------------------------

type Shard = HashMap<WindowKey, WindowSlot>;

/// Window state partitioned into independently locked shards.
///
/// Each key hashes to exactly one shard, so merges for different keys run
/// in parallel while merges for the same key are serialised by its shard
/// lock. Consistent snapshots across shards need the window manager's
/// epoch barrier.
pub struct KeyedStateStore {
    shards: Vec<Mutex<Shard>>,
    accumulator: Accumulator,
    dedup: bool,
    retired: Mutex<BTreeSet<RetiredPosition>>,
}

impl KeyedStateStore {
    pub fn new(accumulator: Accumulator, dedup: bool, shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(Shard::new())).collect(),
            accumulator,
            dedup,
            retired: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    pub fn dedup(&self) -> bool {
        self.dedup
    }

    /// Current accumulator state of a window, if it exists.
    pub fn get(&self, key: &WindowKey) -> Option<AccValue> {
        self.shard(&key.key).get(key).map(|slot| slot.acc.clone())
    }

    pub fn status(&self, key: &WindowKey) -> Option<WindowStatus> {
        self.shard(&key.key).get(key).map(|slot| slot.status)
    }

    /// Merge `record` into the window `key`, creating it on first use.
    pub fn merge(&self, key: &WindowKey, end: i64, record: &Record) -> CoreResult<MergeOutcome> {
        let mut shard = self.shard(&key.key);
        match shard.get_mut(key) {
            Some(slot) => slot.fold(&self.accumulator, record, self.dedup),
            None => {
                let mut slot = WindowSlot::new(end, self.accumulator.initial());
                let outcome = slot.fold(&self.accumulator, record, self.dedup)?;
                shard.insert(key.clone(), slot);
                Ok(outcome)
            }
        }
    }

    /// Whether `position` was already merged into the finalized window
    /// `key`, either while it is closing or after it was released.
    pub fn was_applied(&self, key: &WindowKey, position: SourcePosition) -> bool {
        if !self.dedup {
            return false;
        }
        let in_slot = self
            .shard(&key.key)
            .get(key)
            .is_some_and(|slot| slot.applied.contains(&position));
        in_slot
            || self.retired_lock().contains(&RetiredPosition {
                position,
                window: key.clone(),
            })
    }

    /// Move every open window with `end ≤ watermark` to CLOSING and return
    /// them, ordered by window end then key.
    pub fn close_due(&self, watermark: i64) -> Vec<(WindowKey, WindowSlot)> {
        let mut due = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock().expect("state shard lock poisoned");
            for (key, slot) in shard.iter_mut() {
                if slot.status == WindowStatus::Open && slot.end <= watermark {
                    slot.status = WindowStatus::Closing;
                    due.push((key.clone(), slot.clone()));
                }
            }
        }
        due.sort_by(|a, b| (a.1.end, &a.0).cmp(&(b.1.end, &b.0)));
        due
    }

    /// Every window currently awaiting sink acknowledgement.
    pub fn closing(&self) -> Vec<(WindowKey, WindowSlot)> {
        let mut out: Vec<_> = self
            .shards
            .iter()
            .flat_map(|shard| {
                let shard = shard.lock().expect("state shard lock poisoned");
                shard
                    .iter()
                    .filter(|(_, slot)| slot.status == WindowStatus::Closing)
                    .map(|(k, s)| (k.clone(), s.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by(|a, b| (a.1.end, &a.0).cmp(&(b.1.end, &b.0)));
        out
    }

    /// Drop a closing window after the sink acknowledged it. Open windows are
    /// never released.
    pub fn release(&self, key: &WindowKey) -> bool {
        let removed = {
            let mut shard = self.shard(&key.key);
            match shard.get(key) {
                Some(slot) if slot.status == WindowStatus::Closing => shard.remove(key),
                _ => None,
            }
        };
        match removed {
            Some(slot) => {
                self.retire(key, slot.applied);
                true
            }
            None => false,
        }
    }

    pub(crate) fn retire(&self, key: &WindowKey, applied: BTreeSet<SourcePosition>) {
        if !self.dedup || applied.is_empty() {
            return;
        }
        let mut retired = self.retired_lock();
        for position in applied {
            retired.insert(RetiredPosition {
                position,
                window: key.clone(),
            });
        }
    }

    /// Forget dedup positions whose offsets are committed; they can no longer
    /// be replayed.
    pub fn prune_committed(&self, committed: &BTreeMap<u32, u64>) {
        for shard in &self.shards {
            let mut shard = shard.lock().expect("state shard lock poisoned");
            for slot in shard.values_mut() {
                slot.prune(committed);
            }
        }
        self.retired_lock()
            .retain(|r| !is_committed(committed, r.position));
    }

    pub fn open_windows(&self) -> usize {
        self.count(WindowStatus::Open)
    }

    pub fn closing_windows(&self) -> usize {
        self.count(WindowStatus::Closing)
    }

    pub fn snapshot(&self) -> (Vec<WindowState>, Vec<RetiredPosition>) {
        let mut windows: Vec<WindowState> = self
            .shards
            .iter()
            .flat_map(|shard| {
                let shard = shard.lock().expect("state shard lock poisoned");
                shard
                    .iter()
                    .map(|(k, s)| WindowState::from_slot(k, s))
                    .collect::<Vec<_>>()
            })
            .collect();
        windows.sort_by(|a, b| (&a.key, a.start).cmp(&(&b.key, b.start)));
        let retired = self.retired_lock().iter().cloned().collect();
        (windows, retired)
    }

    /// Replace all state with a checkpoint snapshot.
    pub fn restore(&self, windows: Vec<WindowState>, retired: Vec<RetiredPosition>) {
        for shard in &self.shards {
            shard.lock().expect("state shard lock poisoned").clear();
        }
        for state in windows {
            let (key, slot) = state.into_slot();
            self.shard(&key.key).insert(key, slot);
        }
        *self.retired_lock() = retired.into_iter().collect();
    }

    fn count(&self, status: WindowStatus) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .expect("state shard lock poisoned")
                    .values()
                    .filter(|s| s.status == status)
                    .count()
            })
            .sum()
    }

    fn shard(&self, key: &str) -> std::sync::MutexGuard<'_, Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        self.shards[idx].lock().expect("state shard lock poisoned")
    }

    fn retired_lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<RetiredPosition>> {
        self.retired.lock().expect("retired positions lock poisoned")
    }
}
