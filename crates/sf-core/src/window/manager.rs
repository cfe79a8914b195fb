use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sf_config::{LateDataPolicy, WindowConfig};
use tokio::sync::{RwLock, RwLockWriteGuard};

use super::assigner::WindowAssigner;
use super::store::{
    KeyedStateStore, MergeOutcome, RetiredPosition, WindowSlot, WindowState, WindowStatus,
};
use super::watermark::WatermarkTracker;
use crate::accumulator::Accumulator;
use crate::error::CoreResult;
use crate::record::{Record, WindowKey, WindowResult};

// ---------------------------------------------------------------------------
// Reports and emissions
// ---------------------------------------------------------------------------

/// How one record was applied across the windows it maps to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub merged: usize,
    pub duplicates: usize,
    /// Windows whose late-output correction absorbed the record.
    pub corrected: usize,
    /// Closed windows the record targeted under the `drop` policy.
    pub late: Vec<WindowKey>,
}

impl IngestReport {
    pub fn is_late(&self) -> bool {
        !self.late.is_empty()
    }

    /// The record changed nothing because every target already had it.
    pub fn is_duplicate(&self) -> bool {
        self.duplicates > 0 && self.merged == 0 && self.corrected == 0 && self.late.is_empty()
    }
}

/// Identity of a finalized result awaiting sink acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EmissionId {
    Window(WindowKey),
    Correction(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub id: EmissionId,
    pub result: WindowResult,
}

impl Emission {
    pub fn is_correction(&self) -> bool {
        matches!(self.id, EmissionId::Correction(_))
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionState {
    pub id: u64,
    pub window: WindowState,
}

/// Everything the window manager needs to resume: window slots, pending
/// corrections, dedup history and event-time progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub window_states: Vec<WindowState>,
    #[serde(default)]
    pub corrections: Vec<CorrectionState>,
    #[serde(default)]
    pub retired: Vec<RetiredPosition>,
    /// Highest event time observed per partition.
    #[serde(default)]
    pub watermarks: BTreeMap<u32, i64>,
    /// Windows ending at or before this time are final.
    #[serde(default)]
    pub closed_through: Option<i64>,
}

// ---------------------------------------------------------------------------
// Epoch barrier
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Epoch {
    closed_through: Option<i64>,
}

impl Epoch {
    fn is_closed(&self, end: i64) -> bool {
        self.closed_through.is_some_and(|c| end <= c)
    }
}

/// Exclusive hold on the window manager: no merge or close sweep runs while
/// it is alive.
pub struct EpochGuard<'a> {
    guard: RwLockWriteGuard<'a, Epoch>,
}

impl EpochGuard<'_> {
    pub fn closed_through(&self) -> Option<i64> {
        self.guard.closed_through
    }
}

// ---------------------------------------------------------------------------
// Late-output corrections
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CorrectionBook {
    open: HashMap<WindowKey, u64>,
    slots: BTreeMap<u64, (WindowKey, WindowSlot)>,
    next_id: u64,
}

impl CorrectionBook {
    fn merge(
        &mut self,
        key: WindowKey,
        end: i64,
        record: &Record,
        accumulator: &Accumulator,
        dedup: bool,
    ) -> CoreResult<MergeOutcome> {
        if dedup
            && self
                .slots
                .values()
                .any(|(k, slot)| *k == key && slot.applied.contains(&record.position))
        {
            return Ok(MergeOutcome::Duplicate);
        }
        if let Some(id) = self.open.get(&key)
            && let Some((_, slot)) = self.slots.get_mut(id)
        {
            return slot.fold(accumulator, record, dedup);
        }
        let mut slot = WindowSlot::new(end, accumulator.initial());
        let outcome = slot.fold(accumulator, record, dedup)?;
        let id = self.next_id;
        self.next_id += 1;
        self.open.insert(key.clone(), id);
        self.slots.insert(id, (key, slot));
        Ok(outcome)
    }

    /// Freeze every open correction and return it for emission.
    fn seal(&mut self, accumulator: &Accumulator) -> Vec<Emission> {
        let mut out = Vec::new();
        for (_, id) in self.open.drain() {
            if let Some((key, slot)) = self.slots.get_mut(&id) {
                slot.status = WindowStatus::Closing;
                out.push(emission(EmissionId::Correction(id), key, slot, accumulator));
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    fn closing(&self, accumulator: &Accumulator) -> Vec<Emission> {
        self.slots
            .iter()
            .filter(|(_, (_, slot))| slot.status == WindowStatus::Closing)
            .map(|(id, (key, slot))| emission(EmissionId::Correction(*id), key, slot, accumulator))
            .collect()
    }

    fn release(&mut self, id: u64) -> Option<(WindowKey, WindowSlot)> {
        match self.slots.get(&id) {
            Some((_, slot)) if slot.status == WindowStatus::Closing => self.slots.remove(&id),
            _ => None,
        }
    }

    fn snapshot(&self) -> Vec<CorrectionState> {
        self.slots
            .iter()
            .map(|(id, (key, slot))| CorrectionState {
                id: *id,
                window: WindowState::from_slot(key, slot),
            })
            .collect()
    }

    fn restore(&mut self, states: Vec<CorrectionState>) {
        self.open.clear();
        self.slots.clear();
        self.next_id = 0;
        for state in states {
            let (key, slot) = state.window.into_slot();
            if slot.status == WindowStatus::Open {
                self.open.insert(key.clone(), state.id);
            }
            self.next_id = self.next_id.max(state.id + 1);
            self.slots.insert(state.id, (key, slot));
        }
    }

    fn prune(&mut self, committed: &BTreeMap<u32, u64>) {
        for (_, slot) in self.slots.values_mut() {
            slot.applied
                .retain(|p| !super::store::is_committed(committed, *p));
        }
    }
}

fn emission(
    id: EmissionId,
    key: &WindowKey,
    slot: &WindowSlot,
    accumulator: &Accumulator,
) -> Emission {
    let correction = matches!(id, EmissionId::Correction(_));
    Emission {
        id,
        result: WindowResult {
            key: key.key.clone(),
            window_start: key.start,
            window_end: slot.end,
            value: accumulator.finalize(&slot.acc),
            record_count: slot.record_count,
            correction,
        },
    }
}

// ---------------------------------------------------------------------------
// WindowManager
// ---------------------------------------------------------------------------

/// Assigns records to windows, merges them into the keyed state store and
/// decides, from watermark progress, when windows become final.
///
/// Merges hold the epoch lock shared; close sweeps and checkpoint snapshots
/// hold it exclusively, so both observe a stable state across all shards.
pub struct WindowManager {
    assigner: WindowAssigner,
    late_policy: LateDataPolicy,
    store: KeyedStateStore,
    watermarks: Mutex<WatermarkTracker>,
    epoch: RwLock<Epoch>,
    corrections: Mutex<CorrectionBook>,
}

impl WindowManager {
    pub fn new(config: &WindowConfig, accumulator: Accumulator, dedup: bool, shards: usize) -> Self {
        Self {
            assigner: WindowAssigner::from_config(config),
            late_policy: config.late_data_policy,
            store: KeyedStateStore::new(accumulator, dedup, shards),
            watermarks: Mutex::new(WatermarkTracker::new(
                config.allowed_lateness.as_millis_i64(),
            )),
            epoch: RwLock::new(Epoch::default()),
            corrections: Mutex::new(CorrectionBook::default()),
        }
    }

    pub fn assigner(&self) -> &WindowAssigner {
        &self.assigner
    }

    pub fn store(&self) -> &KeyedStateStore {
        &self.store
    }

    pub fn late_policy(&self) -> LateDataPolicy {
        self.late_policy
    }

    /// Apply `record` to every window it belongs to, then advance its
    /// partition's watermark.
    ///
    /// A target window that is already final is late: with the `correct`
    /// policy the record feeds that window's correction, otherwise the
    /// window is listed in [`IngestReport::late`]. Positions already applied
    /// are reported as duplicates and change nothing.
    pub async fn ingest(&self, record: &Record) -> CoreResult<IngestReport> {
        let epoch = self.epoch.read().await;
        let mut report = IngestReport::default();

        for start in self.assigner.assign(record.event_time) {
            let key = WindowKey::new(record.key.clone(), start);
            let end = self.assigner.end_of(start);
            if epoch.is_closed(end) {
                self.route_late(key, end, record, &mut report)?;
                continue;
            }
            match self.store.merge(&key, end, record)? {
                MergeOutcome::Merged(_) => report.merged += 1,
                MergeOutcome::Duplicate => report.duplicates += 1,
                MergeOutcome::Finalized => self.route_late(key, end, record, &mut report)?,
            }
        }

        // Lateness is judged against the watermark before this record.
        self.watermarks_lock()
            .observe(record.position.partition, record.event_time);
        Ok(report)
    }

    fn route_late(
        &self,
        key: WindowKey,
        end: i64,
        record: &Record,
        report: &mut IngestReport,
    ) -> CoreResult<()> {
        if self.store.was_applied(&key, record.position) {
            report.duplicates += 1;
            return Ok(());
        }
        match self.late_policy {
            LateDataPolicy::Drop => report.late.push(key),
            LateDataPolicy::Correct => {
                let outcome = self.corrections_lock().merge(
                    key.clone(),
                    end,
                    record,
                    self.store.accumulator(),
                    self.store.dedup(),
                )?;
                match outcome {
                    MergeOutcome::Merged(_) => report.corrected += 1,
                    MergeOutcome::Duplicate => report.duplicates += 1,
                    MergeOutcome::Finalized => report.late.push(key),
                }
            }
        }
        Ok(())
    }

    /// Close every window the global watermark has passed, seal pending
    /// corrections, and return the finalized results for the sink.
    ///
    /// Closed windows stay in the store as CLOSING until [`release`] is
    /// called with their ids.
    ///
    /// [`release`]: Self::release
    pub async fn close_ready(&self) -> Vec<Emission> {
        let mut epoch = self.epoch.write().await;
        let mut emissions = Vec::new();

        if let Some(watermark) = self.watermark() {
            let accumulator = self.store.accumulator();
            for (key, slot) in self.store.close_due(watermark) {
                emissions.push(emission(
                    EmissionId::Window(key.clone()),
                    &key,
                    &slot,
                    accumulator,
                ));
            }
            epoch.closed_through = Some(epoch.closed_through.map_or(watermark, |c| c.max(watermark)));
        }
        emissions.extend(self.corrections_lock().seal(self.store.accumulator()));
        emissions
    }

    /// Every finalized result not yet acknowledged by the sink, for
    /// re-emission after recovery.
    pub fn pending(&self) -> Vec<Emission> {
        let accumulator = self.store.accumulator();
        let mut out: Vec<Emission> = self
            .store
            .closing()
            .into_iter()
            .map(|(key, slot)| emission(EmissionId::Window(key.clone()), &key, &slot, accumulator))
            .collect();
        out.extend(self.corrections_lock().closing(accumulator));
        out
    }

    /// Drop acknowledged results; their windows become CLOSED. Returns the
    /// number released.
    ///
    /// Runs inside the epoch so a snapshot never sees a window removed
    /// before its positions are retired.
    pub async fn release(&self, ids: &[EmissionId]) -> usize {
        let _epoch = self.epoch.read().await;
        let mut released = 0;
        for id in ids {
            match id {
                EmissionId::Window(key) => {
                    if self.store.release(key) {
                        released += 1;
                    }
                }
                EmissionId::Correction(id) => {
                    let removed = self.corrections_lock().release(*id);
                    if let Some((key, slot)) = removed {
                        self.store.retire(&key, slot.applied);
                        released += 1;
                    }
                }
            }
        }
        released
    }

    /// Stop merges and close sweeps at an epoch boundary. In-flight merges
    /// finish first.
    pub async fn pause(&self) -> EpochGuard<'_> {
        EpochGuard {
            guard: self.epoch.write().await,
        }
    }

    /// Consistent copy of all state, taken under the epoch barrier.
    pub fn snapshot(&self, epoch: &EpochGuard<'_>) -> StateSnapshot {
        let (window_states, retired) = self.store.snapshot();
        StateSnapshot {
            window_states,
            corrections: self.corrections_lock().snapshot(),
            retired,
            watermarks: self.watermarks_lock().snapshot(),
            closed_through: epoch.closed_through(),
        }
    }

    /// Drop dedup history for committed offsets.
    pub fn prune_committed(&self, _epoch: &EpochGuard<'_>, committed: &BTreeMap<u32, u64>) {
        self.store.prune_committed(committed);
        self.corrections_lock().prune(committed);
    }

    /// Replace all state with a checkpoint snapshot.
    pub async fn restore(&self, snapshot: StateSnapshot) {
        let mut epoch = self.epoch.write().await;
        self.store.restore(snapshot.window_states, snapshot.retired);
        self.corrections_lock().restore(snapshot.corrections);
        self.watermarks_lock().restore(snapshot.watermarks);
        epoch.closed_through = snapshot.closed_through;
    }

    pub fn watermark(&self) -> Option<i64> {
        self.watermarks_lock().global()
    }

    pub fn open_windows(&self) -> usize {
        self.store.open_windows()
    }

    pub fn closing_windows(&self) -> usize {
        self.store.closing_windows()
    }

    fn watermarks_lock(&self) -> std::sync::MutexGuard<'_, WatermarkTracker> {
        self.watermarks.lock().expect("watermark lock poisoned")
    }

    fn corrections_lock(&self) -> std::sync::MutexGuard<'_, CorrectionBook> {
        self.corrections.lock().expect("correction lock poisoned")
    }
}
