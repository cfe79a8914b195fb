use std::sync::Arc;

use sf_core::dead_letter::{DeadLetterEntry, DeadLetterHandler, ErrorKind};
use sf_core::gate::IntakeGate;
use sf_core::offsets::OffsetTracker;
use sf_core::queue::{EnqueueOutcome, IngestionQueue};
use sf_core::record::{QueuedRecord, Record};
use sf_core::window::WindowManager;

use crate::metrics::RuntimeMetrics;

/// Handles shared by every pipeline task.
#[derive(Clone)]
pub(crate) struct PipelineContext {
    pub queue: Arc<IngestionQueue>,
    pub tracker: Arc<OffsetTracker>,
    pub manager: Arc<WindowManager>,
    pub gate: Arc<IntakeGate>,
    pub dead_letter: Arc<DeadLetterHandler>,
    pub metrics: Arc<RuntimeMetrics>,
    /// Send evicted/rejected records to the dead-letter handler.
    pub forward_dropped: bool,
}

/// Whether the queue took the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Admitted,
    /// A record was displaced by the backpressure policy.
    Displaced,
    /// The queue is closed; the record stays in flight for replay.
    Closed,
}

impl PipelineContext {
    /// Enqueue `item`, applying the configured backpressure strategy and
    /// disposing of whichever record it displaces.
    pub async fn admit(&self, item: QueuedRecord) -> Admission {
        match self.queue.enqueue(item).await {
            EnqueueOutcome::Accepted => {
                self.metrics.inc_enqueued();
                Admission::Admitted
            }
            EnqueueOutcome::Evicted(oldest) => {
                self.metrics.inc_enqueued();
                self.metrics.inc_evicted();
                self.drop_record(oldest, "evicted from a full queue");
                Admission::Displaced
            }
            EnqueueOutcome::Rejected(_) if self.queue.is_closed() => Admission::Closed,
            EnqueueOutcome::Rejected(newest) => {
                self.metrics.inc_rejected();
                self.drop_record(newest, "rejected by a full queue");
                Admission::Displaced
            }
        }
    }

    fn drop_record(&self, item: QueuedRecord, why: &str) {
        let position = item.record.position;
        if self.forward_dropped {
            sf_debug!(pipe, position = %position, "{why}, forwarding to dead letter");
            self.dead_letter(item.record, ErrorKind::Dropped, why, item.retry_count);
        } else {
            sf_debug!(pipe, position = %position, "{why}");
            self.tracker.complete(position);
        }
    }

    /// Hand a failed record to the dead-letter handler. Its offset completes
    /// once the handler has persisted it.
    pub fn dead_letter(&self, record: Record, kind: ErrorKind, message: &str, retry_count: u32) {
        self.metrics.inc_dead_letter(kind);
        let position = record.position;
        let entry = DeadLetterEntry::record(record, kind, message, retry_count);
        if !self.dead_letter.add(entry) {
            sf_warn!(
                pipe,
                position = %position,
                kind = %kind,
                "dead-letter handler stopped, record left for replay"
            );
        }
    }
}
