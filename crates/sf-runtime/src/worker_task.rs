use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::Notify;

use sf_core::dead_letter::ErrorKind;
use sf_core::record::{QueuedRecord, Record};
use sf_core::transform::{TransformOutcome, TransformPipeline};

use crate::context::PipelineContext;

/// Record-count trigger shared between the workers and the checkpoint task.
pub(crate) struct CheckpointTrigger {
    every: u64,
    since_last: AtomicU64,
    notify: Notify,
}

impl CheckpointTrigger {
    /// `every == 0` disables the trigger.
    pub fn new(every: u64) -> Self {
        Self {
            every,
            since_last: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn record_merged(&self) {
        if self.every == 0 {
            return;
        }
        let n = self.since_last.fetch_add(1, Ordering::Relaxed) + 1;
        if n == self.every {
            self.notify.notify_one();
        }
    }

    pub fn reset(&self) {
        self.since_last.store(0, Ordering::Relaxed);
    }

    pub async fn fired(&self) {
        self.notify.notified().await;
    }
}

/// Take records off the queue until it is closed and drained.
#[tracing::instrument(name = "worker", skip_all, fields(worker = id))]
pub(crate) async fn run_worker(
    id: usize,
    ctx: PipelineContext,
    transform: Arc<TransformPipeline>,
    trigger: Arc<CheckpointTrigger>,
) -> anyhow::Result<()> {
    let mut processed = 0u64;
    while let Some(item) = ctx.queue.dequeue().await {
        process(&ctx, &transform, &trigger, item).await;
        processed += 1;
    }
    sf_debug!(pipe, processed, "worker drained");
    Ok(())
}

async fn process(
    ctx: &PipelineContext,
    transform: &TransformPipeline,
    trigger: &CheckpointTrigger,
    item: QueuedRecord,
) {
    let started = Instant::now();
    let report = transform.process(&item).await;
    ctx.metrics.observe_transform(started.elapsed());
    ctx.metrics.add_transform_retries(report.retries);

    match report.outcome {
        TransformOutcome::Emit(record) => ingest(ctx, trigger, record, &item).await,
        TransformOutcome::Filtered { stage } => {
            sf_trace!(pipe, position = %item.record.position, stage = %stage, "filtered");
            ctx.metrics.inc_filtered();
            ctx.tracker.complete(item.record.position);
        }
        TransformOutcome::Failed {
            record,
            stage,
            error,
            retry_count,
        } => {
            let kind = if error.is_retryable() {
                ErrorKind::Retryable
            } else {
                ErrorKind::Permanent
            };
            sf_debug!(
                pipe,
                position = %record.position,
                stage = %stage,
                retry_count,
                error = %error,
                "transform failed"
            );
            ctx.dead_letter(record, kind, &format!("stage {stage}: {error}"), retry_count);
        }
    }
}

async fn ingest(ctx: &PipelineContext, trigger: &CheckpointTrigger, record: Record, item: &QueuedRecord) {
    let position = record.position;
    match ctx.manager.ingest(&record).await {
        Ok(report) => {
            ctx.metrics.add_ingest_report(&report);
            if report.merged > 0 || report.corrected > 0 {
                trigger.record_merged();
            }
            if report.is_late() {
                let windows: Vec<String> = report
                    .late
                    .iter()
                    .map(|w| format!("[{}, {})", w.start, ctx.manager.assigner().end_of(w.start)))
                    .collect();
                sf_debug!(pipe, position = %position, windows = ?windows, "late record");
                ctx.dead_letter(
                    record,
                    ErrorKind::Late,
                    &format!("window {} already closed", windows.join(", ")),
                    item.retry_count,
                );
            } else {
                ctx.tracker.complete(position);
            }
        }
        Err(e) => {
            sf_debug!(pipe, position = %position, error = %e, "merge rejected");
            ctx.dead_letter(record, ErrorKind::Permanent, &e.to_string(), item.retry_count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_fires_once_per_threshold() {
        let trigger = Arc::new(CheckpointTrigger::new(3));
        trigger.record_merged();
        trigger.record_merged();
        assert!(
            tokio::time::timeout(Duration::from_millis(20), trigger.fired())
                .await
                .is_err()
        );
        trigger.record_merged();
        tokio::time::timeout(Duration::from_secs(1), trigger.fired())
            .await
            .unwrap();
        trigger.reset();
        trigger.record_merged();
        assert!(
            tokio::time::timeout(Duration::from_millis(20), trigger.fired())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn disabled_trigger_never_fires() {
        let trigger = CheckpointTrigger::new(0);
        for _ in 0..10 {
            trigger.record_merged();
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(20), trigger.fired())
                .await
                .is_err()
        );
    }
}
