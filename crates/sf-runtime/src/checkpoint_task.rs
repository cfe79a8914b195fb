use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use sf_core::checkpoint::CheckpointCoordinator;

use crate::metrics::RuntimeMetrics;
use crate::worker_task::CheckpointTrigger;

/// Checkpoint every `interval`, or sooner when the record-count trigger
/// fires, until cancelled. The final checkpoint is taken by the lifecycle
/// once upstream tasks have drained.
#[tracing::instrument(name = "checkpoint", skip_all)]
pub(crate) async fn run_checkpoints(
    coordinator: Arc<CheckpointCoordinator>,
    metrics: Arc<RuntimeMetrics>,
    trigger: Arc<CheckpointTrigger>,
    interval: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
            _ = trigger.fired() => tick.reset(),
        }
        take_checkpoint(&coordinator, &metrics, &trigger).await;
    }
    Ok(())
}

/// One checkpoint attempt. A failure has already halted intake inside the
/// coordinator; it is logged here and retried on the next tick.
pub(crate) async fn take_checkpoint(
    coordinator: &CheckpointCoordinator,
    metrics: &RuntimeMetrics,
    trigger: &CheckpointTrigger,
) -> bool {
    trigger.reset();
    match coordinator.checkpoint().await {
        Ok(report) => {
            metrics.add_checkpoint(report.elapsed);
            sf_debug!(
                store,
                id = report.id,
                windows = report.windows,
                offsets = ?report.offsets,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "checkpoint written"
            );
            true
        }
        Err(e) => {
            metrics.inc_checkpoint_failure();
            sf_error!(store, error = %e, "checkpoint failed, intake halted");
            false
        }
    }
}
