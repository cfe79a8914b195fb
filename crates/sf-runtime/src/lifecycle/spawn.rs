use std::net::SocketAddr;
use std::sync::Arc;

use orion_error::ErrorOwe;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sf_config::EngineConfig;
use sf_core::checkpoint::CheckpointCoordinator;
use sf_core::dead_letter::DeadLetterEntry;
use sf_core::source::Source;
use sf_core::transform::TransformPipeline;
use sf_core::window::Emission;

use crate::checkpoint_task;
use crate::closer_task::{self, SinkTargets};
use crate::context::PipelineContext;
use crate::dead_letter_task;
use crate::error::RuntimeResult;
use crate::metrics::run_metrics_task;
use crate::source_task;
use crate::worker_task::{self, CheckpointTrigger};

use super::types::TaskGroup;

// ---------------------------------------------------------------------------
// Phase 2: task spawn helpers — each returns its TaskGroup
// ---------------------------------------------------------------------------

/// Bind the Prometheus listener and spawn the exporter. `None` when metrics
/// are disabled.
pub(super) async fn spawn_metrics_task(
    config: &EngineConfig,
    ctx: &PipelineContext,
    cancel: CancellationToken,
) -> RuntimeResult<Option<(SocketAddr, TaskGroup)>> {
    if !config.metrics.enabled {
        return Ok(None);
    }
    let listener = TcpListener::bind(config.metrics.prometheus_listen.as_str())
        .await
        .owe_sys()?;
    let listen_addr = listener.local_addr().owe_sys()?;
    let metrics = Arc::clone(&ctx.metrics);
    let queue = Arc::clone(&ctx.queue);
    let manager = Arc::clone(&ctx.manager);
    let metrics_config = config.metrics.clone();
    let mut group = TaskGroup::with_cancel("metrics", cancel.clone());
    group.push(tokio::spawn(async move {
        run_metrics_task(metrics, metrics_config, listener, queue, manager, cancel).await
    }));
    Ok(Some((listen_addr, group)))
}

/// Spawn the periodic / record-count checkpoint task.
pub(super) fn spawn_checkpoint_task(
    config: &EngineConfig,
    ctx: &PipelineContext,
    coordinator: &Arc<CheckpointCoordinator>,
    trigger: &Arc<CheckpointTrigger>,
    cancel: CancellationToken,
) -> TaskGroup {
    let coordinator = Arc::clone(coordinator);
    let metrics = Arc::clone(&ctx.metrics);
    let trigger = Arc::clone(trigger);
    let interval = config.checkpoint.interval.as_duration();
    let mut group = TaskGroup::with_cancel("checkpoint", cancel.clone());
    group.push(tokio::spawn(async move {
        checkpoint_task::run_checkpoints(coordinator, metrics, trigger, interval, cancel).await
    }));
    group
}

/// Spawn the dead-letter consumer.
pub(super) fn spawn_dead_letter_task(
    ctx: &PipelineContext,
    rx: mpsc::UnboundedReceiver<DeadLetterEntry>,
    cancel: CancellationToken,
) -> TaskGroup {
    let ctx = ctx.clone();
    let mut group = TaskGroup::with_cancel("dead_letter", cancel.clone());
    group.push(tokio::spawn(async move {
        dead_letter_task::run_dead_letter(ctx, rx, cancel).await
    }));
    group
}

/// Spawn the window closer and sink writer.
pub(super) fn spawn_closer_task(
    config: &EngineConfig,
    ctx: &PipelineContext,
    targets: SinkTargets,
    recovered: Vec<Emission>,
    cancel: CancellationToken,
) -> TaskGroup {
    let ctx = ctx.clone();
    let linger = config.sink.linger.as_duration();
    let mut group = TaskGroup::with_cancel("closer", cancel.clone());
    group.push(tokio::spawn(async move {
        closer_task::run_closer(ctx, targets, recovered, linger, cancel).await
    }));
    group
}

/// Spawn `parallelism` transform workers. They stop on their own once the
/// queue is closed and drained.
pub(super) fn spawn_workers(
    config: &EngineConfig,
    ctx: &PipelineContext,
    transform: &Arc<TransformPipeline>,
    trigger: &Arc<CheckpointTrigger>,
) -> TaskGroup {
    let mut group = TaskGroup::new("workers");
    for id in 0..config.pipeline.parallelism.max(1) {
        let ctx = ctx.clone();
        let transform = Arc::clone(transform);
        let trigger = Arc::clone(trigger);
        group.push(tokio::spawn(async move {
            worker_task::run_worker(id, ctx, transform, trigger).await
        }));
    }
    group
}

/// Spawn the source poller. It follows the root token so a shutdown request
/// stops intake first.
pub(super) fn spawn_source_task(
    config: &EngineConfig,
    ctx: &PipelineContext,
    source: Arc<dyn Source>,
    cancel: CancellationToken,
) -> TaskGroup {
    let ctx = ctx.clone();
    let batch_size = config.pipeline.poll_batch_size.max(1);
    let poll_interval = config.pipeline.poll_interval.as_duration();
    let mut group = TaskGroup::with_cancel("source", cancel.clone());
    group.push(tokio::spawn(async move {
        source_task::run_source(ctx, source, batch_size, poll_interval, cancel).await
    }));
    group
}
