use std::sync::Arc;

use orion_error::ErrorOweBase;
use orion_error::prelude::*;
use tokio::sync::Semaphore;

use sf_config::EngineConfig;
use sf_core::checkpoint::CheckpointCoordinator;
use sf_core::dead_letter::DeadLetterHandler;
use sf_core::gate::IntakeGate;
use sf_core::offsets::OffsetTracker;
use sf_core::queue::IngestionQueue;
use sf_core::sink::SinkWriter;
use sf_core::transform::TransformPipeline;
use sf_core::window::WindowManager;

use crate::closer_task::SinkTargets;
use crate::context::PipelineContext;
use crate::error::{RuntimeReason, RuntimeResult};
use crate::metrics::RuntimeMetrics;
use crate::worker_task::CheckpointTrigger;

use super::types::{BootstrapData, Collaborators};

/// Key shards per worker in the keyed state store.
const SHARDS_PER_WORKER: usize = 4;

// ---------------------------------------------------------------------------
// Phase 1: bootstrap — build components, then recover from the last checkpoint
// ---------------------------------------------------------------------------

/// Resolve the accumulator, build the shared pipeline components and restore
/// state from the newest durable checkpoint.
pub(super) async fn bootstrap(
    config: &EngineConfig,
    parts: Collaborators,
) -> RuntimeResult<BootstrapData> {
    // 1. Accumulator from the registry
    let accumulator = parts
        .accumulators
        .resolve(&config.accumulator)
        .owe(RuntimeReason::Bootstrap)?;
    if !accumulator.replay_safe() && !config.accumulator.dedup_by_offset {
        return StructError::from(RuntimeReason::Bootstrap)
            .with_detail(format!(
                "accumulator '{}' does not tolerate replay and requires accumulator.dedup_by_offset = true",
                accumulator.name()
            ))
            .err();
    }
    sf_debug!(
        conf,
        accumulator = accumulator.name(),
        dedup = config.accumulator.dedup_by_offset,
        "accumulator resolved"
    );

    // 2. Window manager over a sharded keyed store
    let shards = config.pipeline.parallelism.max(1) * SHARDS_PER_WORKER;
    let manager = Arc::new(WindowManager::new(
        &config.window,
        accumulator,
        config.accumulator.dedup_by_offset,
        shards,
    ));

    // 3. Shared intake plumbing
    let queue = Arc::new(IngestionQueue::new(
        config.queue.capacity,
        config.queue.backpressure,
    ));
    let tracker = Arc::new(OffsetTracker::new());
    let gate = Arc::new(IntakeGate::new());
    let metrics = Arc::new(RuntimeMetrics::new());
    let (handler, dead_letter_rx) = DeadLetterHandler::new(&config.dead_letter, parts.dead_letters);

    // 4. Recovery
    let coordinator = Arc::new(CheckpointCoordinator::new(
        parts.checkpoints,
        Arc::clone(&manager),
        Arc::clone(&tracker),
        Arc::clone(&parts.source),
        Arc::clone(&gate),
    ));
    let recovery = coordinator.recover().await.owe(RuntimeReason::Recovery)?;
    match &recovery {
        Some(report) => sf_info!(
            store,
            checkpoint = report.checkpoint_id,
            windows = report.windows,
            pending = report.pending.len(),
            offsets = ?report.offsets,
            "resumed from checkpoint"
        ),
        None => sf_info!(store, "no checkpoint, starting fresh"),
    }

    // 5. Transform chain and sink writers
    let transform = parts
        .transform
        .unwrap_or_else(|| TransformPipeline::from_config(&config.pipeline, None));
    sf_debug!(conf, stages = ?transform.stage_names(), "transform pipeline built");

    let targets = SinkTargets {
        main: SinkWriter::from_config(&config.sink, parts.sink),
        late: parts
            .late_sink
            .map(|sink| SinkWriter::from_config(&config.sink, sink)),
        batch_size: config.sink.batch_size.max(1),
        fanout: Arc::new(Semaphore::new(config.sink.fanout.max(1))),
    };

    let ctx = PipelineContext {
        queue,
        tracker,
        manager,
        gate,
        dead_letter: Arc::new(handler),
        metrics,
        forward_dropped: config.queue.forward_dropped,
    };

    Ok(BootstrapData {
        ctx,
        source: parts.source,
        coordinator,
        transform: Arc::new(transform),
        targets,
        trigger: Arc::new(CheckpointTrigger::new(config.checkpoint.every_records)),
        dead_letter_rx,
        recovery,
    })
}
