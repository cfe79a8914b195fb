mod bootstrap;
mod signal;
mod spawn;
mod types;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use orion_error::op_context;
use orion_error::prelude::*;
use tokio_util::sync::CancellationToken;

use sf_config::EngineConfig;
use sf_core::checkpoint::CheckpointCoordinator;
use sf_core::dead_letter::DeadLetterStats;
use sf_core::gate::GateState;

use crate::checkpoint_task::take_checkpoint;
use crate::context::PipelineContext;
use crate::error::RuntimeResult;
use crate::metrics::RuntimeMetrics;
use crate::worker_task::CheckpointTrigger;

// Re-export public API
pub use signal::wait_for_signal;
pub use types::Collaborators;

use bootstrap::bootstrap;
use spawn::{
    spawn_checkpoint_task, spawn_closer_task, spawn_dead_letter_task, spawn_metrics_task,
    spawn_source_task, spawn_workers,
};
use types::TaskGroup;

// ---------------------------------------------------------------------------
// Pipeline — the top-level lifecycle handle
// ---------------------------------------------------------------------------

/// Manages the full lifecycle of a running pipeline: bootstrap and
/// recovery, run, and graceful shutdown.
///
/// Task groups are stored in start order and joined in reverse (LIFO)
/// during [`wait`](Self::wait). The source stops first and the queue is
/// closed behind it; workers drain what is left within the drain timeout;
/// the closer flushes every window the final watermark allows; the
/// dead-letter handler persists what it holds; and a final checkpoint is
/// taken before the metrics exporter stops.
pub struct Pipeline {
    cancel: CancellationToken,
    groups: Vec<TaskGroup>,
    ctx: PipelineContext,
    coordinator: Arc<CheckpointCoordinator>,
    trigger: Arc<CheckpointTrigger>,
    drain_timeout: Duration,
    recovered_checkpoint: Option<u64>,
    metrics_addr: Option<SocketAddr>,
}

impl Pipeline {
    /// Build every component, recover from the newest checkpoint and spawn
    /// the task groups.
    #[tracing::instrument(
        name = "engine.start",
        skip_all,
        fields(parallelism = config.pipeline.parallelism, accumulator = %config.accumulator.kind)
    )]
    pub async fn start(config: EngineConfig, parts: Collaborators) -> RuntimeResult<Self> {
        let mut op = op_context!("pipeline-bootstrap").with_auto_log();
        op.record("accumulator", config.accumulator.kind.as_str());
        op.record("backpressure", config.queue.backpressure.as_str());

        // Phase 1: build components and recover state
        let data = bootstrap(&config, parts).await?;
        let recovered_checkpoint = data.recovery.as_ref().map(|r| r.checkpoint_id);
        let recovered = data.recovery.map(|r| r.pending).unwrap_or_default();

        // Phase 2: spawn task groups
        // (start order: metrics → checkpoint → dead_letter → closer → workers → source)
        let cancel = CancellationToken::new();
        let mut groups: Vec<TaskGroup> = Vec::with_capacity(6);

        let mut metrics_addr = None;
        if let Some((addr, group)) =
            spawn_metrics_task(&config, &data.ctx, CancellationToken::new()).await?
        {
            metrics_addr = Some(addr);
            groups.push(group);
        }
        groups.push(spawn_checkpoint_task(
            &config,
            &data.ctx,
            &data.coordinator,
            &data.trigger,
            CancellationToken::new(),
        ));
        groups.push(spawn_dead_letter_task(
            &data.ctx,
            data.dead_letter_rx,
            CancellationToken::new(),
        ));
        groups.push(spawn_closer_task(
            &config,
            &data.ctx,
            data.targets,
            recovered,
            CancellationToken::new(),
        ));
        groups.push(spawn_workers(
            &config,
            &data.ctx,
            &data.transform,
            &data.trigger,
        ));
        groups.push(spawn_source_task(
            &config,
            &data.ctx,
            data.source,
            cancel.child_token(),
        ));

        sf_info!(
            sys,
            workers = config.pipeline.parallelism,
            queue_capacity = config.queue.capacity,
            recovered_checkpoint = ?recovered_checkpoint,
            "pipeline started"
        );
        op.mark_suc();
        Ok(Self {
            cancel,
            groups,
            ctx: data.ctx,
            coordinator: data.coordinator,
            trigger: data.trigger,
            drain_timeout: config.shutdown.drain_timeout.as_duration(),
            recovered_checkpoint,
            metrics_addr,
        })
    }

    /// Request graceful shutdown: intake stops immediately.
    pub fn shutdown(&self) {
        sf_info!(sys, "initiating graceful shutdown");
        self.cancel.cancel();
    }

    /// Wait for all task groups to complete after shutdown.
    ///
    /// Groups are joined in LIFO order (reverse of start order):
    /// source → workers → closer → dead_letter → checkpoint → metrics.
    /// A failing group does not stop the sequence; the first error is
    /// returned once every group has been joined and the final checkpoint
    /// attempted.
    pub async fn wait(mut self) -> RuntimeResult<()> {
        let mut first_err = None;
        while let Some(group) = self.groups.pop() {
            let name = group.name;
            sf_debug!(sys, task_group = name, "waiting for task group to finish");
            group.cancel();
            let joined = if name == "workers" {
                self.drain_workers(group).await
            } else {
                group.wait().await
            };
            if let Err(e) = joined {
                sf_error!(sys, task_group = name, error = %e, "task group failed");
                first_err.get_or_insert(e);
            }
            sf_debug!(sys, task_group = name, "task group finished");

            match name {
                // Intake has stopped; workers exit once the queue is empty.
                "source" => self.ctx.queue.close(),
                "checkpoint" => {
                    take_checkpoint(&self.coordinator, &self.ctx.metrics, &self.trigger).await;
                }
                _ => {}
            }
        }
        sf_info!(
            sys,
            committed = ?self.coordinator.committed(),
            in_flight = self.ctx.tracker.in_flight(),
            summary = %self.ctx.metrics.summary_line(),
            "pipeline stopped"
        );
        first_err.map_or(Ok(()), Err)
    }

    async fn drain_workers(&self, group: TaskGroup) -> RuntimeResult<()> {
        if group.wait_timeout(self.drain_timeout).await? {
            return Ok(());
        }
        // Whatever is still queued stays uncommitted and is replayed.
        let abandoned = self.ctx.queue.drain();
        sf_warn!(
            sys,
            abandoned = abandoned.len(),
            in_flight = self.ctx.tracker.in_flight(),
            timeout_ms = self.drain_timeout.as_millis() as u64,
            "drain timed out, remaining records left for replay"
        );
        Ok(())
    }

    /// Returns a clone of the root cancellation token (for signal integration).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Local address of the Prometheus exporter, when enabled.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    pub fn metrics(&self) -> Arc<RuntimeMetrics> {
        Arc::clone(&self.ctx.metrics)
    }

    /// Whether intake is halted, and why.
    pub fn gate_state(&self) -> GateState {
        self.ctx.gate.state()
    }

    /// Id of the checkpoint this run resumed from.
    pub fn recovered_checkpoint(&self) -> Option<u64> {
        self.recovered_checkpoint
    }

    pub fn dead_letter_stats(&self) -> &DeadLetterStats {
        self.ctx.dead_letter.stats()
    }

    /// Offsets acknowledged to the source by the last successful checkpoint.
    pub fn committed_offsets(&self) -> BTreeMap<u32, u64> {
        self.coordinator.committed()
    }

    /// Records polled but not yet merged, filtered or dead-lettered.
    pub fn in_flight(&self) -> usize {
        self.ctx.tracker.in_flight()
    }

    pub fn watermark(&self) -> Option<i64> {
        self.ctx.manager.watermark()
    }

    /// Windows accumulating / finalized but not yet acknowledged by the sink.
    pub fn window_counts(&self) -> (usize, usize) {
        (self.ctx.manager.open_windows(), self.ctx.manager.closing_windows())
    }
}
