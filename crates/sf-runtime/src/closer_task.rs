use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use sf_core::dead_letter::{DeadLetterEntry, ErrorKind};
use sf_core::record::WindowResult;
use sf_core::sink::SinkWriter;
use sf_core::window::{Emission, EmissionId};

use crate::context::PipelineContext;

/// Where finalized results go.
#[derive(Clone)]
pub(crate) struct SinkTargets {
    pub main: SinkWriter,
    /// Late-output sink for corrections; `None` sends them to `main`.
    pub late: Option<SinkWriter>,
    pub batch_size: usize,
    /// Bounds concurrent batch writes across both sinks.
    pub fanout: Arc<Semaphore>,
}

/// Every `linger`, close the windows the watermark has passed and write
/// their results. Results recovered from a checkpoint are written first.
/// On cancel a last sweep flushes whatever the final watermark allows.
#[tracing::instrument(name = "closer", skip_all)]
pub(crate) async fn run_closer(
    ctx: PipelineContext,
    targets: SinkTargets,
    recovered: Vec<Emission>,
    linger: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if !recovered.is_empty() {
        sf_info!(store, results = recovered.len(), "re-emitting unacknowledged results");
        flush(&ctx, &targets, recovered).await;
    }

    let mut tick = tokio::time::interval(linger);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => sweep(&ctx, &targets).await,
        }
    }
    sweep(&ctx, &targets).await;
    sf_debug!(store, "closer stopped");
    Ok(())
}

async fn sweep(ctx: &PipelineContext, targets: &SinkTargets) {
    let emissions = ctx.manager.close_ready().await;
    ctx.metrics.sample(&ctx.queue, &ctx.manager);
    if emissions.is_empty() {
        return;
    }
    let corrections = emissions.iter().filter(|e| e.is_correction()).count();
    ctx.metrics.add_closed(emissions.len() - corrections, corrections);
    sf_debug!(
        pipe,
        windows = emissions.len() - corrections,
        corrections,
        watermark = ?ctx.manager.watermark(),
        "windows closed"
    );
    flush(ctx, targets, emissions).await;
}

/// Write `emissions` in `batch_size` chunks, at most `fanout` at a time,
/// and wait for every batch to settle.
async fn flush(ctx: &PipelineContext, targets: &SinkTargets, emissions: Vec<Emission>) {
    let (late, main): (Vec<Emission>, Vec<Emission>) = emissions
        .into_iter()
        .partition(|e| e.is_correction() && targets.late.is_some());

    let mut writes = JoinSet::new();
    let routed = [(&targets.main, main), (targets.late.as_ref().unwrap_or(&targets.main), late)];
    for (writer, emissions) in routed {
        for chunk in emissions.chunks(targets.batch_size.max(1)) {
            let ctx = ctx.clone();
            let writer = writer.clone();
            let batch = chunk.to_vec();
            let fanout = Arc::clone(&targets.fanout);
            writes.spawn(async move {
                let Ok(_permit) = fanout.acquire_owned().await else {
                    return;
                };
                write_batch(&ctx, &writer, batch).await;
            });
        }
    }
    while let Some(joined) = writes.join_next().await {
        if let Err(e) = joined {
            sf_error!(store, error = %e, "sink batch task failed");
        }
    }
}

/// Write one batch. Acknowledged results are released from the store. An
/// exhausted batch halts intake until restart and is persisted whole to the
/// dead-letter store; its windows are released only once that write lands.
async fn write_batch(ctx: &PipelineContext, writer: &SinkWriter, batch: Vec<Emission>) {
    let (ids, results): (Vec<EmissionId>, Vec<WindowResult>) =
        batch.into_iter().map(|e| (e.id, e.result)).unzip();
    let started = Instant::now();

    match writer.write_batch(&results).await {
        Ok(report) => {
            ctx.metrics.add_sink_batch(report.attempts, started.elapsed());
            sf_trace!(store, results = results.len(), attempts = report.attempts, "batch written");
        }
        Err(e) => {
            let retries = writer.retry_policy().max_retries;
            ctx.metrics.inc_sink_failure(retries);
            ctx.metrics.inc_dead_letter(ErrorKind::SinkExhausted);
            ctx.gate.halt_for_sink();
            sf_error!(
                store,
                results = results.len(),
                retries,
                error = %e,
                "sink retries exhausted, intake halted"
            );
            let entry = DeadLetterEntry::batch(results, e.to_string(), retries);
            if let Err(e) = ctx.dead_letter.preserve(&entry).await {
                // Still CLOSING: carried by checkpoints and re-emitted on restart.
                ctx.metrics.inc_dead_letter_persist_failure();
                sf_error!(
                    store,
                    windows = ids.len(),
                    error = %e,
                    "exhausted batch not dead-lettered, kept for re-emission"
                );
                return;
            }
            sf_warn!(store, windows = ids.len(), "exhausted batch dead-lettered");
        }
    }
    ctx.manager.release(&ids).await;
}
