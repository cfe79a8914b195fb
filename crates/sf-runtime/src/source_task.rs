use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use sf_core::record::QueuedRecord;
use sf_core::source::Source;

use crate::context::{Admission, PipelineContext};

/// Poll the source and feed the ingestion queue until cancelled.
///
/// Polling pauses while the intake gate is halted. Every polled record is
/// registered with the offset tracker before it is enqueued, so its offset
/// cannot be committed until it has been merged, filtered or dead-lettered.
#[tracing::instrument(name = "source", skip_all)]
pub(crate) async fn run_source(
    ctx: PipelineContext,
    source: Arc<dyn Source>,
    batch_size: usize,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut admitted = 0u64;
    'poll: loop {
        if !ctx.gate.is_open() {
            sf_warn!(pipe, gate = ?ctx.gate.state(), "intake halted");
            tokio::select! {
                _ = ctx.gate.wait_open() => {
                    sf_info!(pipe, "intake resumed");
                    continue;
                }
                _ = cancel.cancelled() => break,
            }
        }

        let batch = tokio::select! {
            polled = source.poll(batch_size) => polled,
            _ = cancel.cancelled() => break,
        };
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                sf_warn!(pipe, error = %e, "source poll failed");
                Vec::new()
            }
        };
        if batch.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => continue,
                _ = cancel.cancelled() => break,
            }
        }

        ctx.metrics.add_source_records(batch.len());
        for record in batch {
            ctx.tracker.begin(record.position);
            let admission = tokio::select! {
                admission = ctx.admit(QueuedRecord::fresh(record)) => admission,
                // A record abandoned mid-enqueue stays in flight and is
                // replayed after restart.
                _ = cancel.cancelled() => break 'poll,
            };
            match admission {
                Admission::Admitted | Admission::Displaced => admitted += 1,
                Admission::Closed => break 'poll,
            }
        }
    }
    sf_info!(pipe, admitted, "source stopped");
    Ok(())
}
