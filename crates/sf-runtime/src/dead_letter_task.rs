use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use sf_core::dead_letter::{DeadLetterEntry, Disposition};

use crate::context::{Admission, PipelineContext};

/// Delayed work: a resubmission yields nothing, a persist redelivery yields
/// the entry to try again.
type Pending = JoinSet<Option<DeadLetterEntry>>;

/// Drain the dead-letter channel: resubmit retryable records after their
/// backoff and persist everything else. Entries the store refuses are
/// offered again after a delay, so their offsets do not pin commits for the
/// rest of the run. Runs until cancelled, then flushes entries already
/// queued.
#[tracing::instrument(name = "dead_letter", skip_all)]
pub(crate) async fn run_dead_letter(
    ctx: PipelineContext,
    mut rx: mpsc::UnboundedReceiver<DeadLetterEntry>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut pending = Pending::new();
    loop {
        tokio::select! {
            biased;
            entry = rx.recv() => match entry {
                Some(entry) => handle(&ctx, entry, Some(&mut pending)).await,
                None => break,
            },
            Some(joined) = pending.join_next(), if !pending.is_empty() => {
                if let Ok(Some(entry)) = joined {
                    persist(&ctx, entry, Some(&mut pending)).await;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    let mut flushed = 0usize;
    while let Ok(entry) = rx.try_recv() {
        handle(&ctx, entry, None).await;
        flushed += 1;
    }
    let abandoned = pending.len();
    pending.abort_all();
    sf_info!(
        store,
        flushed,
        abandoned,
        "dead-letter handler stopped"
    );
    Ok(())
}

/// `pending` is `None` while flushing on shutdown; retryable records and
/// unpersisted entries are then left in flight for replay.
async fn handle(ctx: &PipelineContext, entry: DeadLetterEntry, pending: Option<&mut Pending>) {
    match ctx.dead_letter.route(entry) {
        Disposition::Resubmit { item, delay } => {
            let position = item.record.position;
            let Some(pending) = pending else {
                sf_debug!(pipe, position = %position, "shutting down, retry left for replay");
                return;
            };
            sf_debug!(
                pipe,
                position = %position,
                retry_count = item.retry_count,
                delay_ms = delay.as_millis() as u64,
                "resubmitting"
            );
            let ctx = ctx.clone();
            pending.spawn(async move {
                tokio::time::sleep(delay).await;
                if ctx.admit(item).await == Admission::Closed {
                    sf_debug!(pipe, position = %position, "queue closed, retry left for replay");
                }
                None
            });
        }
        Disposition::Persist(entry) => persist(ctx, entry, pending).await,
    }
}

async fn persist(ctx: &PipelineContext, entry: DeadLetterEntry, pending: Option<&mut Pending>) {
    match ctx.dead_letter.persist(&entry).await {
        Ok(()) => {
            if let Some(position) = entry.position() {
                ctx.tracker.complete(position);
            }
        }
        Err(e) => {
            ctx.metrics.inc_dead_letter_persist_failure();
            let Some(pending) = pending else {
                // The offset stays uncommitted, so the record is replayed.
                sf_error!(
                    store,
                    kind = %entry.error_kind,
                    position = ?entry.position(),
                    error = %e,
                    "dead-letter entry not persisted, left for replay"
                );
                return;
            };
            let delay = ctx.dead_letter.redelivery_delay();
            sf_error!(
                store,
                kind = %entry.error_kind,
                position = ?entry.position(),
                retry_in_ms = delay.as_millis() as u64,
                error = %e,
                "dead-letter entry not persisted, will retry"
            );
            pending.spawn(async move {
                tokio::time::sleep(delay).await;
                Some(entry)
            });
        }
    }
}
