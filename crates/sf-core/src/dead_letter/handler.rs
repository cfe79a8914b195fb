use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use orion_error::prelude::*;
use sf_config::DeadLetterConfig;
use tokio::sync::mpsc;

use super::{DeadLetterEntry, DeadLetterStore, DeadLetterSubject, ErrorKind};
use crate::error::{CoreReason, CoreResult};
use crate::record::QueuedRecord;
use crate::retry::RetryPolicy;

/// Cap on the delay between attempts to append to the store.
const PERSIST_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// What to do with an entry taken off the dead-letter channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Put the record back on the ingestion queue after `delay`.
    Resubmit { item: QueuedRecord, delay: Duration },
    /// Write the entry to the dead-letter store.
    Persist(DeadLetterEntry),
}

/// Counters per error kind plus resubmission and persistence outcomes.
#[derive(Debug, Default)]
pub struct DeadLetterStats {
    by_kind: [AtomicU64; 5],
    resubmitted: AtomicU64,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
}

impl DeadLetterStats {
    pub fn received(&self, kind: ErrorKind) -> u64 {
        self.by_kind[kind_index(kind)].load(Ordering::Relaxed)
    }

    pub fn resubmitted(&self) -> u64 {
        self.resubmitted.load(Ordering::Relaxed)
    }

    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }
}

fn kind_index(kind: ErrorKind) -> usize {
    match kind {
        ErrorKind::Retryable => 0,
        ErrorKind::Permanent => 1,
        ErrorKind::Late => 2,
        ErrorKind::Dropped => 3,
        ErrorKind::SinkExhausted => 4,
    }
}

/// Receives failed records and batches from every stage.
///
/// [`add`](Self::add) never blocks: entries go onto an unbounded channel
/// whose receiving end is drained by a background task. That task asks
/// [`route`](Self::route) whether to resubmit a record or persist it, and
/// persists through [`persist`](Self::persist), which retries the store on
/// its own schedule.
pub struct DeadLetterHandler {
    tx: mpsc::UnboundedSender<DeadLetterEntry>,
    store: Arc<dyn DeadLetterStore>,
    resubmit: RetryPolicy,
    persist: RetryPolicy,
    stats: DeadLetterStats,
}

impl DeadLetterHandler {
    pub fn new(
        config: &DeadLetterConfig,
        store: Arc<dyn DeadLetterStore>,
    ) -> (Self, mpsc::UnboundedReceiver<DeadLetterEntry>) {
        let base = config.retry_base.as_duration();
        Self::with_policies(
            store,
            RetryPolicy::new(config.max_retries, base, Duration::from_secs(60)),
            RetryPolicy::new(
                config.persist_retries.saturating_sub(1),
                base,
                PERSIST_BACKOFF_MAX,
            ),
        )
    }

    pub fn with_policies(
        store: Arc<dyn DeadLetterStore>,
        resubmit: RetryPolicy,
        persist: RetryPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<DeadLetterEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Self {
            tx,
            store,
            resubmit,
            persist,
            stats: DeadLetterStats::default(),
        };
        (handler, rx)
    }

    pub fn stats(&self) -> &DeadLetterStats {
        &self.stats
    }

    /// Hand an entry to the background task. Returns `false` when the task
    /// is gone; the caller still owns the failure in that case.
    pub fn add(&self, entry: DeadLetterEntry) -> bool {
        self.stats.by_kind[kind_index(entry.error_kind)].fetch_add(1, Ordering::Relaxed);
        self.tx.send(entry).is_ok()
    }

    /// Count `entry` and persist it inline, for callers that must not let go
    /// of what it holds until the store has it.
    pub async fn preserve(&self, entry: &DeadLetterEntry) -> CoreResult<()> {
        self.stats.by_kind[kind_index(entry.error_kind)].fetch_add(1, Ordering::Relaxed);
        self.persist(entry).await
    }

    /// How long to wait before offering an entry whose persist budget ran
    /// out to the store again.
    pub fn redelivery_delay(&self) -> Duration {
        self.persist
            .delay(self.persist.max_retries + 1)
            .min(PERSIST_BACKOFF_MAX)
    }

    /// Retryable records with budget left are resubmitted with exponential
    /// backoff; everything else is persisted.
    pub fn route(&self, entry: DeadLetterEntry) -> Disposition {
        match entry.original {
            DeadLetterSubject::Record(record)
                if entry.error_kind == ErrorKind::Retryable
                    && self.resubmit.allows(entry.retry_count) =>
            {
                self.stats.resubmitted.fetch_add(1, Ordering::Relaxed);
                Disposition::Resubmit {
                    delay: self.resubmit.delay(entry.retry_count),
                    item: QueuedRecord {
                        record,
                        retry_count: entry.retry_count + 1,
                    },
                }
            }
            original => Disposition::Persist(DeadLetterEntry { original, ..entry }),
        }
    }

    /// Append `entry` to the store, retrying with backoff. Fails once the
    /// persist budget is spent.
    pub async fn persist(&self, entry: &DeadLetterEntry) -> CoreResult<()> {
        let mut attempt = 0u32;
        loop {
            let mut stamped = entry.clone();
            stamped.last_attempt_at = Utc::now();
            match self.store.append(&stamped).await {
                Ok(()) => {
                    self.stats.persisted.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) if self.persist.allows(attempt) => {
                    let delay = self.persist.delay(attempt);
                    log::warn!(
                        "dead-letter append failed (attempt {}), retrying in {delay:?}: {e:#}",
                        attempt + 1
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                    return StructError::from(CoreReason::DeadLetter)
                        .with_detail(format!(
                            "{} entry not persisted after {} attempts: {e:#}",
                            entry.error_kind,
                            attempt + 1
                        ))
                        .err();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::MemoryDeadLetterStore;
    use crate::record::{Record, SourcePosition};
    use serde_json::json;

    fn handler(
        store: Arc<MemoryDeadLetterStore>,
        max_retries: u32,
    ) -> (DeadLetterHandler, mpsc::UnboundedReceiver<DeadLetterEntry>) {
        DeadLetterHandler::with_policies(
            store,
            RetryPolicy::new(max_retries, Duration::from_millis(100), Duration::from_secs(10)),
            RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(50)),
        )
    }

    fn failed(kind: ErrorKind, retry_count: u32) -> DeadLetterEntry {
        DeadLetterEntry::record(
            Record::new("k", 0, json!({}), SourcePosition::new(0, 9)),
            kind,
            "boom",
            retry_count,
        )
    }

    #[tokio::test]
    async fn add_is_non_blocking_and_counted() {
        let (h, mut rx) = handler(Arc::new(MemoryDeadLetterStore::new()), 3);
        for _ in 0..1000 {
            assert!(h.add(failed(ErrorKind::Late, 0)));
        }
        assert_eq!(h.stats().received(ErrorKind::Late), 1000);
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn retryable_with_budget_is_resubmitted_with_backoff() {
        let (h, _rx) = handler(Arc::new(MemoryDeadLetterStore::new()), 3);
        let delays: Vec<Duration> = (0..3)
            .map(|n| match h.route(failed(ErrorKind::Retryable, n)) {
                Disposition::Resubmit { item, delay } => {
                    assert_eq!(item.retry_count, n + 1);
                    delay
                }
                other => panic!("expected resubmit, got {other:?}"),
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert!(matches!(
            h.route(failed(ErrorKind::Retryable, 3)),
            Disposition::Persist(e) if e.retry_count == 3
        ));
        assert_eq!(h.stats().resubmitted(), 3);
    }

    #[test]
    fn non_retryable_kinds_are_persisted() {
        let (h, _rx) = handler(Arc::new(MemoryDeadLetterStore::new()), 3);
        for kind in [ErrorKind::Permanent, ErrorKind::Late, ErrorKind::Dropped] {
            assert!(matches!(
                h.route(failed(kind, 0)),
                Disposition::Persist(e) if e.error_kind == kind
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn persist_retries_the_store() {
        let store = Arc::new(MemoryDeadLetterStore::new());
        let (h, _rx) = handler(store.clone(), 3);

        store.fail_next(2);
        h.persist(&failed(ErrorKind::Permanent, 0)).await.unwrap();
        assert_eq!(store.len(), 1);

        store.fail_next(3);
        assert!(h.persist(&failed(ErrorKind::Permanent, 0)).await.is_err());
        assert_eq!(h.stats().persist_failures(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn preserve_counts_and_reports_store_failure() {
        let store = Arc::new(MemoryDeadLetterStore::new());
        let (h, mut rx) = handler(store.clone(), 3);
        let batch = DeadLetterEntry::batch(Vec::new(), "sink down", 2);

        store.fail_next(3);
        assert!(h.preserve(&batch).await.is_err());
        h.preserve(&batch).await.unwrap();

        assert_eq!(h.stats().received(ErrorKind::SinkExhausted), 2);
        assert_eq!(h.stats().persist_failures(), 1);
        assert_eq!(store.len(), 1);
        // Nothing goes through the background channel.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn redelivery_waits_past_the_last_persist_backoff() {
        let (h, _rx) = handler(Arc::new(MemoryDeadLetterStore::new()), 3);
        // Persist policy: 2 retries from 10ms, capped at 50ms.
        assert_eq!(h.redelivery_delay(), Duration::from_millis(50));
    }
}
