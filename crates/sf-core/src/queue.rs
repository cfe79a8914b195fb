use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use sf_config::BackpressureStrategy;
use tokio::sync::Notify;

use crate::record::QueuedRecord;

// ---------------------------------------------------------------------------
// EnqueueOutcome / QueueStats
// ---------------------------------------------------------------------------

/// Result of [`IngestionQueue::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Accepted,
    /// The record was admitted by evicting the head; the evicted record is
    /// handed back to the caller.
    Evicted(QueuedRecord),
    /// The queue was full (`drop_newest`) or closed; the record is handed back.
    Rejected(QueuedRecord),
}

/// Monotonic queue counters.
#[derive(Debug, Default)]
pub struct QueueStats {
    pub enqueued: AtomicU64,
    pub evicted: AtomicU64,
    pub rejected: AtomicU64,
}

impl QueueStats {
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// IngestionQueue
// ---------------------------------------------------------------------------

struct Inner {
    items: VecDeque<QueuedRecord>,
    closed: bool,
}

/// Bounded FIFO between the source and the transform workers.
///
/// Items are consumed strictly in arrival order. Under `block` a full queue
/// suspends producers until a consumer frees a slot; the drop strategies
/// never suspend and report the displaced record to the caller instead.
pub struct IngestionQueue {
    capacity: usize,
    strategy: BackpressureStrategy,
    inner: Mutex<Inner>,
    /// Signalled when an item is pushed or the queue closes.
    not_empty: Notify,
    /// Signalled when an item is popped or the queue closes.
    not_full: Notify,
    stats: QueueStats,
}

impl IngestionQueue {
    pub fn new(capacity: usize, strategy: BackpressureStrategy) -> Self {
        Self {
            capacity: capacity.max(1),
            strategy,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            stats: QueueStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn strategy(&self) -> BackpressureStrategy {
        self.strategy
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Offer a record to the queue, applying the backpressure strategy when
    /// it is full.
    pub async fn enqueue(&self, item: QueuedRecord) -> EnqueueOutcome {
        loop {
            // Register interest before checking, so a pop between the check
            // and the await is not missed.
            let notified = self.not_full.notified();
            {
                let mut inner = self.lock();
                if inner.closed {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    return EnqueueOutcome::Rejected(item);
                }
                if inner.items.len() < self.capacity {
                    inner.items.push_back(item);
                    self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                    drop(inner);
                    self.not_empty.notify_one();
                    return EnqueueOutcome::Accepted;
                }
                match self.strategy {
                    BackpressureStrategy::DropOldest => {
                        let evicted = inner.items.pop_front();
                        inner.items.push_back(item);
                        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                        drop(inner);
                        self.not_empty.notify_one();
                        return match evicted {
                            Some(old) => {
                                self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                                EnqueueOutcome::Evicted(old)
                            }
                            None => EnqueueOutcome::Accepted,
                        };
                    }
                    BackpressureStrategy::DropNewest => {
                        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                        return EnqueueOutcome::Rejected(item);
                    }
                    BackpressureStrategy::Block => {}
                }
            }
            notified.await;
        }
    }

    /// Take the oldest record, waiting while the queue is empty. Returns
    /// `None` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<QueuedRecord> {
        loop {
            let notified = self.not_empty.notified();
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    let more = !inner.items.is_empty();
                    drop(inner);
                    self.not_full.notify_one();
                    if more {
                        // Hand the wake-up on so idle workers keep draining.
                        self.not_empty.notify_one();
                    }
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop admitting records. Pending items stay available to `dequeue`;
    /// suspended producers are released with `Rejected`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Remove and return everything still queued.
    pub fn drain(&self) -> Vec<QueuedRecord> {
        let drained: Vec<_> = self.lock().items.drain(..).collect();
        self.not_full.notify_waiters();
        drained
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("ingestion queue lock poisoned")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
