use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use sf_config::MetricsConfig;
use sf_core::dead_letter::ErrorKind;
use sf_core::queue::IngestionQueue;
use sf_core::window::{IngestReport, WindowManager};

const LATENCY_BUCKETS_SECONDS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Sentinel for "no watermark yet".
const NO_WATERMARK: i64 = i64::MIN;

/// Fixed-bucket latency histogram. Buckets are stored non-cumulatively and
/// summed on render.
struct Histogram {
    bounds_nanos: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_nanos: AtomicU64,
}

impl Histogram {
    fn new(bounds_seconds: &[f64]) -> Self {
        let bounds_nanos: Vec<u64> = bounds_seconds
            .iter()
            .map(|s| (s * 1_000_000_000.0) as u64)
            .collect();
        let buckets = (0..=bounds_nanos.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds_nanos,
            buckets,
            sum_nanos: AtomicU64::new(0),
        }
    }

    fn observe(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.sum_nanos.fetch_add(nanos, Ordering::Relaxed);
        let idx = self
            .bounds_nanos
            .iter()
            .position(|&b| nanos <= b)
            .unwrap_or(self.bounds_nanos.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, out: &mut String, name: &str) {
        let mut cumulative = 0u64;
        for (bound, bucket) in self.bounds_nanos.iter().zip(&self.buckets) {
            cumulative += bucket.load(Ordering::Relaxed);
            let le = *bound as f64 / 1_000_000_000.0;
            let _ = writeln!(out, "{name}_bucket{{le=\"{le}\"}} {cumulative}");
        }
        if let Some(overflow) = self.buckets.last() {
            cumulative += overflow.load(Ordering::Relaxed);
        }
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
        let sum = self.sum_nanos.load(Ordering::Relaxed) as f64 / 1_000_000_000.0;
        let _ = writeln!(out, "{name}_sum {sum}");
        let _ = writeln!(out, "{name}_count {cumulative}");
    }
}

/// Process-wide pipeline counters, gauges and latency histograms.
///
/// Everything is an atomic so the hot path never locks. Counters are kept
/// even when the exporter is disabled; they back the shutdown summary.
pub struct RuntimeMetrics {
    source_records: AtomicU64,
    queue_enqueued: AtomicU64,
    queue_evicted: AtomicU64,
    queue_rejected: AtomicU64,
    transform_filtered: AtomicU64,
    transform_retries: AtomicU64,
    records_merged: AtomicU64,
    records_duplicate: AtomicU64,
    records_late: AtomicU64,
    dead_letter: [AtomicU64; 5],
    dead_letter_persist_failures: AtomicU64,
    windows_closed: AtomicU64,
    corrections: AtomicU64,
    sink_batches: AtomicU64,
    sink_retries: AtomicU64,
    sink_failures: AtomicU64,
    checkpoints: AtomicU64,
    checkpoint_failures: AtomicU64,

    queue_depth: AtomicU64,
    watermark_ms: AtomicI64,
    windows_open: AtomicU64,
    windows_closing: AtomicU64,

    transform_seconds: Histogram,
    sink_write_seconds: Histogram,
    checkpoint_seconds: Histogram,
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self {
            source_records: AtomicU64::new(0),
            queue_enqueued: AtomicU64::new(0),
            queue_evicted: AtomicU64::new(0),
            queue_rejected: AtomicU64::new(0),
            transform_filtered: AtomicU64::new(0),
            transform_retries: AtomicU64::new(0),
            records_merged: AtomicU64::new(0),
            records_duplicate: AtomicU64::new(0),
            records_late: AtomicU64::new(0),
            dead_letter: Default::default(),
            dead_letter_persist_failures: AtomicU64::new(0),
            windows_closed: AtomicU64::new(0),
            corrections: AtomicU64::new(0),
            sink_batches: AtomicU64::new(0),
            sink_retries: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
            checkpoint_failures: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            watermark_ms: AtomicI64::new(NO_WATERMARK),
            windows_open: AtomicU64::new(0),
            windows_closing: AtomicU64::new(0),
            transform_seconds: Histogram::new(LATENCY_BUCKETS_SECONDS),
            sink_write_seconds: Histogram::new(LATENCY_BUCKETS_SECONDS),
            checkpoint_seconds: Histogram::new(LATENCY_BUCKETS_SECONDS),
        }
    }

    // -- source / queue -----------------------------------------------------

    pub fn add_source_records(&self, n: usize) {
        self.source_records.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_enqueued(&self) {
        self.queue_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_evicted(&self) {
        self.queue_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.queue_rejected.fetch_add(1, Ordering::Relaxed);
    }

    // -- transform / windows ------------------------------------------------

    pub fn inc_filtered(&self) {
        self.transform_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_transform_retries(&self, n: u32) {
        self.transform_retries.fetch_add(u64::from(n), Ordering::Relaxed);
    }

    pub fn observe_transform(&self, elapsed: Duration) {
        self.transform_seconds.observe(elapsed);
    }

    pub fn add_ingest_report(&self, report: &IngestReport) {
        if report.merged > 0 || report.corrected > 0 {
            self.records_merged.fetch_add(1, Ordering::Relaxed);
        }
        if report.is_duplicate() {
            self.records_duplicate.fetch_add(1, Ordering::Relaxed);
        }
        if report.is_late() {
            self.records_late.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_closed(&self, windows: usize, corrections: usize) {
        self.windows_closed.fetch_add(windows as u64, Ordering::Relaxed);
        self.corrections.fetch_add(corrections as u64, Ordering::Relaxed);
    }

    pub fn inc_dead_letter(&self, kind: ErrorKind) {
        if let Some(idx) = ErrorKind::ALL.iter().position(|k| *k == kind) {
            self.dead_letter[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_dead_letter_persist_failure(&self) {
        self.dead_letter_persist_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    // -- sink / checkpoint --------------------------------------------------

    pub fn add_sink_batch(&self, attempts: u32, elapsed: Duration) {
        self.sink_batches.fetch_add(1, Ordering::Relaxed);
        self.sink_retries
            .fetch_add(u64::from(attempts.saturating_sub(1)), Ordering::Relaxed);
        self.sink_write_seconds.observe(elapsed);
    }

    pub fn inc_sink_failure(&self, retries: u32) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
        self.sink_retries.fetch_add(u64::from(retries), Ordering::Relaxed);
    }

    pub fn add_checkpoint(&self, elapsed: Duration) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.checkpoint_seconds.observe(elapsed);
    }

    pub fn inc_checkpoint_failure(&self) {
        self.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
    }

    // -- gauges -------------------------------------------------------------

    pub fn sample(&self, queue: &IngestionQueue, manager: &WindowManager) {
        self.queue_depth.store(queue.len() as u64, Ordering::Relaxed);
        self.watermark_ms
            .store(manager.watermark().unwrap_or(NO_WATERMARK), Ordering::Relaxed);
        self.windows_open
            .store(manager.open_windows() as u64, Ordering::Relaxed);
        self.windows_closing
            .store(manager.closing_windows() as u64, Ordering::Relaxed);
    }

    // -- readers used by tests and the summary ------------------------------

    pub fn source_records(&self) -> u64 {
        self.source_records.load(Ordering::Relaxed)
    }

    pub fn merged(&self) -> u64 {
        self.records_merged.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.records_duplicate.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.queue_evicted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.queue_rejected.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self, kind: ErrorKind) -> u64 {
        ErrorKind::ALL
            .iter()
            .position(|k| *k == kind)
            .map_or(0, |idx| self.dead_letter[idx].load(Ordering::Relaxed))
    }

    pub fn dead_letter_persist_failures(&self) -> u64 {
        self.dead_letter_persist_failures.load(Ordering::Relaxed)
    }

    pub fn checkpoints(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    pub fn checkpoint_failures(&self) -> u64 {
        self.checkpoint_failures.load(Ordering::Relaxed)
    }

    pub fn sink_failures(&self) -> u64 {
        self.sink_failures.load(Ordering::Relaxed)
    }

    pub fn windows_closed(&self) -> u64 {
        self.windows_closed.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition of every family.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        let mut typed = BTreeSet::new();
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);

        for (name, value) in [
            ("sf_source_records_total", &self.source_records),
            ("sf_queue_enqueued_total", &self.queue_enqueued),
            ("sf_queue_evicted_total", &self.queue_evicted),
            ("sf_queue_rejected_total", &self.queue_rejected),
            ("sf_transform_filtered_total", &self.transform_filtered),
            ("sf_transform_retries_total", &self.transform_retries),
            ("sf_records_merged_total", &self.records_merged),
            ("sf_records_duplicate_total", &self.records_duplicate),
            ("sf_records_late_total", &self.records_late),
            (
                "sf_dead_letter_persist_failures_total",
                &self.dead_letter_persist_failures,
            ),
            ("sf_windows_closed_total", &self.windows_closed),
            ("sf_corrections_total", &self.corrections),
            ("sf_sink_batches_total", &self.sink_batches),
            ("sf_sink_retries_total", &self.sink_retries),
            ("sf_sink_failures_total", &self.sink_failures),
            ("sf_checkpoints_total", &self.checkpoints),
            ("sf_checkpoint_failures_total", &self.checkpoint_failures),
        ] {
            type_line(&mut out, &mut typed, name, "counter");
            let _ = writeln!(out, "{name} {}", load(value));
        }

        for (kind, value) in ErrorKind::ALL.iter().zip(&self.dead_letter) {
            type_line(&mut out, &mut typed, "sf_dead_letter_total", "counter");
            let _ = writeln!(out, "sf_dead_letter_total{{kind=\"{kind}\"}} {}", load(value));
        }

        for (name, value) in [
            ("sf_queue_depth", &self.queue_depth),
            ("sf_windows_open", &self.windows_open),
            ("sf_windows_closing", &self.windows_closing),
        ] {
            type_line(&mut out, &mut typed, name, "gauge");
            let _ = writeln!(out, "{name} {}", load(value));
        }
        let watermark = self.watermark_ms.load(Ordering::Relaxed);
        if watermark != NO_WATERMARK {
            type_line(&mut out, &mut typed, "sf_watermark_ms", "gauge");
            let _ = writeln!(out, "sf_watermark_ms {watermark}");
        }

        for (name, hist) in [
            ("sf_transform_seconds", &self.transform_seconds),
            ("sf_sink_write_seconds", &self.sink_write_seconds),
            ("sf_checkpoint_seconds", &self.checkpoint_seconds),
        ] {
            type_line(&mut out, &mut typed, name, "histogram");
            hist.render(&mut out, name);
        }
        out
    }

    pub fn summary_line(&self) -> String {
        let dead: u64 = self
            .dead_letter
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .sum();
        format!(
            "polled={} merged={} late={} dead_letter={} closed={} sink_batches={} checkpoints={} queue_depth={}",
            self.source_records.load(Ordering::Relaxed),
            self.records_merged.load(Ordering::Relaxed),
            self.records_late.load(Ordering::Relaxed),
            dead,
            self.windows_closed.load(Ordering::Relaxed),
            self.sink_batches.load(Ordering::Relaxed),
            self.checkpoints.load(Ordering::Relaxed),
            self.queue_depth.load(Ordering::Relaxed),
        )
    }
}

fn type_line(out: &mut String, typed: &mut BTreeSet<&'static str>, name: &'static str, kind: &str) {
    if typed.insert(name) {
        let _ = writeln!(out, "# TYPE {name} {kind}");
    }
}

// ---------------------------------------------------------------------------
// Exporter
// ---------------------------------------------------------------------------

/// Log a summary every `report_interval` and serve `GET /metrics` until
/// cancelled.
#[tracing::instrument(name = "metrics", skip_all)]
pub async fn run_metrics_task(
    metrics: Arc<RuntimeMetrics>,
    config: MetricsConfig,
    listener: TcpListener,
    queue: Arc<IngestionQueue>,
    manager: Arc<WindowManager>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    sf_info!(
        res,
        listen = %config.prometheus_listen,
        interval = %config.report_interval,
        "metrics exporter started"
    );
    let mut tick = tokio::time::interval(config.report_interval.as_duration());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                metrics.sample(&queue, &manager);
                sf_info!(res, summary = %metrics.summary_line(), "metrics snapshot");
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let metrics = Arc::clone(&metrics);
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, &metrics).await {
                        sf_debug!(res, error = %e, "metrics request failed");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn serve_connection(mut stream: TcpStream, metrics: &RuntimeMetrics) -> anyhow::Result<()> {
    const IO_TIMEOUT: Duration = Duration::from_secs(2);

    let mut request = [0u8; 512];
    let n = match timeout(IO_TIMEOUT, stream.read(&mut request)).await {
        Ok(read) => read?,
        Err(_) => return Ok(()),
    };
    let response = if request[..n].starts_with(b"GET /metrics") {
        let body = metrics.render_prometheus();
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    };
    timeout(IO_TIMEOUT, stream.write_all(response.as_bytes())).await??;
    let _ = timeout(Duration::from_secs(1), stream.shutdown()).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_family_is_typed_once() {
        let metrics = RuntimeMetrics::new();
        metrics.inc_dead_letter(ErrorKind::Late);
        metrics.inc_dead_letter(ErrorKind::Late);
        let text = metrics.render_prometheus();
        assert_eq!(text.matches("# TYPE sf_dead_letter_total counter").count(), 1);
        assert!(text.contains("sf_dead_letter_total{kind=\"late\"} 2"));
        assert!(text.contains("sf_dead_letter_total{kind=\"sink_exhausted\"} 0"));
        assert!(!text.contains("sf_watermark_ms"));
    }

    #[test]
    fn histogram_count_equals_inf_bucket() {
        let metrics = RuntimeMetrics::new();
        metrics.add_checkpoint(Duration::from_millis(3));
        metrics.add_checkpoint(Duration::from_secs(30));
        let text = metrics.render_prometheus();
        assert!(text.contains("sf_checkpoint_seconds_bucket{le=\"0.005\"} 1"));
        assert!(text.contains("sf_checkpoint_seconds_bucket{le=\"+Inf\"} 2"));
        assert!(text.contains("sf_checkpoint_seconds_count 2"));
        assert!(text.contains("sf_checkpoints_total 2"));
    }

    #[test]
    fn sink_batch_counts_retries_beyond_first_attempt() {
        let metrics = RuntimeMetrics::new();
        metrics.add_sink_batch(3, Duration::from_millis(1));
        metrics.inc_sink_failure(4);
        let text = metrics.render_prometheus();
        assert!(text.contains("sf_sink_batches_total 1"));
        assert!(text.contains("sf_sink_retries_total 6"));
        assert!(text.contains("sf_sink_failures_total 1"));
    }

    #[tokio::test]
    async fn serves_metrics_over_http() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let metrics = Arc::new(RuntimeMetrics::new());
        metrics.add_source_records(7);

        let server = {
            let metrics = Arc::clone(&metrics);
            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                serve_connection(stream, &metrics).await.unwrap();
            })
        };
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").await.unwrap();
        let mut body = String::new();
        client.read_to_string(&mut body).await.unwrap();
        server.await.unwrap();

        assert!(body.starts_with("HTTP/1.1 200 OK"));
        assert!(body.contains("sf_source_records_total 7"));
    }
}
