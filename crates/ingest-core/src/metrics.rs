//! Operational counters
//!
//! A fixed set of monotonic counters plus two gauges, mutated with
//! atomic read-modify-write and served as a plain `name=value` text
//! snapshot from the HTTP layer. The struct is threaded through
//! constructors rather than living in a global registry so tests can
//! assert on isolated instances.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counter set for the whole server. All counters are monotonic; the
/// two `dlq_*_current`-style fields are gauges and move both ways.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Every request that reached the collect handler
    pub http_requests_total: AtomicU64,
    /// Requests whose event made it onto the event channel
    pub http_requests_accepted_total: AtomicU64,
    /// Requests rejected with 413 (body or query over the limit)
    pub http_requests_rejected_body_too_large_total: AtomicU64,
    /// Requests rejected with 503 (event channel full)
    pub http_requests_rejected_queue_full_total: AtomicU64,

    /// Events persisted to the raw prefix (unit: events, not batches)
    pub s3_events_stored_total: AtomicU64,
    /// Failed PUT attempts (a retried upload counts once per attempt)
    pub s3_put_errors_total: AtomicU64,

    /// Events parked in the local failure queue
    pub dlq_events_enqueued_total: AtomicU64,
    /// Events recovered from the failure queue into the object store
    pub dlq_events_reuploaded_total: AtomicU64,
    /// Events dropped because the failure queue was out of capacity
    pub dlq_events_dropped_total: AtomicU64,
    /// Failure-queue files removed by TTL or capacity eviction
    pub dlq_files_expired_total: AtomicU64,

    /// Gauge: data files currently in the failure-queue directory
    pub dlq_files_current: AtomicI64,
    /// Gauge: bytes currently in the failure-queue directory
    pub dlq_size_bytes: AtomicI64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render the full counter set as one `name=value` pair per line.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(512);

        let mut line = |name: &str, value: u64| {
            let _ = writeln!(out, "{name}={value}");
        };

        line(
            "http_requests_total",
            self.http_requests_total.load(Ordering::Relaxed),
        );
        line(
            "http_requests_accepted_total",
            self.http_requests_accepted_total.load(Ordering::Relaxed),
        );
        line(
            "http_requests_rejected_body_too_large_total",
            self.http_requests_rejected_body_too_large_total
                .load(Ordering::Relaxed),
        );
        line(
            "http_requests_rejected_queue_full_total",
            self.http_requests_rejected_queue_full_total
                .load(Ordering::Relaxed),
        );
        line(
            "s3_events_stored_total",
            self.s3_events_stored_total.load(Ordering::Relaxed),
        );
        line(
            "s3_put_errors_total",
            self.s3_put_errors_total.load(Ordering::Relaxed),
        );
        line(
            "dlq_events_enqueued_total",
            self.dlq_events_enqueued_total.load(Ordering::Relaxed),
        );
        line(
            "dlq_events_reuploaded_total",
            self.dlq_events_reuploaded_total.load(Ordering::Relaxed),
        );
        line(
            "dlq_events_dropped_total",
            self.dlq_events_dropped_total.load(Ordering::Relaxed),
        );
        line(
            "dlq_files_expired_total",
            self.dlq_files_expired_total.load(Ordering::Relaxed),
        );

        let _ = writeln!(
            out,
            "dlq_files_current={}",
            self.dlq_files_current.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "dlq_size_bytes={}",
            self.dlq_size_bytes.load(Ordering::Relaxed)
        );

        out
    }
}
