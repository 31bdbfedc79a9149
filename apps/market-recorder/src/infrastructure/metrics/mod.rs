//! Prometheus Metrics Module
//!
//! Exposes pipeline metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Queues**: Records enqueued, dropped, and current depth per record kind
//! - **Collector**: Source events, skipped snapshots, continuity anomalies,
//!   timestamp regressions
//! - **Writers**: Batches flushed and dropped, records written, retries,
//!   flush latency
//! - **Supervision**: Task restarts and source reconnects
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::record::RecordKind;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Queue counters
    describe_counter!(
        "market_recorder_records_enqueued_total",
        "Total records accepted into a writer queue"
    );
    describe_counter!(
        "market_recorder_records_dropped_total",
        "Total records dropped, by kind and reason"
    );
    describe_gauge!(
        "market_recorder_queue_depth",
        "Records waiting in a writer queue"
    );

    // Collector counters
    describe_counter!(
        "market_recorder_source_events_total",
        "Total events received from the market data source"
    );
    describe_counter!(
        "market_recorder_snapshots_skipped_total",
        "Order-book snapshots that could not be binned, by reason"
    );
    describe_counter!(
        "market_recorder_continuity_anomalies_total",
        "Nonce continuity anomalies, by severity"
    );
    describe_counter!(
        "market_recorder_timestamp_regressions_total",
        "Records whose timestamp went backwards within a kind"
    );

    // Writer counters
    describe_counter!(
        "market_recorder_batches_flushed_total",
        "Batches written successfully"
    );
    describe_counter!(
        "market_recorder_batches_dropped_total",
        "Batches dropped after failed flushes, by reason"
    );
    describe_counter!(
        "market_recorder_records_written_total",
        "Records written successfully"
    );
    describe_counter!(
        "market_recorder_flush_retries_total",
        "Flush retry attempts"
    );
    describe_histogram!(
        "market_recorder_flush_duration_seconds",
        "Time spent in a single storage write"
    );

    // Supervision counters
    describe_counter!(
        "market_recorder_task_restarts_total",
        "Pipeline task restarts, by task"
    );
    describe_counter!(
        "market_recorder_source_reconnects_total",
        "Source WebSocket reconnection attempts"
    );
}

// =============================================================================
// Metric Labels
// =============================================================================

/// Reasons a record is dropped instead of written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The queue stayed full past the enqueue timeout.
    QueueFull,
    /// The queue has no receiver.
    QueueClosed,
    /// Flush retries were exhausted.
    FlushExhausted,
    /// The store rejected the batch.
    Rejected,
    /// Shutdown interrupted a retry.
    Shutdown,
    /// The writer holding the batch panicked or was aborted.
    TaskFailed,
}

impl DropReason {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::QueueClosed => "queue_closed",
            Self::FlushExhausted => "flush_exhausted",
            Self::Rejected => "rejected",
            Self::Shutdown => "shutdown",
            Self::TaskFailed => "task_failed",
        }
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a record accepted into a queue.
pub fn record_enqueued(kind: RecordKind) {
    counter!(
        "market_recorder_records_enqueued_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record records dropped before reaching storage.
pub fn record_records_dropped(kind: RecordKind, reason: DropReason, count: u64) {
    counter!(
        "market_recorder_records_dropped_total",
        "kind" => kind.as_str(),
        "reason" => reason.as_str()
    )
    .increment(count);
}

/// Update the queue depth gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_queue_depth(kind: RecordKind, depth: usize) {
    gauge!(
        "market_recorder_queue_depth",
        "kind" => kind.as_str()
    )
    .set(depth as f64);
}

/// Record an event received from the source.
pub fn record_source_event(event: &'static str) {
    counter!(
        "market_recorder_source_events_total",
        "event" => event
    )
    .increment(1);
}

/// Record a snapshot skipped by the binning step.
pub fn record_snapshot_skipped(reason: &'static str) {
    counter!(
        "market_recorder_snapshots_skipped_total",
        "reason" => reason
    )
    .increment(1);
}

/// Record a continuity anomaly.
pub fn record_continuity_anomaly(severity: &'static str) {
    counter!(
        "market_recorder_continuity_anomalies_total",
        "severity" => severity
    )
    .increment(1);
}

/// Record a timestamp regression within a record kind.
pub fn record_timestamp_regression(kind: RecordKind) {
    counter!(
        "market_recorder_timestamp_regressions_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a successful flush.
pub fn record_batch_flushed(kind: RecordKind, records: u64, duration: Duration) {
    counter!(
        "market_recorder_batches_flushed_total",
        "kind" => kind.as_str()
    )
    .increment(1);
    counter!(
        "market_recorder_records_written_total",
        "kind" => kind.as_str()
    )
    .increment(records);
    histogram!(
        "market_recorder_flush_duration_seconds",
        "kind" => kind.as_str()
    )
    .record(duration.as_secs_f64());
}

/// Record a batch dropped after a failed flush.
pub fn record_batch_dropped(kind: RecordKind, reason: DropReason, records: u64) {
    counter!(
        "market_recorder_batches_dropped_total",
        "kind" => kind.as_str(),
        "reason" => reason.as_str()
    )
    .increment(1);
    record_records_dropped(kind, reason, records);
}

/// Record a flush retry.
pub fn record_flush_retry(kind: RecordKind) {
    counter!(
        "market_recorder_flush_retries_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a task restart.
pub fn record_task_restart(task: &str) {
    counter!(
        "market_recorder_task_restarts_total",
        "task" => task.to_string()
    )
    .increment(1);
}

/// Record a source reconnection attempt.
pub fn record_source_reconnect(stream: &'static str) {
    counter!(
        "market_recorder_source_reconnects_total",
        "stream" => stream
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_reason_as_str() {
        assert_eq!(DropReason::QueueFull.as_str(), "queue_full");
        assert_eq!(DropReason::QueueClosed.as_str(), "queue_closed");
        assert_eq!(DropReason::FlushExhausted.as_str(), "flush_exhausted");
        assert_eq!(DropReason::Rejected.as_str(), "rejected");
        assert_eq!(DropReason::Shutdown.as_str(), "shutdown");
        assert_eq!(DropReason::TaskFailed.as_str(), "task_failed");
    }

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        record_enqueued(RecordKind::Trade);
        record_batch_dropped(RecordKind::Gap, DropReason::Rejected, 3);
        set_queue_depth(RecordKind::BookBin, 10);
    }
}
