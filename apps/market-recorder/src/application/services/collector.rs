//! Collector
//!
//! Bridges a `MarketDataSource` into the record queues. One collector runs
//! per process; it subscribes once to trades and once to order-book
//! snapshots, transforms every event into storage records, and enqueues
//! them.
//!
//! # Event Handling
//!
//! ```text
//! Trade ──► trade_record ─────────────────────────────► trade queue
//! Book  ──► ContinuityAudit ──► Gap/Stale ─► gap_record ─► gap queue
//!                          └──► (unless Stale) binned_records ─► book_bin queue
//! ```
//!
//! Continuity state belongs to the collector instance, so a restarted
//! collector re-anchors on the first snapshot it sees.
//!
//! Sources with sparse nonces report an anomaly on nearly every snapshot, so
//! anomaly warnings are sampled: the first, then every
//! `ANOMALY_LOG_INTERVAL`th. Every anomaly is still counted and recorded.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::queue::QueueSenders;
use crate::application::ports::{EventSink, MarketDataSource, SourceError};
use crate::domain::binning::BinningConfig;
use crate::domain::continuity::{ContinuityAudit, Verdict};
use crate::domain::market::{Instrument, MarketEvent, OrderBookSnapshot};
use crate::domain::record::{RecordKind, StorageRecord};
use crate::domain::schema::{binned_records, gap_record, trade_record};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Collector settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Instrument to record.
    pub instrument: Instrument,
    /// Minimum interval between order-book snapshots.
    pub snapshot_cadence: Duration,
    /// Capacity of the source event sink.
    pub source_buffer: usize,
    /// Depth binning parameters.
    pub binning: BinningConfig,
}

// =============================================================================
// Errors
// =============================================================================

/// Reasons a collector run ends.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// A subscription failed.
    #[error("{stream} subscription failed: {source}")]
    Source {
        /// Stream that failed.
        stream: &'static str,
        /// Underlying error.
        #[source]
        source: SourceError,
    },

    /// A subscription returned without error.
    #[error("{stream} subscription ended")]
    StreamEnded {
        /// Stream that ended.
        stream: &'static str,
    },
}

// =============================================================================
// Timestamp Guard
// =============================================================================

/// Tracks the last timestamp enqueued per record kind and reports
/// regressions. Regressions are logged and counted, never rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampGuard {
    last: [Option<i64>; 3],
}

impl TimestampGuard {
    const fn slot(kind: RecordKind) -> usize {
        match kind {
            RecordKind::Trade => 0,
            RecordKind::BookBin => 1,
            RecordKind::Gap => 2,
        }
    }

    /// Observe a record; returns `true` when its timestamp went backwards.
    pub fn observe(&mut self, record: &StorageRecord) -> bool {
        let slot = &mut self.last[Self::slot(record.kind())];
        let ts = record.timestamp_ns();
        match *slot {
            Some(previous) if ts < previous => true,
            _ => {
                *slot = Some(ts);
                false
            }
        }
    }
}

// =============================================================================
// Collector
// =============================================================================

/// Source-to-queue bridge.
pub struct Collector {
    config: CollectorConfig,
    source: Arc<dyn MarketDataSource>,
    queues: QueueSenders,
    audit: ContinuityAudit,
    guard: TimestampGuard,
    anomalies: u64,
}

/// Log every this many continuity anomalies after the first.
pub const ANOMALY_LOG_INTERVAL: u64 = 100;

/// Whether the `count`th anomaly (1-based) is logged at warn level.
#[must_use]
pub const fn anomaly_logged(count: u64) -> bool {
    count == 1 || count % ANOMALY_LOG_INTERVAL == 0
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("instrument", &self.config.instrument)
            .field("audit", &self.audit)
            .finish_non_exhaustive()
    }
}

impl Collector {
    /// Create a collector with fresh continuity state.
    #[must_use]
    pub fn new(
        config: CollectorConfig,
        source: Arc<dyn MarketDataSource>,
        queues: QueueSenders,
    ) -> Self {
        Self {
            config,
            source,
            queues,
            audit: ContinuityAudit::new(),
            guard: TimestampGuard::default(),
            anomalies: 0,
        }
    }

    /// Continuity anomalies seen by this collector.
    #[must_use]
    pub const fn anomalies(&self) -> u64 {
        self.anomalies
    }

    /// Run until cancelled or until a subscription ends.
    ///
    /// # Errors
    ///
    /// Returns `CollectorError` when either subscription ends or fails, so
    /// the supervisor can restart the collector.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), CollectorError> {
        let (sink, mut events) = EventSink::channel(self.config.source_buffer);
        let source = Arc::clone(&self.source);
        let instrument = self.config.instrument.clone();

        let trades = source.subscribe_trades(&instrument, sink.clone());
        let books = source.subscribe_order_book(&instrument, sink, self.config.snapshot_cadence);
        tokio::pin!(trades);
        tokio::pin!(books);

        tracing::info!(
            instrument = %instrument,
            cadence_ms = self.config.snapshot_cadence.as_millis(),
            "Collector started"
        );

        let outcome = loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    tracing::info!(
                        buffered = events.len(),
                        "Collector cancelled"
                    );
                    return Ok(());
                }

                result = &mut trades => break stream_outcome("trades", result),

                result = &mut books => break stream_outcome("order_book", result),

                Some(event) = events.recv() => {
                    self.handle_event(event).await;
                }
            }
        };

        // Events already delivered are still valid; flush them through.
        while let Ok(event) = events.try_recv() {
            self.handle_event(event).await;
        }

        tracing::warn!(error = %outcome, "Collector stopping");
        Err(outcome)
    }

    /// Transform one event and enqueue its records.
    pub async fn handle_event(&mut self, event: MarketEvent) {
        for record in self.process(event) {
            if self.guard.observe(&record) {
                metrics::record_timestamp_regression(record.kind());
                tracing::warn!(
                    kind = %record.kind(),
                    timestamp_ns = record.timestamp_ns(),
                    "Record timestamp went backwards"
                );
            }
            self.queues.dispatch(record).await;
        }
    }

    /// Transform one event into the records it produces, advancing the
    /// continuity audit.
    pub fn process(&mut self, event: MarketEvent) -> Vec<StorageRecord> {
        match event {
            MarketEvent::Trade(trade) => {
                metrics::record_source_event("trade");
                vec![trade_record(&trade)]
            }
            MarketEvent::Book(snapshot) => {
                metrics::record_source_event("book");
                self.process_snapshot(&snapshot)
            }
        }
    }

    fn process_snapshot(&mut self, snapshot: &OrderBookSnapshot) -> Vec<StorageRecord> {
        let verdict = self.audit.observe(snapshot);
        let mut records = Vec::new();

        if let Some(gap) = verdict.gap_event() {
            metrics::record_continuity_anomaly(gap.severity.as_str());
            self.anomalies += 1;
            if anomaly_logged(self.anomalies) {
                tracing::warn!(
                    exchange = %gap.exchange,
                    symbol = %gap.symbol,
                    severity = gap.severity.as_str(),
                    expected = gap.expected_nonce,
                    observed = gap.observed_nonce,
                    total_anomalies = self.anomalies,
                    "Order book continuity anomaly"
                );
            } else {
                tracing::debug!(
                    severity = gap.severity.as_str(),
                    expected = gap.expected_nonce,
                    observed = gap.observed_nonce,
                    "Order book continuity anomaly"
                );
            }
            records.push(gap_record(gap));
        }

        if matches!(verdict, Verdict::Anchored) {
            tracing::debug!(nonce = snapshot.nonce, "Order book nonce anchored");
        }

        if !verdict.keeps_snapshot() {
            return records;
        }

        match binned_records(snapshot, &self.config.binning) {
            Ok(bins) => records.extend(bins),
            Err(err) => {
                metrics::record_snapshot_skipped(err.reason());
                tracing::debug!(nonce = snapshot.nonce, error = %err, "Skipped order book snapshot");
            }
        }
        records
    }
}

fn stream_outcome(stream: &'static str, result: Result<(), SourceError>) -> CollectorError {
    match result {
        Ok(()) => CollectorError::StreamEnded { stream },
        Err(source) => CollectorError::Source { stream, source },
    }
}
