//! Record Queues
//!
//! One bounded channel per record kind connects the collector to the
//! writers. Senders never block indefinitely: an enqueue waits at most the
//! configured timeout for capacity, then drops the record and counts it.
//!
//! Receivers sit behind an async mutex so a restarted writer resumes
//! draining the same queue its predecessor was reading.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use crate::domain::record::{RecordKind, StorageRecord};
use crate::infrastructure::metrics::{self, DropReason};

// =============================================================================
// Configuration
// =============================================================================

/// Queue capacity and backpressure settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum records buffered per queue.
    pub capacity: usize,
    /// Longest an enqueue waits for capacity before dropping.
    pub enqueue_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            enqueue_timeout: Duration::from_millis(50),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters shared between the two ends of a queue.
#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of `QueueStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStatsSnapshot {
    /// Records accepted.
    pub enqueued: u64,
    /// Records dropped at enqueue.
    pub dropped: u64,
}

impl QueueStats {
    /// Copy the current counters.
    #[must_use]
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Sender
// =============================================================================

/// Result of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The record is in the queue.
    Enqueued,
    /// The record was dropped.
    Dropped(DropReason),
}

/// Producer handle for one record kind.
#[derive(Debug, Clone)]
pub struct RecordSender {
    kind: RecordKind,
    tx: mpsc::Sender<StorageRecord>,
    enqueue_timeout: Duration,
    stats: Arc<QueueStats>,
}

impl RecordSender {
    /// Record kind this queue carries.
    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Enqueue a record, waiting at most the enqueue timeout for capacity.
    pub async fn enqueue(&self, record: StorageRecord) -> EnqueueOutcome {
        match self.tx.send_timeout(record, self.enqueue_timeout).await {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                metrics::record_enqueued(self.kind);
                EnqueueOutcome::Enqueued
            }
            Err(err) => {
                let reason = match err {
                    mpsc::error::SendTimeoutError::Timeout(_) => DropReason::QueueFull,
                    mpsc::error::SendTimeoutError::Closed(_) => DropReason::QueueClosed,
                };
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::record_records_dropped(self.kind, reason, 1);
                // Log the first drop and then every thousandth to keep a
                // saturated queue from flooding the log.
                if dropped == 1 || dropped % 1_000 == 0 {
                    tracing::warn!(
                        kind = %self.kind,
                        reason = reason.as_str(),
                        total_dropped = dropped,
                        "Dropped record at enqueue"
                    );
                }
                EnqueueOutcome::Dropped(reason)
            }
        }
    }

    /// Records currently waiting in the queue.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Senders for every record kind, handed to the collector.
#[derive(Debug, Clone)]
pub struct QueueSenders {
    trades: RecordSender,
    book_bins: RecordSender,
    gaps: RecordSender,
}

impl QueueSenders {
    /// Sender for a record kind.
    #[must_use]
    pub const fn for_kind(&self, kind: RecordKind) -> &RecordSender {
        match kind {
            RecordKind::Trade => &self.trades,
            RecordKind::BookBin => &self.book_bins,
            RecordKind::Gap => &self.gaps,
        }
    }

    /// Route a record to the queue for its kind.
    pub async fn dispatch(&self, record: StorageRecord) -> EnqueueOutcome {
        self.for_kind(record.kind()).enqueue(record).await
    }
}

// =============================================================================
// Receiver
// =============================================================================

/// Consumer handle for one record kind.
#[derive(Debug)]
pub struct RecordReceiver {
    kind: RecordKind,
    rx: mpsc::Receiver<StorageRecord>,
}

impl RecordReceiver {
    /// Record kind this queue carries.
    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Wait for the next record; `None` once every sender is gone and the
    /// queue is empty.
    pub async fn recv(&mut self) -> Option<StorageRecord> {
        self.rx.recv().await
    }

    /// Take the next record if one is immediately available.
    pub fn try_recv(&mut self) -> Option<StorageRecord> {
        self.rx.try_recv().ok()
    }

    /// Records currently waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Receiver shared across writer restarts.
pub type SharedReceiver = Arc<Mutex<RecordReceiver>>;

// =============================================================================
// Queue Set
// =============================================================================

/// Receivers and statistics for every record kind.
#[derive(Debug)]
pub struct RecordQueues {
    trades: (SharedReceiver, Arc<QueueStats>),
    book_bins: (SharedReceiver, Arc<QueueStats>),
    gaps: (SharedReceiver, Arc<QueueStats>),
}

impl RecordQueues {
    /// Create one queue per record kind.
    #[must_use]
    pub fn new(config: QueueConfig) -> (QueueSenders, Self) {
        let (trades_tx, trades) = channel(RecordKind::Trade, config);
        let (book_bins_tx, book_bins) = channel(RecordKind::BookBin, config);
        let (gaps_tx, gaps) = channel(RecordKind::Gap, config);
        (
            QueueSenders {
                trades: trades_tx,
                book_bins: book_bins_tx,
                gaps: gaps_tx,
            },
            Self {
                trades,
                book_bins,
                gaps,
            },
        )
    }

    const fn entry(&self, kind: RecordKind) -> &(SharedReceiver, Arc<QueueStats>) {
        match kind {
            RecordKind::Trade => &self.trades,
            RecordKind::BookBin => &self.book_bins,
            RecordKind::Gap => &self.gaps,
        }
    }

    /// Shared receiver for a record kind.
    #[must_use]
    pub fn receiver(&self, kind: RecordKind) -> SharedReceiver {
        Arc::clone(&self.entry(kind).0)
    }

    /// Statistics for a record kind.
    #[must_use]
    pub fn stats(&self, kind: RecordKind) -> QueueStatsSnapshot {
        self.entry(kind).1.snapshot()
    }
}

fn channel(
    kind: RecordKind,
    config: QueueConfig,
) -> (RecordSender, (SharedReceiver, Arc<QueueStats>)) {
    let (tx, rx) = mpsc::channel(config.capacity.max(1));
    let stats = Arc::new(QueueStats::default());
    (
        RecordSender {
            kind,
            tx,
            enqueue_timeout: config.enqueue_timeout,
            stats: Arc::clone(&stats),
        },
        (Arc::new(Mutex::new(RecordReceiver { kind, rx })), stats),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: RecordKind, ts: i64) -> StorageRecord {
        StorageRecord::new(kind, ts).field("n", ts)
    }

    #[tokio::test]
    async fn dispatch_routes_by_kind() {
        let (senders, queues) = RecordQueues::new(QueueConfig::default());

        senders.dispatch(record(RecordKind::Gap, 1)).await;
        senders.dispatch(record(RecordKind::Trade, 2)).await;

        let gaps = queues.receiver(RecordKind::Gap);
        let mut gaps = gaps.lock().await;
        assert_eq!(gaps.kind(), RecordKind::Gap);
        assert_eq!(gaps.try_recv().map(|r| r.timestamp_ns()), Some(1));
        assert!(gaps.is_empty());
        assert_eq!(queues.stats(RecordKind::Trade).enqueued, 1);
        assert_eq!(senders.for_kind(RecordKind::Trade).depth(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_after_timeout() {
        let config = QueueConfig {
            capacity: 2,
            enqueue_timeout: Duration::from_millis(10),
        };
        let (senders, queues) = RecordQueues::new(config);
        let trades = senders.for_kind(RecordKind::Trade);

        assert_eq!(trades.enqueue(record(RecordKind::Trade, 1)).await, EnqueueOutcome::Enqueued);
        assert_eq!(trades.enqueue(record(RecordKind::Trade, 2)).await, EnqueueOutcome::Enqueued);
        assert_eq!(
            trades.enqueue(record(RecordKind::Trade, 3)).await,
            EnqueueOutcome::Dropped(DropReason::QueueFull)
        );

        let stats = queues.stats(RecordKind::Trade);
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn receiver_sees_end_once_senders_are_gone() {
        let (senders, queues) = RecordQueues::new(QueueConfig::default());
        senders.dispatch(record(RecordKind::BookBin, 1)).await;
        drop(senders);

        let receiver = queues.receiver(RecordKind::BookBin);
        let mut receiver = receiver.lock().await;
        assert!(receiver.recv().await.is_some());
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_queue_drops() {
        let (senders, queues) = RecordQueues::new(QueueConfig::default());
        drop(queues);
        assert_eq!(
            senders.dispatch(record(RecordKind::Trade, 1)).await,
            EnqueueOutcome::Dropped(DropReason::QueueClosed)
        );
    }
}
