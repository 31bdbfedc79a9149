//! Batch Writer
//!
//! One writer runs per record kind. It drains its queue into a batch and
//! flushes the batch to a `StorageBackend` when the batch is full or when the
//! flush interval has elapsed since the first record entered it.
//!
//! # State Machine
//!
//! ```text
//!            record             full / timer          Ok
//!   Idle ───────────► Accumulating ───────► Flushing ─────► Idle
//!                                              │  ▲
//!                                   retryable  │  │ delay elapsed
//!                                              ▼  │
//!                                            Retrying
//! ```
//!
//! A batch that still fails after `max_retries` retries, or that the store
//! rejects outright, is dropped and counted. Records are written in dequeue
//! order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::queue::{RecordReceiver, SharedReceiver};
use crate::application::ports::StorageBackend;
use crate::domain::record::{RecordKind, StorageRecord};
use crate::infrastructure::metrics::{self, DropReason};

// =============================================================================
// Configuration
// =============================================================================

/// Batching and retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    /// Flush as soon as the batch holds this many records.
    pub max_batch_size: usize,
    /// Flush once this long has passed since the batch became non-empty.
    pub flush_interval: Duration,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub retry_base_delay: Duration,
    /// Upper bound on the retry delay.
    pub retry_max_delay: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            flush_interval: Duration::from_secs(1),
            max_retries: 5,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(5),
        }
    }
}

impl WriterConfig {
    /// Delay before retry number `attempt` (1-based): the base delay doubled
    /// per attempt, capped at the maximum.
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

// =============================================================================
// State and Statistics
// =============================================================================

/// Writer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriterState {
    /// Batch is empty.
    #[default]
    Idle,
    /// Batch is non-empty and the flush timer is running.
    Accumulating,
    /// A write is in flight.
    Flushing,
    /// A write failed and is being retried.
    Retrying {
        /// Retry number, starting at 1.
        attempt: u32,
    },
}

/// Counters for one writer, shared across restarts.
#[derive(Debug, Default)]
pub struct WriterStats {
    batches_flushed: AtomicU64,
    records_written: AtomicU64,
    batches_dropped: AtomicU64,
    records_dropped: AtomicU64,
    retries: AtomicU64,
    pending: AtomicU64,
}

/// Point-in-time copy of `WriterStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WriterStatsSnapshot {
    /// Batches written.
    pub batches_flushed: u64,
    /// Records written.
    pub records_written: u64,
    /// Batches dropped after failures.
    pub batches_dropped: u64,
    /// Records in dropped batches.
    pub records_dropped: u64,
    /// Retry attempts.
    pub retries: u64,
    /// Records held in the writer's current batch.
    pub pending: u64,
}

impl WriterStats {
    /// Copy the current counters.
    #[must_use]
    pub fn snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }

    /// Count the last published batch as dropped, for a writer that died
    /// without clearing it. Returns the records lost.
    pub fn abandon_pending(&self) -> u64 {
        let lost = self.pending.swap(0, Ordering::Relaxed);
        if lost > 0 {
            self.batches_dropped.fetch_add(1, Ordering::Relaxed);
            self.records_dropped.fetch_add(lost, Ordering::Relaxed);
        }
        lost
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Batching writer for one record kind.
pub struct Writer {
    kind: RecordKind,
    config: WriterConfig,
    storage: Arc<dyn StorageBackend>,
    queue: SharedReceiver,
    batch: Vec<StorageRecord>,
    state: WriterState,
    stats: Arc<WriterStats>,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("batch_len", &self.batch.len())
            .finish_non_exhaustive()
    }
}

impl Writer {
    /// Create a writer over a shared queue.
    #[must_use]
    pub fn new(
        kind: RecordKind,
        config: WriterConfig,
        storage: Arc<dyn StorageBackend>,
        queue: SharedReceiver,
        stats: Arc<WriterStats>,
    ) -> Self {
        Self {
            kind,
            config,
            storage,
            queue,
            batch: Vec::with_capacity(config.max_batch_size),
            state: WriterState::Idle,
            stats,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> WriterState {
        self.state
    }

    /// Records waiting in the current batch.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Run until cancelled or until the queue is closed and empty.
    ///
    /// On cancellation the queue is drained without waiting and flushed in
    /// batches of at most `max_batch_size` before returning.
    pub async fn run(&mut self, cancel: CancellationToken) {
        let queue = Arc::clone(&self.queue);
        let mut queue = queue.lock().await;
        let mut deadline: Option<Instant> = None;

        tracing::info!(kind = %self.kind, "Writer started");

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    tracing::info!(
                        kind = %self.kind,
                        pending = self.batch.len(),
                        "Writer draining for shutdown"
                    );
                    let mut drained = 0;
                    loop {
                        drained += self.fill(&mut queue);
                        if self.batch.is_empty() {
                            break;
                        }
                        self.flush(&cancel).await;
                    }
                    tracing::info!(kind = %self.kind, drained, "Writer drained");
                    break;
                }

                () = flush_timer(deadline) => {
                    deadline = None;
                    self.flush(&cancel).await;
                }

                received = queue.recv() => match received {
                    Some(record) => {
                        if self.batch.is_empty() {
                            deadline = Some(Instant::now() + self.config.flush_interval);
                            self.state = WriterState::Accumulating;
                        }
                        self.batch.push(record);
                        self.publish_pending();
                        if self.batch.len() >= self.config.max_batch_size {
                            deadline = None;
                            self.flush(&cancel).await;
                        }
                    }
                    None => {
                        tracing::info!(kind = %self.kind, "Writer queue closed");
                        self.flush(&cancel).await;
                        break;
                    }
                },
            }
        }

        tracing::info!(kind = %self.kind, stats = ?self.stats.snapshot(), "Writer stopped");
    }

    /// Top the batch up to `max_batch_size` from records already queued.
    fn fill(&mut self, queue: &mut RecordReceiver) -> usize {
        let mut taken = 0;
        while self.batch.len() < self.config.max_batch_size
            && let Some(record) = queue.try_recv()
        {
            self.batch.push(record);
            taken += 1;
        }
        self.publish_pending();
        taken
    }

    fn publish_pending(&self) {
        self.stats
            .pending
            .store(self.batch.len() as u64, Ordering::Relaxed);
    }

    /// Write the current batch, retrying retryable failures.
    async fn flush(&mut self, cancel: &CancellationToken) {
        if self.batch.is_empty() {
            self.state = WriterState::Idle;
            return;
        }

        let records = self.batch.len() as u64;
        let mut attempt = 0_u32;

        loop {
            self.state = if attempt == 0 {
                WriterState::Flushing
            } else {
                WriterState::Retrying { attempt }
            };

            let started = std::time::Instant::now();
            let result = self.storage.write(&self.batch).await;

            let err = match result {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    metrics::record_batch_flushed(self.kind, records, elapsed);
                    self.stats.batches_flushed.fetch_add(1, Ordering::Relaxed);
                    self.stats.records_written.fetch_add(records, Ordering::Relaxed);
                    tracing::debug!(
                        kind = %self.kind,
                        records,
                        attempt,
                        elapsed_ms = elapsed.as_millis(),
                        "Flushed batch"
                    );
                    self.batch.clear();
                    self.publish_pending();
                    break;
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                tracing::error!(kind = %self.kind, records, error = %err, "Storage rejected batch, dropping");
                self.drop_batch(DropReason::Rejected);
                break;
            }

            if attempt >= self.config.max_retries {
                tracing::error!(
                    kind = %self.kind,
                    records,
                    attempts = attempt + 1,
                    error = %err,
                    "Flush retries exhausted, dropping batch"
                );
                self.drop_batch(DropReason::FlushExhausted);
                break;
            }

            attempt += 1;
            let delay = self.config.retry_delay(attempt);
            metrics::record_flush_retry(self.kind);
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            self.state = WriterState::Retrying { attempt };
            tracing::warn!(
                kind = %self.kind,
                records,
                attempt,
                delay_ms = delay.as_millis(),
                error = %err,
                "Flush failed, retrying"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::error!(kind = %self.kind, records, "Shutdown during flush retry, abandoning batch");
                    self.drop_batch(DropReason::Shutdown);
                    break;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.state = WriterState::Idle;
    }

    fn drop_batch(&mut self, reason: DropReason) {
        let records = self.batch.len() as u64;
        metrics::record_batch_dropped(self.kind, reason, records);
        self.stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
        self.stats.records_dropped.fetch_add(records, Ordering::Relaxed);
        self.batch.clear();
        self.publish_pending();
    }
}

async fn flush_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::application::ports::{MockStorageBackend, StorageError};
    use crate::application::services::queue::{QueueConfig, QueueSenders, RecordQueues};
    use crate::infrastructure::storage::InMemoryStorage;

    fn record(ts: i64) -> StorageRecord {
        StorageRecord::new(RecordKind::Trade, ts).field("n", ts)
    }

    fn config(max_batch_size: usize) -> WriterConfig {
        WriterConfig {
            max_batch_size,
            flush_interval: Duration::from_secs(1),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_millis(250),
        }
    }

    fn writer(
        config: WriterConfig,
        storage: Arc<dyn StorageBackend>,
    ) -> (Writer, QueueSenders, Arc<WriterStats>) {
        let (senders, queues) = RecordQueues::new(QueueConfig::default());
        let stats = Arc::new(WriterStats::default());
        let writer = Writer::new(
            RecordKind::Trade,
            config,
            storage,
            queues.receiver(RecordKind::Trade),
            Arc::clone(&stats),
        );
        (writer, senders, stats)
    }

    fn timestamps(batches: &[Vec<StorageRecord>]) -> Vec<Vec<i64>> {
        batches
            .iter()
            .map(|batch| batch.iter().map(StorageRecord::timestamp_ns).collect())
            .collect()
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let config = config(10);
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(3), Duration::from_millis(250));
        assert_eq!(config.retry_delay(40), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_before_next_record_joins() {
        let storage = Arc::new(InMemoryStorage::new());
        let (mut writer, senders, stats) = writer(config(3), storage.clone());
        for ts in 1..=4 {
            senders.dispatch(record(ts)).await;
        }
        drop(senders);

        writer.run(CancellationToken::new()).await;

        assert_eq!(timestamps(&storage.batches()), vec![vec![1, 2, 3], vec![4]]);
        assert_eq!(stats.snapshot().batches_flushed, 2);
        assert_eq!(stats.snapshot().records_written, 4);
        assert_eq!(writer.state(), WriterState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_flushes_on_interval() {
        let storage = Arc::new(InMemoryStorage::new());
        let (mut writer, senders, _stats) = writer(config(100), storage.clone());
        let cancel = CancellationToken::new();
        senders.dispatch(record(1)).await;

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                writer.run(cancel).await;
                writer
            }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(storage.batches().is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(timestamps(&storage.batches()), vec![vec![1]]);

        cancel.cancel();
        let writer = task.await.unwrap();
        assert_eq!(writer.pending(), 0);
        assert_eq!(storage.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_drains_queue_and_flushes() {
        let storage = Arc::new(InMemoryStorage::new());
        let (mut writer, senders, _stats) = writer(config(100), storage.clone());
        let cancel = CancellationToken::new();
        for ts in 1..=5 {
            senders.dispatch(record(ts)).await;
        }
        cancel.cancel();

        writer.run(cancel).await;

        assert_eq!(timestamps(&storage.batches()), vec![vec![1, 2, 3, 4, 5]]);
        drop(senders);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drain_flushes_in_bounded_batches() {
        let storage = Arc::new(InMemoryStorage::new());
        let (mut writer, senders, stats) = writer(config(3), storage.clone());
        let cancel = CancellationToken::new();
        for ts in 1..=10 {
            senders.dispatch(record(ts)).await;
        }
        cancel.cancel();

        writer.run(cancel).await;

        assert_eq!(
            timestamps(&storage.batches()),
            vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9], vec![10]]
        );
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.records_written, 10);
        assert_eq!(snapshot.pending, 0);
        drop(senders);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_batch_is_published_and_can_be_abandoned() {
        let storage = Arc::new(InMemoryStorage::new());
        let (mut writer, senders, stats) = writer(config(10), storage.clone());
        senders.dispatch(record(1)).await;
        senders.dispatch(record(2)).await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { writer.run(cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stats.snapshot().pending, 2);

        assert_eq!(stats.abandon_pending(), 2);
        assert_eq!(stats.abandon_pending(), 0);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.batches_dropped, 1);
        assert_eq!(snapshot.records_dropped, 2);

        cancel.cancel();
        task.await.unwrap();
        drop(senders);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_is_retried_with_same_batch() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.fail_next(2, StorageError::RateLimited);
        let (mut writer, senders, stats) = writer(config(2), storage.clone());
        senders.dispatch(record(1)).await;
        senders.dispatch(record(2)).await;
        drop(senders);

        writer.run(CancellationToken::new()).await;

        assert_eq!(timestamps(&storage.batches()), vec![vec![1, 2]]);
        assert_eq!(storage.write_attempts(), 3);
        assert_eq!(stats.snapshot().retries, 2);
        assert_eq!(stats.snapshot().batches_dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_drop_batch() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut storage = MockStorageBackend::new();
        let counter = Arc::clone(&attempts);
        storage.expect_write().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Unavailable {
                message: "connection refused".to_string(),
            })
        });
        let (mut writer, senders, stats) = writer(config(1), Arc::new(storage));
        senders.dispatch(record(1)).await;
        drop(senders);

        writer.run(CancellationToken::new()).await;

        // One attempt plus three retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        let stats = stats.snapshot();
        assert_eq!(stats.batches_dropped, 1);
        assert_eq!(stats.records_dropped, 1);
        assert_eq!(stats.retries, 3);
        assert_eq!(writer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_batch_is_not_retried() {
        let mut storage = MockStorageBackend::new();
        storage.expect_write().times(1).returning(|_| {
            Err(StorageError::Rejected {
                status: 400,
                message: "unable to parse".to_string(),
            })
        });
        let (mut writer, senders, stats) = writer(config(1), Arc::new(storage));
        senders.dispatch(record(1)).await;
        drop(senders);

        writer.run(CancellationToken::new()).await;

        assert_eq!(stats.snapshot().batches_dropped, 1);
        assert_eq!(stats.snapshot().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_retry_abandons_batch() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.fail_next(10, StorageError::Timeout(Duration::from_secs(1)));
        let (mut writer, senders, stats) = writer(config(1), storage.clone());
        let cancel = CancellationToken::new();
        senders.dispatch(record(1)).await;

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { writer.run(cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(storage.batches().is_empty());
        assert_eq!(stats.snapshot().batches_dropped, 1);
        drop(senders);
    }

    #[tokio::test]
    async fn restarted_writer_resumes_same_queue() {
        let storage = Arc::new(InMemoryStorage::new());
        let (senders, queues) = RecordQueues::new(QueueConfig::default());
        let receiver = queues.receiver(RecordKind::Trade);
        let stats = Arc::new(WriterStats::default());

        senders.dispatch(record(1)).await;
        {
            let cancel = CancellationToken::new();
            cancel.cancel();
            let mut first = Writer::new(
                RecordKind::Trade,
                config(10),
                storage.clone(),
                Arc::clone(&receiver),
                Arc::clone(&stats),
            );
            first.run(cancel).await;
        }

        senders.dispatch(record(2)).await;
        drop(senders);
        let mut second = Writer::new(
            RecordKind::Trade,
            config(10),
            storage.clone(),
            receiver,
            Arc::clone(&stats),
        );
        second.run(CancellationToken::new()).await;

        assert_eq!(timestamps(&storage.batches()), vec![vec![1], vec![2]]);
        assert_eq!(stats.snapshot().batches_flushed, 2);
    }
}
