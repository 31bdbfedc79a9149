//! In-memory storage backend.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::application::ports::{StorageBackend, StorageError};
use crate::domain::record::{RecordKind, StorageRecord};

/// Keeps every written batch in memory.
///
/// Failures can be scripted with [`fail_next`](Self::fail_next) to exercise
/// retry paths.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    batches: Mutex<Vec<Vec<StorageRecord>>>,
    failures: Mutex<Vec<StorageError>>,
    attempts: AtomicU64,
    closed: AtomicBool,
}

impl InMemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes with `error`.
    pub fn fail_next(&self, count: usize, error: StorageError) {
        let mut failures = self.failures.lock();
        failures.extend(std::iter::repeat_n(error, count));
    }

    /// Batches written so far, in order.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<StorageRecord>> {
        self.batches.lock().clone()
    }

    /// Every record written so far, flattened.
    #[must_use]
    pub fn records(&self) -> Vec<StorageRecord> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    /// Records of one kind written so far.
    #[must_use]
    pub fn records_of(&self, kind: RecordKind) -> Vec<StorageRecord> {
        self.batches
            .lock()
            .iter()
            .flatten()
            .filter(|r| r.kind() == kind)
            .cloned()
            .collect()
    }

    /// Write calls made, including failed ones.
    #[must_use]
    pub fn write_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StorageBackend for InMemoryStorage {
    async fn write(&self, records: &[StorageRecord]) -> Result<(), StorageError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        if self.is_closed() {
            return Err(StorageError::Closed);
        }

        {
            let mut failures = self.failures.lock();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }

        self.batches.lock().push(records.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: i64) -> StorageRecord {
        StorageRecord::new(RecordKind::Trade, ts)
    }

    #[tokio::test]
    async fn stores_batches_in_order() {
        let storage = InMemoryStorage::new();
        storage.write(&[record(1), record(2)]).await.unwrap();
        storage.write(&[record(3)]).await.unwrap();

        assert_eq!(storage.batches().len(), 2);
        assert_eq!(storage.records().len(), 3);
        assert_eq!(storage.write_attempts(), 2);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed() {
        let storage = InMemoryStorage::new();
        storage.fail_next(1, StorageError::RateLimited);

        assert_eq!(
            storage.write(&[record(1)]).await,
            Err(StorageError::RateLimited)
        );
        storage.write(&[record(1)]).await.unwrap();
        assert_eq!(storage.batches().len(), 1);
        assert_eq!(storage.write_attempts(), 2);
    }

    #[tokio::test]
    async fn closed_store_rejects_writes() {
        let storage = InMemoryStorage::new();
        storage.close().await.unwrap();
        assert!(storage.is_closed());
        assert_eq!(storage.write(&[record(1)]).await, Err(StorageError::Closed));
    }
}
