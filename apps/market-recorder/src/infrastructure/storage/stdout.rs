//! Stdout storage backend.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::application::ports::{StorageBackend, StorageError};
use crate::domain::record::{StorageRecord, encode_batch};

/// Writes each batch to stdout as line protocol.
#[derive(Debug)]
pub struct StdoutStorage {
    out: Mutex<tokio::io::Stdout>,
}

impl StdoutStorage {
    /// Create a stdout backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdoutStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for StdoutStorage {
    async fn write(&self, records: &[StorageRecord]) -> Result<(), StorageError> {
        let body = encode_batch(records);
        let mut out = self.out.lock().await;
        out.write_all(body.as_bytes())
            .await
            .map_err(|e| StorageError::Unavailable {
                message: e.to_string(),
            })?;
        out.flush().await.map_err(|e| StorageError::Unavailable {
            message: e.to_string(),
        })
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.out
            .lock()
            .await
            .flush()
            .await
            .map_err(|e| StorageError::Unavailable {
                message: e.to_string(),
            })
    }
}
