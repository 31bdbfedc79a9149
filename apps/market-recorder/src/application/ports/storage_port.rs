//! Storage Port (Driven Port)
//!
//! Interface for persisting batches of storage records.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::record::StorageRecord;

/// Storage backend error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The store could not be reached.
    #[error("Storage unavailable: {message}")]
    Unavailable {
        /// Error details.
        message: String,
    },

    /// The write did not complete in time.
    #[error("Storage write timed out after {0:?}")]
    Timeout(Duration),

    /// The store asked us to slow down.
    #[error("Rate limited by storage")]
    RateLimited,

    /// The store failed internally.
    #[error("Storage server error ({status}): {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },

    /// The store refused the batch; resending it will not help.
    #[error("Storage rejected batch ({status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },

    /// The client has been closed.
    #[error("Storage client closed")]
    Closed,
}

impl StorageError {
    /// Whether resending the same batch may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout(_) | Self::RateLimited | Self::Server { .. }
        )
    }

    /// Short label for metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "unavailable",
            Self::Timeout(_) => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Server { .. } => "server",
            Self::Rejected { .. } => "rejected",
            Self::Closed => "closed",
        }
    }
}

/// Port for a batch-oriented time-series store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write a batch. The whole batch succeeds or fails together.
    async fn write(&self, records: &[StorageRecord]) -> Result<(), StorageError>;

    /// Release the client.
    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(
            StorageError::Unavailable {
                message: "refused".to_string()
            }
            .is_retryable()
        );
        assert!(StorageError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(StorageError::RateLimited.is_retryable());
        assert!(
            StorageError::Server {
                status: 503,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            !StorageError::Rejected {
                status: 400,
                message: "bad line".to_string()
            }
            .is_retryable()
        );
        assert!(!StorageError::Closed.is_retryable());
    }

    #[test]
    fn reason_labels() {
        assert_eq!(StorageError::RateLimited.reason(), "rate_limited");
        assert_eq!(StorageError::Closed.reason(), "closed");
    }
}
