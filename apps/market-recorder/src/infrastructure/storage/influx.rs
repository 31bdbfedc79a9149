//! InfluxDB v2 storage backend.
//!
//! Each batch is one `POST /api/v2/write` carrying newline-separated line
//! protocol with nanosecond timestamps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::application::ports::{StorageBackend, StorageError};
use crate::domain::record::{StorageRecord, encode_batch};
use crate::infrastructure::config::StorageToken;

/// Longest response body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Connection settings for an InfluxDB v2 bucket.
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    /// Base URL, e.g. `http://localhost:8086`.
    pub url: String,
    /// Organization.
    pub org: String,
    /// Bucket.
    pub bucket: String,
    /// API token.
    pub token: StorageToken,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// InfluxDB v2 write client.
#[derive(Debug)]
pub struct InfluxStorage {
    client: Client,
    write_url: String,
    org: String,
    bucket: String,
    token: StorageToken,
    timeout: Duration,
    closed: AtomicBool,
}

impl InfluxStorage {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Unavailable` if the HTTP client cannot be built.
    pub fn new(config: InfluxConfig) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StorageError::Unavailable {
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            write_url: format!("{}/api/v2/write", config.url.trim_end_matches('/')),
            org: config.org,
            bucket: config.bucket,
            token: config.token,
            timeout: config.timeout,
            closed: AtomicBool::new(false),
        })
    }

    fn map_send_error(&self, error: &reqwest::Error) -> StorageError {
        if error.is_timeout() {
            StorageError::Timeout(self.timeout)
        } else {
            StorageError::Unavailable {
                message: error.to_string(),
            }
        }
    }
}

#[async_trait]
impl StorageBackend for InfluxStorage {
    async fn write(&self, records: &[StorageRecord]) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(StorageError::Closed);
        }
        if records.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", self.token.expose()))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(encode_batch(records))
            .send()
            .await
            .map_err(|e| self.map_send_error(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let mut message = response.text().await.unwrap_or_default();
        if message.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }

        Err(classify_status(status, message, self.timeout))
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Map a non-success status to a storage error.
fn classify_status(status: StatusCode, message: String, timeout: Duration) -> StorageError {
    match status.as_u16() {
        408 => StorageError::Timeout(timeout),
        429 => StorageError::RateLimited,
        code @ 500..=599 => StorageError::Server {
            status: code,
            message,
        },
        code => StorageError::Rejected {
            status: code,
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(429, true ; "rate limited")]
    #[test_case(408, true ; "request timeout")]
    #[test_case(500, true ; "internal error")]
    #[test_case(503, true ; "unavailable")]
    #[test_case(400, false ; "bad line protocol")]
    #[test_case(401, false ; "bad token")]
    #[test_case(413, false ; "batch too large")]
    fn status_retry_classification(code: u16, retryable: bool) {
        let status = StatusCode::from_u16(code).unwrap();
        let error = classify_status(status, String::new(), Duration::from_secs(1));
        assert_eq!(error.is_retryable(), retryable);
    }

    #[test]
    fn write_url_strips_trailing_slash() {
        let storage = InfluxStorage::new(InfluxConfig {
            url: "http://influx:8086/".to_string(),
            org: "o".to_string(),
            bucket: "b".to_string(),
            token: StorageToken::new("t".to_string()),
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert_eq!(storage.write_url, "http://influx:8086/api/v2/write");
    }

    #[test]
    fn debug_redacts_token() {
        let storage = InfluxStorage::new(InfluxConfig {
            url: "http://influx:8086".to_string(),
            org: "o".to_string(),
            bucket: "b".to_string(),
            token: StorageToken::new("super-secret".to_string()),
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert!(!format!("{storage:?}").contains("super-secret"));
    }
}
