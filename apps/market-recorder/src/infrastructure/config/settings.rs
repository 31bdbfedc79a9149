//! Recorder Configuration Settings
//!
//! Configuration types for the market recorder, loaded from environment
//! variables. Malformed numeric values fall back to their defaults; semantic
//! problems (zero capacities, empty symbol, missing token) are rejected by
//! `RecorderConfig::validate`.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::application::services::{
    CollectorConfig, QueueConfig, RestartPolicy, SupervisorConfig, WriterConfig,
};
use crate::domain::binning::BinningConfig;
use crate::domain::market::Instrument;

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    /// InfluxDB v2 HTTP write API.
    #[default]
    Influx,
    /// Line protocol to standard output (dry run).
    Stdout,
}

impl StorageKind {
    /// Parse storage kind from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "stdout" | "dry-run" | "dry_run" => Self::Stdout,
            _ => Self::Influx,
        }
    }

    /// Get the storage kind name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Influx => "influx",
            Self::Stdout => "stdout",
        }
    }
}

/// Time-series store API token.
#[derive(Clone)]
pub struct StorageToken(String);

impl StorageToken {
    /// Wrap a token.
    #[must_use]
    pub const fn new(token: String) -> Self {
        Self(token)
    }

    /// Get the token.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for StorageToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Market data source settings.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// WebSocket base URL.
    pub url: String,
    /// Order-book levels per side requested from the source.
    pub book_depth: u16,
    /// Minimum interval between order-book snapshots.
    pub snapshot_cadence: Duration,
    /// Capacity of the source event buffer.
    pub buffer: usize,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            url: "wss://stream.binance.com:9443".to_string(),
            book_depth: 20,
            snapshot_cadence: Duration::from_millis(100),
            buffer: 1_024,
        }
    }
}

/// Depth binning settings.
#[derive(Debug, Clone, Copy)]
pub struct BinningSettings {
    /// Basis points per bin.
    pub bps_per_bin: Decimal,
    /// Bins on each side of mid.
    pub max_bins: u32,
}

impl Default for BinningSettings {
    fn default() -> Self {
        Self {
            bps_per_bin: Decimal::from(5),
            max_bins: 50,
        }
    }
}

/// Record queue settings.
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// Capacity of each record queue.
    pub capacity: usize,
    /// Longest an enqueue waits for capacity.
    pub enqueue_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            enqueue_timeout: Duration::from_millis(50),
        }
    }
}

/// Batch writer settings.
#[derive(Debug, Clone, Copy)]
pub struct WriterSettings {
    /// Records per batch before a forced flush.
    pub batch_size: usize,
    /// Time from first record to flush.
    pub flush_interval: Duration,
    /// Retries per batch.
    pub max_retries: u32,
    /// First retry delay.
    pub retry_base_delay: Duration,
    /// Retry delay cap.
    pub retry_max_delay: Duration,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_millis(1_000),
            max_retries: 5,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_millis(5_000),
        }
    }
}

/// Task supervision settings.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    /// First restart delay.
    pub restart_base_delay: Duration,
    /// Restart delay cap.
    pub restart_max_delay: Duration,
    /// Restart delay growth per consecutive failure.
    pub restart_multiplier: f64,
    /// Run length that resets the restart delay.
    pub healthy_after: Duration,
    /// Deadline for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            restart_base_delay: Duration::from_millis(500),
            restart_max_delay: Duration::from_millis(60_000),
            restart_multiplier: 2.0,
            healthy_after: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Inactivity timeout before considering the connection dead.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum consecutive reconnection attempts before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 10,
        }
    }
}

/// Time-series store settings.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Backend selection.
    pub kind: StorageKind,
    /// Store base URL.
    pub url: String,
    /// Organization.
    pub org: String,
    /// Bucket.
    pub bucket: String,
    /// API token.
    pub token: Option<StorageToken>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            kind: StorageKind::Influx,
            url: "http://localhost:8086".to_string(),
            org: "market".to_string(),
            bucket: "market_data".to_string(),
            token: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port (0 = disabled).
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete recorder configuration.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Exchange identifier.
    pub exchange: String,
    /// Exchange symbol.
    pub symbol: String,
    /// Source settings.
    pub source: SourceSettings,
    /// Binning settings.
    pub binning: BinningSettings,
    /// Queue settings.
    pub queue: QueueSettings,
    /// Writer settings.
    pub writer: WriterSettings,
    /// Supervision settings.
    pub supervisor: SupervisorSettings,
    /// WebSocket connection settings.
    pub websocket: WebSocketSettings,
    /// Storage settings.
    pub storage: StorageSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Stop after this long; `None` runs until signalled.
    pub run_duration: Option<Duration>,
}

impl RecorderConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or the resulting
    /// configuration is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or the resulting
    /// configuration is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let source_defaults = SourceSettings::default();
        let source = SourceSettings {
            url: env.string("RECORDER_SOURCE_URL", &source_defaults.url),
            book_depth: env.parse("RECORDER_BOOK_DEPTH", source_defaults.book_depth),
            snapshot_cadence: env.millis(
                "RECORDER_SNAPSHOT_CADENCE_MS",
                source_defaults.snapshot_cadence,
            ),
            buffer: env.parse("RECORDER_SOURCE_BUFFER", source_defaults.buffer),
        };

        let binning_defaults = BinningSettings::default();
        let binning = BinningSettings {
            bps_per_bin: env.parse("RECORDER_BPS_PER_BIN", binning_defaults.bps_per_bin),
            max_bins: env.parse("RECORDER_MAX_BINS", binning_defaults.max_bins),
        };

        let queue_defaults = QueueSettings::default();
        let queue = QueueSettings {
            capacity: env.parse("RECORDER_QUEUE_CAPACITY", queue_defaults.capacity),
            enqueue_timeout: env.millis(
                "RECORDER_ENQUEUE_TIMEOUT_MS",
                queue_defaults.enqueue_timeout,
            ),
        };

        let writer_defaults = WriterSettings::default();
        let writer = WriterSettings {
            batch_size: env.parse("RECORDER_BATCH_SIZE", writer_defaults.batch_size),
            flush_interval: env.millis(
                "RECORDER_FLUSH_INTERVAL_MS",
                writer_defaults.flush_interval,
            ),
            max_retries: env.parse("RECORDER_FLUSH_MAX_RETRIES", writer_defaults.max_retries),
            retry_base_delay: env.millis(
                "RECORDER_FLUSH_RETRY_BASE_MS",
                writer_defaults.retry_base_delay,
            ),
            retry_max_delay: env.millis(
                "RECORDER_FLUSH_RETRY_MAX_MS",
                writer_defaults.retry_max_delay,
            ),
        };

        let supervisor_defaults = SupervisorSettings::default();
        let supervisor = SupervisorSettings {
            restart_base_delay: env.millis(
                "RECORDER_RESTART_BASE_MS",
                supervisor_defaults.restart_base_delay,
            ),
            restart_max_delay: env.millis(
                "RECORDER_RESTART_MAX_MS",
                supervisor_defaults.restart_max_delay,
            ),
            restart_multiplier: env.parse(
                "RECORDER_RESTART_MULTIPLIER",
                supervisor_defaults.restart_multiplier,
            ),
            healthy_after: env.secs(
                "RECORDER_HEALTHY_AFTER_SECS",
                supervisor_defaults.healthy_after,
            ),
            shutdown_timeout: env.secs(
                "RECORDER_SHUTDOWN_TIMEOUT_SECS",
                supervisor_defaults.shutdown_timeout,
            ),
        };

        let websocket_defaults = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            heartbeat_interval: env.secs(
                "RECORDER_HEARTBEAT_INTERVAL_SECS",
                websocket_defaults.heartbeat_interval,
            ),
            heartbeat_timeout: env.secs(
                "RECORDER_HEARTBEAT_TIMEOUT_SECS",
                websocket_defaults.heartbeat_timeout,
            ),
            reconnect_delay_initial: env.millis(
                "RECORDER_RECONNECT_DELAY_INITIAL_MS",
                websocket_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.secs(
                "RECORDER_RECONNECT_DELAY_MAX_SECS",
                websocket_defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.parse(
                "RECORDER_RECONNECT_DELAY_MULTIPLIER",
                websocket_defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: env.parse(
                "RECORDER_MAX_RECONNECT_ATTEMPTS",
                websocket_defaults.max_reconnect_attempts,
            ),
        };

        let storage_defaults = StorageSettings::default();
        let storage = StorageSettings {
            kind: env
                .get("RECORDER_STORAGE")
                .map(|s| StorageKind::from_str_case_insensitive(&s))
                .unwrap_or_default(),
            url: env.string("INFLUX_URL", &storage_defaults.url),
            org: env.string("INFLUX_ORG", &storage_defaults.org),
            bucket: env.string("INFLUX_BUCKET", &storage_defaults.bucket),
            token: env.get("INFLUX_TOKEN").map(StorageToken::new),
            timeout: env.secs("RECORDER_STORAGE_TIMEOUT_SECS", storage_defaults.timeout),
        };

        let server = ServerSettings {
            health_port: env.parse("RECORDER_HEALTH_PORT", ServerSettings::default().health_port),
        };

        let run_duration = Some(env.secs("RECORDER_RUN_DURATION_SECS", Duration::ZERO))
            .filter(|d| !d.is_zero());

        let config = Self {
            exchange: env.string("RECORDER_EXCHANGE", "binance"),
            symbol: env.string("RECORDER_SYMBOL", "BTCUSDT").to_uppercase(),
            source,
            binning,
            queue,
            writer,
            supervisor,
            websocket,
            storage,
            server,
            run_duration,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exchange.is_empty() {
            return Err(ConfigError::EmptyValue("RECORDER_EXCHANGE".to_string()));
        }
        if self.symbol.is_empty() {
            return Err(ConfigError::EmptyValue("RECORDER_SYMBOL".to_string()));
        }
        if self.queue.capacity == 0 {
            return Err(invalid("RECORDER_QUEUE_CAPACITY", "must be at least 1"));
        }
        if self.source.buffer == 0 {
            return Err(invalid("RECORDER_SOURCE_BUFFER", "must be at least 1"));
        }
        if self.writer.batch_size == 0 {
            return Err(invalid("RECORDER_BATCH_SIZE", "must be at least 1"));
        }
        if self.writer.flush_interval.is_zero() {
            return Err(invalid("RECORDER_FLUSH_INTERVAL_MS", "must be positive"));
        }
        if self.binning.bps_per_bin <= Decimal::ZERO {
            return Err(invalid("RECORDER_BPS_PER_BIN", "must be positive"));
        }
        if self.binning.max_bins == 0 {
            return Err(invalid("RECORDER_MAX_BINS", "must be at least 1"));
        }
        if self.source.book_depth == 0 {
            return Err(invalid("RECORDER_BOOK_DEPTH", "must be at least 1"));
        }
        if self.storage.kind == StorageKind::Influx {
            match &self.storage.token {
                None => return Err(ConfigError::MissingEnvVar("INFLUX_TOKEN".to_string())),
                Some(token) if token.expose().is_empty() => {
                    return Err(ConfigError::EmptyValue("INFLUX_TOKEN".to_string()));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// The recorded instrument.
    #[must_use]
    pub fn instrument(&self) -> Instrument {
        Instrument::new(self.exchange.as_str(), self.symbol.as_str())
    }

    /// Binning parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the binning settings are unusable.
    pub fn binning_config(&self) -> Result<BinningConfig, ConfigError> {
        BinningConfig::new(self.binning.bps_per_bin, self.binning.max_bins)
            .map_err(|e| invalid("RECORDER_BPS_PER_BIN", &e.to_string()))
    }

    /// Pipeline settings for the supervisor.
    ///
    /// # Errors
    ///
    /// Returns an error if the binning settings are unusable.
    pub fn supervisor_config(&self) -> Result<SupervisorConfig, ConfigError> {
        Ok(SupervisorConfig {
            collector: CollectorConfig {
                instrument: self.instrument(),
                snapshot_cadence: self.source.snapshot_cadence,
                source_buffer: self.source.buffer,
                binning: self.binning_config()?,
            },
            queue: QueueConfig {
                capacity: self.queue.capacity,
                enqueue_timeout: self.queue.enqueue_timeout,
            },
            writer: WriterConfig {
                max_batch_size: self.writer.batch_size,
                flush_interval: self.writer.flush_interval,
                max_retries: self.writer.max_retries,
                retry_base_delay: self.writer.retry_base_delay,
                retry_max_delay: self.writer.retry_max_delay,
            },
            restart: RestartPolicy {
                base_delay: self.supervisor.restart_base_delay,
                multiplier: self.supervisor.restart_multiplier,
                max_delay: self.supervisor.restart_max_delay,
                healthy_after: self.supervisor.healthy_after,
            },
            shutdown_timeout: self.supervisor.shutdown_timeout,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Variable lookup with typed, defaulting accessors.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<RecorderConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        RecorderConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_with_token() {
        let config = load(&[("INFLUX_TOKEN", "secret-token")]).unwrap();

        assert_eq!(config.exchange, "binance");
        assert_eq!(config.symbol, "BTCUSDT");
        assert_eq!(config.source.url, "wss://stream.binance.com:9443");
        assert_eq!(config.source.book_depth, 20);
        assert_eq!(config.source.snapshot_cadence, Duration::from_millis(100));
        assert_eq!(config.binning.bps_per_bin, Decimal::from(5));
        assert_eq!(config.binning.max_bins, 50);
        assert_eq!(config.queue.capacity, 10_000);
        assert_eq!(config.writer.batch_size, 500);
        assert_eq!(config.writer.max_retries, 5);
        assert_eq!(config.supervisor.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.websocket.max_reconnect_attempts, 10);
        assert_eq!(config.storage.kind, StorageKind::Influx);
        assert_eq!(config.server.health_port, 8083);
        assert!(config.run_duration.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("RECORDER_SYMBOL", "ethusdt"),
            ("RECORDER_BPS_PER_BIN", "2.5"),
            ("RECORDER_MAX_BINS", "20"),
            ("RECORDER_BATCH_SIZE", "3"),
            ("RECORDER_FLUSH_INTERVAL_MS", "250"),
            ("RECORDER_RESTART_MULTIPLIER", "1.5"),
            ("RECORDER_RUN_DURATION_SECS", "90"),
            ("RECORDER_STORAGE", "stdout"),
        ])
        .unwrap();

        assert_eq!(config.symbol, "ETHUSDT");
        assert_eq!(config.binning.bps_per_bin, Decimal::new(25, 1));
        assert_eq!(config.binning.max_bins, 20);
        assert_eq!(config.writer.batch_size, 3);
        assert_eq!(config.writer.flush_interval, Duration::from_millis(250));
        assert!((config.supervisor.restart_multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.run_duration, Some(Duration::from_secs(90)));
        assert_eq!(config.storage.kind, StorageKind::Stdout);
    }

    #[test]
    fn malformed_numbers_fall_back_to_defaults() {
        let config = load(&[
            ("RECORDER_STORAGE", "stdout"),
            ("RECORDER_QUEUE_CAPACITY", "lots"),
            ("RECORDER_BPS_PER_BIN", "five"),
        ])
        .unwrap();

        assert_eq!(config.queue.capacity, 10_000);
        assert_eq!(config.binning.bps_per_bin, Decimal::from(5));
    }

    #[test]
    fn influx_requires_token() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref key) if key == "INFLUX_TOKEN"));

        let err = load(&[("INFLUX_TOKEN", "  ")]).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(_)));
    }

    #[test]
    fn zero_values_are_rejected() {
        for key in [
            "RECORDER_QUEUE_CAPACITY",
            "RECORDER_BATCH_SIZE",
            "RECORDER_MAX_BINS",
            "RECORDER_BPS_PER_BIN",
        ] {
            let err = load(&[("RECORDER_STORAGE", "stdout"), (key, "0")]).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { key: ref k, .. } if k == key),
                "{key} should be rejected"
            );
        }
    }

    #[test]
    fn token_redacted_debug() {
        let config = load(&[("INFLUX_TOKEN", "super-secret")]).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn storage_kind_parsing() {
        assert_eq!(StorageKind::from_str_case_insensitive("STDOUT"), StorageKind::Stdout);
        assert_eq!(StorageKind::from_str_case_insensitive("influx"), StorageKind::Influx);
        assert_eq!(StorageKind::from_str_case_insensitive("other"), StorageKind::Influx);
        assert_eq!(StorageKind::Stdout.as_str(), "stdout");
    }

    #[test]
    fn supervisor_config_mapping() {
        let config = load(&[("RECORDER_STORAGE", "stdout")]).unwrap();
        let supervisor = config.supervisor_config().unwrap();

        assert_eq!(supervisor.collector.instrument.to_string(), "binance:BTCUSDT");
        assert_eq!(supervisor.writer.max_batch_size, 500);
        assert_eq!(supervisor.restart.base_delay, Duration::from_millis(500));
        assert_eq!(supervisor.restart.max_delay, Duration::from_secs(60));
        assert_eq!(supervisor.queue.enqueue_timeout, Duration::from_millis(50));
    }
}
