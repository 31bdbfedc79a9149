#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Recorder - Live Market Data Ingestion
//!
//! A long-running service that subscribes to one exchange/symbol pair's
//! trade and order-book streams, bins book depth in basis points around the
//! mid-price, audits snapshot nonces for gaps, and writes everything to a
//! time-series store in bounded-retry batches.
//!
//! # Layers (inside to outside)
//!
//! - **Domain**: Pure data types and transformations
//!   - `market`: Trades, order-book snapshots
//!   - `record`: Storage records and line protocol
//!   - `binning`: Basis-point relative depth binning
//!   - `continuity`: Nonce gap audit
//!   - `schema`: Event-to-record mapping
//!
//! - **Application**: Ports and long-running services
//!   - `ports`: Market data source, storage backend
//!   - `services`: Collector, queues, writers, supervisor
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `exchange`: Binance WebSocket source
//!   - `storage`: InfluxDB, stdout, in-memory backends
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!   - `metrics`, `telemetry`: Observability
//!
//! # Data Flow
//!
//! ```text
//!                                    ┌─► trades queue ─► Writer ─┐
//! Source ─► Collector ─► schema/bin ─┼─► bins queue   ─► Writer ─┼─► Storage
//!              │                     └─► gaps queue   ─► Writer ─┘
//!              └─ continuity audit ──────────┘
//!
//!                 Supervisor: restarts, status, shutdown
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Market types and pure transformations.
pub mod domain;

/// Application layer - Pipeline services and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::binning::{BinningConfig, BinningError, bin_snapshot};
pub use domain::continuity::{ContinuityAudit, GapEvent, GapSeverity, NonceTracker, Verdict};
pub use domain::market::{
    BookSide, Instrument, MarketEvent, OrderBookSnapshot, PriceLevel, Side, TradeEvent,
};
pub use domain::record::{RecordKind, StorageRecord};

// Ports
pub use application::ports::{
    EventSink, MarketDataSource, SourceError, StorageBackend, StorageError,
};

// Services
pub use application::services::{
    Collector, PipelineStatus, ShutdownReport, StorageBackends, Supervisor, SupervisorConfig,
    Writer,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, RecorderConfig, StorageKind};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
