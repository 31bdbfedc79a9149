//! Application Ports
//!
//! Interfaces the pipeline uses to reach external systems. Infrastructure
//! adapters implement these; the collector and writers only ever see the
//! traits.
//!
//! ## Driven Ports (Outbound)
//!
//! - `MarketDataSource`: streaming trades and order-book snapshots
//! - `StorageBackend`: batch writes to a time-series store

mod market_data_port;
mod storage_port;

pub use market_data_port::{EventSink, MarketDataSource, SourceError};
pub use storage_port::{StorageBackend, StorageError};

#[cfg(test)]
pub use storage_port::MockStorageBackend;
