//! Storage Adapters
//!
//! Implementations of the `StorageBackend` port.
//!
//! - `InfluxStorage`: line-protocol writes over HTTP
//! - `StdoutStorage`: prints line protocol, for dry runs
//! - `InMemoryStorage`: keeps batches in memory, for tests and replay

mod influx;
mod memory;
mod stdout;

pub use influx::{InfluxConfig, InfluxStorage};
pub use memory::InMemoryStorage;
pub use stdout::StdoutStorage;
