//! Domain Layer - Market data types and pure transformations.
//!
//! Everything here is synchronous and free of I/O: the raw event types a
//! source delivers, the storage record they become, and the binning and
//! continuity logic in between.

/// Trades, order-book snapshots and the events that carry them.
pub mod market;

/// Line-oriented storage records.
pub mod record;

/// Basis-point relative depth binning.
pub mod binning;

/// Nonce continuity audit for order-book snapshots.
pub mod continuity;

/// Event-to-record transformation functions.
pub mod schema;
