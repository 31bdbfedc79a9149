//! Exchange Adapters
//!
//! Implementations of the `MarketDataSource` port.

pub mod binance;

pub use binance::{BinanceConfig, BinanceSource};
