//! Market Data Types
//!
//! Raw market events as delivered by a streaming source: trades and
//! order-book snapshots for a single exchange/symbol pair. These are the
//! inputs of the schema layer and carry no storage concerns.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Instrument
// =============================================================================

/// An exchange/symbol pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    /// Exchange identifier (e.g., "binance").
    pub exchange: String,
    /// Exchange symbol (e.g., "BTCUSDT").
    pub symbol: String,
}

impl Instrument {
    /// Create a new instrument.
    #[must_use]
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

// =============================================================================
// Sides
// =============================================================================

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buyer lifted an offer.
    Buy,
    /// Seller hit a bid.
    Sell,
}

impl Side {
    /// Tag value used in storage records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

/// Side of the order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    /// Resting buy orders.
    Bid,
    /// Resting sell orders.
    Ask,
}

impl BookSide {
    /// Tag value used in storage records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bid => "bid",
            Self::Ask => "ask",
        }
    }
}

impl fmt::Display for BookSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Trade
// =============================================================================

/// A single exchange trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Exchange identifier.
    pub exchange: String,
    /// Exchange symbol.
    pub symbol: String,
    /// Aggressor side.
    pub side: Side,
    /// Execution price.
    pub price: Decimal,
    /// Executed quantity.
    pub size: Decimal,
    /// Exchange trade identifier.
    pub trade_id: String,
    /// Exchange timestamp in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

// =============================================================================
// Order Book
// =============================================================================

/// One price level of an order-book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Level price.
    pub price: Decimal,
    /// Resting quantity at this price.
    pub size: Decimal,
}

impl PriceLevel {
    /// Create a new price level.
    #[must_use]
    pub const fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// A full order-book snapshot.
///
/// Bids are ordered by descending price, asks by ascending price, so the
/// first level of each side is the top of book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    /// Exchange identifier.
    pub exchange: String,
    /// Exchange symbol.
    pub symbol: String,
    /// Bid levels, best first.
    pub bids: Vec<PriceLevel>,
    /// Ask levels, best first.
    pub asks: Vec<PriceLevel>,
    /// Source-supplied, monotonically increasing sequence number.
    pub nonce: u64,
    /// Snapshot timestamp in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

impl OrderBookSnapshot {
    /// Best (highest) bid price.
    #[must_use]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|level| level.price)
    }

    /// Best (lowest) ask price.
    #[must_use]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|level| level.price)
    }

    /// Mid-price, or `None` when either side is empty.
    #[must_use]
    pub fn mid_price(&self) -> Option<Decimal> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        Some((bid + ask) / Decimal::TWO)
    }

    /// Levels of one side.
    #[must_use]
    pub fn levels(&self, side: BookSide) -> &[PriceLevel] {
        match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        }
    }

    /// Total resting quantity on one side.
    #[must_use]
    pub fn total_size(&self, side: BookSide) -> Decimal {
        self.levels(side).iter().map(|level| level.size).sum()
    }
}

// =============================================================================
// Market Event
// =============================================================================

/// Event delivered by a market data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketEvent {
    /// A trade print.
    Trade(TradeEvent),
    /// An order-book snapshot.
    Book(OrderBookSnapshot),
}

impl MarketEvent {
    /// Source timestamp of the event in milliseconds.
    #[must_use]
    pub const fn timestamp_ms(&self) -> i64 {
        match self {
            Self::Trade(trade) => trade.timestamp_ms,
            Self::Book(book) => book.timestamp_ms,
        }
    }
}
