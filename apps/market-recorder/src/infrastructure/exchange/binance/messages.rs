//! Binance Stream Messages
//!
//! Wire types for the public `<symbol>@trade` and `<symbol>@depth<N>@100ms`
//! raw streams, and their conversion into domain market events.
//!
//! # Trade
//!
//! ```json
//! {"e":"trade","E":1700000000001,"s":"BTCUSDT","t":3141592,
//!  "p":"70000.00","q":"0.015","T":1700000000000,"m":false}
//! ```
//!
//! # Partial depth
//!
//! ```json
//! {"lastUpdateId":160,"bids":[["69999.9","1.5"]],"asks":[["70000.1","0.3"]]}
//! ```
//!
//! `lastUpdateId` becomes the snapshot nonce. It counts every book diff on
//! the exchange, and a partial-depth push covers many diffs, so consecutive
//! snapshots usually differ by hundreds. Gap records from this source measure
//! update-id distance between pushes, not lost snapshots; only a stale
//! (backwards) nonce indicates a real ordering problem.

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::market::{Instrument, OrderBookSnapshot, PriceLevel, Side, TradeEvent};

/// Errors decoding a stream message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload is not the expected JSON shape.
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    /// A trade stream carried a different event type.
    #[error("unexpected event type: {0}")]
    UnexpectedEvent(String),
}

// =============================================================================
// Trade Stream
// =============================================================================

/// Raw trade message.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeMessage {
    /// Event type, always "trade".
    #[serde(rename = "e")]
    pub event_type: String,
    /// Event time (ms).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Trade ID.
    #[serde(rename = "t")]
    pub trade_id: u64,
    /// Price.
    #[serde(rename = "p", with = "rust_decimal::serde::str")]
    pub price: Decimal,
    /// Quantity.
    #[serde(rename = "q", with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    /// Trade time (ms).
    #[serde(rename = "T")]
    pub trade_time: i64,
    /// Whether the buyer was the resting order.
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
}

impl TradeMessage {
    /// Aggressor side. A resting buyer means the seller crossed the spread.
    #[must_use]
    pub const fn aggressor(&self) -> Side {
        if self.buyer_is_maker {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    /// Convert into a domain trade.
    #[must_use]
    pub fn into_trade(self, instrument: &Instrument) -> TradeEvent {
        TradeEvent {
            exchange: instrument.exchange.clone(),
            symbol: instrument.symbol.clone(),
            side: self.aggressor(),
            price: self.price,
            size: self.quantity,
            trade_id: self.trade_id.to_string(),
            timestamp_ms: self.trade_time,
        }
    }
}

/// Decode a trade stream payload.
///
/// # Errors
///
/// Returns `CodecError` if the payload is not a trade event.
pub fn decode_trade(text: &str, instrument: &Instrument) -> Result<TradeEvent, CodecError> {
    let message: TradeMessage = serde_json::from_str(text)?;
    if message.event_type != "trade" {
        return Err(CodecError::UnexpectedEvent(message.event_type));
    }
    Ok(message.into_trade(instrument))
}

// =============================================================================
// Depth Stream
// =============================================================================

/// One `[price, quantity]` pair.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RawLevel(
    #[serde(with = "rust_decimal::serde::str")] Decimal,
    #[serde(with = "rust_decimal::serde::str")] Decimal,
);

impl From<RawLevel> for PriceLevel {
    fn from(level: RawLevel) -> Self {
        Self::new(level.0, level.1)
    }
}

/// Raw partial-depth message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthMessage {
    /// Book update sequence.
    pub last_update_id: u64,
    /// Bids, best first.
    pub bids: Vec<RawLevel>,
    /// Asks, best first.
    pub asks: Vec<RawLevel>,
}

impl DepthMessage {
    /// Convert into a domain snapshot.
    ///
    /// Partial-depth payloads carry no timestamp, so the receive time is used.
    #[must_use]
    pub fn into_snapshot(self, instrument: &Instrument, received_ms: i64) -> OrderBookSnapshot {
        OrderBookSnapshot {
            exchange: instrument.exchange.clone(),
            symbol: instrument.symbol.clone(),
            bids: self.bids.into_iter().map(PriceLevel::from).collect(),
            asks: self.asks.into_iter().map(PriceLevel::from).collect(),
            nonce: self.last_update_id,
            timestamp_ms: received_ms,
        }
    }
}

/// Decode a partial-depth payload.
///
/// # Errors
///
/// Returns `CodecError` if the payload is not a depth snapshot.
pub fn decode_depth(
    text: &str,
    instrument: &Instrument,
    received_ms: i64,
) -> Result<OrderBookSnapshot, CodecError> {
    let message: DepthMessage = serde_json::from_str(text)?;
    Ok(message.into_snapshot(instrument, received_ms))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn instrument() -> Instrument {
        Instrument::new("binance", "BTCUSDT")
    }

    #[test]
    fn decodes_taker_buy() {
        let text = r#"{"e":"trade","E":1700000000001,"s":"BTCUSDT","t":3141592,
            "p":"70000.00","q":"0.015","T":1700000000000,"m":false,"M":true}"#;

        let trade = decode_trade(text, &instrument()).unwrap();
        assert_eq!(trade.side, Side::Buy);
        assert_eq!(trade.price, dec("70000.00"));
        assert_eq!(trade.size, dec("0.015"));
        assert_eq!(trade.trade_id, "3141592");
        assert_eq!(trade.timestamp_ms, 1_700_000_000_000);
        assert_eq!(trade.exchange, "binance");
    }

    #[test]
    fn buyer_maker_is_taker_sell() {
        let text = r#"{"e":"trade","E":1,"s":"BTCUSDT","t":1,"p":"1","q":"1","T":1,"m":true}"#;
        assert_eq!(decode_trade(text, &instrument()).unwrap().side, Side::Sell);
    }

    #[test]
    fn rejects_other_event_types() {
        let text = r#"{"e":"aggTrade","E":1,"s":"BTCUSDT","t":1,"p":"1","q":"1","T":1,"m":true}"#;
        assert!(matches!(
            decode_trade(text, &instrument()),
            Err(CodecError::UnexpectedEvent(e)) if e == "aggTrade"
        ));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            decode_trade("{not json", &instrument()),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn decodes_partial_depth() {
        let text = r#"{"lastUpdateId":160,
            "bids":[["69999.9","1.5"],["69999.8","2"]],
            "asks":[["70000.1","0.3"]]}"#;

        let snapshot = decode_depth(text, &instrument(), 1_700_000_000_000).unwrap();
        assert_eq!(snapshot.nonce, 160);
        assert_eq!(snapshot.bids.len(), 2);
        assert_eq!(snapshot.best_bid(), Some(dec("69999.9")));
        assert_eq!(snapshot.best_ask(), Some(dec("70000.1")));
        assert_eq!(snapshot.mid_price(), Some(dec("70000.0")));
        assert_eq!(snapshot.timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn depth_with_empty_side_still_decodes() {
        let text = r#"{"lastUpdateId":7,"bids":[],"asks":[["1","1"]]}"#;
        let snapshot = decode_depth(text, &instrument(), 0).unwrap();
        assert!(snapshot.bids.is_empty());
        assert_eq!(snapshot.mid_price(), None);
    }
}
