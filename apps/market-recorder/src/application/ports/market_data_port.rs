//! Market Data Source Port (Driven Port)
//!
//! Interface for subscribing to a streaming market data feed.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::market::{Instrument, MarketEvent};

/// Market data source error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Connection could not be established or was lost.
    #[error("Source connection error: {message}")]
    Connection {
        /// Error details.
        message: String,
    },

    /// The source sent something it should not have.
    #[error("Source protocol error: {message}")]
    Protocol {
        /// Error details.
        message: String,
    },

    /// Reconnection attempts were exhausted.
    #[error("Source reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
    },

    /// The stream ended.
    #[error("Source stream ended: {stream}")]
    StreamEnded {
        /// Stream name.
        stream: String,
    },

    /// The receiving side of the sink is gone.
    #[error("Event sink closed")]
    SinkClosed,
}

/// Bounded channel into which a source delivers events.
///
/// Delivery waits for capacity, so a slow consumer slows the source down
/// rather than growing memory.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<MarketEvent>,
}

impl EventSink {
    /// Create a sink and its receiving end.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<MarketEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Deliver one event.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::SinkClosed` if the consumer has gone away.
    pub async fn deliver(&self, event: MarketEvent) -> Result<(), SourceError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| SourceError::SinkClosed)
    }

    /// Whether the consumer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Port for a streaming market data source.
///
/// Both subscriptions run until the stream ends or fails; returning at all
/// means the subscription is over.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Stream trades for an instrument into the sink.
    async fn subscribe_trades(
        &self,
        instrument: &Instrument,
        sink: EventSink,
    ) -> Result<(), SourceError>;

    /// Stream order-book snapshots for an instrument into the sink, at most
    /// one per `cadence`.
    async fn subscribe_order_book(
        &self,
        instrument: &Instrument,
        sink: EventSink,
        cadence: Duration,
    ) -> Result<(), SourceError>;

    /// Release any connections held by the source.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::{Side, TradeEvent};

    fn trade() -> MarketEvent {
        MarketEvent::Trade(TradeEvent {
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Sell,
            price: rust_decimal::Decimal::ONE,
            size: rust_decimal::Decimal::ONE,
            trade_id: "1".to_string(),
            timestamp_ms: 1,
        })
    }

    #[tokio::test]
    async fn sink_delivers_events() {
        let (sink, mut rx) = EventSink::channel(4);
        sink.deliver(trade()).await.unwrap();
        assert_eq!(rx.recv().await, Some(trade()));
    }

    #[tokio::test]
    async fn sink_reports_closed_receiver() {
        let (sink, rx) = EventSink::channel(4);
        drop(rx);
        assert!(sink.is_closed());
        assert_eq!(sink.deliver(trade()).await, Err(SourceError::SinkClosed));
    }
}
