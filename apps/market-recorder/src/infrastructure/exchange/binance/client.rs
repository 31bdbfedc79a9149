//! Binance WebSocket Source
//!
//! Implements `MarketDataSource` over Binance's public raw streams. Each
//! subscription owns one connection and reconnects on its own until the
//! attempt limit is reached.
//!
//! # Stream URLs
//!
//! - Trades: `wss://stream.binance.com:9443/ws/btcusdt@trade`
//! - Book: `wss://stream.binance.com:9443/ws/btcusdt@depth20@100ms`

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
use super::messages::{CodecError, decode_depth, decode_trade};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{EventSink, MarketDataSource, SourceError};
use crate::domain::market::{Instrument, MarketEvent};
use crate::infrastructure::config::{SourceSettings, WebSocketSettings};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Binance source settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BinanceConfig {
    /// WebSocket base URL.
    pub url: String,
    /// Requested book depth per side.
    pub book_depth: u16,
    /// Heartbeat settings.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect settings.
    pub reconnect: ReconnectConfig,
}

impl BinanceConfig {
    /// Build from source and WebSocket settings.
    #[must_use]
    pub fn from_settings(source: &SourceSettings, websocket: &WebSocketSettings) -> Self {
        Self {
            url: source.url.clone(),
            book_depth: source.book_depth,
            heartbeat: HeartbeatConfig::from_settings(websocket),
            reconnect: ReconnectConfig::from_settings(websocket),
        }
    }

    /// Full URL of a raw stream.
    #[must_use]
    pub fn stream_url(&self, stream: &str) -> String {
        format!("{}/ws/{stream}", self.url.trim_end_matches('/'))
    }

    /// Partial-depth level count. Binance only serves 5, 10 or 20.
    #[must_use]
    pub const fn depth_levels(&self) -> u16 {
        match self.book_depth {
            0..=5 => 5,
            6..=10 => 10,
            _ => 20,
        }
    }
}

/// Trade stream name.
#[must_use]
pub fn trade_stream(instrument: &Instrument) -> String {
    format!("{}@trade", instrument.symbol.to_lowercase())
}

/// Partial-depth stream name.
#[must_use]
pub fn depth_stream(instrument: &Instrument, levels: u16) -> String {
    format!("{}@depth{levels}@100ms", instrument.symbol.to_lowercase())
}

// =============================================================================
// Cadence Gate
// =============================================================================

/// Lets through at most one snapshot per cadence.
///
/// Admission follows a fixed schedule of slots `cadence` apart. A frame is
/// admitted once it is within a quarter cadence of the next slot, so a
/// stream pushing at exactly the cadence is never thinned by arrival jitter.
#[derive(Debug)]
pub struct CadenceGate {
    cadence: Duration,
    tolerance: Duration,
    next_slot: Option<Instant>,
}

impl CadenceGate {
    /// Create a gate. A zero cadence admits everything.
    #[must_use]
    pub fn new(cadence: Duration) -> Self {
        Self {
            cadence,
            tolerance: cadence / 4,
            next_slot: None,
        }
    }

    /// Whether a snapshot arriving at `now` should be forwarded.
    pub fn admit(&mut self, now: Instant) -> bool {
        if let Some(slot) = self.next_slot
            && now + self.tolerance < slot
        {
            return false;
        }

        // Resync after a silence longer than one cadence.
        self.next_slot = Some(match self.next_slot {
            Some(slot) if now < slot + self.cadence => slot + self.cadence,
            _ => now + self.cadence,
        });
        true
    }
}

// =============================================================================
// Source
// =============================================================================

/// How a single connection ended.
enum SessionEnd {
    /// `close` was called.
    Cancelled,
    /// The consumer went away.
    SinkClosed,
    /// The connection dropped; worth reconnecting.
    Dropped(String),
    /// Reconnecting will not help.
    Fatal(SourceError),
}

/// Binance public-stream market data source.
#[derive(Debug)]
pub struct BinanceSource {
    config: BinanceConfig,
    cancel: CancellationToken,
}

impl BinanceSource {
    /// Create a source.
    #[must_use]
    pub fn new(config: BinanceConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Run one stream with reconnects until it is closed or gives up.
    async fn run_stream<D>(
        &self,
        label: &'static str,
        stream: &str,
        sink: &EventSink,
        mut decode: D,
    ) -> Result<(), SourceError>
    where
        D: FnMut(&str) -> Result<Option<MarketEvent>, CodecError> + Send,
    {
        let url = self.config.stream_url(stream);
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            let reason = match self.session(label, &url, sink, &mut decode, &mut policy).await {
                SessionEnd::Cancelled => return Ok(()),
                SessionEnd::SinkClosed => return Err(SourceError::SinkClosed),
                SessionEnd::Fatal(e) => return Err(e),
                SessionEnd::Dropped(reason) => reason,
            };

            let Some(delay) = policy.next_delay() else {
                tracing::error!(
                    stream,
                    attempts = policy.attempts(),
                    error = %reason,
                    "Reconnect attempts exhausted"
                );
                return Err(SourceError::ReconnectExhausted {
                    attempts: policy.attempts(),
                });
            };

            metrics::record_source_reconnect(label);
            tracing::warn!(
                stream,
                attempt = policy.attempts(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %reason,
                "Stream dropped, reconnecting"
            );

            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Connect once and pump frames until the connection ends.
    async fn session<D>(
        &self,
        label: &'static str,
        url: &str,
        sink: &EventSink,
        decode: &mut D,
        policy: &mut ReconnectPolicy,
    ) -> SessionEnd
    where
        D: FnMut(&str) -> Result<Option<MarketEvent>, CodecError> + Send,
    {
        tracing::info!(url, "Connecting to stream");

        let connected = tokio::select! {
            () = self.cancel.cancelled() => return SessionEnd::Cancelled,
            result = tokio_tungstenite::connect_async(url) => result,
        };
        let ws = match connected {
            Ok((ws, _response)) => ws,
            Err(e) => return classify_connect_error(e),
        };
        tracing::info!(url, "Stream connected");

        let (mut write, mut read) = ws.split();
        let mut heartbeat = HeartbeatMonitor::new(self.config.heartbeat);
        let interval = heartbeat.ping_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                _ = ticker.tick() => match heartbeat.on_tick() {
                    HeartbeatAction::Ping => {
                        if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                            return SessionEnd::Dropped(e.to_string());
                        }
                    }
                    HeartbeatAction::Timeout { silent_for } => {
                        return SessionEnd::Dropped(format!("no frames for {silent_for:?}"));
                    }
                },
                frame = read.next() => {
                    heartbeat.record_activity();
                    match frame {
                        Some(Ok(Message::Text(text))) => match decode(text.as_str()) {
                            Ok(Some(event)) => {
                                if sink.deliver(event).await.is_err() {
                                    return SessionEnd::SinkClosed;
                                }
                                policy.reset();
                            }
                            Ok(None) => {}
                            Err(e) => {
                                metrics::record_source_event("decode_error");
                                tracing::warn!(stream = label, error = %e, "Failed to decode message");
                            }
                        },
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                return SessionEnd::Dropped(e.to_string());
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return SessionEnd::Dropped(format!("server closed connection: {frame:?}"));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                        None => return SessionEnd::Dropped("stream ended".to_string()),
                    }
                }
            }
        }
    }
}

/// Split handshake failures into retryable and fatal.
fn classify_connect_error(error: tungstenite::Error) -> SessionEnd {
    match error {
        tungstenite::Error::Url(e) => SessionEnd::Fatal(SourceError::Connection {
            message: e.to_string(),
        }),
        tungstenite::Error::Http(response) if response.status().is_client_error() => {
            SessionEnd::Fatal(SourceError::Protocol {
                message: format!("handshake rejected with {}", response.status()),
            })
        }
        other => SessionEnd::Dropped(other.to_string()),
    }
}

#[async_trait]
impl MarketDataSource for BinanceSource {
    async fn subscribe_trades(
        &self,
        instrument: &Instrument,
        sink: EventSink,
    ) -> Result<(), SourceError> {
        let stream = trade_stream(instrument);
        self.run_stream("trades", &stream, &sink, |text| {
            decode_trade(text, instrument).map(|trade| Some(MarketEvent::Trade(trade)))
        })
        .await
    }

    async fn subscribe_order_book(
        &self,
        instrument: &Instrument,
        sink: EventSink,
        cadence: Duration,
    ) -> Result<(), SourceError> {
        let stream = depth_stream(instrument, self.config.depth_levels());
        let mut gate = CadenceGate::new(cadence);
        self.run_stream("book", &stream, &sink, move |text| {
            if !gate.admit(Instant::now()) {
                metrics::record_source_event("book_throttled");
                return Ok(None);
            }
            let received_ms = chrono::Utc::now().timestamp_millis();
            decode_depth(text, instrument, received_ms).map(|book| Some(MarketEvent::Book(book)))
        })
        .await
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}
