//! Binance Public Streams
//!
//! Trade and partial-depth streams from Binance spot, decoded into domain
//! market events.

pub mod client;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;

pub use client::{BinanceConfig, BinanceSource, CadenceGate};
pub use heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
pub use messages::{CodecError, DepthMessage, TradeMessage, decode_depth, decode_trade};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
