//! Connection Heartbeat
//!
//! Binance pings every connection and expects pongs back; we also ping on our
//! own interval. Any inbound frame counts as activity. If nothing arrives
//! within the inactivity timeout the connection is treated as dead.

use std::time::Duration;

use tokio::time::Instant;

use crate::infrastructure::config::WebSocketSettings;

/// Heartbeat settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between client pings.
    pub ping_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub inactivity_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::from_settings(&WebSocketSettings::default())
    }
}

impl HeartbeatConfig {
    /// Build from WebSocket settings.
    #[must_use]
    pub const fn from_settings(settings: &WebSocketSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            inactivity_timeout: settings.heartbeat_timeout,
        }
    }
}

/// What the connection loop should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping.
    Ping,
    /// Drop the connection.
    Timeout {
        /// Time since the last inbound frame.
        silent_for: Duration,
    },
}

/// Per-connection liveness tracker.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    last_activity: Instant,
}

impl HeartbeatMonitor {
    /// Start monitoring a fresh connection.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            last_activity: Instant::now(),
        }
    }

    /// Interval between ticks.
    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        self.config.ping_interval
    }

    /// Record an inbound frame.
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Decide what to do on a tick.
    #[must_use]
    pub fn on_tick(&self) -> HeartbeatAction {
        let silent_for = self.last_activity.elapsed();
        if silent_for > self.config.inactivity_timeout {
            HeartbeatAction::Timeout { silent_for }
        } else {
            HeartbeatAction::Ping
        }
    }
}
