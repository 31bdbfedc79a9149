//! Reconnect Backoff
//!
//! Exponential backoff with jitter between WebSocket reconnection attempts,
//! bounded by a consecutive-attempt limit. Once the limit is hit the stream
//! gives up and the collector's supervisor takes over.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::WebSocketSettings;

/// Reconnect backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Consecutive attempts allowed (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from_settings(&WebSocketSettings::default())
    }
}

impl ReconnectConfig {
    /// Build from WebSocket settings.
    #[must_use]
    pub const fn from_settings(settings: &WebSocketSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: 0.1,
            max_attempts: settings.max_reconnect_attempts,
        }
    }

    /// Delay before attempt `attempt` (1-based), before jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.initial_delay.as_secs_f64() * 1_000.0 * factor;
        let max_millis = self.max_delay.as_secs_f64() * 1_000.0;

        if !millis.is_finite() || millis >= max_millis {
            return self.max_delay;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(millis.round() as u64)
    }
}

/// Tracks consecutive reconnection attempts for one stream.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Create a policy with no attempts made.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.jitter(self.config.base_delay(self.attempts)))
    }

    /// Forget past attempts once the stream is delivering again.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    fn jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }

        let millis = delay.as_secs_f64() * 1_000.0;
        let range = millis * self.config.jitter_factor;
        let offset: f64 = rand::rng().random_range(-range..=range);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis((millis + offset).max(1.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn defaults_follow_websocket_settings() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 10);
    }

    #[test]
    fn delays_double_up_to_cap() {
        let mut policy = ReconnectPolicy::new(config(0));
        let delays: Vec<u128> = (0..6)
            .map(|_| policy.next_delay().unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 4_000, 4_000]);
    }

    #[test]
    fn attempts_are_bounded() {
        let mut policy = ReconnectPolicy::new(config(3));
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert_eq!(policy.attempts(), 3);
    }

    #[test]
    fn reset_restarts_from_initial_delay() {
        let mut policy = ReconnectPolicy::new(config(3));
        let _ = policy.next_delay();
        let _ = policy.next_delay();
        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn huge_attempt_counts_saturate_at_cap() {
        assert_eq!(config(0).base_delay(u32::MAX), Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                initial_delay: Duration::from_millis(1_000),
                jitter_factor: 0.1,
                ..config(0)
            });
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((900..=1_100).contains(&millis), "delay {millis}ms out of range");
        }
    }
}
