//! Nonce Continuity Audit
//!
//! Order-book snapshots carry a source-supplied nonce that is expected to
//! increase by one per snapshot. The audit compares each observed nonce
//! against the expected next value and classifies anomalies:
//!
//! | Observed | Verdict | Snapshot |
//! |----------|---------|----------|
//! | first ever | `Anchored` | kept |
//! | `== expected` | `Continuous` | kept |
//! | `> expected` | `Gap`, resync to observed | kept |
//! | `<= last seen` | `Stale` | discarded |
//!
//! State lives in the owning collector and is rebuilt from scratch when the
//! collector restarts.

use std::collections::HashMap;

use super::market::{Instrument, OrderBookSnapshot};

// =============================================================================
// Gap Event
// =============================================================================

/// Kind of continuity anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GapSeverity {
    /// One or more nonces were skipped.
    Gap,
    /// A nonce at or below the last accepted one arrived.
    Stale,
}

impl GapSeverity {
    /// Tag value used in storage records and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gap => "gap",
            Self::Stale => "stale",
        }
    }
}

/// A detected continuity anomaly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapEvent {
    /// Exchange identifier.
    pub exchange: String,
    /// Exchange symbol.
    pub symbol: String,
    /// Nonce the audit expected next.
    pub expected_nonce: u64,
    /// Nonce the snapshot carried.
    pub observed_nonce: u64,
    /// Anomaly kind.
    pub severity: GapSeverity,
    /// Snapshot timestamp in milliseconds.
    pub timestamp_ms: i64,
}

impl GapEvent {
    /// Number of skipped nonces; zero for stale snapshots.
    #[must_use]
    pub const fn missing(&self) -> u64 {
        match self.severity {
            GapSeverity::Gap => self.observed_nonce.saturating_sub(self.expected_nonce),
            GapSeverity::Stale => 0,
        }
    }
}

// =============================================================================
// Verdicts
// =============================================================================

/// Outcome of auditing one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// First snapshot for the instrument; establishes the anchor.
    Anchored,
    /// Nonce was exactly the expected next value.
    Continuous,
    /// Nonces were skipped; the snapshot is still valid.
    Gap(GapEvent),
    /// Out-of-order or duplicate snapshot; it must be discarded.
    Stale(GapEvent),
}

impl Verdict {
    /// Whether the snapshot should still be binned.
    #[must_use]
    pub const fn keeps_snapshot(&self) -> bool {
        !matches!(self, Self::Stale(_))
    }

    /// The anomaly to record, if any.
    #[must_use]
    pub const fn gap_event(&self) -> Option<&GapEvent> {
        match self {
            Self::Gap(event) | Self::Stale(event) => Some(event),
            Self::Anchored | Self::Continuous => None,
        }
    }
}

// =============================================================================
// Nonce Tracker
// =============================================================================

/// Continuity state for a single instrument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NonceTracker {
    last_seen: Option<u64>,
}

/// Classification of one nonce, without event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceCheck {
    /// First nonce observed.
    Anchored,
    /// Exactly the expected nonce.
    Continuous,
    /// Ahead of the expected nonce.
    Gap {
        /// The nonce that was expected.
        expected: u64,
    },
    /// At or behind the last accepted nonce.
    Stale {
        /// The nonce that was expected.
        expected: u64,
    },
}

impl NonceTracker {
    /// Last accepted nonce.
    #[must_use]
    pub const fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }

    /// The nonce expected next, once anchored.
    #[must_use]
    pub const fn expected_next(&self) -> Option<u64> {
        match self.last_seen {
            Some(last) => Some(last.saturating_add(1)),
            None => None,
        }
    }

    /// Classify a nonce and advance the state. Stale nonces leave the state
    /// unchanged.
    pub const fn observe(&mut self, observed: u64) -> NonceCheck {
        let Some(last) = self.last_seen else {
            self.last_seen = Some(observed);
            return NonceCheck::Anchored;
        };
        let expected = last.saturating_add(1);
        if observed <= last {
            return NonceCheck::Stale { expected };
        }
        self.last_seen = Some(observed);
        if observed == expected {
            NonceCheck::Continuous
        } else {
            NonceCheck::Gap { expected }
        }
    }
}

// =============================================================================
// Continuity Audit
// =============================================================================

/// Per-instrument continuity audit.
#[derive(Debug, Default)]
pub struct ContinuityAudit {
    trackers: HashMap<Instrument, NonceTracker>,
}

impl ContinuityAudit {
    /// Create an audit with no anchors.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit one snapshot.
    pub fn observe(&mut self, snapshot: &OrderBookSnapshot) -> Verdict {
        let instrument = Instrument::new(snapshot.exchange.as_str(), snapshot.symbol.as_str());
        let tracker = self.trackers.entry(instrument).or_default();

        let event = |expected: u64, severity: GapSeverity| GapEvent {
            exchange: snapshot.exchange.clone(),
            symbol: snapshot.symbol.clone(),
            expected_nonce: expected,
            observed_nonce: snapshot.nonce,
            severity,
            timestamp_ms: snapshot.timestamp_ms,
        };

        match tracker.observe(snapshot.nonce) {
            NonceCheck::Anchored => Verdict::Anchored,
            NonceCheck::Continuous => Verdict::Continuous,
            NonceCheck::Gap { expected } => Verdict::Gap(event(expected, GapSeverity::Gap)),
            NonceCheck::Stale { expected } => Verdict::Stale(event(expected, GapSeverity::Stale)),
        }
    }

    /// Tracker state for an instrument.
    #[must_use]
    pub fn tracker(&self, instrument: &Instrument) -> Option<&NonceTracker> {
        self.trackers.get(instrument)
    }

    /// Forget all anchors.
    pub fn reset(&mut self) {
        self.trackers.clear();
    }
}
