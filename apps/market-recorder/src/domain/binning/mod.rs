//! Basis-Point Relative Depth Binning
//!
//! Aggregates an order-book snapshot into bins whose width is a fixed number
//! of basis points of the mid-price.
//!
//! # Algorithm
//!
//! ```text
//! mid       = (best_bid + best_ask) / 2
//! width     = mid * bps_per_bin / 10_000
//! bin_index = clamp(trunc((price - mid) / width), -max_bins, +max_bins)
//! ```
//!
//! Division results are truncated toward zero, so bin `0` spans one width on
//! either side of mid and `-40 / 35 = -1.14` lands in bin `-1`. Levels farther
//! away than `max_bins` widths collapse into the outermost bin; quantity is
//! never discarded.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use super::market::{BookSide, OrderBookSnapshot};

/// Basis points in one unit.
const BPS_DIVISOR: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

// =============================================================================
// Configuration
// =============================================================================

/// Binning parameters, fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinningConfig {
    bps_per_bin: Decimal,
    max_bins: i64,
}

impl Default for BinningConfig {
    fn default() -> Self {
        Self {
            bps_per_bin: Decimal::from(5),
            max_bins: 50,
        }
    }
}

impl BinningConfig {
    /// Create a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `BinningError::InvalidConfig` if `bps_per_bin` is not positive
    /// or `max_bins` is zero.
    pub fn new(bps_per_bin: Decimal, max_bins: u32) -> Result<Self, BinningError> {
        if bps_per_bin <= Decimal::ZERO {
            return Err(BinningError::InvalidConfig(format!(
                "bps_per_bin must be positive, got {bps_per_bin}"
            )));
        }
        if max_bins == 0 {
            return Err(BinningError::InvalidConfig(
                "max_bins must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            bps_per_bin,
            max_bins: i64::from(max_bins),
        })
    }

    /// Basis points per bin.
    #[must_use]
    pub const fn bps_per_bin(&self) -> Decimal {
        self.bps_per_bin
    }

    /// Bins on each side of mid (the clamp bound).
    #[must_use]
    pub const fn max_bins(&self) -> i64 {
        self.max_bins
    }

    /// Bin width in price units for a given mid-price.
    #[must_use]
    pub fn bin_width(&self, mid_price: Decimal) -> Decimal {
        mid_price * self.bps_per_bin / BPS_DIVISOR
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Reasons a snapshot cannot be binned. None of these are fatal; the
/// snapshot is skipped and counted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BinningError {
    /// Both sides of the book are empty.
    #[error("order book is empty")]
    EmptyBook,

    /// One side of the book has no levels, so there is no mid-price.
    #[error("order book has no {missing} levels")]
    OneSidedBook {
        /// The empty side.
        missing: BookSide,
    },

    /// The mid-price is not positive, so bin width would be degenerate.
    #[error("mid-price {0} is not positive")]
    InvalidMid(Decimal),

    /// A level has a non-positive price or a negative size.
    #[error("invalid {side} level: price {price}, size {size}")]
    InvalidLevel {
        /// Side of the offending level.
        side: BookSide,
        /// Level price.
        price: Decimal,
        /// Level size.
        size: Decimal,
    },

    /// Binning parameters are unusable.
    #[error("invalid binning configuration: {0}")]
    InvalidConfig(String),
}

impl BinningError {
    /// Short label for metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::EmptyBook => "empty_book",
            Self::OneSidedBook { .. } => "one_sided_book",
            Self::InvalidMid(_) => "invalid_mid",
            Self::InvalidLevel { .. } => "invalid_level",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }
}

// =============================================================================
// Binned Output
// =============================================================================

/// Aggregated quantity for one `(side, bin_index)` pair of one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinnedLevel {
    /// Book side.
    pub side: BookSide,
    /// Signed offset from mid in bins, within `[-max_bins, +max_bins]`.
    pub bin_index: i64,
    /// Sum of sizes of all levels that fell into this bin.
    pub quantity: Decimal,
    /// Number of source levels aggregated.
    pub level_count: u32,
    /// Snapshot timestamp in milliseconds.
    pub timestamp_ms: i64,
}

/// The binned form of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinnedBook {
    /// Mid-price the bins are relative to.
    pub mid_price: Decimal,
    /// Bin width in price units.
    pub bin_width: Decimal,
    /// Bins ordered by side (bids first), then by bin index.
    pub levels: Vec<BinnedLevel>,
}

impl BinnedBook {
    /// Total binned quantity on one side.
    #[must_use]
    pub fn total_quantity(&self, side: BookSide) -> Decimal {
        self.levels
            .iter()
            .filter(|level| level.side == side)
            .map(|level| level.quantity)
            .sum()
    }
}

// =============================================================================
// Binning
// =============================================================================

/// Map a price to its bin index.
///
/// `bin_width` must be positive. The quotient is truncated toward zero and
/// clamped to `[-max_bins, +max_bins]`; a quotient too large to represent
/// saturates into the clamp bin.
#[must_use]
pub fn bin_index(price: Decimal, mid_price: Decimal, bin_width: Decimal, max_bins: i64) -> i64 {
    let distance = price - mid_price;
    let raw = distance
        .checked_div(bin_width)
        .and_then(|quotient| quotient.trunc().to_i64())
        .unwrap_or(if distance.is_sign_negative() {
            i64::MIN
        } else {
            i64::MAX
        });
    raw.clamp(-max_bins, max_bins)
}

/// Bin every level of a snapshot.
///
/// # Errors
///
/// Returns a `BinningError` when the book is empty or one-sided, when the
/// mid-price is not positive, or when any level is malformed.
pub fn bin_snapshot(
    snapshot: &OrderBookSnapshot,
    config: &BinningConfig,
) -> Result<BinnedBook, BinningError> {
    let mid_price = match (snapshot.best_bid(), snapshot.best_ask()) {
        (None, None) => return Err(BinningError::EmptyBook),
        (None, Some(_)) => {
            return Err(BinningError::OneSidedBook {
                missing: BookSide::Bid,
            });
        }
        (Some(_), None) => {
            return Err(BinningError::OneSidedBook {
                missing: BookSide::Ask,
            });
        }
        (Some(bid), Some(ask)) => (bid + ask) / Decimal::TWO,
    };

    if mid_price <= Decimal::ZERO {
        return Err(BinningError::InvalidMid(mid_price));
    }

    let bin_width = config.bin_width(mid_price);
    let mut bins: BTreeMap<(BookSide, i64), (Decimal, u32)> = BTreeMap::new();

    for side in [BookSide::Bid, BookSide::Ask] {
        for level in snapshot.levels(side) {
            if level.price <= Decimal::ZERO || level.size.is_sign_negative() {
                return Err(BinningError::InvalidLevel {
                    side,
                    price: level.price,
                    size: level.size,
                });
            }
            if level.size.is_zero() {
                continue;
            }
            let index = bin_index(level.price, mid_price, bin_width, config.max_bins);
            let entry = bins.entry((side, index)).or_insert((Decimal::ZERO, 0));
            entry.0 += level.size;
            entry.1 += 1;
        }
    }

    let levels = bins
        .into_iter()
        .map(|((side, bin_index), (quantity, level_count))| BinnedLevel {
            side,
            bin_index,
            quantity,
            level_count,
            timestamp_ms: snapshot.timestamp_ms,
        })
        .collect();

    Ok(BinnedBook {
        mid_price,
        bin_width,
        levels,
    })
}
