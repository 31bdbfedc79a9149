//! Schema Transformation
//!
//! Pure functions from raw market events to storage records. These are the
//! only place record shapes are defined; the collector and writers treat
//! records opaquely.

use super::binning::{BinningConfig, BinningError, bin_snapshot};
use super::continuity::GapEvent;
use super::market::{OrderBookSnapshot, TradeEvent};
use super::record::{RecordKind, StorageRecord};

/// Nanoseconds per millisecond.
const NANOS_PER_MILLI: i64 = 1_000_000;

/// Convert a millisecond timestamp to nanoseconds, saturating at the bounds
/// of `i64`.
#[must_use]
pub const fn millis_to_nanos(timestamp_ms: i64) -> i64 {
    timestamp_ms.saturating_mul(NANOS_PER_MILLI)
}

/// Build the `trades` record for one trade.
#[must_use]
pub fn trade_record(trade: &TradeEvent) -> StorageRecord {
    StorageRecord::new(RecordKind::Trade, millis_to_nanos(trade.timestamp_ms))
        .tag("exchange", trade.exchange.as_str())
        .tag("symbol", trade.symbol.as_str())
        .tag("side", trade.side.as_str())
        .field("price", trade.price)
        .field("size", trade.size)
        .field("trade_id", trade.trade_id.as_str())
}

/// Bin a snapshot and build one `orderbook_bins` record per non-empty
/// `(side, bin)` pair.
///
/// # Errors
///
/// Propagates the `BinningError` of a snapshot that cannot be binned.
pub fn binned_records(
    snapshot: &OrderBookSnapshot,
    config: &BinningConfig,
) -> Result<Vec<StorageRecord>, BinningError> {
    let binned = bin_snapshot(snapshot, config)?;
    let timestamp_ns = millis_to_nanos(snapshot.timestamp_ms);
    let nonce = i64::try_from(snapshot.nonce).unwrap_or(i64::MAX);

    Ok(binned
        .levels
        .iter()
        .map(|level| {
            StorageRecord::new(RecordKind::BookBin, timestamp_ns)
                .tag("exchange", snapshot.exchange.as_str())
                .tag("symbol", snapshot.symbol.as_str())
                .tag("side", level.side.as_str())
                .tag("bin", level.bin_index.to_string())
                .field("quantity", level.quantity)
                .field("levels", i64::from(level.level_count))
                .field("mid_price", binned.mid_price)
                .field("nonce", nonce)
        })
        .collect())
}

/// Build the `orderbook_gaps` record for one continuity anomaly.
#[must_use]
pub fn gap_record(gap: &GapEvent) -> StorageRecord {
    StorageRecord::new(RecordKind::Gap, millis_to_nanos(gap.timestamp_ms))
        .tag("exchange", gap.exchange.as_str())
        .tag("symbol", gap.symbol.as_str())
        .tag("severity", gap.severity.as_str())
        .field("expected_nonce", saturating_i64(gap.expected_nonce))
        .field("observed_nonce", saturating_i64(gap.observed_nonce))
        .field("missing", saturating_i64(gap.missing()))
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
