//! Storage Records
//!
//! The line-oriented representation that crosses the queue boundary between
//! the collector and the writers: a measurement, an ordered tag set, an
//! ordered field set, and a nanosecond timestamp.
//!
//! # Wire Format
//!
//! Records encode to the time-series line protocol:
//!
//! ```text
//! trades,exchange=binance,symbol=BTCUSDT,side=buy price=70000,size=0.015,trade_id="42" 1700000000000000000
//! ```

use std::fmt::{self, Write as _};

use rust_decimal::Decimal;

// =============================================================================
// Record Kind
// =============================================================================

/// Record type; one queue and one writer exist per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    /// Trade prints.
    Trade,
    /// Binned order-book depth.
    BookBin,
    /// Nonce continuity anomalies.
    Gap,
}

impl RecordKind {
    /// All record kinds, in writer start order.
    pub const ALL: [Self; 3] = [Self::Trade, Self::BookBin, Self::Gap];

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trade => "trade",
            Self::BookBin => "book_bin",
            Self::Gap => "gap",
        }
    }

    /// Measurement name written for this kind.
    #[must_use]
    pub const fn measurement(self) -> &'static str {
        match self {
            Self::Trade => "trades",
            Self::BookBin => "orderbook_bins",
            Self::Gap => "orderbook_gaps",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Field Values
// =============================================================================

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Decimal number, written as a float field.
    Decimal(Decimal),
    /// Signed integer, written with the `i` suffix.
    Integer(i64),
    /// String, written double-quoted.
    String(String),
    /// Boolean.
    Boolean(bool),
}

impl From<Decimal> for FieldValue {
    fn from(value: Decimal) -> Self {
        Self::Decimal(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decimal(value) => write!(f, "{}", value.normalize()),
            Self::Integer(value) => write!(f, "{value}i"),
            Self::String(value) => {
                f.write_char('"')?;
                for c in value.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' | '\r' => f.write_char(' ')?,
                        other => f.write_char(other)?,
                    }
                }
                f.write_char('"')
            }
            Self::Boolean(value) => write!(f, "{value}"),
        }
    }
}

// =============================================================================
// Storage Record
// =============================================================================

/// A single line-oriented storage record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRecord {
    kind: RecordKind,
    tags: Vec<(String, String)>,
    fields: Vec<(String, FieldValue)>,
    timestamp_ns: i64,
}

impl StorageRecord {
    /// Start a record of the given kind at a nanosecond timestamp.
    #[must_use]
    pub const fn new(kind: RecordKind, timestamp_ns: i64) -> Self {
        Self {
            kind,
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp_ns,
        }
    }

    /// Add a tag. Empty tag values are omitted since the line protocol
    /// cannot represent them.
    #[must_use]
    pub fn tag(mut self, key: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.tags.push((key.to_string(), value));
        }
        self
    }

    /// Add a field.
    #[must_use]
    pub fn field(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.push((key.to_string(), value.into()));
        self
    }

    /// Record kind.
    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Measurement name.
    #[must_use]
    pub const fn measurement(&self) -> &'static str {
        self.kind.measurement()
    }

    /// Timestamp in nanoseconds since the Unix epoch.
    #[must_use]
    pub const fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }

    /// Look up a tag value.
    #[must_use]
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Look up a field value.
    #[must_use]
    pub fn field_value(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// All tags in insertion order.
    #[must_use]
    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    /// All fields in insertion order.
    #[must_use]
    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    /// Encode as one line of line protocol (no trailing newline).
    #[must_use]
    pub fn to_line(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StorageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_escaped(f, self.measurement(), &[',', ' '])?;
        for (key, value) in &self.tags {
            f.write_char(',')?;
            write_escaped(f, key, &[',', '=', ' '])?;
            f.write_char('=')?;
            write_escaped(f, value, &[',', '=', ' '])?;
        }
        for (i, (key, value)) in self.fields.iter().enumerate() {
            f.write_char(if i == 0 { ' ' } else { ',' })?;
            write_escaped(f, key, &[',', '=', ' '])?;
            write!(f, "={value}")?;
        }
        write!(f, " {}", self.timestamp_ns)
    }
}

/// Encode a batch as newline-separated line protocol.
#[must_use]
pub fn encode_batch(records: &[StorageRecord]) -> String {
    let mut body = String::with_capacity(records.len() * 128);
    for record in records {
        // Writing to a String cannot fail.
        let _ = writeln!(body, "{record}");
    }
    body
}

/// Line protocol has no newline escape, so line breaks become spaces. A
/// trailing backslash is doubled so it cannot escape the following delimiter.
fn write_escaped(f: &mut fmt::Formatter<'_>, value: &str, special: &[char]) -> fmt::Result {
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        let c = if matches!(c, '\n' | '\r') { ' ' } else { c };
        match c {
            '\\' if chars.peek().is_none() => f.write_str("\\\\")?,
            c if special.contains(&c) => {
                f.write_char('\\')?;
                f.write_char(c)?;
            }
            c => f.write_char(c)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn encodes_tags_fields_and_timestamp() {
        let record = StorageRecord::new(RecordKind::Trade, 1_700_000_000_000_000_000)
            .tag("exchange", "binance")
            .tag("symbol", "BTCUSDT")
            .field("price", Decimal::from_str("70000.00").unwrap())
            .field("size", Decimal::from_str("0.015").unwrap())
            .field("trade_id", "42");

        assert_eq!(
            record.to_line(),
            "trades,exchange=binance,symbol=BTCUSDT price=70000,size=0.015,trade_id=\"42\" 1700000000000000000"
        );
    }

    #[test]
    fn escapes_tag_special_characters() {
        let record = StorageRecord::new(RecordKind::Trade, 1)
            .tag("symbol", "BTC USD,PERP=1")
            .field("n", 1_i64);
        assert_eq!(
            record.to_line(),
            "trades,symbol=BTC\\ USD\\,PERP\\=1 n=1i 1"
        );
    }

    #[test]
    fn escapes_string_fields() {
        let record = StorageRecord::new(RecordKind::Gap, 5)
            .field("note", "say \"hi\" \\ bye\nnext");
        assert_eq!(
            record.to_line(),
            "orderbook_gaps note=\"say \\\"hi\\\" \\\\ bye next\" 5"
        );
    }

    #[test]
    fn tag_line_breaks_and_trailing_backslash() {
        let record = StorageRecord::new(RecordKind::Trade, 1)
            .tag("venue", "a\nb")
            .tag("path", "c:\\")
            .field("n", 1_i64);
        assert_eq!(record.to_line(), "trades,venue=a\\ b,path=c:\\\\ n=1i 1");
    }

    #[test]
    fn empty_tag_values_are_omitted() {
        let record = StorageRecord::new(RecordKind::Trade, 1)
            .tag("exchange", "")
            .field("ok", true);
        assert!(record.tags().is_empty());
        assert_eq!(record.to_line(), "trades ok=true 1");
    }

    #[test]
    fn integer_fields_have_suffix() {
        assert_eq!(FieldValue::Integer(-7).to_string(), "-7i");
    }

    #[test]
    fn batch_is_newline_terminated() {
        let a = StorageRecord::new(RecordKind::Gap, 1).field("x", 1_i64);
        let b = StorageRecord::new(RecordKind::Gap, 2).field("x", 2_i64);
        assert_eq!(
            encode_batch(&[a, b]),
            "orderbook_gaps x=1i 1\norderbook_gaps x=2i 2\n"
        );
    }

    #[test]
    fn lookup_helpers() {
        let record = StorageRecord::new(RecordKind::BookBin, 9)
            .tag("side", "bid")
            .field("levels", 3_i64);
        assert_eq!(record.tag_value("side"), Some("bid"));
        assert_eq!(record.field_value("levels"), Some(&FieldValue::Integer(3)));
        assert_eq!(record.field_value("missing"), None);
        assert_eq!(record.measurement(), "orderbook_bins");
    }

    #[test]
    fn kind_labels() {
        assert_eq!(RecordKind::Trade.as_str(), "trade");
        assert_eq!(RecordKind::BookBin.to_string(), "book_bin");
        assert_eq!(RecordKind::Gap.measurement(), "orderbook_gaps");
    }
}
