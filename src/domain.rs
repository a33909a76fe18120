// ===============================
// src/domain.rs
// ===============================
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

// ---- Topics ----
pub mod topics {
    pub const RAW_MARKET: &str = "RAW_MARKET";
    pub const ORDERED_MARKET: &str = "ORDERED_MARKET";
    pub const MARKET_SNAPSHOT: &str = "MARKET_SNAPSHOT";
    pub const SIGNAL: &str = "SIGNAL";
    pub const ORDER: &str = "ORDER";
    pub const FILL: &str = "FILL";
    pub const PORTFOLIO_MARK: &str = "PORTFOLIO_MARK";
    pub const ALPHA_PNL_TICK: &str = "ALPHA_PNL_TICK";
}

pub const TARGET_DIRECTION: &str = "TARGET";
pub const GENERIC_ALPHA: &str = "GENERIC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn sign(&self) -> f64 { match self { Side::Buy => 1.0, Side::Sell => -1.0 } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
}

/// Tick as delivered by a data-source collaborator. Nothing is validated yet;
/// see [`RawTick::parse`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawTick {
    pub source: String,
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub source: String,
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub ts: DateTime<Utc>,
}

impl RawTick {
    pub fn normalized_symbol(&self) -> String { self.symbol.trim().to_ascii_uppercase() }

    /// Validate every field and build a [`Tick`]. Symbol is upper-cased.
    pub fn parse(&self) -> Result<Tick, PipelineError> {
        let symbol = self.normalized_symbol();
        if symbol.is_empty() {
            return Err(PipelineError::MalformedTick("empty symbol".into()));
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(PipelineError::MalformedTick(format!("bad price {} for {}", self.price, symbol)));
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(PipelineError::MalformedTick(format!("bad volume {} for {}", self.volume, symbol)));
        }
        let ts = parse_timestamp(&self.timestamp).ok_or_else(|| {
            PipelineError::MalformedTick(format!("bad timestamp '{}' for {}", self.timestamp, symbol))
        })?;
        Ok(Tick { source: self.source.clone(), symbol, price: self.price, volume: self.volume, ts })
    }
}

/// ISO-8601 UTC. Accepts RFC 3339 (`Z` or offset) and offset-less strings,
/// which are read as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() { return None; }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Millisecond ISO string, e.g. `2025-11-06T12:01:05.123Z`.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub source: String,
    pub symbol: String,
    pub timeframe: String,
    pub bucket_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub closed: bool,
}

/// Per-alpha breakdown carried from Signal through Order to Fill.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributionMeta {
    #[serde(default)]
    pub alpha: String,
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: String,
    pub score: f64,
    pub price: f64,
    #[serde(default)]
    pub meta: AttributionMeta,
}

impl Signal {
    pub fn target(symbol: impl Into<String>, score: f64, price: f64, meta: AttributionMeta) -> Self {
        Self { symbol: symbol.into(), direction: TARGET_DIRECTION.to_string(), score, price, meta }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    #[serde(default)]
    pub meta: AttributionMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub fill_price: f64,
    pub commission: f64,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub meta: AttributionMeta,
}

impl Fill {
    pub fn signed_qty(&self) -> f64 { self.side.sign() * self.quantity }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityMark {
    pub ts: DateTime<Utc>,
    pub equity: f64,
    pub cash: f64,
    pub unrealized: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlphaPnl {
    pub alpha: String,
    pub ts: DateTime<Utc>,
    pub pnl: f64,
}

/// Payload envelope for everything that travels over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    RawTick(RawTick),
    Candle(Candle),
    Signal(Signal),
    Order(Order),
    Fill(Fill),
    Mark(EquityMark),
    AlphaPnl(AlphaPnl),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::RawTick(_) => "raw_tick",
            Event::Candle(_) => "candle",
            Event::Signal(_) => "signal",
            Event::Order(_) => "order",
            Event::Fill(_) => "fill",
            Event::Mark(_) => "mark",
            Event::AlphaPnl(_) => "alpha_pnl",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(symbol: &str, price: f64, ts: &str) -> RawTick {
        RawTick { source: "BINANCE".into(), symbol: symbol.into(), price, volume: 0.5, timestamp: ts.into() }
    }

    #[test]
    fn parse_upper_cases_symbol() {
        let t = raw(" btcusdt ", 100.0, "2025-11-06T12:01:05.123Z").parse().unwrap();
        assert_eq!(t.symbol, "BTCUSDT");
        assert_eq!(t.ts.timestamp_millis() % 1000, 123);
    }

    #[test]
    fn parse_rejects_malformed_fields() {
        assert!(raw("", 100.0, "2025-11-06T12:01:05Z").parse().is_err());
        assert!(raw("ETHUSDT", f64::NAN, "2025-11-06T12:01:05Z").parse().is_err());
        assert!(raw("ETHUSDT", 0.0, "2025-11-06T12:01:05Z").parse().is_err());
        assert!(raw("ETHUSDT", 10.0, "yesterday").parse().is_err());
    }

    #[test]
    fn naive_timestamps_are_utc() {
        let a = parse_timestamp("2025-11-06T12:01:05.500").unwrap();
        let b = parse_timestamp("2025-11-06T12:01:05.500+00:00").unwrap();
        assert_eq!(a, b);
        assert_eq!(format_timestamp(&a), "2025-11-06T12:01:05.500Z");
    }

    #[test]
    fn event_envelope_is_tagged() {
        let ev = Event::RawTick(raw("BTCUSDT", 1.0, "2025-11-06T12:01:05Z"));
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "RawTick");
        assert_eq!(v["data"]["symbol"], "BTCUSDT");
        let back: Event = serde_json::from_value(v).unwrap();
        assert_eq!(back, ev);
    }
}
