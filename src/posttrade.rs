// ===============================
// src/posttrade.rs
// ===============================
//
// Sanitized outbound records. Attribution meta never leaves the process
// through these; only the event journal keeps full payloads.
//
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::Handler;
use crate::domain::{format_timestamp, Candle, Event, Fill, Order, Side, Signal};
use crate::error::Result;
use crate::recorder::Record;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleRecord {
    pub source: String,
    pub symbol: String,
    pub timeframe: String,
    pub bucket_start: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<&Candle> for CandleRecord {
    fn from(c: &Candle) -> Self {
        Self {
            source: c.source.clone(),
            symbol: c.symbol.clone(),
            timeframe: c.timeframe.clone(),
            bucket_start: format_timestamp(&c.bucket_start),
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub score: f64,
    pub price: f64,
    pub alpha: String,
}

impl From<&Signal> for SignalRecord {
    fn from(s: &Signal) -> Self {
        Self { ts: Utc::now(), symbol: s.symbol.clone(), score: s.score, price: s.price, alpha: s.meta.alpha.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub ts: DateTime<Utc>,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub status: String,
}

impl From<&Order> for OrderRecord {
    fn from(o: &Order) -> Self {
        Self {
            ts: Utc::now(),
            order_id: o.order_id.clone(),
            symbol: o.symbol.clone(),
            side: o.side,
            qty: o.quantity,
            price: o.price,
            status: "NEW".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRecord {
    pub ts: DateTime<Utc>,
    pub fill_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub commission: f64,
}

impl From<&Fill> for FillRecord {
    fn from(f: &Fill) -> Self {
        Self {
            ts: f.ts,
            fill_id: format!("FILL-{}", f.order_id),
            order_id: f.order_id.clone(),
            symbol: f.symbol.clone(),
            side: f.side,
            qty: f.quantity,
            price: f.fill_price,
            commission: f.commission,
        }
    }
}

/// Bus handler that turns pipeline events into report records.
pub struct ReportSink {
    tx: mpsc::Sender<Record>,
}

impl ReportSink {
    pub fn new(tx: mpsc::Sender<Record>) -> Self { Self { tx } }

    pub fn record_for(event: &Event) -> Option<Record> {
        match event {
            Event::Candle(c) => Some(Record::Candle(c.into())),
            Event::Signal(s) => Some(Record::Signal(s.into())),
            Event::Order(o) => Some(Record::Order(o.into())),
            Event::Fill(f) => Some(Record::Fill(f.into())),
            Event::Mark(m) => Some(Record::Mark(m.clone())),
            Event::AlphaPnl(p) => Some(Record::AlphaPnl(p.clone())),
            Event::RawTick(_) => None,
        }
    }
}

#[async_trait]
impl Handler for ReportSink {
    async fn handle(&self, topic: &str, event: &Event) -> Result<()> {
        match event {
            Event::Order(o) => info!(order_id = %o.order_id, symbol = %o.symbol, side = o.side.as_str(), qty = o.quantity, px = o.price, "ORDER"),
            Event::Fill(f) => info!(order_id = %f.order_id, symbol = %f.symbol, qty = f.quantity, px = f.fill_price, fee = f.commission, "FILLED"),
            _ => debug!(topic, kind = event.kind(), "report"),
        }
        if let Some(rec) = Self::record_for(event) {
            // Reporting is best effort; never stall the pipeline on it.
            if self.tx.try_send(rec).is_err() {
                warn!(topic, "report channel full or closed, record dropped");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AttributionMeta;

    #[test]
    fn order_record_has_no_meta() {
        let mut meta = AttributionMeta::default();
        meta.scores.insert("momentum".into(), 0.7);
        let order = Order {
            order_id: "ORD-1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            quantity: 0.008,
            price: 100.0,
            meta,
        };
        let line = serde_json::to_string(&OrderRecord::from(&order)).unwrap();
        assert!(!line.contains("momentum"));
        assert!(!line.contains("meta"));
        assert!(line.contains("\"side\":\"BUY\""));
    }

    #[tokio::test]
    async fn sink_forwards_records() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = ReportSink::new(tx);
        let fill = Fill {
            order_id: "ORD-2".into(),
            symbol: "ETHUSDT".into(),
            side: Side::Sell,
            quantity: 1.0,
            fill_price: 10.0,
            commission: 0.001,
            ts: Utc::now(),
            meta: AttributionMeta::default(),
        };
        sink.handle("FILL", &Event::Fill(fill)).await.unwrap();
        match rx.try_recv().unwrap() {
            Record::Fill(r) => assert_eq!(r.fill_id, "FILL-ORD-2"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
