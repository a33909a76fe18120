// ===============================
// src/candles.rs (tick -> multi-timeframe OHLCV)
// ===============================
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Handler};
use crate::domain::{topics, Candle, Event, Tick};
use crate::error::{PipelineError, Result};
use crate::metrics::{CANDLES, TICKS_DROPPED};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Timeframe {
    pub label: String,
    pub millis: i64,
}

impl FromStr for Timeframe {
    type Err = PipelineError;

    /// `30s`, `1m`, `5m`, `1h`, `1d`.
    fn from_str(s: &str) -> Result<Self> {
        let label = s.trim().to_ascii_lowercase();
        if label.len() < 2 {
            return Err(PipelineError::Timeframe(s.to_string()));
        }
        let (num, unit) = label.split_at(label.len() - 1);
        let n: i64 = num.parse().map_err(|_| PipelineError::Timeframe(s.to_string()))?;
        let unit_ms = match unit {
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => return Err(PipelineError::Timeframe(s.to_string())),
        };
        let millis = match n.checked_mul(unit_ms) {
            Some(ms) if n > 0 => ms,
            _ => return Err(PipelineError::Timeframe(s.to_string())),
        };
        Ok(Self { label, millis })
    }
}

impl Timeframe {
    pub fn parse_list(items: &[String]) -> Result<Vec<Timeframe>> {
        let mut out: Vec<Timeframe> = Vec::new();
        for item in items {
            let tf: Timeframe = item.parse()?;
            if !out.contains(&tf) {
                out.push(tf);
            }
        }
        if out.is_empty() {
            return Err(PipelineError::Timeframe("no timeframes configured".into()));
        }
        Ok(out)
    }

    /// Start of the bucket holding `ts`: floor to a multiple of the duration since epoch.
    pub fn bucket_start(&self, ts: &DateTime<Utc>) -> DateTime<Utc> {
        let ms = ts.timestamp_millis();
        let start = ms - ms.rem_euclid(self.millis);
        Utc.timestamp_millis_opt(start).single().unwrap_or(*ts)
    }
}

pub struct CandleAggregator {
    bus: Arc<EventBus>,
    timeframes: Vec<Timeframe>,
    // (symbol, timeframe index) -> open candle
    open: Mutex<HashMap<(String, usize), Candle>>,
}

impl CandleAggregator {
    pub fn new(bus: Arc<EventBus>, timeframes: Vec<Timeframe>) -> Self {
        Self { bus, timeframes, open: Mutex::new(HashMap::new()) }
    }

    pub fn attach(self: &Arc<Self>) {
        self.bus.subscribe(topics::ORDERED_MARKET, "candle_aggregator", self.clone());
        let labels: Vec<&str> = self.timeframes.iter().map(|t| t.label.as_str()).collect();
        info!(timeframes = ?labels, "aggregator subscribed to ORDERED_MARKET");
    }

    pub fn timeframes(&self) -> &[Timeframe] { &self.timeframes }

    /// Fold one tick into every timeframe and return the candles it closed.
    pub fn update_tick(&self, tick: &Tick) -> Vec<Candle> {
        let mut finished = Vec::new();
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);

        for (idx, tf) in self.timeframes.iter().enumerate() {
            let bucket = tf.bucket_start(&tick.ts);
            let key = (tick.symbol.clone(), idx);
            match open.get_mut(&key) {
                Some(bar) if bar.bucket_start == bucket => {
                    bar.high = bar.high.max(tick.price);
                    bar.low = bar.low.min(tick.price);
                    bar.close = tick.price;
                    bar.volume += tick.volume;
                }
                _ => {
                    let fresh = Candle {
                        source: tick.source.clone(),
                        symbol: tick.symbol.clone(),
                        timeframe: tf.label.clone(),
                        bucket_start: bucket,
                        open: tick.price,
                        high: tick.price,
                        low: tick.price,
                        close: tick.price,
                        volume: tick.volume,
                        closed: false,
                    };
                    if let Some(mut prev) = open.insert(key, fresh) {
                        prev.closed = true;
                        finished.push(prev);
                    }
                }
            }
        }
        finished
    }

    /// Snapshot of the open candle for (symbol, timeframe label).
    pub fn open_candle(&self, symbol: &str, timeframe: &str) -> Option<Candle> {
        let idx = self.timeframes.iter().position(|t| t.label == timeframe)?;
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        open.get(&(symbol.to_string(), idx)).cloned()
    }

    pub async fn on_tick(&self, tick: &Tick) -> Result<()> {
        let finished = self.update_tick(tick);
        for candle in finished {
            CANDLES.with_label_values(&[&candle.symbol, &candle.timeframe]).inc();
            debug!(
                symbol = %candle.symbol,
                tf = %candle.timeframe,
                o = candle.open, h = candle.high, l = candle.low, c = candle.close,
                "candle closed"
            );
            self.bus.publish(topics::MARKET_SNAPSHOT, Event::Candle(candle)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for CandleAggregator {
    async fn handle(&self, topic: &str, event: &Event) -> Result<()> {
        let Event::RawTick(raw) = event else {
            return Err(PipelineError::UnexpectedEvent { topic: topic.to_string(), got: event.kind() });
        };
        match raw.parse() {
            Ok(tick) => self.on_tick(&tick).await,
            Err(e) => {
                warn!(error = %e, source = %raw.source, "aggregator: bad tick dropped");
                TICKS_DROPPED.with_label_values(&["malformed"]).inc();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RawTick;

    fn tfs(list: &[&str]) -> Vec<Timeframe> {
        Timeframe::parse_list(&list.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
    }

    fn tick(sym: &str, ts: &str, price: f64) -> Tick {
        RawTick { source: "T".into(), symbol: sym.into(), price, volume: 1.0, timestamp: ts.into() }
            .parse()
            .unwrap()
    }

    #[test]
    fn timeframe_parsing() {
        assert_eq!("1m".parse::<Timeframe>().unwrap().millis, 60_000);
        assert_eq!("4H".parse::<Timeframe>().unwrap().millis, 4 * 3_600_000);
        assert!("1w".parse::<Timeframe>().is_err());
        assert!("0m".parse::<Timeframe>().is_err());
        assert!("m".parse::<Timeframe>().is_err());
        assert!(matches!("99999999999999d".parse::<Timeframe>(), Err(PipelineError::Timeframe(_))));
        assert!(Timeframe::parse_list(&[]).is_err());
    }

    #[test]
    fn three_ticks_one_bucket() {
        let agg = CandleAggregator::new(Arc::new(EventBus::new()), tfs(&["1m"]));
        assert!(agg.update_tick(&tick("BTCUSDT", "2025-11-06T12:01:05Z", 100.0)).is_empty());
        assert!(agg.update_tick(&tick("BTCUSDT", "2025-11-06T12:01:20Z", 102.0)).is_empty());
        assert!(agg.update_tick(&tick("BTCUSDT", "2025-11-06T12:01:59.999Z", 101.0)).is_empty());

        let closed = agg.update_tick(&tick("BTCUSDT", "2025-11-06T12:02:00Z", 99.0));
        assert_eq!(closed.len(), 1);
        let c = &closed[0];
        assert!(c.closed);
        assert_eq!((c.open, c.high, c.low, c.close), (100.0, 102.0, 100.0, 101.0));
        assert_eq!(c.volume, 3.0);
        assert_eq!(c.bucket_start.timestamp_millis() % 60_000, 0);

        let open = agg.open_candle("BTCUSDT", "1m").unwrap();
        assert!(!open.closed);
        assert_eq!(open.open, 99.0);
    }

    #[test]
    fn multiple_timeframes_close_together() {
        let agg = CandleAggregator::new(Arc::new(EventBus::new()), tfs(&["1m", "5m", "1h"]));
        agg.update_tick(&tick("ETHUSDT", "2025-11-06T12:59:30Z", 10.0));
        let closed = agg.update_tick(&tick("ETHUSDT", "2025-11-06T13:00:00Z", 11.0));
        let mut labels: Vec<&str> = closed.iter().map(|c| c.timeframe.as_str()).collect();
        labels.sort();
        assert_eq!(labels, vec!["1h", "1m", "5m"]);
        for c in &closed {
            let tf: Timeframe = c.timeframe.parse().unwrap();
            assert_eq!(c.bucket_start.timestamp_millis() % tf.millis, 0);
        }
    }

    #[test]
    fn symbols_are_independent() {
        let agg = CandleAggregator::new(Arc::new(EventBus::new()), tfs(&["1m"]));
        agg.update_tick(&tick("AAA", "2025-11-06T12:00:10Z", 1.0));
        let closed = agg.update_tick(&tick("BBB", "2025-11-06T12:05:10Z", 2.0));
        assert!(closed.is_empty());
        assert_eq!(agg.open_candle("AAA", "1m").unwrap().close, 1.0);
    }

    #[tokio::test]
    async fn candle_invariants_hold_on_random_walk() {
        let bus = Arc::new(EventBus::new());
        let out = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = out.clone();
        bus.subscribe_fn(topics::MARKET_SNAPSHOT, "collect", move |ev| {
            let sink = sink.clone();
            async move {
                if let Event::Candle(c) = ev {
                    sink.lock().unwrap().push(c);
                }
                Ok(())
            }
        });
        let agg = Arc::new(CandleAggregator::new(bus.clone(), tfs(&["1m", "5m"])));
        agg.attach();

        let base = Utc.with_ymd_and_hms(2025, 11, 6, 12, 0, 0).unwrap();
        let mut px = 100.0;
        for i in 0..600i64 {
            px += ((i * 7919) % 11 - 5) as f64 * 0.1;
            let ts = base + chrono::Duration::milliseconds(i * 1_700);
            let raw = RawTick {
                source: "T".into(),
                symbol: "BTCUSDT".into(),
                price: px,
                volume: 0.1,
                timestamp: crate::domain::format_timestamp(&ts),
            };
            bus.publish(topics::ORDERED_MARKET, Event::RawTick(raw)).await.unwrap();
        }
        // malformed tick is dropped, not an error
        let bad = RawTick { symbol: "BTCUSDT".into(), price: 1.0, timestamp: "??".into(), ..Default::default() };
        assert!(bus.publish(topics::ORDERED_MARKET, Event::RawTick(bad)).await.is_ok());

        let candles = out.lock().unwrap().clone();
        assert!(candles.len() > 10);
        for c in &candles {
            let tf: Timeframe = c.timeframe.parse().unwrap();
            assert!(c.closed);
            assert!(c.high >= c.open.max(c.close));
            assert!(c.low <= c.open.min(c.close));
            assert_eq!(c.bucket_start.timestamp_millis() % tf.millis, 0);
        }
    }
}
