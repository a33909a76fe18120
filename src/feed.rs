// ===============================
// src/feed.rs
// ===============================
//
// Data-source collaborators. Each one only produces RawTick payloads on
// RAW_MARKET; ordering and validation happen downstream.
// - run_mock    : random walk per (source, symbol) with jittered timestamps
// - run_binance : Binance WS `<symbol>@trade` stream with reconnect backoff
// - load_csv / run_csv : backtest replayer over a CSV file
//
// All loops stop when their CancellationToken fires.
//

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use futures_util::StreamExt; // for .next()
use rand::Rng;
use serde::Deserialize;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bus::EventBus;
use crate::domain::{format_timestamp, parse_timestamp, topics, Event, RawTick};
use crate::error::{PipelineError, Result};

async fn emit(bus: &EventBus, tick: RawTick) {
    if let Err(e) = bus.publish(topics::RAW_MARKET, Event::RawTick(tick)).await {
        warn!(error = %e, "RAW_MARKET dispatch failed");
    }
}

#[derive(Debug, Clone)]
pub struct MockCfg {
    pub start_price: f64,
    pub interval: Duration,
    /// Max backdating of a tick timestamp; makes independent sources interleave.
    pub max_jitter_ms: i64,
}

impl Default for MockCfg {
    fn default() -> Self {
        Self { start_price: 100.0, interval: Duration::from_millis(50), max_jitter_ms: 150 }
    }
}

/// Random-walk generator for one (source, symbol) pair.
pub async fn run_mock(bus: Arc<EventBus>, source: String, symbol: String, cfg: MockCfg, cancel: CancellationToken) {
    let mut px = cfg.start_price;
    info!(%source, %symbol, "mock feed started");
    loop {
        // jangan simpan ThreadRng melewati .await
        let (step, jitter, vol) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(-0.0005..=0.0005),
                rng.gen_range(0..=cfg.max_jitter_ms.max(0)),
                rng.gen_range(0.001..=0.5),
            )
        };
        px = (px * (1.0 + step)).max(0.01);
        let ts = Utc::now() - ChronoDuration::milliseconds(jitter);
        let tick = RawTick {
            source: source.clone(),
            symbol: symbol.clone(),
            price: px,
            volume: vol,
            timestamp: format_timestamp(&ts),
        };
        emit(&bus, tick).await;

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(cfg.interval) => {}
        }
    }
    info!(%source, %symbol, "mock feed stopped");
}

/// Binance trade payload (`<symbol>@trade`):
/// {"e":"trade","E":1672515782136,"s":"BNBBTC","t":12345,"p":"0.001","q":"100","T":1672515782136,"m":true}
#[derive(Debug, Deserialize)]
struct TradeMsg {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    qty: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

fn parse_trade(txt: &str) -> Option<RawTick> {
    let msg: TradeMsg = serde_json::from_str(txt).ok()?;
    let ts = Utc.timestamp_millis_opt(msg.trade_time).single()?;
    Some(RawTick {
        source: "BINANCE".into(),
        symbol: msg.symbol,
        price: msg.price.parse().ok()?,
        volume: msg.qty.parse().ok()?,
        timestamp: format_timestamp(&ts),
    })
}

/// Exponential backoff + jitter: 0.5s, 1s, 2s ... capped at 32s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.min(6);
    let factor = 1u64 << shift;
    let base_ms = 500u64.saturating_mul(factor);
    let jitter = rand::thread_rng().gen_range(0..=250);
    Duration::from_millis(base_ms + jitter)
}

/// Adapter ke Binance WS (read-only) untuk trade stream.
///
/// - `ws_base` from config, e.g. `wss://stream.binance.com:9443/ws`
/// - `symbol` is the domain symbol ("BTCUSDT"); lower-cased for the stream name.
pub async fn run_binance(bus: Arc<EventBus>, symbol: String, ws_base: String, cancel: CancellationToken) {
    let stream = format!("{}@trade", symbol.to_lowercase());
    let ws_url = format!("{}/{}", ws_base.trim_end_matches('/'), stream);
    let url = match Url::parse(&ws_url) {
        Ok(u) => u,
        Err(e) => {
            error!(?e, %ws_url, "bad ws url");
            return;
        }
    };

    let mut attempt: u32 = 0;
    while !cancel.is_cancelled() {
        info!(%ws_url, "connecting binance trade stream");
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            r = connect_async(url.clone()) => r,
        };
        match connected {
            Ok((mut ws, _resp)) => {
                info!(%symbol, "connected to trade stream");
                attempt = 0; // reset backoff

                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => None,
                        f = ws.next() => f,
                    };
                    let Some(frame) = frame else { break };
                    match frame {
                        Ok(m) if m.is_text() => {
                            let txt = match m.into_text() {
                                Ok(t) => t,
                                Err(e) => {
                                    warn!(?e, "failed to read text frame");
                                    continue;
                                }
                            };
                            match parse_trade(&txt) {
                                Some(tick) => emit(&bus, tick).await,
                                None => debug!(payload = %txt, "non-trade frame ignored"),
                            }
                        }
                        Ok(_) => {
                            // ping/pong/binary frames
                        }
                        Err(e) => {
                            error!(?e, "ws read error");
                            break;
                        }
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
                info!(%symbol, "trade stream disconnected, will reconnect");
            }
            Err(e) => {
                error!(?e, "connect failed");
            }
        }

        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(backoff_delay(attempt)) => {}
        }
    }
    info!(%symbol, "binance feed stopped");
}

// ---- CSV backtest ----

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    #[serde(alias = "close")]
    price: f64,
    #[serde(default)]
    volume: Option<f64>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

/// Epoch milliseconds or any timestamp [`RawTick::parse`] accepts.
fn csv_timestamp(raw: &str) -> String {
    let raw = raw.trim();
    match raw.parse::<i64>() {
        Ok(ms) => match Utc.timestamp_millis_opt(ms).single() {
            Some(ts) => format_timestamp(&ts),
            None => raw.to_string(),
        },
        Err(_) => raw.to_string(),
    }
}

/// Read a backtest file into raw ticks, sorted by timestamp (stable, rows
/// with an unreadable timestamp go last). A missing file is fatal; bad rows
/// are skipped with a warning.
pub fn load_csv(path: &Path, default_symbol: &str) -> Result<Vec<RawTick>> {
    if !path.is_file() {
        return Err(PipelineError::MissingFile(path.display().to_string()));
    }
    let mut rdr = csv::Reader::from_path(path)?;
    let mut out = Vec::new();
    for (line, result) in rdr.deserialize::<CsvRow>().enumerate() {
        let row = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(line = line + 2, error = %e, "csv row skipped");
                continue;
            }
        };
        out.push(RawTick {
            source: row.source.unwrap_or_else(|| "CSV".to_string()),
            symbol: row.symbol.unwrap_or_else(|| default_symbol.to_string()),
            price: row.price,
            volume: row.volume.unwrap_or(0.0),
            timestamp: csv_timestamp(&row.timestamp),
        });
    }
    out.sort_by_key(|t| parse_timestamp(&t.timestamp).map_or(i64::MAX, |ts| ts.timestamp_millis()));
    info!(path = %path.display(), rows = out.len(), "csv loaded");
    Ok(out)
}

/// Publish every tick in the given order. Returns the number published.
pub async fn run_csv(bus: Arc<EventBus>, ticks: Vec<RawTick>, cancel: CancellationToken) -> usize {
    let mut sent = 0;
    for tick in ticks {
        if cancel.is_cancelled() {
            warn!(sent, "csv replay cancelled");
            break;
        }
        emit(&bus, tick).await;
        sent += 1;
    }
    sent
}
