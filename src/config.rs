// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : alpha_bot_rust - event-driven multi-alpha trading pipeline
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Ingests ticks from several sources (mock/Binance/CSV), reorders
          them per symbol, builds multi-timeframe candles, blends alpha
          scores into target signals, sizes orders, simulates fills and
          attributes PnL per alpha. Exposes Prometheus metrics and records
          JSONL reports plus a replayable event journal.
=============================================================================
*/
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing::warn;

use crate::blender::BlenderCfg;
use crate::candles::Timeframe;
use crate::error::{PipelineError, Result};
use crate::gateway::{ExecCfg, ExecMode};
use crate::positions::LedgerCfg;
use crate::risk::SizingLimits;
use crate::router::RouterCfg;
use crate::strategy::AlphaKind;

/// Sumber market data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Mock,
    Binance,
    Csv,
}

impl FeedMode {
    pub fn parse(raw: Option<&str>, default_mode: FeedMode) -> FeedMode {
        match raw.unwrap_or_default().trim().to_ascii_lowercase().as_str() {
            "" => default_mode,
            "mock" => FeedMode::Mock,
            "binance" => FeedMode::Binance,
            "csv" => FeedMode::Csv,
            other => {
                warn!(value = other, "unknown FEED_MODE, using default");
                default_mode
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Mock => "mock",
            FeedMode::Binance => "binance",
            FeedMode::Csv => "csv",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub symbols: Vec<String>,
    pub feed_mode: FeedMode,
    pub mock_sources: Vec<String>,
    pub binance_ws_url: String,

    pub timeframes: Vec<Timeframe>,
    pub strategies: Vec<AlphaKind>,
    pub blender: BlenderCfg,
    pub ledger: LedgerCfg,
    pub exec: ExecCfg,
    pub router: RouterCfg,

    pub record_dir: Option<PathBuf>,
    pub metrics_port: u16,
    pub report_interval: Duration,
}

#[derive(Parser, Debug)]
#[command(name = "alpha_bot_rust", version, about = "Multi-alpha event-driven trading pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Stream live or mock feeds (default)
    Run,
    /// Replay a CSV file of ticks through the full pipeline
    Backtest {
        #[arg(long)]
        file: PathBuf,
        /// Symbol for rows without a `symbol` column
        #[arg(long)]
        symbol: Option<String>,
    },
    /// Re-publish a recorded events.jsonl journal
    Replay {
        #[arg(long)]
        file: PathBuf,
        /// Topics to re-publish (comma separated). ORDERED_MARKET replays the
        /// router's recorded output with the router detached.
        #[arg(long, value_delimiter = ',', default_value = "ORDERED_MARKET")]
        topics: Vec<String>,
    },
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',').map(|x| x.trim()).filter(|x| !x.is_empty()).map(str::to_string).collect()
}

/// `name:value,name:value`
fn parse_pairs(key: &str, raw: &str) -> Result<BTreeMap<String, f64>> {
    let mut out = BTreeMap::new();
    for item in split_list(raw) {
        let (name, value) = item
            .split_once(':')
            .ok_or_else(|| PipelineError::Config(format!("{key}: expected name:value, got '{item}'")))?;
        let v: f64 = value
            .trim()
            .parse()
            .map_err(|_| PipelineError::Config(format!("{key}: bad number in '{item}'")))?;
        if !v.is_finite() {
            return Err(PipelineError::Config(format!("{key}: non-finite value in '{item}'")));
        }
        out.insert(name.trim().to_string(), v);
    }
    Ok(out)
}

impl Config {
    /// Build from any key lookup; `load` passes the process environment.
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let num = |key: &str, default: f64| -> f64 {
            get(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
        };
        let int = |key: &str, default: u64| -> u64 {
            get(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
        };

        // ===== Market data =====
        let symbols: Vec<String> = get("SYMBOLS")
            .map(|s| split_list(&s).into_iter().map(|x| x.to_ascii_uppercase()).collect())
            .filter(|v: &Vec<String>| !v.is_empty())
            .unwrap_or_else(|| vec!["BTCUSDT".to_string()]);
        let feed_mode = FeedMode::parse(get("FEED_MODE").as_deref(), FeedMode::Mock);
        let mock_sources = get("MOCK_SOURCES")
            .map(|s| split_list(&s))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| vec!["MOCK_A".to_string(), "MOCK_B".to_string()]);
        let binance_ws_url =
            get("BINANCE_WS_URL").unwrap_or_else(|| "wss://stream.binance.com:9443/ws".to_string());

        // ===== Candles / strategies =====
        let timeframes = Timeframe::parse_list(&split_list(&get("TIMEFRAMES").unwrap_or_else(|| "1m,5m,1h".into())))?;

        let strategies = match get("STRATEGIES") {
            Some(raw) if !raw.trim().is_empty() => {
                let mut out = Vec::new();
                for name in split_list(&raw) {
                    let kind = AlphaKind::parse_one(&name)
                        .ok_or_else(|| PipelineError::Config(format!("STRATEGIES: unknown alpha '{name}'")))?;
                    if !out.contains(&kind) {
                        out.push(kind);
                    }
                }
                out
            }
            _ => AlphaKind::ALL.to_vec(),
        };

        let weights = match get("ALPHA_WEIGHTS") {
            Some(raw) if !raw.trim().is_empty() => {
                let parsed = parse_pairs("ALPHA_WEIGHTS", &raw)?;
                let mut normalized = BTreeMap::new();
                for (name, w) in parsed {
                    let kind = AlphaKind::parse_one(&name)
                        .ok_or_else(|| PipelineError::Config(format!("ALPHA_WEIGHTS: unknown alpha '{name}'")))?;
                    normalized.insert(kind.name().to_string(), w);
                }
                Some(normalized)
            }
            _ => None,
        };

        let signal_timeframe = match get("SIGNAL_TIMEFRAME").filter(|s| !s.trim().is_empty()) {
            Some(raw) => {
                let tf: Timeframe = raw.parse()?;
                if !timeframes.contains(&tf) {
                    return Err(PipelineError::Config(format!("SIGNAL_TIMEFRAME {} is not in TIMEFRAMES", tf.label)));
                }
                Some(tf.label)
            }
            None => None,
        };

        let blender = BlenderCfg {
            weights,
            threshold: num("CONVICTION_THRESHOLD", 0.05),
            publish_delta: num("PUBLISH_DELTA", 0.05),
            enabled: get("BLENDER_ENABLED")
                .map(|s| !matches!(s.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
                .unwrap_or(true),
            timeframe: signal_timeframe,
        };

        // ===== Ledger / sizing =====
        let max_units_by_symbol: HashMap<String, f64> = match get("MAX_UNITS_BY_SYMBOL") {
            Some(raw) => parse_pairs("MAX_UNITS_BY_SYMBOL", &raw)?
                .into_iter()
                .map(|(k, v)| (k.to_ascii_uppercase(), v))
                .collect(),
            None => HashMap::new(),
        };
        let ledger = LedgerCfg {
            initial_cash: num("INITIAL_CASH", 100_000.0),
            limits: SizingLimits {
                default_max_units: num("MAX_UNITS", 0.01),
                max_units_by_symbol,
                noise_threshold: num("NOISE_THRESHOLD", 4e-4),
            },
        };

        // ===== Execution =====
        let mode = match get("EXEC_MODE") {
            Some(raw) if !raw.trim().is_empty() => raw.parse::<ExecMode>()?,
            _ => ExecMode::Paper,
        };
        let lat_min = int("LATENCY_MIN_MS", 50);
        let lat_max = int("LATENCY_MAX_MS", 150).max(lat_min);
        let exec = ExecCfg {
            mode,
            slippage_bps: num("SLIPPAGE_BPS", 3.0),
            commission_bps: num("COMMISSION_BPS", 1.0),
            latency_ms: (lat_min, lat_max),
            meta_ttl: Duration::from_secs(int("META_TTL_SECS", 60)),
        };

        // ===== Router =====
        let router = RouterCfg {
            buffer_window: Duration::from_millis(int("ROUTER_BUFFER_MS", 200)),
            max_buffered: int("ROUTER_MAX_BUFFERED", 50) as usize,
            queue_capacity: int("ROUTER_QUEUE_CAPACITY", 10_000).max(1) as usize,
        };

        // ===== Files / metrics =====
        let record_dir = get("RECORD_DIR").filter(|s| !s.trim().is_empty()).map(PathBuf::from);
        let metrics_port = get("METRICS_PORT").and_then(|s| s.trim().parse().ok()).unwrap_or(9898);
        let report_interval = Duration::from_secs(int("REPORT_INTERVAL_SECS", 30).max(1));

        Ok(Self {
            symbols,
            feed_mode,
            mock_sources,
            binance_ws_url,
            timeframes,
            strategies,
            blender,
            ledger,
            exec,
            router,
            record_dir,
            metrics_port,
            report_interval,
        })
    }
}

pub fn load() -> Result<Config> {
    // Pastikan .env dibaca (agar RECORD_DIR, SYMBOLS, dll ter-load)
    let _ = dotenv();
    Config::from_lookup(|k| env::var(k).ok())
}
