// ===============================
// src/main.rs
// ===============================
/*
 # konfigurasi yang aktif
curl -s localhost:9898/metrics | egrep '^config_(feed_mode|exec_mode|symbol|alpha_weight)'

# aktivitas per symbol / alpha
curl -s localhost:9898/metrics | grep '^ticks_total_by_symbol'
curl -s localhost:9898/metrics | grep '^alpha_virtual_pnl'
curl -s localhost:9898/metrics | grep '^alpha_notional_exposure'

# backtest / replay
cargo run -- backtest --file data/BTCUSDT_1m.csv --symbol BTCUSDT
cargo run -- replay --file records/events.jsonl
cargo run -- replay --file records/events.jsonl --topics RAW_MARKET
*/
/*
=============================================================================
Project : alpha_bot_rust - event-driven multi-alpha trading pipeline
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)
=============================================================================
*/
use anyhow::{bail, Context};
use clap::Parser;
use tokio::{
    select,
    time::{interval, Duration},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use alpha_bot_rust::config::{self, Cli, Command, Config, FeedMode};
use alpha_bot_rust::engine::Engine;
use alpha_bot_rust::gateway::ExecMode;
use alpha_bot_rust::{feed, metrics, replay};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // ---- Load config ----
    let cfg = config::load().context("loading configuration")?;

    // ---- Metrics ----
    metrics::init();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_live(cfg).await,
        Command::Backtest { file, symbol } => {
            let symbol = symbol
                .map(|s| s.to_ascii_uppercase())
                .or_else(|| cfg.symbols.first().cloned())
                .unwrap_or_else(|| "BTCUSDT".to_string());
            let ticks = feed::load_csv(&file, &symbol).with_context(|| format!("reading {}", file.display()))?;

            let cfg = backtest_cfg(cfg);
            log_startup(&cfg, "backtest");
            let engine = Engine::build(&cfg);
            let sent = feed::run_csv(engine.bus.clone(), ticks, engine.cancel_token()).await;
            let ledger = engine.ledger.clone();
            engine.shutdown().await;
            report_summary(&ledger.snapshot(), sent);
            Ok(())
        }
        Command::Replay { file, topics } => {
            let entries = replay::load_journal(&file).await.with_context(|| format!("reading {}", file.display()))?;

            let cfg = backtest_cfg(cfg);
            log_startup(&cfg, "replay");
            let engine = Engine::build(&cfg);
            if replay::bypasses_router(&topics) {
                engine.detach_router();
            }
            let sent = replay::replay(engine.bus.clone(), entries, &topics, engine.cancel_token()).await;
            let ledger = engine.ledger.clone();
            engine.shutdown().await;
            report_summary(&ledger.snapshot(), sent);
            Ok(())
        }
    }
}

/// Offline runs are simulated without latency so they finish fast and
/// reproduce exactly.
fn backtest_cfg(mut cfg: Config) -> Config {
    cfg.exec.mode = ExecMode::Backtest;
    cfg.exec.latency_ms = (0, 0);
    cfg
}

// ---- Human-friendly startup info + export config to metrics ----
fn log_startup(cfg: &Config, command: &str) {
    let timeframes: Vec<&str> = cfg.timeframes.iter().map(|t| t.label.as_str()).collect();
    let strategies: Vec<&str> = cfg.strategies.iter().map(|k| k.name()).collect();
    info!(
        command,
        feed_mode = cfg.feed_mode.as_str(),
        exec_mode = %cfg.exec.mode,
        symbols = ?cfg.symbols,
        timeframes = ?timeframes,
        strategies = ?strategies,
        weights = ?cfg.blender.weights,
        blender_enabled = cfg.blender.enabled,
        record_dir = ?cfg.record_dir,
        "startup config"
    );

    metrics::CONFIG_FEED_MODE.with_label_values(&[cfg.feed_mode.as_str()]).set(1);
    metrics::CONFIG_EXEC_MODE.with_label_values(&[&cfg.exec.mode.to_string()]).set(1);
    for s in &cfg.symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[s]).set(1);
    }
}

fn report_summary(snap: &alpha_bot_rust::positions::LedgerSnapshot, events: usize) {
    info!(
        events,
        fills = snap.fills,
        equity = %format!("{:.4}", snap.equity),
        cash = %format!("{:.4}", snap.cash),
        unrealized = %format!("{:.4}", snap.unrealized),
        "run finished"
    );
    for (alpha, pnl) in &snap.alpha_pnl {
        info!(%alpha, pnl = %format!("{pnl:.4}"), "alpha attribution");
    }
}

async fn run_live(cfg: Config) -> anyhow::Result<()> {
    if cfg.feed_mode == FeedMode::Csv {
        bail!("FEED_MODE=csv is offline only; use `backtest --file <csv>`");
    }
    metrics::serve_metrics(cfg.metrics_port);
    log_startup(&cfg, "run");

    let mut engine = Engine::build(&cfg);
    for (alpha, w) in engine.blender.weights() {
        metrics::CONFIG_ALPHA_WEIGHT.with_label_values(&[alpha]).set(*w);
    }

    // ---- FEED (Market Data) ----
    match cfg.feed_mode {
        FeedMode::Mock => {
            for sym in cfg.symbols.iter().cloned() {
                for source in cfg.mock_sources.iter().cloned() {
                    let h = tokio::spawn(feed::run_mock(
                        engine.bus.clone(),
                        source,
                        sym.clone(),
                        feed::MockCfg::default(),
                        engine.cancel_token(),
                    ));
                    engine.track(h);
                }
            }
        }
        FeedMode::Binance => {
            for sym in cfg.symbols.iter().cloned() {
                let h = tokio::spawn(feed::run_binance(
                    engine.bus.clone(),
                    sym,
                    cfg.binance_ws_url.clone(),
                    engine.cancel_token(),
                ));
                engine.track(h);
            }
        }
        FeedMode::Csv => {} // rejected above
    }

    // ---- Heartbeat until Ctrl-C ----
    let mut beat = interval(Duration::from_secs(1));
    let mut last_ticks = metrics::TICKS.get();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        select! {
            _ = beat.tick() => {
                let now = metrics::TICKS.get();
                info!(ticks = now - last_ticks, symbols = ?engine.router.symbols(), "heartbeat");
                last_ticks = now;
            }
            res = &mut ctrl_c => {
                if let Err(e) = res {
                    warn!(error = %e, "ctrl-c handler failed, shutting down");
                }
                break;
            }
        }
    }

    info!("shutting down");
    engine.shutdown().await;
    Ok(())
}
