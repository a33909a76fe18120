// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Ingestion --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "raw ticks received").unwrap());

pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total_by_symbol", "raw ticks per symbol"),
        &["symbol"],
    )
    .unwrap()
});

pub static TICKS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_dropped_total", "ticks dropped (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

pub static ROUTER_BUFFERED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("router_buffered", "ticks waiting in the reorder heap"),
        &["symbol"],
    )
    .unwrap()
});

// -------- Candles / signals --------
pub static CANDLES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("candles_closed_total", "closed candles (labels: symbol, timeframe)"),
        &["symbol", "timeframe"],
    )
    .unwrap()
});

pub static SIGNALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("signals_total_by_symbol", "blended TARGET signals published"),
        &["symbol"],
    )
    .unwrap()
});

// -------- Orders / fills --------
pub static ORDERS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("orders_total", "orders sized by the ledger").unwrap());

pub static EXECS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("exec_reports_total", "execution reports"),
        &["status", "mode"],
    )
    .unwrap()
});

// Latency from order -> fill (milliseconds)
pub static LAT_ORDER_FILL: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "latency_order_to_fill_ms",
        "Simulated latency from order to fill (ms)",
    ))
    .unwrap()
});

// -------- Ledger --------
pub static EQUITY: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("portfolio_equity", "cash + marked positions").unwrap());

pub static CASH: Lazy<Gauge> = Lazy::new(|| Gauge::new("portfolio_cash", "cash balance").unwrap());

pub static POSITION: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("position_qty", "net qty per symbol"), &["symbol"]).unwrap()
});

pub static ALPHA_PNL: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("alpha_virtual_pnl", "virtual PnL attributed per alpha"),
        &["alpha"],
    )
    .unwrap()
});

pub static ALPHA_EXPOSURE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("alpha_notional_exposure", "blender weight*score exposure marked at last close"),
        &["alpha"],
    )
    .unwrap()
});

// ---- Config visibility (feed / exec mode / strategies / symbols) ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_feed_mode", "feed mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub static CONFIG_EXEC_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_exec_mode", "execution mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub static CONFIG_ALPHA_WEIGHT: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("config_alpha_weight", "blender weight per alpha"),
        &["alpha"],
    )
    .unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "configured symbols (label: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICKS_BY_SYMBOL.clone())),
        REGISTRY.register(Box::new(TICKS_DROPPED.clone())),
        REGISTRY.register(Box::new(ROUTER_BUFFERED.clone())),
        REGISTRY.register(Box::new(CANDLES.clone())),
        REGISTRY.register(Box::new(SIGNALS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(EXECS.clone())),
        REGISTRY.register(Box::new(LAT_ORDER_FILL.clone())),
        REGISTRY.register(Box::new(EQUITY.clone())),
        REGISTRY.register(Box::new(CASH.clone())),
        REGISTRY.register(Box::new(POSITION.clone())),
        REGISTRY.register(Box::new(ALPHA_PNL.clone())),
        REGISTRY.register(Box::new(ALPHA_EXPOSURE.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_FEED_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_EXEC_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_ALPHA_WEIGHT.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

/// Metrics endpoint on a dedicated OS thread. A bind failure is logged, not fatal.
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%addr, error = %e, "metrics bind failed");
                return;
            }
        };
        tracing::info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(error = %e, "metrics accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_never_empty() {
        TICKS.inc();
        let body = encode_metrics();
        assert!(!body.is_empty());
    }
}
