use std::sync::{Arc, Mutex};
use std::time::Duration;

use alpha_bot_rust::config::Config;
use alpha_bot_rust::domain::{parse_timestamp, topics, Candle, Event, RawTick};
use alpha_bot_rust::engine::Engine;
use alpha_bot_rust::gateway::ExecMode;
use alpha_bot_rust::replay;
use alpha_bot_rust::strategy::{Alpha, AlphaFactory};
use tokio_util::sync::CancellationToken;

struct Constant(f64);

impl Alpha for Constant {
    fn name(&self) -> &str { "constant" }
    fn score(&mut self, _candle: &Candle) -> f64 { self.0 }
}

fn cfg() -> Config {
    let mut cfg = Config::from_lookup(|k| match k {
        "TIMEFRAMES" => Some("1m".to_string()),
        _ => None,
    })
    .unwrap();
    cfg.exec.mode = ExecMode::Backtest;
    cfg.exec.latency_ms = (0, 0);
    cfg
}

fn raw(source: &str, ts: &str, price: f64) -> Event {
    Event::RawTick(RawTick {
        source: source.into(),
        symbol: "btcusdt".into(),
        price,
        volume: 0.5,
        timestamp: ts.into(),
    })
}

fn constant(score: f64) -> Vec<(String, AlphaFactory)> {
    let factory: AlphaFactory = Arc::new(move || Box::new(Constant(score)) as Box<dyn Alpha>);
    vec![("constant".to_string(), factory)]
}

#[tokio::test]
async fn tick_to_attributed_fill() {
    let engine = Engine::with_alphas(&cfg(), constant(0.8));
    let bus = engine.bus.clone();
    let ledger = engine.ledger.clone();

    let fills = Arc::new(Mutex::new(Vec::new()));
    let sink = fills.clone();
    bus.subscribe_fn(topics::FILL, "test_fills", move |ev| {
        let sink = sink.clone();
        async move {
            if let Event::Fill(f) = ev {
                sink.lock().unwrap().push(f);
            }
            Ok(())
        }
    });

    for (ts, px) in [
        ("2025-11-06T12:00:10.000Z", 100.0),
        ("2025-11-06T12:00:40.000Z", 101.0),
        ("2025-11-06T12:01:05.000Z", 102.0),
        ("2025-11-06T12:01:30.000Z", 103.0),
    ] {
        bus.publish(topics::RAW_MARKET, raw("A", ts, px)).await.unwrap();
    }
    tokio::time::timeout(Duration::from_secs(5), engine.shutdown()).await.unwrap();

    let fills = fills.lock().unwrap().clone();
    assert_eq!(fills.len(), 1, "one closed candle, one target, one fill");
    let f = &fills[0];
    assert_eq!(f.symbol, "BTCUSDT");
    assert!((f.quantity - 0.008).abs() < 1e-12);
    // closed 12:00 candle closes at 101, +3 bps slippage
    assert!((f.fill_price - 101.0 * 1.0003).abs() < 1e-9);
    assert!((f.commission - f.fill_price * 0.008 * 1e-4).abs() < 1e-12);
    assert_eq!(f.meta.alpha, "multi");
    assert_eq!(f.meta.scores["constant"], 0.8);

    let snap = ledger.snapshot();
    assert!((snap.positions["BTCUSDT"] - 0.008).abs() < 1e-12);
    let expected_cash = 100_000.0 - 0.008 * f.fill_price - f.commission;
    assert!((snap.cash - expected_cash).abs() < 1e-9);
    assert!((snap.equity - ledger.equity_from_scratch()).abs() < 1e-9);
    assert!((snap.alpha_pnl["constant"] - 0.8 * 0.008 * f.fill_price).abs() < 1e-9);
}

#[tokio::test]
async fn repeated_targets_do_not_reorder() {
    let engine = Engine::with_alphas(&cfg(), constant(0.5));
    let bus = engine.bus.clone();
    let ledger = engine.ledger.clone();

    // ten minutes of ticks, one candle per minute, same score every time
    for minute in 0..10 {
        for sec in [5, 35] {
            let ts = format!("2025-11-06T12:{minute:02}:{sec:02}.000Z");
            bus.publish(topics::RAW_MARKET, raw("A", &ts, 100.0 + minute as f64)).await.unwrap();
        }
    }
    tokio::time::timeout(Duration::from_secs(5), engine.shutdown()).await.unwrap();

    let snap = ledger.snapshot();
    assert_eq!(snap.fills, 1);
    assert!((snap.positions["BTCUSDT"] - 0.005).abs() < 1e-12);
}

#[tokio::test]
async fn interleaved_sources_come_out_ordered() {
    let engine = Engine::with_alphas(&cfg(), constant(0.0));
    let bus = engine.bus.clone();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe_fn(topics::ORDERED_MARKET, "test_order", move |ev| {
        let sink = sink.clone();
        async move {
            if let Event::RawTick(t) = ev {
                sink.lock().unwrap().push(t.timestamp);
            }
            Ok(())
        }
    });

    let arrivals = [
        ("A", "2025-11-06T12:00:00.300Z"),
        ("B", "2025-11-06T12:00:00.100Z"),
        ("A", "2025-11-06T12:00:00.400Z"),
        ("B", "2025-11-06T12:00:00.200Z"),
        ("B", "2025-11-06T12:00:00.050Z"),
    ];
    for (src, ts) in arrivals {
        bus.publish(topics::RAW_MARKET, raw(src, ts, 100.0)).await.unwrap();
    }
    tokio::time::timeout(Duration::from_secs(5), engine.shutdown()).await.unwrap();

    let seen: Vec<i64> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|s| parse_timestamp(s).unwrap().timestamp_millis())
        .collect();
    assert_eq!(seen.len(), arrivals.len());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
}

fn ordered_prices(bus: &alpha_bot_rust::bus::EventBus) -> Arc<Mutex<Vec<f64>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe_fn(topics::ORDERED_MARKET, "test_ordered", move |ev| {
        let sink = sink.clone();
        async move {
            if let Event::RawTick(t) = ev {
                sink.lock().unwrap().push(t.price);
            }
            Ok(())
        }
    });
    seen
}

#[tokio::test]
async fn replay_keeps_the_recorded_order_of_a_late_tick() {
    let dir = std::env::temp_dir().join(format!("alpha_bot_late_tick_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);

    // record: the .100 tick arrives after the .200 tick's window has flushed
    let mut live_cfg = cfg();
    live_cfg.router.buffer_window = Duration::from_millis(20);
    live_cfg.record_dir = Some(dir.clone());
    let live = Engine::with_alphas(&live_cfg, constant(0.0));
    let live_seen = ordered_prices(&live.bus);
    live.bus.publish(topics::RAW_MARKET, raw("A", "2025-11-06T12:00:00.200Z", 2.0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    live.bus.publish(topics::RAW_MARKET, raw("B", "2025-11-06T12:00:00.100Z", 1.0)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), live.shutdown()).await.unwrap();
    let live_seen = live_seen.lock().unwrap().clone();
    assert_eq!(live_seen, vec![2.0, 1.0]);

    // replay with the default topics
    let entries = replay::load_journal(&dir.join("events.jsonl")).await.unwrap();
    let wanted: Vec<String> = replay::DEFAULT_TOPICS.iter().map(|s| s.to_string()).collect();
    let offline = Engine::with_alphas(&cfg(), constant(0.0));
    assert!(replay::bypasses_router(&wanted));
    offline.detach_router();
    assert_eq!(offline.bus.subscriber_count(topics::RAW_MARKET), 0);
    let replay_seen = ordered_prices(&offline.bus);
    let sent = replay::replay(offline.bus.clone(), entries, &wanted, CancellationToken::new()).await;
    assert_eq!(sent, 2);
    assert!(offline.router.symbols().is_empty());
    tokio::time::timeout(Duration::from_secs(5), offline.shutdown()).await.unwrap();

    assert_eq!(*replay_seen.lock().unwrap(), live_seen);
    let _ = std::fs::remove_dir_all(&dir);
}
