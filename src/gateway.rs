// ===============================
// src/gateway.rs (execution simulator)
// ===============================
//
// ORDER -> stash meta by order_id -> simulated latency -> slippage/fee
//       -> FILL (meta re-attached from the stash)
//
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Handler};
use crate::domain::{topics, AttributionMeta, Event, Fill, Order, Side};
use crate::error::{PipelineError, Result};
use crate::metrics::{EXECS, LAT_ORDER_FILL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Paper,
    Backtest,
    Live,
}

impl FromStr for ExecMode {
    type Err = PipelineError;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paper" => Ok(ExecMode::Paper),
            "backtest" => Ok(ExecMode::Backtest),
            "live" => Ok(ExecMode::Live),
            other => Err(PipelineError::Config(format!("EXEC_MODE must be paper|backtest|live, got '{other}'"))),
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecMode::Paper => "paper",
            ExecMode::Backtest => "backtest",
            ExecMode::Live => "live",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExecCfg {
    pub mode: ExecMode,
    pub slippage_bps: f64,
    pub commission_bps: f64,
    /// Inclusive simulated latency range in ms.
    pub latency_ms: (u64, u64),
    pub meta_ttl: Duration,
}

impl Default for ExecCfg {
    fn default() -> Self {
        Self {
            mode: ExecMode::Paper,
            slippage_bps: 3.0,
            commission_bps: 1.0,
            latency_ms: (50, 150),
            meta_ttl: Duration::from_secs(60),
        }
    }
}

/// Slipped price: worse for the taker on both sides.
pub fn fill_price(side: Side, price: f64, slippage_bps: f64) -> f64 {
    let slip = slippage_bps / 10_000.0 * price;
    match side {
        Side::Buy => price + slip,
        Side::Sell => price - slip,
    }
}

pub fn commission(fill_price: f64, qty: f64, commission_bps: f64) -> f64 {
    commission_bps / 10_000.0 * fill_price * qty
}

struct Stashed {
    meta: AttributionMeta,
    at: Instant,
}

pub struct ExecutionSimulator {
    bus: Arc<EventBus>,
    cfg: ExecCfg,
    // order_id -> attribution meta; never logged
    stash: Mutex<HashMap<String, Stashed>>,
}

impl ExecutionSimulator {
    pub fn new(bus: Arc<EventBus>, cfg: ExecCfg) -> Self {
        Self { bus, cfg, stash: Mutex::new(HashMap::new()) }
    }

    pub fn attach(self: &Arc<Self>) {
        self.bus.subscribe(topics::ORDER, "execution_simulator", self.clone());
        if self.cfg.mode == ExecMode::Live {
            warn!("EXEC_MODE=live: no venue adapter wired, orders are simulated");
        }
        info!(
            mode = %self.cfg.mode,
            slippage_bps = self.cfg.slippage_bps,
            commission_bps = self.cfg.commission_bps,
            "execution subscribed to ORDER"
        );
    }

    pub fn mode(&self) -> ExecMode { self.cfg.mode }

    pub fn stashed(&self) -> usize { self.stash.lock().unwrap_or_else(PoisonError::into_inner).len() }

    fn stash_meta(&self, order: &Order) -> Result<()> {
        let mut stash = self.stash.lock().unwrap_or_else(PoisonError::into_inner);
        let ttl = self.cfg.meta_ttl;
        let before = stash.len();
        stash.retain(|_, s| s.at.elapsed() < ttl);
        if stash.len() != before {
            warn!(purged = before - stash.len(), "expired order meta purged");
        }
        if stash.contains_key(&order.order_id) {
            return Err(PipelineError::DuplicateOrder(order.order_id.clone()));
        }
        stash.insert(order.order_id.clone(), Stashed { meta: order.meta.clone(), at: Instant::now() });
        Ok(())
    }

    fn take_meta(&self, order: &Order) -> AttributionMeta {
        let taken = self.stash.lock().unwrap_or_else(PoisonError::into_inner).remove(&order.order_id);
        match taken {
            Some(s) => s.meta,
            None => {
                warn!(order_id = %order.order_id, "order meta expired before fill, using order copy");
                order.meta.clone()
            }
        }
    }

    fn latency(&self) -> Duration {
        // jangan simpan ThreadRng melewati .await
        let (lo, hi) = self.cfg.latency_ms;
        let ms = if hi > lo { rand::thread_rng().gen_range(lo..=hi) } else { lo };
        Duration::from_millis(ms)
    }

    /// Simulate one order to completion and return its fill (not published).
    pub async fn execute(&self, order: &Order) -> Result<Fill> {
        if !(order.quantity.is_finite() && order.quantity > 0.0) {
            return Err(PipelineError::InvalidOrder(format!("{} qty={}", order.order_id, order.quantity)));
        }
        self.stash_meta(order)?;

        let started = Instant::now();
        let wait = self.latency();
        if !wait.is_zero() {
            sleep(wait).await;
        }

        let px = fill_price(order.side, order.price, self.cfg.slippage_bps);
        let fee = commission(px, order.quantity, self.cfg.commission_bps);
        let meta = self.take_meta(order);

        LAT_ORDER_FILL.observe(started.elapsed().as_secs_f64() * 1_000.0);
        Ok(Fill {
            order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            fill_price: px,
            commission: fee,
            ts: Utc::now(),
            meta,
        })
    }
}

#[async_trait]
impl Handler for ExecutionSimulator {
    async fn handle(&self, topic: &str, event: &Event) -> Result<()> {
        let Event::Order(order) = event else {
            return Err(PipelineError::UnexpectedEvent { topic: topic.to_string(), got: event.kind() });
        };
        let mode = self.cfg.mode.to_string();
        EXECS.with_label_values(&["ack", &mode]).inc();

        let fill = self.execute(order).await?;
        debug!(order_id = %fill.order_id, px = fill.fill_price, fee = fill.commission, "simulated fill");
        EXECS.with_label_values(&["filled", &mode]).inc();
        self.bus.publish(topics::FILL, Event::Fill(fill)).await
    }
}
