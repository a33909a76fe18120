// ===============================
// src/positions.rs (Portfolio ledger: cash, inventory, alpha attribution)
// ===============================
//
// SIGNAL (TARGET) -> size against filled + pending qty -> ORDER
// FILL            -> cash / position / mark / per-alpha virtual position
//                 -> PORTFOLIO_MARK + ALPHA_PNL_TICK (best effort)
//
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Handler};
use crate::domain::{
    topics, AlphaPnl, EquityMark, Event, Fill, Order, Signal, GENERIC_ALPHA, TARGET_DIRECTION,
};
use crate::error::{PipelineError, Result};
use crate::metrics::{ALPHA_PNL, CASH, EQUITY, ORDERS, POSITION};
use crate::risk::{self, SizingLimits};

#[derive(Debug, Clone)]
pub struct LedgerCfg {
    pub initial_cash: f64,
    pub limits: SizingLimits,
}

impl Default for LedgerCfg {
    fn default() -> Self { Self { initial_cash: 100_000.0, limits: SizingLimits::default() } }
}

/// Point-in-time view of the ledger, published on a watch channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSnapshot {
    pub cash: f64,
    pub unrealized: f64,
    pub equity: f64,
    pub positions: BTreeMap<String, f64>,
    pub last_prices: BTreeMap<String, f64>,
    pub alpha_pnl: BTreeMap<String, f64>,
    pub fills: u64,
}

#[derive(Debug, Default)]
struct LedgerState {
    cash: f64,
    positions: HashMap<String, f64>,
    last_prices: HashMap<String, f64>,
    // order_id -> (symbol, signed qty) for orders not yet filled
    pending: HashMap<String, (String, f64)>,
    // alpha -> symbol -> virtual qty
    alpha_pos: BTreeMap<String, HashMap<String, f64>>,
    unrealized: f64,
    total_equity: f64,
    fills: u64,
}

impl LedgerState {
    fn effective_position(&self, symbol: &str) -> f64 {
        let filled = self.positions.get(symbol).copied().unwrap_or(0.0);
        let pending: f64 = self.pending.values().filter(|(s, _)| s == symbol).map(|(_, q)| q).sum();
        filled + pending
    }

    fn mark(&mut self) {
        self.unrealized = self
            .positions
            .iter()
            .map(|(s, q)| q * self.last_prices.get(s).copied().unwrap_or(0.0))
            .sum();
        self.total_equity = self.cash + self.unrealized;
    }

    fn alpha_pnl(&self) -> BTreeMap<String, f64> {
        self.alpha_pos
            .iter()
            .map(|(alpha, by_sym)| {
                let v = by_sym
                    .iter()
                    .map(|(s, q)| q * self.last_prices.get(s).copied().unwrap_or(0.0))
                    .sum();
                (alpha.clone(), v)
            })
            .collect()
    }

    fn apply_fill(&mut self, f: &Fill) {
        let signed = f.signed_qty();
        self.pending.remove(&f.order_id);

        *self.positions.entry(f.symbol.clone()).or_insert(0.0) += signed;
        self.last_prices.insert(f.symbol.clone(), f.fill_price);
        // buy: -(value + fee), sell: +(value - fee)
        self.cash += -signed * f.fill_price - f.commission;

        if f.meta.scores.is_empty() {
            *self.alpha_pos.entry(GENERIC_ALPHA.to_string()).or_default().entry(f.symbol.clone()).or_insert(0.0) +=
                signed;
        } else {
            for (alpha, weight) in &f.meta.scores {
                *self.alpha_pos.entry(alpha.clone()).or_default().entry(f.symbol.clone()).or_insert(0.0) +=
                    weight * signed;
            }
        }
        self.fills += 1;
        self.mark();
    }

    fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            cash: self.cash,
            unrealized: self.unrealized,
            equity: self.total_equity,
            positions: self.positions.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            last_prices: self.last_prices.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            alpha_pnl: self.alpha_pnl(),
            fills: self.fills,
        }
    }
}

pub struct PortfolioLedger {
    bus: Arc<EventBus>,
    cfg: LedgerCfg,
    state: Mutex<LedgerState>,
    snap_tx: watch::Sender<LedgerSnapshot>,
}

impl PortfolioLedger {
    pub fn new(bus: Arc<EventBus>, cfg: LedgerCfg) -> Self {
        let mut state = LedgerState { cash: cfg.initial_cash, ..Default::default() };
        state.mark();
        let (snap_tx, _) = watch::channel(state.snapshot());
        Self { bus, cfg, state: Mutex::new(state), snap_tx }
    }

    pub fn attach(self: &Arc<Self>) {
        self.bus.subscribe(topics::SIGNAL, "portfolio.on_signal", self.clone());
        self.bus.subscribe(topics::FILL, "portfolio.on_fill", self.clone());
        info!(cash = self.cfg.initial_cash, max_units = self.cfg.limits.default_max_units, "ledger subscribed to SIGNAL and FILL");
    }

    pub fn snapshot(&self) -> LedgerSnapshot { self.lock().snapshot() }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<LedgerSnapshot> { self.snap_tx.subscribe() }

    pub fn position(&self, symbol: &str) -> f64 { self.lock().positions.get(symbol).copied().unwrap_or(0.0) }

    pub fn pending_orders(&self) -> usize { self.lock().pending.len() }

    /// cash + sum(position * last price), recomputed without the running totals.
    pub fn equity_from_scratch(&self) -> f64 {
        let st = self.lock();
        let mut total = st.cash;
        for (s, q) in &st.positions {
            total += q * st.last_prices.get(s).copied().unwrap_or(0.0);
        }
        total
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Size the signal and reserve its quantity as pending. Returns the order
    /// to publish, if any.
    pub fn prepare_order(&self, sig: &Signal) -> Result<Option<Order>> {
        if sig.direction != TARGET_DIRECTION {
            debug!(direction = %sig.direction, "non-TARGET signal ignored");
            return Ok(None);
        }
        let mut sig = sig.clone();
        sig.symbol = sig.symbol.trim().to_ascii_uppercase();
        if sig.meta.scores.is_empty() {
            sig.meta.alpha = GENERIC_ALPHA.to_string();
            sig.meta.scores.insert(GENERIC_ALPHA.to_string(), sig.score);
        }

        let mut st = self.lock();
        if sig.price.is_finite() && sig.price > 0.0 {
            st.last_prices.insert(sig.symbol.clone(), sig.price);
            st.mark();
        }
        let current = st.effective_position(&sig.symbol);
        let Some(order) = risk::size_order(&sig, current, &self.cfg.limits, risk::next_order_id)? else {
            debug!(symbol = %sig.symbol, score = sig.score, current, "delta inside noise floor");
            return Ok(None);
        };
        st.pending.insert(order.order_id.clone(), (order.symbol.clone(), order.side.sign() * order.quantity));
        Ok(Some(order))
    }

    pub async fn on_signal(&self, sig: &Signal) -> Result<()> {
        let order = match self.prepare_order(sig) {
            Ok(Some(o)) => o,
            Ok(None) => return Ok(()),
            Err(e) => {
                error!(symbol = %sig.symbol, error = %e, "ledger failed to size signal");
                return Err(e);
            }
        };
        ORDERS.inc();
        debug!(order_id = %order.order_id, symbol = %order.symbol, side = order.side.as_str(), qty = order.quantity, "order sized");

        let order_id = order.order_id.clone();
        if let Err(e) = self.bus.publish(topics::ORDER, Event::Order(order)).await {
            // roll back the reservation only if the fill never landed
            self.lock().pending.remove(&order_id);
            error!(%order_id, error = %e, "order dispatch failed");
            return Err(e);
        }
        Ok(())
    }

    /// Apply the fill and return the fresh snapshot.
    pub fn apply_fill(&self, fill: &Fill) -> Result<LedgerSnapshot> {
        if !(fill.quantity.is_finite() && fill.quantity > 0.0 && fill.fill_price.is_finite()) {
            return Err(PipelineError::InvalidFill(format!("{} qty={} px={}", fill.order_id, fill.quantity, fill.fill_price)));
        }
        let snap = {
            let mut st = self.lock();
            st.apply_fill(fill);
            st.snapshot()
        };

        EQUITY.set(snap.equity);
        CASH.set(snap.cash);
        for (s, q) in &snap.positions {
            POSITION.with_label_values(&[s]).set(*q);
        }
        for (a, v) in &snap.alpha_pnl {
            ALPHA_PNL.with_label_values(&[a]).set(*v);
        }
        self.snap_tx.send_replace(snap.clone());
        Ok(snap)
    }

    pub async fn on_fill(&self, fill: &Fill) -> Result<()> {
        let snap = match self.apply_fill(fill) {
            Ok(s) => s,
            Err(e) => {
                error!(order_id = %fill.order_id, error = %e, "ledger failed to apply fill");
                return Err(e);
            }
        };
        debug!(
            order_id = %fill.order_id,
            equity = snap.equity,
            cash = snap.cash,
            unrealized = snap.unrealized,
            "fill applied"
        );

        let ts = Utc::now();
        let mark = EquityMark { ts, equity: snap.equity, cash: snap.cash, unrealized: snap.unrealized };
        if let Err(e) = self.bus.publish(topics::PORTFOLIO_MARK, Event::Mark(mark)).await {
            warn!(error = %e, "PORTFOLIO_MARK listener failed");
        }
        for (alpha, pnl) in snap.alpha_pnl {
            let ev = Event::AlphaPnl(AlphaPnl { alpha, ts, pnl });
            if let Err(e) = self.bus.publish(topics::ALPHA_PNL_TICK, ev).await {
                warn!(error = %e, "ALPHA_PNL_TICK listener failed");
            }
        }
        Ok(())
    }

    /// Periodic equity log until cancelled.
    pub fn spawn_reporter(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.subscribe_snapshots();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let s = rx.borrow_and_update().clone();
                        info!(
                            equity = %format!("{:.2}", s.equity),
                            cash = %format!("{:.2}", s.cash),
                            unrealized = %format!("{:.2}", s.unrealized),
                            fills = s.fills,
                            "portfolio"
                        );
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Handler for PortfolioLedger {
    async fn handle(&self, topic: &str, event: &Event) -> Result<()> {
        match event {
            Event::Signal(sig) => self.on_signal(sig).await,
            Event::Fill(fill) => self.on_fill(fill).await,
            other => Err(PipelineError::UnexpectedEvent { topic: topic.to_string(), got: other.kind() }),
        }
    }
}
