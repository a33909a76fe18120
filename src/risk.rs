// ===============================
// src/risk.rs (target sizing: Signal -> Order)
// ===============================
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap as HashMap;
use chrono::Utc;
use thiserror::Error;

use crate::domain::{Order, Side, Signal};

/// Absolute floor under which a position delta is never traded.
pub const MIN_TRADE_UNITS: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct SizingLimits {
    pub default_max_units: f64,
    pub max_units_by_symbol: HashMap<String, f64>,
    pub noise_threshold: f64,
}

impl Default for SizingLimits {
    fn default() -> Self {
        Self { default_max_units: 0.01, max_units_by_symbol: HashMap::new(), noise_threshold: 4e-4 }
    }
}

impl SizingLimits {
    pub fn max_units(&self, symbol: &str) -> f64 {
        self.max_units_by_symbol.get(symbol).copied().unwrap_or(self.default_max_units)
    }

    /// Smallest |delta| that produces an order.
    pub fn min_delta(&self) -> f64 { self.noise_threshold.max(MIN_TRADE_UNITS) }
}

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("score is not finite")]
    BadScore,
    #[error("price out of band: {0}")]
    PriceBand(f64),
    #[error("no capacity configured for {0}")]
    NoCapacity(String),
}

static ORDER_SEQ: AtomicU64 = AtomicU64::new(0);

/// `ORD-<epoch ms>-<seq>`; unique within the process.
pub fn next_order_id() -> String {
    let seq = ORDER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("ORD-{}-{}", Utc::now().timestamp_millis(), seq)
}

/// Target position for a normalized score.
pub fn target_units(score: f64, max_units: f64) -> f64 { score.clamp(-1.0, 1.0) * max_units }

/// Size a TARGET signal against the current effective position (filled plus
/// pending). `Ok(None)` means the delta is inside the noise floor.
pub fn size_order(
    sig: &Signal,
    current: f64,
    lim: &SizingLimits,
    order_id: impl FnOnce() -> String,
) -> Result<Option<Order>, RiskError> {
    if !sig.score.is_finite() {
        return Err(RiskError::BadScore);
    }
    if !sig.price.is_finite() || sig.price <= 0.0 {
        return Err(RiskError::PriceBand(sig.price));
    }
    let max_units = lim.max_units(&sig.symbol);
    if !(max_units > 0.0) {
        return Err(RiskError::NoCapacity(sig.symbol.clone()));
    }

    let target = target_units(sig.score, max_units);
    let delta = target - current;
    if delta.abs() < lim.min_delta() {
        return Ok(None);
    }

    Ok(Some(Order {
        order_id: order_id(),
        symbol: sig.symbol.clone(),
        side: if delta > 0.0 { Side::Buy } else { Side::Sell },
        quantity: delta.abs(),
        price: sig.price,
        meta: sig.meta.clone(),
    }))
}
