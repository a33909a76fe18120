// ===============================
// src/strategy.rs
// ===============================
//
// Alpha scorers. Every alpha implements one capability:
//   score(candle) -> f64 in [-1, 1]   (0 = no conviction)
//
// Five alphas are provided:
// 1) MeanReversion  -> z-score of close vs rolling mean, sign flipped
// 2) Momentum       -> fast EMA vs slow EMA spread
// 3) AtrGaussian    -> close vs Gaussian-smoothed close, in ATR units
// 4) MacdFibonacci  -> MACD histogram
// 5) GenericAlpha   -> momentum / z-score / volatility composite
//
// All of them smooth the raw score against the previous output and apply a
// deadband so positions do not flip on noise. State lives in the instance.
//
use std::collections::VecDeque;
use std::sync::Arc;

use crate::domain::Candle;

pub trait Alpha: Send {
    fn name(&self) -> &str;
    fn score(&mut self, candle: &Candle) -> f64;
}

pub type AlphaFactory = Arc<dyn Fn() -> Box<dyn Alpha> + Send + Sync>;

fn smooth(alpha: f64, raw: f64, prev: &mut f64) -> f64 {
    let s = alpha * raw + (1.0 - alpha) * *prev;
    *prev = s;
    s
}

fn deadband(score: f64, band: f64) -> f64 {
    if score.abs() < band { 0.0 } else { score }
}

fn push_capped(buf: &mut VecDeque<f64>, cap: usize, v: f64) {
    if buf.len() == cap {
        buf.pop_front();
    }
    buf.push_back(v);
}

/// Mean and population std of the last `n` values.
fn mean_std<'a>(values: impl Iterator<Item = &'a f64> + Clone) -> (f64, f64) {
    let n = values.clone().count().max(1) as f64;
    let mean = values.clone().sum::<f64>() / n;
    let var = values.map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

// ---- Registry ----
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlphaKind {
    MeanReversion,
    Momentum,
    AtrGaussian,
    MacdFibonacci,
    GenericAlpha,
}

impl AlphaKind {
    pub const ALL: [AlphaKind; 5] = [
        AlphaKind::MeanReversion,
        AlphaKind::Momentum,
        AlphaKind::AtrGaussian,
        AlphaKind::MacdFibonacci,
        AlphaKind::GenericAlpha,
    ];

    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "meanreversion" | "mean_reversion" | "mr" => Some(AlphaKind::MeanReversion),
            "momentum" | "mom" => Some(AlphaKind::Momentum),
            "atrgaussian" | "atr_gaussian" | "atrgauss" => Some(AlphaKind::AtrGaussian),
            "macdfibonacci" | "macd_fibonacci" | "macdfib" => Some(AlphaKind::MacdFibonacci),
            "genericalpha" | "generic_alpha" | "generic" => Some(AlphaKind::GenericAlpha),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AlphaKind::MeanReversion => "meanreversion",
            AlphaKind::Momentum => "momentum",
            AlphaKind::AtrGaussian => "atrgaussian",
            AlphaKind::MacdFibonacci => "macdfibonacci",
            AlphaKind::GenericAlpha => "genericalpha",
        }
    }

    pub fn build(&self) -> Box<dyn Alpha> {
        match self {
            AlphaKind::MeanReversion => Box::new(MeanReversion::default()),
            AlphaKind::Momentum => Box::new(Momentum::default()),
            AlphaKind::AtrGaussian => Box::new(AtrGaussian::default()),
            AlphaKind::MacdFibonacci => Box::new(MacdFibonacci::default()),
            AlphaKind::GenericAlpha => Box::new(GenericAlpha::default()),
        }
    }

    pub fn factory(self) -> AlphaFactory {
        Arc::new(move || self.build())
    }
}

// -----------------------------------------------------------------------------
// 1) MEAN-REVERSION
//    z = (close - mean_w) / std_w ; raw = tanh(-z / entry_z)
//    Price far above its mean -> short bias, far below -> long bias.
// -----------------------------------------------------------------------------
pub struct MeanReversion {
    window: usize,
    entry_z: f64,
    max_history: usize,
    smooth_alpha: f64,
    prices: VecDeque<f64>,
    prev_score: f64,
}

impl MeanReversion {
    pub fn new(window: usize, entry_z: f64, max_history: usize, smooth_alpha: f64) -> Self {
        Self {
            window,
            entry_z,
            max_history: max_history.max(window),
            smooth_alpha,
            prices: VecDeque::with_capacity(max_history),
            prev_score: 0.0,
        }
    }
}

impl Default for MeanReversion {
    fn default() -> Self { Self::new(20, 2.0, 300, 0.25) }
}

impl Alpha for MeanReversion {
    fn name(&self) -> &str { "meanreversion" }

    fn score(&mut self, candle: &Candle) -> f64 {
        let close = candle.close;
        push_capped(&mut self.prices, self.max_history, close);
        if self.prices.len() < self.window {
            return 0.0;
        }
        let recent = self.prices.iter().skip(self.prices.len() - self.window);
        let (mean, std) = mean_std(recent);
        let z = (close - mean) / (std + 1e-9);
        let raw = (-z / self.entry_z).tanh();
        deadband(smooth(self.smooth_alpha, raw, &mut self.prev_score), 0.10)
    }
}

// -----------------------------------------------------------------------------
// 2) MOMENTUM (EMA crossover)
//    spread = ema_fast - ema_slow ; raw = tanh(4 * spread)
//    First candle only seeds the EMAs.
// -----------------------------------------------------------------------------
pub struct Momentum {
    k_short: f64,
    k_long: f64,
    smooth_alpha: f64,
    ema: Option<(f64, f64)>,
    prev_score: f64,
}

impl Momentum {
    pub fn new(short_window: usize, long_window: usize, smooth_alpha: f64) -> Self {
        Self {
            k_short: 2.0 / (short_window as f64 + 1.0),
            k_long: 2.0 / (long_window as f64 + 1.0),
            smooth_alpha,
            ema: None,
            prev_score: 0.0,
        }
    }
}

impl Default for Momentum {
    fn default() -> Self { Self::new(5, 12, 0.25) }
}

impl Alpha for Momentum {
    fn name(&self) -> &str { "momentum" }

    fn score(&mut self, candle: &Candle) -> f64 {
        let close = candle.close;
        let Some((mut short, mut long)) = self.ema else {
            self.ema = Some((close, close));
            return 0.0;
        };
        short += self.k_short * (close - short);
        long += self.k_long * (close - long);
        self.ema = Some((short, long));

        let raw = ((short - long) * 4.0).tanh();
        deadband(smooth(self.smooth_alpha, raw, &mut self.prev_score), 0.10)
    }
}

// -----------------------------------------------------------------------------
// 3) ATR + GAUSSIAN FILTER
//    smooth = gaussian(close, sigma)[last] (reflect boundary, radius 4 sigma)
//    raw = clip(((close - smooth) / atr) / 2, -1, 1)
// -----------------------------------------------------------------------------
pub struct AtrGaussian {
    sigma: f64,
    atr_window: usize,
    max_history: usize,
    high: VecDeque<f64>,
    low: VecDeque<f64>,
    close: VecDeque<f64>,
    prev_score: f64,
}

impl AtrGaussian {
    pub fn new(sigma: f64, atr_window: usize, max_history: usize) -> Self {
        let max_history = max_history.max(atr_window + 5);
        Self {
            sigma,
            atr_window,
            max_history,
            high: VecDeque::with_capacity(max_history),
            low: VecDeque::with_capacity(max_history),
            close: VecDeque::with_capacity(max_history),
            prev_score: 0.0,
        }
    }

    fn atr(&self) -> Option<f64> {
        let n = self.close.len();
        if n < self.atr_window + 1 {
            return None;
        }
        let mut sum = 0.0;
        for i in (n - self.atr_window)..n {
            let prev_close = if i == 0 { self.close[0] } else { self.close[i - 1] };
            let (h, l) = (self.high[i], self.low[i]);
            sum += (h - l).max((h - prev_close).abs()).max((l - prev_close).abs());
        }
        Some(sum / self.atr_window as f64)
    }

    /// Gaussian-smoothed value at the last index.
    fn gaussian_last(&self) -> f64 {
        let n = self.close.len() as i64;
        let radius = (4.0 * self.sigma + 0.5) as i64;
        let last = n - 1;
        let mut acc = 0.0;
        let mut wsum = 0.0;
        for k in -radius..=radius {
            let w = (-0.5 * (k as f64 / self.sigma).powi(2)).exp();
            acc += w * self.close[reflect(last + k, n)];
            wsum += w;
        }
        acc / wsum
    }
}

/// Half-sample symmetric reflection: (d c b a | a b c d | d c b a).
fn reflect(mut i: i64, n: i64) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * n;
    i = i.rem_euclid(period);
    if i >= n {
        i = period - 1 - i;
    }
    i as usize
}

impl Default for AtrGaussian {
    fn default() -> Self { Self::new(2.0, 14, 200) }
}

impl Alpha for AtrGaussian {
    fn name(&self) -> &str { "atrgaussian" }

    fn score(&mut self, candle: &Candle) -> f64 {
        push_capped(&mut self.high, self.max_history, candle.high);
        push_capped(&mut self.low, self.max_history, candle.low);
        push_capped(&mut self.close, self.max_history, candle.close);

        if self.close.len() < self.atr_window + 5 {
            return 0.0;
        }
        let smooth_close = self.gaussian_last();
        let atr = match self.atr() {
            Some(a) if a > 0.0 => a,
            _ => 1e-9,
        };
        let raw = (((candle.close - smooth_close) / atr) / 2.0).clamp(-1.0, 1.0);
        deadband(smooth(0.2, raw, &mut self.prev_score), 0.2)
    }
}

// -----------------------------------------------------------------------------
// 4) MACD + FIBONACCI MOMENTUM
//    hist = (ema_fast - ema_slow) - ema_signal ; raw = tanh(sensitivity * hist)
// -----------------------------------------------------------------------------
pub struct MacdFibonacci {
    k_fast: f64,
    k_slow: f64,
    k_signal: f64,
    sensitivity: f64,
    smooth_alpha: f64,
    // (fast, slow, signal)
    ema: Option<(f64, f64, f64)>,
    prev_score: f64,
}

impl MacdFibonacci {
    pub fn new(fast: usize, slow: usize, signal: usize, sensitivity: f64, smooth_alpha: f64) -> Self {
        Self {
            k_fast: 2.0 / (fast as f64 + 1.0),
            k_slow: 2.0 / (slow as f64 + 1.0),
            k_signal: 2.0 / (signal as f64 + 1.0),
            sensitivity,
            smooth_alpha,
            ema: None,
            prev_score: 0.0,
        }
    }
}

impl Default for MacdFibonacci {
    fn default() -> Self { Self::new(12, 26, 9, 4.0, 0.25) }
}

impl Alpha for MacdFibonacci {
    fn name(&self) -> &str { "macdfibonacci" }

    fn score(&mut self, candle: &Candle) -> f64 {
        let close = candle.close;
        let Some((mut fast, mut slow, mut signal)) = self.ema else {
            self.ema = Some((close, close, 0.0));
            return 0.0;
        };
        fast += self.k_fast * (close - fast);
        slow += self.k_slow * (close - slow);
        let macd = fast - slow;
        signal += self.k_signal * (macd - signal);
        self.ema = Some((fast, slow, signal));

        let raw = ((macd - signal) * self.sensitivity).tanh();
        deadband(smooth(self.smooth_alpha, raw, &mut self.prev_score), 0.10)
    }
}

// -----------------------------------------------------------------------------
// 5) GENERIC ALPHA (multi-factor)
//    raw = 0.5 * momentum - 0.3 * zscore - 0.2 * vol(diffs) ; score = tanh(raw)
// -----------------------------------------------------------------------------
pub struct GenericAlpha {
    lookback: usize,
    max_history: usize,
    closes: VecDeque<f64>,
    prev_score: f64,
}

impl GenericAlpha {
    pub fn new(lookback: usize, max_history: usize) -> Self {
        let lookback = lookback.max(2);
        Self { lookback, max_history: max_history.max(lookback), closes: VecDeque::new(), prev_score: 0.0 }
    }
}

impl Default for GenericAlpha {
    fn default() -> Self { Self::new(20, 300) }
}

impl Alpha for GenericAlpha {
    fn name(&self) -> &str { "genericalpha" }

    fn score(&mut self, candle: &Candle) -> f64 {
        push_capped(&mut self.closes, self.max_history, candle.close);
        if self.closes.len() < self.lookback {
            return 0.0;
        }
        let recent: Vec<f64> = self.closes.iter().skip(self.closes.len() - self.lookback).copied().collect();
        let first = recent[0];
        let last = recent[recent.len() - 1];

        let momentum = (last - first) / (first.abs() + 1e-9);
        let (mean, std) = mean_std(recent.iter());
        let zscore = (last - mean) / (std + 1e-9);
        let diffs: Vec<f64> = recent.windows(2).map(|w| w[1] - w[0]).collect();
        let (_, vol) = mean_std(diffs.iter());

        let raw = (0.5 * momentum - 0.3 * zscore - 0.2 * (vol + 1e-9)).tanh();
        deadband(smooth(0.25, raw, &mut self.prev_score), 0.15)
    }
}
