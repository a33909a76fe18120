// ===============================
// src/blender.rs (multi-strategy manager)
// ===============================
//
// MARKET_SNAPSHOT (closed candle) -> every alpha scores it -> weighted sum
// -> conviction threshold -> clip -> anti-spam -> SIGNAL {direction: TARGET}.
//
// Alpha instances are created per symbol from the registry factories, so
// rolling state of one symbol never leaks into another.
//
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Handler};
use crate::domain::{topics, AttributionMeta, Candle, Event, Signal};
use crate::error::{PipelineError, Result};
use crate::metrics::{ALPHA_EXPOSURE, SIGNALS};
use crate::strategy::{Alpha, AlphaFactory, AlphaKind};

#[derive(Debug, Clone)]
pub struct BlenderCfg {
    /// alpha name -> weight; `None` means equal weight.
    pub weights: Option<BTreeMap<String, f64>>,
    pub threshold: f64,
    pub publish_delta: f64,
    /// false = individual mode: the blender never subscribes and each alpha
    /// publishes its own signal through [`IndividualAlpha`].
    pub enabled: bool,
    /// Only score candles of this timeframe when set.
    pub timeframe: Option<String>,
}

impl Default for BlenderCfg {
    fn default() -> Self {
        Self { weights: None, threshold: 0.05, publish_delta: 0.05, enabled: true, timeframe: None }
    }
}

/// Informational per-alpha virtual exposure: weight * score, marked at the
/// last seen price. Does not feed back into the blended score.
#[derive(Debug, Default, Clone)]
pub struct AlphaAttribution {
    exposure: BTreeMap<String, HashMap<String, f64>>,
    last_price: HashMap<String, f64>,
}

impl AlphaAttribution {
    pub fn update(&mut self, symbol: &str, price: f64, per_alpha: &BTreeMap<String, f64>) {
        self.last_price.insert(symbol.to_string(), price);
        for (alpha, units) in per_alpha {
            self.exposure.entry(alpha.clone()).or_default().insert(symbol.to_string(), *units);
        }
    }

    pub fn exposure(&self, alpha: &str, symbol: &str) -> f64 {
        self.exposure.get(alpha).and_then(|m| m.get(symbol)).copied().unwrap_or(0.0)
    }

    /// Per-alpha exposure times last price, summed over symbols.
    pub fn notional(&self) -> BTreeMap<String, f64> {
        self.exposure
            .iter()
            .map(|(alpha, by_sym)| {
                let v = by_sym
                    .iter()
                    .map(|(s, q)| q * self.last_price.get(s).copied().unwrap_or(0.0))
                    .sum();
                (alpha.clone(), v)
            })
            .collect()
    }
}

struct BlendState {
    alphas: HashMap<String, Vec<Box<dyn Alpha>>>,
    last_published: HashMap<String, f64>,
    attribution: AlphaAttribution,
}

pub struct StrategyBlender {
    bus: Arc<EventBus>,
    cfg: BlenderCfg,
    registry: Vec<(String, AlphaFactory)>,
    weights: BTreeMap<String, f64>,
    state: Mutex<BlendState>,
}

impl StrategyBlender {
    pub fn new(bus: Arc<EventBus>, kinds: &[AlphaKind], cfg: BlenderCfg) -> Self {
        let registry = kinds.iter().map(|k| (k.name().to_string(), k.factory())).collect();
        Self::with_factories(bus, registry, cfg)
    }

    /// Any [`Alpha`] can be plugged in through a named factory.
    pub fn with_factories(bus: Arc<EventBus>, registry: Vec<(String, AlphaFactory)>, cfg: BlenderCfg) -> Self {
        let weights = match &cfg.weights {
            Some(w) => registry.iter().map(|(n, _)| (n.clone(), w.get(n).copied().unwrap_or(0.0))).collect(),
            None => {
                let eq = if registry.is_empty() { 0.0 } else { 1.0 / registry.len() as f64 };
                registry.iter().map(|(n, _)| (n.clone(), eq)).collect()
            }
        };
        if let Some(w) = &cfg.weights {
            for name in w.keys() {
                if !registry.iter().any(|(n, _)| n == name) {
                    warn!(alpha = %name, "weight given for unknown alpha, ignored");
                }
            }
        }
        Self {
            bus,
            cfg,
            registry,
            weights,
            state: Mutex::new(BlendState {
                alphas: HashMap::new(),
                last_published: HashMap::new(),
                attribution: AlphaAttribution::default(),
            }),
        }
    }

    pub fn weights(&self) -> &BTreeMap<String, f64> { &self.weights }

    pub fn attach(self: &Arc<Self>) {
        if !self.cfg.enabled {
            info!("blender disabled (individual mode), not subscribing");
            return;
        }
        self.bus.subscribe(topics::MARKET_SNAPSHOT, "strategy_blender", self.clone());
        info!(weights = ?self.weights, threshold = self.cfg.threshold, "blender subscribed to MARKET_SNAPSHOT");
    }

    pub fn notional_exposure(&self) -> BTreeMap<String, f64> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).attribution.notional()
    }

    /// Score, combine, threshold and de-duplicate. Returns the signal to
    /// publish, if any.
    pub fn blend(&self, candle: &Candle) -> Option<Signal> {
        if let Some(tf) = &self.cfg.timeframe {
            if &candle.timeframe != tf {
                return None;
            }
        }
        let symbol = candle.symbol.to_ascii_uppercase();
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let registry = &self.registry;
        let alphas = st
            .alphas
            .entry(symbol.clone())
            .or_insert_with(|| registry.iter().map(|(_, f)| f()).collect());

        let mut scores: BTreeMap<String, f64> = BTreeMap::new();
        for ((name, _), alpha) in registry.iter().zip(alphas.iter_mut()) {
            let s = alpha.score(candle);
            let s = if s.is_finite() { s.clamp(-1.0, 1.0) } else { 0.0 };
            scores.insert(name.clone(), s);
        }

        let weighted: f64 = scores.iter().map(|(n, s)| self.weights.get(n).copied().unwrap_or(0.0) * s).sum();
        let mut combined = if weighted.abs() < self.cfg.threshold { 0.0 } else { weighted };
        combined = combined.clamp(-1.0, 1.0);

        let exposure: BTreeMap<String, f64> = scores
            .iter()
            .map(|(n, s)| (n.clone(), self.weights.get(n).copied().unwrap_or(0.0) * s))
            .collect();
        st.attribution.update(&symbol, candle.close, &exposure);
        let notional = st.attribution.notional();
        for (alpha, v) in &notional {
            ALPHA_EXPOSURE.with_label_values(&[alpha]).set(*v);
        }
        debug!(%symbol, ?scores, combined, ?notional, "alpha scores");

        let last = st.last_published.get(&symbol).copied().unwrap_or(0.0);
        if (combined - last).abs() < self.cfg.publish_delta {
            return None;
        }
        st.last_published.insert(symbol.clone(), combined);

        let meta = AttributionMeta { alpha: "multi".to_string(), weights: self.weights.clone(), scores };
        Some(Signal::target(symbol, combined, candle.close, meta))
    }
}

#[async_trait]
impl Handler for StrategyBlender {
    async fn handle(&self, topic: &str, event: &Event) -> Result<()> {
        let Event::Candle(candle) = event else {
            return Err(PipelineError::UnexpectedEvent { topic: topic.to_string(), got: event.kind() });
        };
        if let Some(sig) = self.blend(candle) {
            SIGNALS.with_label_values(&[&sig.symbol]).inc();
            debug!(symbol = %sig.symbol, score = sig.score, px = sig.price, "TARGET signal");
            self.bus.publish(topics::SIGNAL, Event::Signal(sig)).await?;
        }
        Ok(())
    }
}

// ---- Individual mode ----
//
// One handler per alpha, each publishing its own raw score as a TARGET
// signal on every candle: no weights, no threshold, no anti-spam.

pub struct IndividualAlpha {
    bus: Arc<EventBus>,
    name: String,
    factory: AlphaFactory,
    timeframe: Option<String>,
    // symbol -> alpha instance
    alphas: Mutex<HashMap<String, Box<dyn Alpha>>>,
}

impl IndividualAlpha {
    pub fn new(bus: Arc<EventBus>, name: impl Into<String>, factory: AlphaFactory, timeframe: Option<String>) -> Self {
        Self { bus, name: name.into(), factory, timeframe, alphas: Mutex::new(HashMap::new()) }
    }

    /// One subscribed handler per registry entry.
    pub fn attach_all(
        bus: &Arc<EventBus>,
        registry: &[(String, AlphaFactory)],
        timeframe: Option<String>,
    ) -> Vec<Arc<IndividualAlpha>> {
        registry
            .iter()
            .map(|(name, factory)| {
                let solo = Arc::new(IndividualAlpha::new(bus.clone(), name.clone(), factory.clone(), timeframe.clone()));
                bus.subscribe(topics::MARKET_SNAPSHOT, &format!("alpha_{name}"), solo.clone());
                info!(alpha = %name, "individual alpha subscribed to MARKET_SNAPSHOT");
                solo
            })
            .collect()
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn signal(&self, candle: &Candle) -> Option<Signal> {
        if let Some(tf) = &self.timeframe {
            if &candle.timeframe != tf {
                return None;
            }
        }
        let symbol = candle.symbol.to_ascii_uppercase();
        let s = {
            let mut alphas = self.alphas.lock().unwrap_or_else(PoisonError::into_inner);
            let alpha = alphas.entry(symbol.clone()).or_insert_with(|| (self.factory)());
            alpha.score(candle)
        };
        let s = if s.is_finite() { s.clamp(-1.0, 1.0) } else { 0.0 };

        let mut meta = AttributionMeta { alpha: self.name.clone(), ..Default::default() };
        meta.weights.insert(self.name.clone(), 1.0);
        meta.scores.insert(self.name.clone(), s);
        Some(Signal::target(symbol, s, candle.close, meta))
    }
}

#[async_trait]
impl Handler for IndividualAlpha {
    async fn handle(&self, topic: &str, event: &Event) -> Result<()> {
        let Event::Candle(candle) = event else {
            return Err(PipelineError::UnexpectedEvent { topic: topic.to_string(), got: event.kind() });
        };
        if let Some(sig) = self.signal(candle) {
            SIGNALS.with_label_values(&[&sig.symbol]).inc();
            debug!(alpha = %self.name, symbol = %sig.symbol, score = sig.score, "individual TARGET signal");
            self.bus.publish(topics::SIGNAL, Event::Signal(sig)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::tests::candle;

    struct Fixed(&'static str, f64);
    impl Alpha for Fixed {
        fn name(&self) -> &str { self.0 }
        fn score(&mut self, _c: &Candle) -> f64 { self.1 }
    }

    /// Replays a scripted list of scores, one per candle.
    struct Scripted(Vec<f64>, usize);
    impl Alpha for Scripted {
        fn name(&self) -> &str { "scripted" }
        fn score(&mut self, _c: &Candle) -> f64 {
            let s = self.0.get(self.1).copied().unwrap_or(0.0);
            self.1 += 1;
            s
        }
    }

    fn fixed(name: &'static str, s: f64) -> (String, AlphaFactory) {
        let f: AlphaFactory = Arc::new(move || Box::new(Fixed(name, s)) as Box<dyn Alpha>);
        (name.to_string(), f)
    }

    fn scripted(scores: Vec<f64>) -> (String, AlphaFactory) {
        let f: AlphaFactory = Arc::new(move || Box::new(Scripted(scores.clone(), 0)) as Box<dyn Alpha>);
        ("scripted".to_string(), f)
    }

    fn blender(reg: Vec<(String, AlphaFactory)>, cfg: BlenderCfg) -> StrategyBlender {
        StrategyBlender::with_factories(Arc::new(EventBus::new()), reg, cfg)
    }

    #[test]
    fn equal_weights_by_default() {
        let b = blender(vec![fixed("a", 1.0), fixed("b", 0.5)], BlenderCfg::default());
        let sig = b.blend(&candle(100.0)).unwrap();
        assert!((sig.score - 0.75).abs() < 1e-12);
        assert_eq!(sig.direction, "TARGET");
        assert_eq!(sig.price, 100.0);
        assert_eq!(sig.meta.scores["a"], 1.0);
        assert_eq!(sig.meta.weights["b"], 0.5);
        assert_eq!(sig.meta.alpha, "multi");
    }

    #[test]
    fn below_threshold_is_hold_and_not_published() {
        let b = blender(vec![fixed("a", 0.03)], BlenderCfg::default());
        assert!(b.blend(&candle(100.0)).is_none());
    }

    #[test]
    fn combined_is_clipped() {
        let mut w = BTreeMap::new();
        w.insert("a".to_string(), 1.0);
        w.insert("b".to_string(), 1.0);
        let cfg = BlenderCfg { weights: Some(w), ..Default::default() };
        let b = blender(vec![fixed("a", 0.9), fixed("b", 0.9)], cfg);
        assert_eq!(b.blend(&candle(1.0)).unwrap().score, 1.0);
    }

    #[test]
    fn anti_spam_suppresses_small_changes() {
        let b = blender(vec![scripted(vec![0.5, 0.52, 0.56, 0.56, 0.0])], BlenderCfg::default());
        let published: Vec<Option<f64>> = (0..5).map(|_| b.blend(&candle(10.0)).map(|s| s.score)).collect();
        assert_eq!(published, vec![Some(0.5), None, Some(0.56), None, Some(0.0)]);
    }

    #[test]
    fn timeframe_filter_and_per_symbol_state() {
        let cfg = BlenderCfg { timeframe: Some("5m".into()), ..Default::default() };
        let b = blender(vec![scripted(vec![0.5, 0.9])], cfg);
        assert!(b.blend(&candle(10.0)).is_none()); // 1m candle ignored

        let mut c = candle(10.0);
        c.timeframe = "5m".into();
        assert_eq!(b.blend(&c).unwrap().score, 0.5);
        c.symbol = "ETHUSDT".into();
        // fresh script for the new symbol
        assert_eq!(b.blend(&c).unwrap().score, 0.5);
    }

    #[test]
    fn attribution_tracks_weighted_exposure() {
        let b = blender(vec![fixed("alpha_x", 1.0), fixed("alpha_y", -0.5)], BlenderCfg::default());
        b.blend(&candle(100.0));
        let notional = b.notional_exposure();
        assert!((notional["alpha_x"] - 50.0).abs() < 1e-9);
        assert!((notional["alpha_y"] + 25.0).abs() < 1e-9);
        assert!((ALPHA_EXPOSURE.with_label_values(&["alpha_x"]).get() - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn disabled_blender_does_not_subscribe() {
        let bus = Arc::new(EventBus::new());
        let b = Arc::new(StrategyBlender::with_factories(
            bus.clone(),
            vec![fixed("a", 1.0)],
            BlenderCfg { enabled: false, ..Default::default() },
        ));
        b.attach();
        assert_eq!(bus.subscriber_count(topics::MARKET_SNAPSHOT), 0);
    }

    #[test]
    fn individual_alpha_passes_raw_score_through() {
        let (name, f) = scripted(vec![0.03, 0.04, -2.0]);
        let solo = IndividualAlpha::new(Arc::new(EventBus::new()), name, f, None);
        let scores: Vec<f64> = (0..3).map(|_| solo.signal(&candle(10.0)).unwrap().score).collect();
        // below the blend threshold, inside the anti-spam delta, then clipped
        assert_eq!(scores, vec![0.03, 0.04, -1.0]);

        let sig = solo.signal(&candle(10.0)).unwrap();
        assert_eq!(sig.meta.alpha, "scripted");
        assert_eq!(sig.meta.scores["scripted"], 0.0);
        assert_eq!(sig.meta.weights["scripted"], 1.0);
    }

    #[tokio::test]
    async fn publishes_signal_on_bus() {
        let bus = Arc::new(EventBus::new());
        let got = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = got.clone();
        bus.subscribe_fn(topics::SIGNAL, "collect", move |ev| {
            let sink = sink.clone();
            async move {
                if let Event::Signal(s) = ev {
                    sink.lock().unwrap().push(s);
                }
                Ok(())
            }
        });
        let b = Arc::new(StrategyBlender::with_factories(bus.clone(), vec![fixed("a", 0.8)], BlenderCfg::default()));
        b.attach();
        bus.publish(topics::MARKET_SNAPSHOT, Event::Candle(candle(100.0))).await.unwrap();
        bus.publish(topics::MARKET_SNAPSHOT, Event::Candle(candle(101.0))).await.unwrap();
        let got = got.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert!((got[0].score - 0.8).abs() < 1e-12);
    }
}
