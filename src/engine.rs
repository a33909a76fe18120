// ===============================
// src/engine.rs (wiring)
// ===============================
//
// One bus, six stages:
//   RAW_MARKET -> router -> ORDERED_MARKET -> aggregator -> MARKET_SNAPSHOT
//   -> blender -> SIGNAL -> ledger -> ORDER -> execution -> FILL -> ledger
//   -> PORTFOLIO_MARK / ALPHA_PNL_TICK
// plus an optional report sink and event journal when RECORD_DIR is set.
// In individual mode one handler per alpha replaces the blender.
//
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::blender::{IndividualAlpha, StrategyBlender};
use crate::bus::EventBus;
use crate::candles::CandleAggregator;
use crate::config::Config;
use crate::domain::topics;
use crate::gateway::{ExecMode, ExecutionSimulator};
use crate::positions::PortfolioLedger;
use crate::posttrade::ReportSink;
use crate::recorder::{self, Record};
use crate::router::StreamRouter;
use crate::strategy::AlphaFactory;

const RECORD_CHANNEL: usize = 8192;

pub struct Engine {
    pub bus: Arc<EventBus>,
    pub router: Arc<StreamRouter>,
    pub aggregator: Arc<CandleAggregator>,
    pub blender: Arc<StrategyBlender>,
    /// Per-alpha signal handlers, only populated when the blender is disabled.
    pub individual: Vec<Arc<IndividualAlpha>>,
    pub ledger: Arc<PortfolioLedger>,
    pub execution: Arc<ExecutionSimulator>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    recorder: Option<JoinHandle<()>>,
}

impl Engine {
    /// Wire every stage from config. Must run inside a tokio runtime.
    pub fn build(cfg: &Config) -> Self {
        let registry = cfg.strategies.iter().map(|k| (k.name().to_string(), k.factory())).collect();
        Self::with_alphas(cfg, registry)
    }

    /// Same as [`Engine::build`] with a caller-supplied alpha registry.
    pub fn with_alphas(cfg: &Config, registry: Vec<(String, AlphaFactory)>) -> Self {
        let bus = Arc::new(EventBus::new());
        let cancel = CancellationToken::new();

        // reports first, so ORDER is logged before the FILL it causes
        let recorder = cfg.record_dir.clone().map(|dir| Self::attach_recording(&bus, dir));

        let router = Arc::new(StreamRouter::new(bus.clone(), cfg.router.clone()));
        router.attach();
        let aggregator = Arc::new(CandleAggregator::new(bus.clone(), cfg.timeframes.clone()));
        aggregator.attach();
        let individual = if cfg.blender.enabled {
            Vec::new()
        } else {
            IndividualAlpha::attach_all(&bus, &registry, cfg.blender.timeframe.clone())
        };
        let blender = Arc::new(StrategyBlender::with_factories(bus.clone(), registry, cfg.blender.clone()));
        blender.attach();
        let ledger = Arc::new(PortfolioLedger::new(bus.clone(), cfg.ledger.clone()));
        ledger.attach();
        let execution = Arc::new(ExecutionSimulator::new(bus.clone(), cfg.exec.clone()));
        execution.attach();

        let mut tasks = Vec::new();
        if cfg.exec.mode != ExecMode::Backtest {
            tasks.push(ledger.spawn_reporter(cfg.report_interval, cancel.child_token()));
        }

        Self { bus, router, aggregator, blender, individual, ledger, execution, cancel, tasks, recorder }
    }

    fn attach_recording(bus: &Arc<EventBus>, dir: PathBuf) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel::<Record>(RECORD_CHANNEL);
        let sink = Arc::new(ReportSink::new(tx.clone()));
        for topic in [
            topics::MARKET_SNAPSHOT,
            topics::SIGNAL,
            topics::ORDER,
            topics::FILL,
            topics::PORTFOLIO_MARK,
            topics::ALPHA_PNL_TICK,
        ] {
            bus.subscribe(topic, "report_sink", sink.clone());
        }
        bus.set_journal(tx);
        info!(dir = %dir.display(), "recording reports and event journal");
        tokio::spawn(recorder::run(rx, dir))
    }

    /// Stop routing RAW_MARKET, for replays that feed ORDERED_MARKET directly.
    pub fn detach_router(&self) {
        if self.router.detach() {
            info!("router detached, ordered ticks come from the journal");
        }
    }

    /// Token for feeds and other tasks that should stop with the engine.
    pub fn cancel_token(&self) -> CancellationToken { self.cancel.child_token() }

    pub fn track(&mut self, task: JoinHandle<()>) { self.tasks.push(task); }

    /// Stop feeds, flush router lanes through the pipeline, then tear down
    /// subscriptions and close the recorder.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for t in self.tasks.drain(..) {
            if let Err(e) = t.await {
                error!(?e, "engine task failed");
            }
        }
        self.router.shutdown().await;
        self.bus.clear();
        self.bus.detach_journal();
        // the report sink's sender went away with clear()
        if let Some(rec) = self.recorder.take() {
            if let Err(e) = rec.await {
                error!(?e, "recorder task failed");
            }
        }
        let snap = self.ledger.snapshot();
        info!(equity = snap.equity, cash = snap.cash, fills = snap.fills, "engine stopped");
    }
}
