// ===============================
// src/router.rs (per-symbol reorder buffer)
// ===============================
//
// RAW_MARKET -> per-symbol bounded queue -> consumer task (min-heap on
// timestamp) -> ORDERED_MARKET.
//
// Flush policy: the whole heap is drained in timestamp order when
//   (a) the oldest buffered item has waited `buffer_window`, or
//   (b) more than `max_buffered` items are held.
// Ordering is per symbol only. Unparseable timestamps sort as "now".
//
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, PoisonError};

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Handler, SubscriptionId};
use crate::domain::{parse_timestamp, topics, Event, RawTick};
use crate::error::{PipelineError, Result};
use crate::metrics::{ROUTER_BUFFERED, TICKS, TICKS_BY_SYMBOL, TICKS_DROPPED};

#[derive(Debug, Clone)]
pub struct RouterCfg {
    pub buffer_window: Duration,
    pub max_buffered: usize,
    pub queue_capacity: usize,
}

impl Default for RouterCfg {
    fn default() -> Self {
        Self { buffer_window: Duration::from_millis(200), max_buffered: 50, queue_capacity: 10_000 }
    }
}

struct Lane {
    tx: mpsc::Sender<RawTick>,
    task: JoinHandle<()>,
}

pub struct StreamRouter {
    bus: Arc<EventBus>,
    cfg: RouterCfg,
    lanes: Mutex<HashMap<String, Lane>>,
    subscription: Mutex<Option<SubscriptionId>>,
    cancel: CancellationToken,
}

/// Heap entry ordered by (timestamp, arrival seq) so equal timestamps keep FIFO.
#[derive(Debug)]
struct Buffered {
    ts_ms: i64,
    seq: u64,
    tick: RawTick,
}

impl PartialEq for Buffered {
    fn eq(&self, other: &Self) -> bool { (self.ts_ms, self.seq) == (other.ts_ms, other.seq) }
}
impl Eq for Buffered {}
impl PartialOrd for Buffered {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}
impl Ord for Buffered {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering { (self.ts_ms, self.seq).cmp(&(other.ts_ms, other.seq)) }
}

fn ordering_key_ms(raw: &RawTick) -> i64 {
    parse_timestamp(&raw.timestamp)
        .map(|t| t.timestamp_millis())
        .unwrap_or_else(|| Utc::now().timestamp_millis())
}

impl StreamRouter {
    pub fn new(bus: Arc<EventBus>, cfg: RouterCfg) -> Self {
        Self { bus, cfg, lanes: Mutex::new(HashMap::new()), subscription: Mutex::new(None), cancel: CancellationToken::new() }
    }

    pub fn attach(self: &Arc<Self>) {
        let id = self.bus.subscribe(topics::RAW_MARKET, "stream_router", self.clone());
        *self.subscription.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
        info!(
            window_ms = self.cfg.buffer_window.as_millis() as u64,
            max_buffered = self.cfg.max_buffered,
            "router subscribed to RAW_MARKET"
        );
    }

    /// Unsubscribe from RAW_MARKET. Returns false if not attached.
    pub fn detach(&self) -> bool {
        let id = self.subscription.lock().unwrap_or_else(PoisonError::into_inner).take();
        id.is_some_and(|id| self.bus.unsubscribe(topics::RAW_MARKET, id))
    }

    pub fn symbols(&self) -> Vec<String> {
        let lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<String> = lanes.keys().cloned().collect();
        out.sort();
        out
    }

    fn lane_sender(&self, symbol: &str) -> mpsc::Sender<RawTick> {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lane) = lanes.get(symbol) {
            return lane.tx.clone();
        }
        let (tx, rx) = mpsc::channel::<RawTick>(self.cfg.queue_capacity.max(1));
        let task = tokio::spawn(run_lane(
            symbol.to_string(),
            rx,
            self.bus.clone(),
            self.cfg.clone(),
            self.cancel.child_token(),
        ));
        debug!(symbol, "router lane created");
        lanes.insert(symbol.to_string(), Lane { tx: tx.clone(), task });
        tx
    }

    /// Queue a raw tick on its symbol lane. Blocks while the lane is full.
    pub async fn on_raw(&self, mut raw: RawTick) -> Result<()> {
        let symbol = raw.normalized_symbol();
        if symbol.is_empty() {
            warn!(source = %raw.source, "router: tick without symbol dropped");
            TICKS_DROPPED.with_label_values(&["no_symbol"]).inc();
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            debug!(%symbol, "router stopped, tick dropped");
            TICKS_DROPPED.with_label_values(&["router_stopped"]).inc();
            return Ok(());
        }
        raw.symbol = symbol.clone();
        TICKS.inc();
        TICKS_BY_SYMBOL.with_label_values(&[&symbol]).inc();

        let tx = self.lane_sender(&symbol);
        tx.send(raw)
            .await
            .map_err(|_| PipelineError::ChannelClosed(format!("router lane {symbol}")))
    }

    /// Cancel every lane, let each drain and flush what it holds, then wait.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let lanes: Vec<(String, Lane)> = {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            lanes.drain().collect()
        };
        for (symbol, lane) in lanes {
            drop(lane.tx);
            if let Err(e) = lane.task.await {
                error!(%symbol, ?e, "router lane task failed");
            }
        }
        info!("router stopped");
    }
}

#[async_trait]
impl Handler for StreamRouter {
    async fn handle(&self, topic: &str, event: &Event) -> Result<()> {
        match event {
            Event::RawTick(raw) => self.on_raw(raw.clone()).await,
            other => Err(PipelineError::UnexpectedEvent { topic: topic.to_string(), got: other.kind() }),
        }
    }
}

async fn flush(symbol: &str, heap: &mut BinaryHeap<Reverse<Buffered>>, bus: &EventBus) {
    let n = heap.len();
    while let Some(Reverse(item)) = heap.pop() {
        if let Err(e) = bus.publish(topics::ORDERED_MARKET, Event::RawTick(item.tick)).await {
            // per-tick failures are logged and skipped, the lane keeps going
            error!(symbol, error = %e, "ordered tick dispatch failed");
        }
    }
    ROUTER_BUFFERED.with_label_values(&[symbol]).set(0);
    if n > 0 {
        debug!(symbol, n, "router flushed");
    }
}

async fn run_lane(
    symbol: String,
    mut rx: mpsc::Receiver<RawTick>,
    bus: Arc<EventBus>,
    cfg: RouterCfg,
    cancel: CancellationToken,
) {
    let mut heap: BinaryHeap<Reverse<Buffered>> = BinaryHeap::new();
    let mut seq: u64 = 0;
    // set when the heap goes from empty to non-empty
    let mut window_start: Option<Instant> = None;

    loop {
        let deadline = window_start.map(|t| t + cfg.buffer_window);
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                while let Ok(raw) = rx.try_recv() {
                    heap.push(Reverse(Buffered { ts_ms: ordering_key_ms(&raw), seq, tick: raw }));
                    seq += 1;
                }
                flush(&symbol, &mut heap, &bus).await;
                break;
            }

            _ = async { sleep_until(deadline.unwrap_or_else(Instant::now)).await }, if deadline.is_some() => {
                flush(&symbol, &mut heap, &bus).await;
                window_start = None;
            }

            maybe = rx.recv() => {
                match maybe {
                    Some(raw) => {
                        heap.push(Reverse(Buffered { ts_ms: ordering_key_ms(&raw), seq, tick: raw }));
                        seq += 1;
                        let started = *window_start.get_or_insert_with(Instant::now);
                        ROUTER_BUFFERED.with_label_values(&[&symbol]).set(heap.len() as i64);
                        if heap.len() > cfg.max_buffered || started.elapsed() >= cfg.buffer_window {
                            flush(&symbol, &mut heap, &bus).await;
                            window_start = None;
                        }
                    }
                    None => {
                        flush(&symbol, &mut heap, &bus).await;
                        break;
                    }
                }
            }
        }
    }
    debug!(%symbol, "router lane exited");
}
