// ===============================
// src/recorder.rs
// ===============================
//
// JSONL recorder:
// - One file per record kind under RECORD_DIR (events.jsonl, orders.jsonl, ...).
// - BufWriter per file, flush every 1s and/or every 1000 records.
// - Parent directory is created on demand.
// - A failed write reopens the file once, then drops the record.
//
// events.jsonl is the unified journal consumed by `replay`.
//
use std::path::{Path, PathBuf};

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::{AlphaPnl, Event, EquityMark};
use crate::error::Result;
use crate::posttrade::{CandleRecord, FillRecord, OrderRecord, SignalRecord};

/// One bus publish, as journaled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub topic: String,
    pub event: Event,
}

#[derive(Debug, Clone)]
pub enum Record {
    Journal(JournalEntry),
    Candle(CandleRecord),
    Signal(SignalRecord),
    Order(OrderRecord),
    Fill(FillRecord),
    Mark(EquityMark),
    AlphaPnl(AlphaPnl),
}

impl Record {
    pub fn file_name(&self) -> &'static str {
        match self {
            Record::Journal(_) => "events.jsonl",
            Record::Candle(_) => "candles.jsonl",
            Record::Signal(_) => "signals.jsonl",
            Record::Order(_) => "orders.jsonl",
            Record::Fill(_) => "fills.jsonl",
            Record::Mark(_) => "marks.jsonl",
            Record::AlphaPnl(_) => "alpha_pnl.jsonl",
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        match self {
            Record::Journal(r) => serde_json::to_string(r),
            Record::Candle(r) => serde_json::to_string(r),
            Record::Signal(r) => serde_json::to_string(r),
            Record::Order(r) => serde_json::to_string(r),
            Record::Fill(r) => serde_json::to_string(r),
            Record::Mark(r) => serde_json::to_string(r),
            Record::AlphaPnl(r) => serde_json::to_string(r),
        }
    }
}

async fn open_writer(path: &Path) -> Result<BufWriter<tokio::fs::File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

struct Writers {
    dir: PathBuf,
    open: HashMap<&'static str, BufWriter<tokio::fs::File>>,
}

impl Writers {
    async fn write(&mut self, name: &'static str, line: &str) -> Result<()> {
        if !self.open.contains_key(name) {
            let w = open_writer(&self.dir.join(name)).await?;
            self.open.insert(name, w);
        }
        if let Some(w) = self.open.get_mut(name) {
            w.write_all(line.as_bytes()).await?;
            w.write_all(b"\n").await?;
        }
        Ok(())
    }

    async fn flush_all(&mut self) {
        for (name, w) in self.open.iter_mut() {
            if let Err(e) = w.flush().await {
                error!(?e, file = name, "recorder: flush failed");
            }
        }
    }
}

pub async fn run(mut rx: mpsc::Receiver<Record>, dir: PathBuf) {
    info!(dir = %dir.display(), "recorder: started");
    let mut writers = Writers { dir, open: HashMap::new() };

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut since_last_flush: u32 = 0;
    const FLUSH_EVERY_N_RECORDS: u32 = 1000;

    loop {
        tokio::select! {
            maybe_rec = rx.recv() => {
                match maybe_rec {
                    Some(rec) => {
                        let line = match rec.to_line() {
                            Ok(s) => s,
                            Err(e) => {
                                error!(?e, "recorder: serialize error, skip record");
                                continue;
                            }
                        };
                        let name = rec.file_name();
                        if let Err(e) = writers.write(name, &line).await {
                            error!(?e, file = name, "recorder: write failed, attempting reopen");
                            writers.open.remove(name);
                            if let Err(e2) = writers.write(name, &line).await {
                                error!(?e2, file = name, "recorder: write failed again after reopen, drop record");
                                continue;
                            }
                        }

                        since_last_flush += 1;
                        if since_last_flush >= FLUSH_EVERY_N_RECORDS {
                            writers.flush_all().await;
                            since_last_flush = 0;
                        }
                    }
                    None => {
                        writers.flush_all().await;
                        info!("recorder: channel closed, stopped");
                        break;
                    }
                }
            }

            _ = tick.tick() => {
                writers.flush_all().await;
                since_last_flush = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RawTick;

    #[tokio::test]
    async fn writes_one_file_per_kind() {
        let dir = std::env::temp_dir().join(format!("alpha_bot_rec_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run(rx, dir.clone()));

        let entry = JournalEntry {
            seq: 0,
            ts: Utc::now(),
            topic: "RAW_MARKET".into(),
            event: Event::RawTick(RawTick { symbol: "BTCUSDT".into(), price: 10.0, ..Default::default() }),
        };
        tx.send(Record::Journal(entry.clone())).await.unwrap();
        tx.send(Record::Mark(EquityMark { ts: Utc::now(), equity: 5.0, cash: 5.0, unrealized: 0.0 }))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        let events = std::fs::read_to_string(dir.join("events.jsonl")).unwrap();
        let back: JournalEntry = serde_json::from_str(events.lines().next().unwrap()).unwrap();
        assert_eq!(back, entry);
        let marks = std::fs::read_to_string(dir.join("marks.jsonl")).unwrap();
        assert_eq!(marks.lines().count(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
