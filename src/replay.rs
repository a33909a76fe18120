// ===============================
// src/replay.rs (journal -> bus)
// ===============================
use std::path::Path;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::domain::topics;
use crate::error::{PipelineError, Result};
use crate::recorder::JournalEntry;

/// Replayed by default: the router's recorded output, so stages downstream
/// of the router see exactly the ordered stream of the recorded run.
/// Replaying RAW_MARKET instead re-runs the router's wall-clock windows.
pub const DEFAULT_TOPICS: &[&str] = &[topics::ORDERED_MARKET];

/// True when `wanted` includes router output, in which case the router must
/// be detached so ticks are not ordered twice.
pub fn bypasses_router(wanted: &[String]) -> bool {
    wanted.iter().any(|t| t == topics::ORDERED_MARKET)
}

/// Read `events.jsonl`. Unreadable lines are skipped; entries come back in
/// journal sequence order.
pub async fn load_journal(path: &Path) -> Result<Vec<JournalEntry>> {
    let file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PipelineError::MissingFile(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let mut lines = BufReader::new(file).lines();
    let mut out = Vec::new();
    let mut n = 0usize;
    while let Some(line) = lines.next_line().await? {
        n += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(&line) {
            Ok(e) => out.push(e),
            Err(e) => warn!(line = n, error = %e, "journal line skipped"),
        }
    }
    out.sort_by_key(|e| e.seq);
    info!(path = %path.display(), entries = out.len(), "journal loaded");
    Ok(out)
}

/// Republish entries whose topic is in `topics`, in order. Handler failures
/// are logged and the replay continues. Returns the number republished.
pub async fn replay(
    bus: Arc<EventBus>,
    entries: Vec<JournalEntry>,
    topics: &[String],
    cancel: CancellationToken,
) -> usize {
    let mut sent = 0;
    for entry in entries {
        if cancel.is_cancelled() {
            warn!(sent, "replay cancelled");
            break;
        }
        if !topics.iter().any(|t| t == &entry.topic) {
            continue;
        }
        if let Err(e) = bus.publish(&entry.topic, entry.event).await {
            warn!(seq = entry.seq, topic = %entry.topic, error = %e, "replayed event failed");
        }
        sent += 1;
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Event, RawTick};
    use crate::recorder::{self, Record};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn raw(price: f64) -> Event {
        Event::RawTick(RawTick {
            source: "T".into(),
            symbol: "BTCUSDT".into(),
            price,
            volume: 1.0,
            timestamp: "2025-11-06T12:00:00.000Z".into(),
        })
    }

    #[test]
    fn ordered_replay_needs_the_router_detached() {
        let default: Vec<String> = DEFAULT_TOPICS.iter().map(|s| s.to_string()).collect();
        assert!(bypasses_router(&default));
        assert!(!bypasses_router(&[topics::RAW_MARKET.to_string()]));
    }

    #[tokio::test]
    async fn missing_journal_is_fatal() {
        let err = load_journal(Path::new("/no/such/events.jsonl")).await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingFile(_)));
    }

    #[tokio::test]
    async fn recorded_publishes_replay_identically() {
        let dir = std::env::temp_dir().join(format!("alpha_bot_replay_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        // record
        let (tx, rx) = mpsc::channel::<Record>(64);
        let writer = tokio::spawn(recorder::run(rx, dir.clone()));
        let bus = Arc::new(EventBus::new());
        bus.set_journal(tx);
        let published = vec![
            (topics::RAW_MARKET, raw(1.0)),
            (topics::ORDERED_MARKET, raw(1.0)),
            (topics::RAW_MARKET, raw(2.0)),
            (topics::RAW_MARKET, raw(3.0)),
        ];
        for (t, ev) in &published {
            bus.publish(t, ev.clone()).await.unwrap();
        }
        drop(bus);
        writer.await.unwrap();

        // replay
        let entries = load_journal(&dir.join("events.jsonl")).await.unwrap();
        assert_eq!(entries.len(), 4);

        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_fn(topics::RAW_MARKET, "collect", move |ev| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(ev);
                Ok(())
            }
        });
        let only_raw = vec![topics::RAW_MARKET.to_string()];
        let n = replay(bus, entries, &only_raw, CancellationToken::new()).await;
        assert_eq!(n, 3);
        let expected: Vec<Event> = published
            .into_iter()
            .filter(|(t, _)| *t == topics::RAW_MARKET)
            .map(|(_, e)| e)
            .collect();
        assert_eq!(*seen.lock().unwrap(), expected);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
