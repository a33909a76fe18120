// ===============================
// src/bus.rs (in-process pub/sub)
// ===============================
//
// Topic -> ordered list of handlers. `publish` awaits every handler of the
// topic in subscription order, so one tick -> signal -> order -> fill chain
// is sequential from the publisher's point of view.
//
// The subscriber table is only read to take a snapshot; handlers run with
// no lock held, so a handler may publish (nested) or subscribe freely.
//
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::domain::Event;
use crate::error::{PipelineError, Result};
use crate::recorder::{JournalEntry, Record};

pub type SubscriptionId = u64;

/// Anything that can consume bus events. Synchronous handlers simply
/// return without awaiting.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, topic: &str, event: &Event) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, _topic: &str, event: &Event) -> Result<()> {
        (self.0)(event.clone()).await
    }
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    name: String,
    handler: Arc<dyn Handler>,
}

pub struct EventBus {
    subs: RwLock<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
    journal: RwLock<Option<mpsc::Sender<Record>>>,
    journal_seq: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self { Self::new() }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            journal: RwLock::new(None),
            journal_seq: AtomicU64::new(0),
        }
    }

    /// Every publish is also sent to `tx` as a [`JournalEntry`] before dispatch.
    pub fn set_journal(&self, tx: mpsc::Sender<Record>) {
        *self.journal.write().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    /// Stop journaling; returns true if a journal was attached.
    pub fn detach_journal(&self) -> bool {
        self.journal.write().unwrap_or_else(PoisonError::into_inner).take().is_some()
    }

    pub fn subscribe(&self, topic: &str, name: &str, handler: Arc<dyn Handler>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subs.write().unwrap_or_else(PoisonError::into_inner);
        subs.entry(topic.to_string())
            .or_default()
            .push(Subscription { id, name: name.to_string(), handler });
        debug!(topic, handler = name, id, "subscribed");
        id
    }

    pub fn subscribe_fn<F, Fut>(&self, topic: &str, name: &str, f: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(topic, name, Arc::new(FnHandler(f)))
    }

    /// Returns false if the id was not subscribed to `topic`.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut subs = self.subs.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = subs.get_mut(topic) else { return false };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subs.remove(topic);
        }
        if removed {
            debug!(topic, id, "unsubscribed");
        }
        removed
    }

    pub fn clear(&self) {
        self.subs.write().unwrap_or_else(PoisonError::into_inner).clear();
        debug!("cleared all subscriptions");
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, Vec::len)
    }

    fn snapshot(&self, topic: &str) -> Vec<Subscription> {
        self.subs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    async fn journal(&self, topic: &str, event: &Event) {
        let tx = self.journal.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(tx) = tx {
            let entry = JournalEntry {
                seq: self.journal_seq.fetch_add(1, Ordering::Relaxed),
                ts: Utc::now(),
                topic: topic.to_string(),
                event: event.clone(),
            };
            if tx.send(Record::Journal(entry)).await.is_err() {
                warn!(topic, "journal channel closed, event not journaled");
            }
        }
    }

    /// Deliver `event` to every handler of `topic`, in subscription order.
    /// All handlers run even if one fails; the first failure is returned.
    pub async fn publish(&self, topic: &str, event: Event) -> Result<()> {
        self.journal(topic, &event).await;

        let subs = self.snapshot(topic);
        if subs.is_empty() {
            trace!(topic, "no subscribers");
            return Ok(());
        }
        trace!(topic, n = subs.len(), kind = event.kind(), "publish");

        let mut first_err: Option<PipelineError> = None;
        for sub in &subs {
            if let Err(e) = sub.handler.handle(topic, &event).await {
                warn!(topic, handler = %sub.name, error = %e, "handler failed");
                if first_err.is_none() {
                    first_err = Some(PipelineError::Handler {
                        topic: topic.to_string(),
                        handler: sub.name.clone(),
                        source: Box::new(e),
                    });
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EquityMark, RawTick};
    use std::sync::Mutex;
    use tokio::time::{sleep, Duration};

    fn tick() -> Event {
        Event::RawTick(RawTick { symbol: "BTCUSDT".into(), price: 1.0, ..Default::default() })
    }

    fn recording(bus: &EventBus, topic: &str, name: &'static str, log: Arc<Mutex<Vec<String>>>) -> SubscriptionId {
        bus.subscribe_fn(topic, name, move |_ev| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name.to_string());
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn delivers_in_subscription_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recording(&bus, "T", "first", log.clone());
        recording(&bus, "T", "second", log.clone());
        recording(&bus, "OTHER", "other", log.clone());

        bus.publish("T", tick()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        assert!(bus.publish("NOBODY", tick()).await.is_ok());
    }

    #[tokio::test]
    async fn publish_waits_for_suspending_handlers() {
        let bus = EventBus::new();
        let done = Arc::new(Mutex::new(false));
        let flag = done.clone();
        bus.subscribe_fn("T", "slow", move |_ev| {
            let flag = flag.clone();
            async move {
                sleep(Duration::from_millis(20)).await;
                *flag.lock().unwrap() = true;
                Ok(())
            }
        });
        bus.publish("T", tick()).await.unwrap();
        assert!(*done.lock().unwrap());
    }

    #[tokio::test]
    async fn failure_propagates_and_table_survives() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe_fn("T", "boom", |_ev| async {
            Err(PipelineError::ChannelClosed("boom".into()))
        });
        recording(&bus, "T", "after", log.clone());

        let err = bus.publish("T", tick()).await.unwrap_err();
        match &err {
            PipelineError::Handler { handler, topic, .. } => {
                assert_eq!(handler, "boom");
                assert_eq!(topic, "T");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(err.root(), PipelineError::ChannelClosed(_)));
        // the handler after the failing one still ran
        assert_eq!(log.lock().unwrap().len(), 1);

        assert!(bus.publish("T", tick()).await.is_err());
        assert_eq!(bus.subscriber_count("T"), 2);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_and_clear() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recording(&bus, "T", "a", log.clone());
        recording(&bus, "T", "b", log.clone());

        assert!(bus.unsubscribe("T", a));
        assert!(!bus.unsubscribe("T", a));
        bus.publish("T", tick()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["b"]);

        bus.clear();
        assert_eq!(bus.subscriber_count("T"), 0);
        bus.publish("T", tick()).await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn nested_publish_from_handler() {
        let bus = Arc::new(EventBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        recording(&bus, "INNER", "inner", log.clone());
        let inner_bus = bus.clone();
        bus.subscribe_fn("OUTER", "outer", move |_ev| {
            let bus = inner_bus.clone();
            async move {
                let mark = EquityMark { ts: Utc::now(), equity: 1.0, cash: 1.0, unrealized: 0.0 };
                bus.publish("INNER", Event::Mark(mark)).await
            }
        });
        bus.publish("OUTER", tick()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["inner"]);
    }

    #[tokio::test]
    async fn journal_sees_every_publish() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::channel(8);
        bus.set_journal(tx);
        bus.publish("A", tick()).await.unwrap();
        bus.publish("B", tick()).await.unwrap();

        let mut topics = Vec::new();
        while let Ok(Record::Journal(e)) = rx.try_recv() {
            topics.push((e.seq, e.topic));
        }
        assert_eq!(topics, vec![(0, "A".to_string()), (1, "B".to_string())]);
    }
}
