//! In-process bus backend.
//!
//! A topic maps to a set of subscribers. Each subscriber owns a bounded
//! queue and a dedicated delivery task that invokes the handler envelope by
//! envelope, which keeps per-subscriber FIFO without letting one slow
//! handler wedge the bus. `publish` snapshots the sender list under the
//! read lock, releases it, and then `try_send`s to every queue — when a
//! queue is full the newest envelope for that subscriber is dropped and a
//! warning logged (at-most-once permits this; the overflow policy is
//! deliberate).

use crate::{BusError, Envelope, EventBus, Handler, Subscription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

const DEFAULT_QUEUE_CAPACITY: usize = 64;

struct Subscriber {
    tx: mpsc::Sender<Envelope>,
    delivery: JoinHandle<()>,
}

/// In-process [`EventBus`] backend.
pub struct MemoryBus {
    topics: RwLock<HashMap<String, HashMap<u64, Subscriber>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    closed: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl EventBus for MemoryBus {
    async fn subscribe(&self, topic: &str, handler: Handler) -> Result<Subscription, BusError> {
        self.ensure_open()?;

        let (tx, mut rx) = mpsc::channel::<Envelope>(self.queue_capacity);
        let delivery = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                handler(envelope).await;
            }
        });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .insert(id, Subscriber { tx, delivery });

        Ok(Subscription {
            id,
            topic: topic.to_string(),
        })
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), BusError> {
        self.ensure_open()?;

        // Snapshot senders under the read lock; never hold it across a send.
        let senders: Vec<mpsc::Sender<Envelope>> = {
            let topics = self.topics.read().await;
            match topics.get(topic) {
                Some(subs) => subs.values().map(|s| s.tx.clone()).collect(),
                None => return Ok(()),
            }
        };

        for tx in senders {
            if let Err(mpsc::error::TrySendError::Full(dropped)) = tx.try_send(envelope.clone()) {
                tracing::warn!(
                    topic = %topic,
                    event = %dropped.event,
                    "subscriber queue full, dropping envelope"
                );
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), BusError> {
        let mut topics = self.topics.write().await;
        if let Some(subs) = topics.get_mut(&subscription.topic) {
            if let Some(sub) = subs.remove(&subscription.id) {
                // Abort rather than drain: after unsubscribe returns, the
                // handler must not run again.
                sub.delivery.abort();
            }
            if subs.is_empty() {
                topics.remove(&subscription.topic);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::Release);
        let mut topics = self.topics.write().await;
        for (_, subs) in topics.drain() {
            for (_, sub) in subs {
                sub.delivery.abort();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn envelope(topic: &str, n: i64) -> Envelope {
        Envelope::new(topic, "test.event", json!({ "n": n }))
    }

    /// Collects delivered envelopes behind a channel so tests can await them.
    fn collector() -> (Handler, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let h = handler(move |env| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(env);
            }
        });
        (h, rx)
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = MemoryBus::new();
        let (h, mut rx) = collector();
        bus.subscribe("user:a", h).await.unwrap();

        bus.publish("user:a", envelope("user:a", 1)).await.unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.payload["n"], 1);
    }

    #[tokio::test]
    async fn publish_to_unrelated_topic_is_silent() {
        let bus = MemoryBus::new();
        let (h, mut rx) = collector();
        bus.subscribe("user:a", h).await.unwrap();

        bus.publish("user:b", envelope("user:b", 1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_subscriber_fifo() {
        let bus = MemoryBus::new();
        let (h, mut rx) = collector();
        bus.subscribe("room:r", h).await.unwrap();

        for n in 0..32 {
            bus.publish("room:r", envelope("room:r", n)).await.unwrap();
        }

        for n in 0..32 {
            let got = rx.recv().await.unwrap();
            assert_eq!(got.payload["n"], n);
        }
    }

    #[tokio::test]
    async fn subscribe_publish_unsubscribe_publish_delivers_exactly_once() {
        let bus = MemoryBus::new();
        let (h, mut rx) = collector();
        let sub = bus.subscribe("user:a", h).await.unwrap();

        bus.publish("user:a", envelope("user:a", 1)).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload["n"], 1);

        bus.unsubscribe(&sub).await.unwrap();
        bus.publish("user:a", envelope("user:a", 2)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive() {
        let bus = MemoryBus::new();
        let (h1, mut rx1) = collector();
        let (h2, mut rx2) = collector();
        bus.subscribe("room:r", h1).await.unwrap();
        bus.subscribe("room:r", h2).await.unwrap();

        bus.publish("room:r", envelope("room:r", 7)).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap().payload["n"], 7);
        assert_eq!(rx2.recv().await.unwrap().payload["n"], 7);
    }

    #[tokio::test]
    async fn overflow_drops_newest() {
        let bus = MemoryBus::with_queue_capacity(1);
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let started = Arc::new(tokio::sync::Notify::new());
        let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

        let h = {
            let gate = gate.clone();
            let started = started.clone();
            let seen = seen.clone();
            handler(move |env| {
                let gate = gate.clone();
                let started = started.clone();
                let seen = seen.clone();
                async move {
                    started.notify_one();
                    let _permit = gate.acquire().await.unwrap();
                    seen.lock().await.push(env.payload["n"].as_i64().unwrap());
                }
            })
        };
        bus.subscribe("user:a", h).await.unwrap();

        // First envelope enters the handler and blocks on the gate.
        bus.publish("user:a", envelope("user:a", 1)).await.unwrap();
        started.notified().await;
        // Second fills the queue; third overflows and is dropped.
        bus.publish("user:a", envelope("user:a", 2)).await.unwrap();
        bus.publish("user:a", envelope("user:a", 3)).await.unwrap();

        gate.add_permits(3);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn closed_bus_refuses_work() {
        let bus = MemoryBus::new();
        bus.close().await.unwrap();
        assert!(matches!(
            bus.publish("user:a", envelope("user:a", 1)).await,
            Err(BusError::Closed)
        ));
        let (h, _rx) = collector();
        assert!(matches!(
            bus.subscribe("user:a", h).await,
            Err(BusError::Closed)
        ));
    }
}
