//! Redis bus backend.
//!
//! Topics become Redis Pub/Sub channels and envelopes travel as JSON bytes,
//! so several server nodes can share one bus. Locally this mirrors the
//! in-process backend: every subscription still has its own bounded queue
//! and delivery task, so per-subscriber FIFO holds for envelopes published
//! through one node, and nothing stronger is promised across topics.
//!
//! One background task owns the Pub/Sub stream and fans messages out to the
//! local registry; a second applies channel subscribe/unsubscribe commands.
//! Publishing rides a [`ConnectionManager`], which reconnects on its own.

use crate::{BusError, Envelope, EventBus, Handler, Subscription};
use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

const DEFAULT_QUEUE_CAPACITY: usize = 64;

struct Subscriber {
    tx: mpsc::Sender<Envelope>,
    delivery: JoinHandle<()>,
}

enum Ctl {
    Subscribe(String),
    Unsubscribe(String),
}

/// Redis-backed [`EventBus`].
pub struct RedisBus {
    registry: Arc<RwLock<HashMap<String, HashMap<u64, Subscriber>>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    closed: AtomicBool,
    ctl_tx: mpsc::UnboundedSender<Ctl>,
    publish_conn: ConnectionManager,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Arc<Self>, BusError> {
        Self::connect_with_queue_capacity(url, DEFAULT_QUEUE_CAPACITY).await
    }

    pub async fn connect_with_queue_capacity(
        url: &str,
        queue_capacity: usize,
    ) -> Result<Arc<Self>, BusError> {
        let client = ::redis::Client::open(url)?;
        let publish_conn = ConnectionManager::new(client.clone()).await?;
        let pubsub = client.get_async_pubsub().await?;
        let (mut sink, mut stream) = pubsub.split();

        let registry: Arc<RwLock<HashMap<String, HashMap<u64, Subscriber>>>> =
            Arc::new(RwLock::new(HashMap::new()));

        // Channel-management task: keeps the Redis subscription set in sync
        // with the local registry.
        let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel::<Ctl>();
        let ctl_task = tokio::spawn(async move {
            while let Some(ctl) = ctl_rx.recv().await {
                let result = match ctl {
                    Ctl::Subscribe(topic) => sink.subscribe(&topic).await,
                    Ctl::Unsubscribe(topic) => sink.unsubscribe(&topic).await,
                };
                if let Err(e) = result {
                    tracing::error!(error = %e, "redis pubsub channel update failed");
                }
            }
        });

        // Fan-out task: one reader for the whole connection, dispatching to
        // local subscriber queues.
        let fanout_registry = registry.clone();
        let fanout_task = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let topic = msg.get_channel_name().to_string();
                let envelope: Envelope = match serde_json::from_slice(msg.get_payload_bytes()) {
                    Ok(env) => env,
                    Err(e) => {
                        tracing::warn!(topic = %topic, error = %e, "undecodable envelope on bus");
                        continue;
                    }
                };

                let senders: Vec<mpsc::Sender<Envelope>> = {
                    let registry = fanout_registry.read().await;
                    match registry.get(&topic) {
                        Some(subs) => subs.values().map(|s| s.tx.clone()).collect(),
                        None => continue,
                    }
                };
                for tx in senders {
                    if let Err(mpsc::error::TrySendError::Full(dropped)) =
                        tx.try_send(envelope.clone())
                    {
                        tracing::warn!(
                            topic = %topic,
                            event = %dropped.event,
                            "subscriber queue full, dropping envelope"
                        );
                    }
                }
            }
            tracing::info!("redis pubsub stream ended");
        });

        Ok(Arc::new(Self {
            registry,
            next_id: AtomicU64::new(1),
            queue_capacity,
            closed: AtomicBool::new(false),
            ctl_tx,
            publish_conn,
            tasks: Mutex::new(vec![ctl_task, fanout_task]),
        }))
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
impl EventBus for RedisBus {
    async fn subscribe(&self, topic: &str, handler: Handler) -> Result<Subscription, BusError> {
        self.ensure_open()?;

        let (tx, mut rx) = mpsc::channel::<Envelope>(self.queue_capacity);
        let delivery = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                handler(envelope).await;
            }
        });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.registry.write().await;
        let subs = registry.entry(topic.to_string()).or_default();
        let first_for_topic = subs.is_empty();
        subs.insert(id, Subscriber { tx, delivery });
        drop(registry);

        if first_for_topic {
            let _ = self.ctl_tx.send(Ctl::Subscribe(topic.to_string()));
        }

        Ok(Subscription {
            id,
            topic: topic.to_string(),
        })
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), BusError> {
        self.ensure_open()?;
        let bytes = serde_json::to_vec(&envelope)?;
        let mut conn = self.publish_conn.clone();
        let _receivers: i64 = conn.publish(topic, bytes).await?;
        Ok(())
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), BusError> {
        let mut registry = self.registry.write().await;
        let mut topic_empty = false;
        if let Some(subs) = registry.get_mut(&subscription.topic) {
            if let Some(sub) = subs.remove(&subscription.id) {
                sub.delivery.abort();
            }
            if subs.is_empty() {
                registry.remove(&subscription.topic);
                topic_empty = true;
            }
        }
        drop(registry);

        if topic_empty {
            let _ = self.ctl_tx.send(Ctl::Unsubscribe(subscription.topic.clone()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::Release);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let mut registry = self.registry.write().await;
        for (_, subs) in registry.drain() {
            for (_, sub) in subs {
                sub.delivery.abort();
            }
        }
        Ok(())
    }
}
