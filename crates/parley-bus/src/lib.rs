//! # parley-bus
//!
//! Topic-addressed message delivery between the hub, the call handlers, and
//! the SFU. Delivery is at-most-once and fire-and-forget: publishing never
//! waits for subscribers, envelopes from one publisher reach each subscriber
//! in order, and nothing is promised across topics or across subscribers.
//!
//! Two backends implement the same [`EventBus`] contract:
//! - [`memory::MemoryBus`] — in-process, the default.
//! - [`redis::RedisBus`] — topics as Redis Pub/Sub channels, for multi-node
//!   deployments.

pub mod memory;
pub mod redis;
pub mod topic;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// The unit of delivery: where it goes, what it is, and the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    #[serde(rename = "type")]
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }
}

/// Subscriber callback. Invoked sequentially per subscription, so a handler
/// observes envelopes in publish order.
pub type Handler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle returned by `subscribe`; pass it back to `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub(crate) id: u64,
    pub(crate) topic: String,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus is closed")]
    Closed,

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// The swappable pub/sub contract.
///
/// Implementations must deliver at-most-once, preserve FIFO from a single
/// publisher to a single subscriber, and guarantee that no handler runs
/// after `unsubscribe` returns.
#[async_trait::async_trait]
pub trait EventBus: Send + Sync {
    async fn subscribe(&self, topic: &str, handler: Handler) -> Result<Subscription, BusError>;

    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), BusError>;

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), BusError>;

    async fn close(&self) -> Result<(), BusError>;
}

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |env| Box::pin(f(env)))
}
