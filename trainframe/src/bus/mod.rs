//! Topic-based publish/subscribe abstraction.
//!
//! The pipeline talks to its transport through the [`EventBus`] trait: an
//! at-least-once `publish` plus consumer-group `subscribe` returning a
//! detachable [`Subscription`]. Two interchangeable adapters are provided:
//!
//! - [`InMemoryBus`] — local multiplexer for single-process development and
//!   testing; every subscription is its own delivery path and group names
//!   are ignored; unconsumed messages are lost.
//! - [`StreamBus`] — capped append-log per topic with named consumer-group
//!   cursors and blocking batched reads; delivery within a topic preserves
//!   append order and entries may be redelivered after a restart, so
//!   handlers must be idempotent.
//!
//! Payloads are opaque [`Bytes`]; the processor owns envelope decoding. A
//! handler failure is isolated per message and logged — it never unwinds
//! the delivery loop or reaches other subscribers.

mod memory;
mod stream;

pub use memory::InMemoryBus;
pub use stream::StreamBus;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Topic carrying normalized vehicle events from producers to the processor.
pub const TOPIC_EVENTS_NORMALIZED: &str = "events.normalized";

/// Topic reserved for reduced-change notifications to downstream consumers.
///
/// Nothing in the core publishes it yet; the name is fixed here so producers
/// and consumers agree when it comes into use.
pub const TOPIC_STATE_DELTA: &str = "state.delta";

/// Consumer group for the feed-normalization stage.
pub const GROUP_NORMALIZER: &str = "normalizer";

/// Consumer group used by the processor's subscription.
pub const GROUP_PROCESSOR: &str = "processor";

/// Consumer group for the client-broadcast stage.
pub const GROUP_BROADCASTER: &str = "broadcaster";

/// Boxed future type for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error type a message handler may return. Always isolated and logged.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by transport operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,

    /// The transport could not accept or deliver the message.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Receives messages delivered by a subscription.
///
/// Dyn-compatible via [`BoxFuture`] so adapters can hold handlers as
/// `Arc<dyn MessageHandler>`.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, payload: Bytes) -> BoxFuture<'_, Result<(), HandlerError>>;
}

/// Adapts a plain async closure into a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    struct FnHandler<F>(F);

    impl<F, Fut> MessageHandler for FnHandler<F>
    where
        F: Fn(Bytes) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        fn handle(&self, payload: Bytes) -> BoxFuture<'_, Result<(), HandlerError>> {
            Box::pin((self.0)(payload))
        }
    }

    Arc::new(FnHandler(f))
}

/// Publish/subscribe contract implemented by every transport adapter.
pub trait EventBus: Send + Sync {
    /// Publish a message to a topic with at-least-once delivery toward
    /// subscribers. Never blocks on subscriber processing.
    fn publish(&self, topic: &str, payload: Bytes) -> BoxFuture<'_, Result<(), BusError>>;

    /// Attach a consumer to a topic.
    ///
    /// `group` partitions delivery so consumers sharing a group never both
    /// receive the same logical entry (meaningful only for the durable
    /// adapter). `consumer_id` identifies this consumer in logs. The
    /// returned [`Subscription`] detaches on `unsubscribe()` or drop.
    fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer_id: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError>;
}

/// Handle to an active subscription's delivery task.
///
/// Dropping the handle detaches the subscription; a handler already running
/// for a delivered message is allowed to complete.
pub struct Subscription {
    topic: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(topic: impl Into<String>, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            topic: topic.into(),
            cancel,
            task: Some(task),
        }
    }

    /// Topic this subscription is attached to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Detach from the topic. No further messages are delivered; the
    /// in-flight handler, if any, runs to completion on the delivery task.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        self.cancel.cancel();
        if self.task.take().is_some() {
            debug!(topic = %self.topic, "subscription detached");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
