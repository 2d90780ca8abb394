//! In-memory publish/subscribe multiplexer.
//!
//! Intended for single-process development and testing. Each subscription
//! gets its own unbounded channel, so per-topic delivery order matches
//! publish order and a slow subscriber never blocks the publisher. There is
//! no persistence: a message published with no active subscriber is lost.
//!
//! The bus is an explicit instance owned by whoever constructs the
//! processor — its lifecycle is tied to its owner, not to process-wide
//! state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BoxFuture, BusError, EventBus, MessageHandler, Subscription};

/// Local fan-out bus. Group names are accepted but ignored: every
/// subscription is its own delivery path.
#[derive(Default)]
pub struct InMemoryBus {
    topics: DashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>,
    next_subscriber_id: AtomicU64,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |senders| senders.len())
    }
}

impl EventBus for InMemoryBus {
    fn publish(&self, topic: &str, payload: Bytes) -> BoxFuture<'_, Result<(), BusError>> {
        let delivered = match self.topics.get_mut(topic).as_deref_mut() {
            Some(senders) => {
                // Closed receivers mean the subscription task has exited;
                // drop their slots as we go.
                senders.retain(|tx| tx.send(payload.clone()).is_ok());
                senders.len()
            }
            None => 0,
        };
        if delivered == 0 {
            debug!(topic, "no active subscribers, message dropped");
        }
        Box::pin(async { Ok(()) })
    }

    fn subscribe(
        &self,
        topic: &str,
        _group: &str,
        consumer_id: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.topics.entry(topic.to_string()).or_default().push(tx);

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task_topic = topic.to_string();
        let task_consumer = consumer_id.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(payload) => {
                            if let Err(error) = handler.handle(payload).await {
                                warn!(
                                    topic = %task_topic,
                                    consumer = %task_consumer,
                                    %error,
                                    "subscriber handler failed, message skipped"
                                );
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!(topic = %task_topic, consumer = %task_consumer, subscriber = id, "delivery loop ended");
        });

        Ok(Subscription::new(topic, cancel, task))
    }
}
