//! Durable stream-backed bus adapter.
//!
//! Publishing appends to a capped append-log per topic; subscriptions read
//! through named consumer-group cursors, so multiple consumers in one group
//! share delivery of a topic without duplicate processing while separate
//! groups each see every entry.
//!
//! Reads block for up to the configured timeout waiting for new entries
//! (no busy-polling); a timed-out read is simply retried, never an error.
//! Claiming a batch advances the group cursor before the handlers run, so
//! delivery is at-least-once and handlers must be idempotent with respect
//! to reprocessing the same envelope.
//!
//! The log lives in process memory. Entries trimmed by `max_len` are gone
//! for every group, caught-up or not — the cap bounds memory, not loss.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{BoxFuture, BusError, EventBus, MessageHandler, Subscription};
use crate::config::StreamBusConfig;

/// Append-log state for one topic.
#[derive(Debug, Default)]
struct TopicLog {
    /// Retained entries, oldest first, as (entry id, payload).
    entries: VecDeque<(u64, Bytes)>,
    /// Id assigned to the next appended entry.
    next_id: u64,
    /// Per-group cursor: the next entry id the group will claim.
    cursors: HashMap<String, u64>,
}

impl TopicLog {
    /// Claim up to `count` entries for a group, advancing its cursor.
    ///
    /// A group that has never read starts at the oldest retained entry; a
    /// group whose cursor fell behind the trim horizon resumes from there.
    fn claim(&mut self, group: &str, count: usize) -> Vec<Bytes> {
        let oldest = self.entries.front().map_or(self.next_id, |(id, _)| *id);
        let cursor = self.cursors.entry(group.to_string()).or_insert(oldest);
        let start = (*cursor).max(oldest);

        let batch: Vec<Bytes> = self
            .entries
            .iter()
            .skip_while(|(id, _)| *id < start)
            .take(count)
            .map(|(_, payload)| payload.clone())
            .collect();

        *cursor = start + batch.len() as u64;
        batch
    }
}

#[derive(Debug)]
struct StreamInner {
    config: StreamBusConfig,
    topics: Mutex<HashMap<String, TopicLog>>,
    appended: Notify,
    closed: AtomicBool,
}

impl StreamInner {
    /// Blocking batched read: returns a non-empty batch, or `None` once the
    /// bus is shut down and the group has drained.
    async fn next_batch(&self, topic: &str, group: &str) -> Option<Vec<Bytes>> {
        loop {
            // Register interest before claiming so an append between the
            // claim and the wait still wakes us.
            let notified = self.appended.notified();

            let batch = self.claim(topic, group, self.config.count);
            if !batch.is_empty() {
                return Some(batch);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            // Bounded wait; a timeout is a normal empty read and we retry.
            if timeout(self.config.block_timeout, notified).await.is_err() {
                trace!(topic, group, "blocking read timed out, retrying");
            }
        }
    }

    fn claim(&self, topic: &str, group: &str, count: usize) -> Vec<Bytes> {
        let mut topics = self.topics.lock();
        topics
            .get_mut(topic)
            .map_or_else(Vec::new, |log| log.claim(group, count))
    }
}

/// Stream-backed [`EventBus`] with consumer-group semantics.
///
/// Cheap to clone; clones share the same log.
#[derive(Clone, Debug)]
pub struct StreamBus {
    inner: Arc<StreamInner>,
}

impl StreamBus {
    pub fn new(config: StreamBusConfig) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                config,
                topics: Mutex::new(HashMap::new()),
                appended: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Stop accepting publishes and wake every blocked reader so delivery
    /// tasks can drain and exit.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.appended.notify_waiters();
        debug!("stream bus shut down");
    }

    /// Number of retained entries in a topic's log.
    pub fn log_len(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map_or(0, |log| log.entries.len())
    }

    /// Non-blocking consumer-group read: claim up to `count` entries past
    /// the group's cursor.
    ///
    /// This is the primitive the subscription loop builds its blocking read
    /// from; it is public so operational tooling can drain a group directly.
    pub fn read_group(&self, topic: &str, group: &str, count: usize) -> Vec<Bytes> {
        self.inner.claim(topic, group, count)
    }

    /// Point a group's cursor at the end of the log so only entries
    /// appended after this call are delivered to it.
    fn register_group(&self, topic: &str, group: &str) {
        let mut topics = self.inner.topics.lock();
        let log = topics.entry(topic.to_string()).or_default();
        log.cursors.entry(group.to_string()).or_insert(log.next_id);
    }
}

impl EventBus for StreamBus {
    fn publish(&self, topic: &str, payload: Bytes) -> BoxFuture<'_, Result<(), BusError>> {
        let result = if self.inner.closed.load(Ordering::SeqCst) {
            Err(BusError::Closed)
        } else {
            let mut topics = self.inner.topics.lock();
            let log = topics.entry(topic.to_string()).or_default();
            let id = log.next_id;
            log.next_id += 1;
            log.entries.push_back((id, payload));
            while log.entries.len() > self.inner.config.max_len {
                log.entries.pop_front();
            }
            drop(topics);
            self.inner.appended.notify_waiters();
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer_id: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.register_group(topic, group);

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let inner = Arc::clone(&self.inner);
        let task_topic = topic.to_string();
        let task_group = group.to_string();
        let task_consumer = consumer_id.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    batch = inner.next_batch(&task_topic, &task_group) => {
                        let Some(batch) = batch else { break };
                        for payload in batch {
                            if let Err(error) = handler.handle(payload).await {
                                warn!(
                                    topic = %task_topic,
                                    group = %task_group,
                                    consumer = %task_consumer,
                                    %error,
                                    "subscriber handler failed, entry skipped"
                                );
                            }
                        }
                    }
                }
            }
            debug!(topic = %task_topic, group = %task_group, consumer = %task_consumer, "delivery loop ended");
        });

        Ok(Subscription::new(topic, cancel, task))
    }
}
