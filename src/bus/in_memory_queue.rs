//! In-memory queue for in-process messaging.
//!
//! This module provides a thread-safe in-memory broker that implements
//! both `Publisher` and `Subscriber`, useful for:
//! - Modules of one process talking through the bus without coupling
//! - Unit and integration testing without external dependencies
//! - Development and prototyping

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{Delivery, Message, MessageStream, PublishError, Publisher, Subscriber};

/// In-memory fan-out broker.
///
/// Features:
/// - Thread-safe (can be shared across tasks via `Clone`)
/// - Every live subscriber of a topic receives every message published to it
/// - Messages published to a topic nobody listens on are dropped
/// - Cancelled subscriptions are removed from the topic
///
/// ## Example
///
/// ```
/// use futures::StreamExt;
/// use sourced_cqrs::bus::{InMemoryQueue, Message, Publisher, Subscriber};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() {
/// let queue = InMemoryQueue::new();
/// let mut stream = queue.subscribe("orders", CancellationToken::new()).await.unwrap();
///
/// queue.publish("orders", Message::new(b"{}".to_vec())).await.unwrap();
///
/// let delivery = stream.next().await.unwrap();
/// assert_eq!(delivery.message.payload_str(), Some("{}"));
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    /// Live subscribers per topic
    topics: Arc<Mutex<HashMap<String, Vec<TopicSubscriber>>>>,
    /// Subscription id source
    next_id: Arc<AtomicU64>,
    /// Fires when the queue is closed
    closed: CancellationToken,
}

struct TopicSubscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl InMemoryQueue {
    /// Create a new in-memory queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Topics with at least one live subscriber.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, subs)| subs.iter().any(|s| !s.tx.is_closed()))
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Close the queue: end every subscription and reject further use.
    pub fn close(&self) {
        self.closed.cancel();
        self.lock().clear();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<TopicSubscriber>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, topic: &str, id: u64) {
        let mut topics = self.lock();
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

#[async_trait]
impl Publisher for InMemoryQueue {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), PublishError> {
        if self.is_closed() {
            return Err(PublishError::Closed);
        }

        let mut topics = self.lock();
        let Some(subs) = topics.get_mut(topic) else {
            tracing::trace!(topic, "no subscribers, message dropped");
            return Ok(());
        };
        subs.retain(|s| !s.tx.is_closed());
        for sub in subs.iter() {
            // a receiver dropped since the retain is pruned on the next publish
            let _ = sub.tx.send(Delivery::new(message.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Subscriber for InMemoryQueue {
    async fn subscribe(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<MessageStream, PublishError> {
        if self.is_closed() {
            return Err(PublishError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .entry(topic.to_string())
            .or_default()
            .push(TopicSubscriber { id, tx });

        let queue = self.clone();
        let topic_name = topic.to_string();
        let until = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = queue.closed.cancelled() => {}
            }
            queue.remove(&topic_name, id);
        });

        Ok(Box::pin(
            UnboundedReceiverStream::new(rx).take_until(until.cancelled_owned()),
        ))
    }
}
