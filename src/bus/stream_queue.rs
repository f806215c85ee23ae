//! Durable stream queue with consumer groups.
//!
//! Models a cross-process stream broker (Redis Streams style): each topic
//! is an append-only log of encoded records; consumer groups hold a shared
//! read cursor, so members of one group compete for entries while distinct
//! groups each see the whole stream. Delivered entries stay pending for
//! their group until acknowledged.
//!
//! Reply topics (`...:reply:<id>`) serve a single call. They are dropped
//! once their last reader leaves, and records appended to one nobody
//! reads are discarded.
//!
//! ```text
//!  topic "cqrs:contacts.party.create"
//!  ┌──────────┬──────────┬──────────┬──────────┐
//!  │ 1700-0   │ 1700-1   │ 1701-2   │ 1702-3   │  append-only
//!  └──────────┴──────────┴──────────┴──────────┘
//!        ▲ group "contacts" cursor   ▲ group "audit" cursor
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::topic::REPLY_SEPARATOR;
use super::{Delivery, Message, MessageStream, PublishError, Publisher, Subscriber};

/// Shared durable stream broker.
///
/// Cloning shares the same streams. Bind a bus instance to a consumer
/// group with [`StreamQueue::consumer`].
#[derive(Clone, Default)]
pub struct StreamQueue {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    streams: Mutex<HashMap<String, TopicStream>>,
    closed: CancellationToken,
}

#[derive(Default)]
struct TopicStream {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, ConsumerGroup>,
    next_seq: u64,
    notify: Arc<Notify>,
}

struct StreamEntry {
    id: String,
    record: Vec<u8>,
}

#[derive(Default)]
struct ConsumerGroup {
    /// Index of the next undelivered entry
    cursor: usize,
    /// Live subscriptions reading as this group
    members: usize,
    /// Delivered, unacknowledged entry ids with their delivery count
    pending: BTreeMap<String, u32>,
}

impl StreamQueue {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport handle reading as member of consumer group `group`.
    pub fn consumer(&self, group: impl Into<String>) -> StreamConsumer {
        StreamConsumer {
            queue: self.clone(),
            group: group.into(),
        }
    }

    /// Number of topics the broker currently holds.
    pub fn topic_count(&self) -> usize {
        self.lock().len()
    }

    /// Number of entries ever appended to `topic`.
    pub fn len(&self, topic: &str) -> usize {
        self.lock().get(topic).map(|s| s.entries.len()).unwrap_or(0)
    }

    /// Whether `topic` has no entries.
    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Entry ids of `topic`, oldest first.
    pub fn entry_ids(&self, topic: &str) -> Vec<String> {
        self.lock()
            .get(topic)
            .map(|s| s.entries.iter().map(|e| e.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Delivered but unacknowledged entry ids for `group` on `topic`.
    pub fn pending(&self, topic: &str, group: &str) -> Vec<String> {
        self.lock()
            .get(topic)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Close the broker: end every subscription and reject further use.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TopicStream>> {
        self.inner
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a record, returning its entry id. `None` when the topic is a
    /// reply topic without readers.
    fn append(&self, topic: &str, record: Vec<u8>) -> Option<String> {
        let mut streams = self.lock();
        if is_reply_topic(topic) && streams.get(topic).map_or(true, |s| s.groups.is_empty()) {
            return None;
        }
        let stream = streams.entry(topic.to_string()).or_default();
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let id = format!("{}-{}", millis, stream.next_seq);
        stream.next_seq += 1;
        stream.entries.push(StreamEntry {
            id: id.clone(),
            record,
        });
        stream.notify.notify_waiters();
        Some(id)
    }

    /// Register `group` on `topic` (reading from the start) and return the
    /// topic's wakeup handle.
    fn join_group(&self, topic: &str, group: &str) -> Arc<Notify> {
        let mut streams = self.lock();
        let stream = streams.entry(topic.to_string()).or_default();
        stream.groups.entry(group.to_string()).or_default().members += 1;
        Arc::clone(&stream.notify)
    }

    /// Drop one member from `group`. The last reader of a reply topic
    /// takes the topic with it.
    fn leave_group(&self, topic: &str, group: &str) {
        let mut streams = self.lock();
        let Some(stream) = streams.get_mut(topic) else {
            return;
        };
        if let Some(consumer_group) = stream.groups.get_mut(group) {
            consumer_group.members = consumer_group.members.saturating_sub(1);
            if consumer_group.members == 0 && is_reply_topic(topic) {
                stream.groups.remove(group);
            }
        }
        if stream.groups.is_empty() && is_reply_topic(topic) {
            streams.remove(topic);
        }
    }

    /// Advance the group cursor and mark the entry pending.
    fn claim_next(&self, topic: &str, group: &str) -> Option<(String, Vec<u8>)> {
        let mut streams = self.lock();
        let stream = streams.get_mut(topic)?;
        let consumer_group = stream.groups.get_mut(group)?;
        let entry = stream.entries.get(consumer_group.cursor)?;
        consumer_group.cursor += 1;
        *consumer_group.pending.entry(entry.id.clone()).or_insert(0) += 1;
        Some((entry.id.clone(), entry.record.clone()))
    }

    fn ack(&self, topic: &str, group: &str, id: &str) {
        if let Some(consumer_group) = self
            .lock()
            .get_mut(topic)
            .and_then(|s| s.groups.get_mut(group))
        {
            consumer_group.pending.remove(id);
        }
    }
}

/// A [`StreamQueue`] handle bound to one consumer group.
#[derive(Clone)]
pub struct StreamConsumer {
    queue: StreamQueue,
    group: String,
}

impl StreamConsumer {
    /// The consumer group this handle reads as.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The shared broker.
    pub fn queue(&self) -> &StreamQueue {
        &self.queue
    }
}

#[async_trait]
impl Publisher for StreamConsumer {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), PublishError> {
        if self.queue.is_closed() {
            return Err(PublishError::Closed);
        }
        let record = bitcode::serialize(&message)
            .map_err(|e| PublishError::SerializationFailed(e.to_string()))?;
        match self.queue.append(topic, record) {
            Some(id) => tracing::trace!(topic, entry_id = %id, "appended stream entry"),
            None => tracing::debug!(topic, "reply topic has no reader, record discarded"),
        }
        Ok(())
    }
}

#[async_trait]
impl Subscriber for StreamConsumer {
    async fn subscribe(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<MessageStream, PublishError> {
        if self.queue.is_closed() {
            return Err(PublishError::Closed);
        }

        let notify = self.queue.join_group(topic, &self.group);
        let (tx, rx) = mpsc::channel(1);
        let queue = self.queue.clone();
        let group = self.group.clone();
        let topic = topic.to_string();
        let until = cancel.clone();

        tokio::spawn(async move {
            let closed = queue.inner.closed.clone();
            loop {
                // only claim an entry once the consumer has room for it
                let permit = tokio::select! {
                    permit = tx.reserve() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = cancel.cancelled() => break,
                    _ = closed.cancelled() => break,
                };

                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let (id, record) = match queue.claim_next(&topic, &group) {
                    Some(entry) => entry,
                    None => {
                        drop(permit);
                        tokio::select! {
                            _ = &mut notified => {}
                            _ = cancel.cancelled() => break,
                            _ = closed.cancelled() => break,
                        }
                        continue;
                    }
                };

                match bitcode::deserialize::<Message>(&record) {
                    Ok(message) => {
                        let acker = queue.clone();
                        let (ack_topic, ack_group) = (topic.clone(), group.clone());
                        permit.send(Delivery::with_ack(message, move || {
                            acker.ack(&ack_topic, &ack_group, &id)
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(topic = %topic, entry_id = %id, error = %err, "undecodable stream entry skipped");
                        queue.ack(&topic, &group, &id);
                    }
                }
            }
            queue.leave_group(&topic, &group);
        });

        Ok(Box::pin(
            ReceiverStream::new(rx).take_until(until.cancelled_owned()),
        ))
    }
}

fn is_reply_topic(topic: &str) -> bool {
    topic.contains(REPLY_SEPARATOR)
}
