//! Core publisher trait for the transport.

use async_trait::async_trait;
use thiserror::Error;

use super::Message;

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Encoding the envelope for the wire failed
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
    /// The broker rejected the message or subscription
    #[error("Rejected: {0}")]
    Rejected(String),
    /// The broker has been closed
    #[error("Broker closed")]
    Closed,
    /// Other error
    #[error("Transport error: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Trait for publishing messages to a named topic.
///
/// Implementations might include:
/// - `InMemoryQueue` - in-process fan-out
/// - `StreamQueue` - durable stream with consumer groups
/// - Redis Streams, NATS JetStream, Kafka adapters (external)
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a single message to `topic`.
    async fn publish(&self, topic: &str, message: Message) -> Result<(), PublishError>;

    /// Publish several messages to `topic`.
    ///
    /// Default implementation publishes sequentially.
    async fn publish_batch(&self, topic: &str, messages: Vec<Message>) -> Result<(), PublishError> {
        for message in messages {
            self.publish(topic, message).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<P: Publisher + ?Sized> Publisher for std::sync::Arc<P> {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), PublishError> {
        (**self).publish(topic, message).await
    }
}
