//! Core subscriber trait for the transport.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use super::publisher::PublishError;
use super::Message;

/// A message handed to a subscriber, with its acknowledgement.
pub struct Delivery {
    /// The delivered envelope.
    pub message: Message,
    ack: Option<Box<dyn FnOnce() + Send>>,
}

impl Delivery {
    /// A delivery that needs no acknowledgement.
    pub fn new(message: Message) -> Self {
        Self { message, ack: None }
    }

    /// A delivery whose `ack` runs `on_ack`.
    pub fn with_ack(message: Message, on_ack: impl FnOnce() + Send + 'static) -> Self {
        Self {
            message,
            ack: Some(Box::new(on_ack)),
        }
    }

    /// Acknowledge the delivery. Later calls are no-ops.
    pub fn ack(&mut self) {
        if let Some(ack) = self.ack.take() {
            ack();
        }
    }

    /// Whether this delivery still awaits acknowledgement.
    pub fn is_pending(&self) -> bool {
        self.ack.is_some()
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Stream of deliveries for one subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Trait for subscribing to a named topic.
///
/// The returned stream ends once `cancel` fires (or the broker closes);
/// implementations release their per-subscription resources then.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscribe to `topic` until `cancel` fires.
    async fn subscribe(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<MessageStream, PublishError>;
}

#[async_trait]
impl<S: Subscriber + ?Sized> Subscriber for std::sync::Arc<S> {
    async fn subscribe(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<MessageStream, PublishError> {
        (**self).subscribe(topic, cancel).await
    }
}
