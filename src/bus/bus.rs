//! Request/reply bus: wraps a publisher and subscriber for a service.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::context::Context;
use super::handler::{panic_detail, Handler};
use super::packet::{Reply, ReplyPacket, RequestPacket};
use super::registry::{HandlerInfo, Registry};
use super::request::{Request, RequestType};
use super::{topic, Message, MessageStream, Publisher, Subscriber};
use crate::config::BusConfig;
use crate::error::BusError;

/// Request/reply bus over a publisher and subscriber.
///
/// Callers issue typed requests with [`send`](Bus::send) (fire-and-forget)
/// or [`request`](Bus::request) (await one reply, bounded by a timeout).
/// Services register handlers with [`subscribe`](Bus::subscribe); each
/// registered handler gets one task consuming its request topic.
///
/// Cloning a `Bus` shares the same registry and transport.
///
/// ## Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use sourced_cqrs::bus::{handler, Bus, InMemoryQueue, RequestPacket};
/// use sourced_cqrs::{Request, RequestType};
/// use tokio_util::sync::CancellationToken;
///
/// #[derive(Default, Serialize, Deserialize)]
/// struct CreateParty {
///     name: String,
/// }
///
/// impl Request for CreateParty {
///     type Result = String;
///
///     fn request_type(&self) -> RequestType {
///         RequestType::action("contacts", "party", "create")
///     }
/// }
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), sourced_cqrs::BusError> {
/// let bus = Bus::from_queue(InMemoryQueue::new());
///
/// bus.subscribe(
///     &CancellationToken::new(),
///     [handler(|_ctx, packet: RequestPacket<CreateParty>| async move {
///         Ok(format!("party {}", packet.request.name))
///     })],
/// )
/// .await?;
///
/// let created = bus.request(CreateParty { name: "Ada".into() }).await?;
/// assert_eq!(created, "party Ada");
///
/// bus.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Bus<P: Publisher, S: Subscriber> {
    inner: Arc<Inner<P, S>>,
}

struct Inner<P, S> {
    publisher: P,
    subscriber: S,
    config: BusConfig,
    registry: Registry,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: Publisher, S: Subscriber> Clone for Bus<P, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, S> Bus<P, S>
where
    P: Publisher + 'static,
    S: Subscriber + 'static,
{
    /// Create a new bus with the given publisher and subscriber.
    pub fn new(publisher: P, subscriber: S) -> Self {
        Self::with_config(publisher, subscriber, BusConfig::default())
    }

    /// Create a bus with explicit timeouts.
    pub fn with_config(publisher: P, subscriber: S, config: BusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                publisher,
                subscriber,
                config,
                registry: Registry::default(),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The bus configuration.
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Publish a request without waiting for a reply.
    ///
    /// The envelope is flagged `no_reply`, so the handling side does not
    /// publish one. A panic while marshaling or publishing is returned as
    /// [`BusError::Panicked`].
    pub async fn send<R: Request>(&self, request: R) -> Result<(), BusError> {
        self.ensure_open()?;
        guarded(async move {
            let packet = RequestPacket::outgoing(request, true)?;
            tracing::debug!(
                topic = %packet.request_topic,
                correlation_id = %packet.correlation_id,
                "sending request without reply"
            );
            self.inner
                .publisher
                .publish(&packet.request_topic, packet.message)
                .await?;
            Ok(())
        })
        .await
    }

    /// Publish a request and wait for its reply, bounded by the configured
    /// request timeout.
    pub async fn request<R: Request>(&self, request: R) -> Result<R::Result, BusError> {
        self.request_with_timeout(request, self.inner.config.request_timeout)
            .await
    }

    /// Publish a request and wait at most `timeout` for its reply.
    ///
    /// Returns exactly one of: the handler's result, the handler's error
    /// ([`BusError::Handler`]), a transport failure, a caught panic
    /// ([`BusError::Panicked`]), or [`BusError::Timeout`] naming the
    /// correlation id and topic.
    pub async fn request_with_timeout<R: Request>(
        &self,
        request: R,
        timeout: Duration,
    ) -> Result<R::Result, BusError> {
        self.ensure_open()?;
        guarded(async move {
            let packet = RequestPacket::outgoing(request, false)?;
            let correlation_id = packet.correlation_id.clone();
            let request_topic = packet.request_topic.clone();

            match tokio::time::timeout(timeout, self.round_trip(packet)).await {
                Ok(reply) => reply?.decode::<R::Result>(),
                Err(_) => {
                    tracing::debug!(
                        topic = %request_topic,
                        correlation_id = %correlation_id,
                        ?timeout,
                        "request timed out"
                    );
                    Err(BusError::Timeout {
                        correlation_id,
                        topic: request_topic,
                        timeout,
                    })
                }
            }
        })
        .await
    }

    async fn round_trip<R: Request>(
        &self,
        packet: RequestPacket<R>,
    ) -> Result<Reply<serde_json::Value>, BusError> {
        let call = self.inner.shutdown.child_token();
        // cancelled on every exit path, releasing the reply subscription
        let _release = call.clone().drop_guard();

        // subscribe before publishing so an immediate reply cannot be missed
        let mut replies = self
            .inner
            .subscriber
            .subscribe(&packet.reply_topic, call.clone())
            .await?;

        tracing::debug!(
            topic = %packet.request_topic,
            correlation_id = %packet.correlation_id,
            "sending request"
        );
        self.inner
            .publisher
            .publish(&packet.request_topic, packet.message)
            .await?;

        while let Some(mut delivery) = replies.next().await {
            delivery.ack();
            let (reply_packet, reply) = ReplyPacket::decode(delivery.message)?;
            if reply_packet.correlation_id != packet.correlation_id {
                tracing::debug!(
                    topic = %packet.reply_topic,
                    expected = %packet.correlation_id,
                    received = %reply_packet.correlation_id,
                    "ignoring reply for another request"
                );
                continue;
            }
            return Ok(reply);
        }

        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        Err(BusError::ReplyStreamClosed {
            correlation_id: packet.correlation_id,
        })
    }

    /// Register handlers, tying their subscriptions to `cancel`.
    ///
    /// Each handler is registered independently; failures (duplicate
    /// request type, transport subscribe error) are collected and returned
    /// together. Cancelling `cancel` tears down every subscription made
    /// here and frees their request types.
    pub async fn subscribe<I>(&self, cancel: &CancellationToken, handlers: I) -> Result<(), BusError>
    where
        I: IntoIterator<Item = Box<dyn Handler>>,
    {
        self.ensure_open()?;
        let mut errors = Vec::new();
        for handler in handlers {
            if let Err(err) = self.subscribe_one(cancel, Arc::from(handler)).await {
                tracing::warn!(error = %err, "handler registration failed");
                errors.push(err);
            }
        }
        match BusError::join(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn subscribe_one(
        &self,
        parent: &CancellationToken,
        handler: Arc<dyn Handler>,
    ) -> Result<(), BusError> {
        let request_type = handler.new_request().request_type();
        let key = request_type.to_string();
        let topic = topic::request_topic(&request_type);
        let cancel = parent.child_token();

        let info = HandlerInfo {
            request_type,
            result_type: handler.new_reply(),
        };
        let id = self.inner.registry.insert(info, cancel.clone())?;

        let stream = match self.inner.subscriber.subscribe(&topic, cancel.clone()).await {
            Ok(stream) => stream,
            Err(err) => {
                self.inner.registry.remove(&key, id);
                cancel.cancel();
                return Err(err.into());
            }
        };

        tracing::info!(request_type = %key, topic = %topic, "handler subscribed");

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            inner.receive_loop(handler, &key, id, cancel, stream).await;
        });

        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        Ok(())
    }

    /// Registered handlers, sorted by request type.
    pub fn handlers(&self) -> Vec<HandlerInfo> {
        self.inner.registry.infos()
    }

    /// Whether a handler for `request_type` is registered on this bus.
    pub fn is_registered(&self, request_type: &RequestType) -> bool {
        self.inner.registry.contains(request_type)
    }

    /// Shut the bus down: cancel every subscription, wait for the receive
    /// loops to exit, and fail later calls with [`BusError::Closed`].
    ///
    /// Handlers still running get the configured `shutdown_grace` to observe
    /// their cancelled context before they are dropped, so `close` waits at
    /// most that long for in-flight work.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.registry.cancel_all();

        let tasks = std::mem::take(
            &mut *self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "receive loop ended abnormally");
            }
        }
        tracing::info!("bus closed");
    }

    /// Whether [`close`](Bus::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Get a reference to the underlying publisher.
    pub fn publisher(&self) -> &P {
        &self.inner.publisher
    }

    /// Get a reference to the underlying subscriber.
    pub fn subscriber(&self) -> &S {
        &self.inner.subscriber
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

// Convenience: when publisher and subscriber are the same type (e.g., InMemoryQueue)
impl<T> Bus<T, T>
where
    T: Publisher + Subscriber + Clone + 'static,
{
    /// Create a bus from a unified queue that implements both Publisher and Subscriber.
    pub fn from_queue(queue: T) -> Self {
        Self::new(queue.clone(), queue)
    }

    /// Like [`from_queue`](Bus::from_queue), with explicit timeouts.
    pub fn from_queue_with_config(queue: T, config: BusConfig) -> Self {
        Self::with_config(queue.clone(), queue, config)
    }
}

impl<P, S> Inner<P, S>
where
    P: Publisher + 'static,
    S: Subscriber + 'static,
{
    /// Serve one subscription until it is cancelled, the bus shuts down,
    /// or the transport ends the stream. Messages are handled one at a
    /// time in delivery order.
    async fn receive_loop(
        &self,
        handler: Arc<dyn Handler>,
        key: &str,
        id: u64,
        cancel: CancellationToken,
        mut stream: MessageStream,
    ) {
        let _release = cancel.clone().drop_guard();

        loop {
            let mut delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                delivery = stream.next() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            // acknowledged before handling: a poisoned message is dropped,
            // never redelivered
            delivery.ack();
            let work = self.process(handler.as_ref(), &cancel, delivery.message);
            tokio::pin!(work);
            tokio::select! {
                _ = &mut work => {}
                _ = cancel.cancelled() => {
                    let grace = self.config.shutdown_grace;
                    if tokio::time::timeout(grace, &mut work).await.is_err() {
                        tracing::warn!(request_type = %key, ?grace, "abandoning in-flight handler");
                    }
                    break;
                }
            }
        }

        self.registry.remove(key, id);
        tracing::info!(request_type = %key, "handler unsubscribed");
    }

    async fn process(&self, handler: &dyn Handler, cancel: &CancellationToken, message: Message) {
        let mut request = handler.new_request();
        if let Err(err) = request.unmarshal(&message) {
            tracing::warn!(
                message_uuid = %message.uuid,
                correlation_id = message.correlation_id().unwrap_or_default(),
                error = %err,
                "dropping request that failed to unmarshal"
            );
            return;
        }

        let packet = match RequestPacket::incoming(message, request) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::warn!(error = %err, "dropping request without routing metadata");
                return;
            }
        };
        let correlation_id = packet.correlation_id.clone();
        let reply_topic = packet.reply_topic.clone();
        let no_reply = packet.no_reply;

        tracing::debug!(
            topic = %packet.request_topic,
            correlation_id = %correlation_id,
            "handling request"
        );

        let timeout = self.config.handler_timeout;
        let invocation = cancel.child_token();
        let _finished = invocation.clone().drop_guard();
        let ctx = Context::new(invocation, timeout);

        let reply = match tokio::time::timeout(timeout, handler.handle(ctx, packet)).await {
            Ok(reply) => reply,
            Err(_) => {
                tracing::warn!(correlation_id = %correlation_id, ?timeout, "handler timed out");
                Reply::err(format!("handler timed out after {:?}", timeout))
            }
        };

        if let Some(error) = &reply.error {
            tracing::debug!(correlation_id = %correlation_id, error = %error, "handler failed");
        }

        if no_reply {
            tracing::debug!(correlation_id = %correlation_id, "no reply requested");
            return;
        }

        let reply_packet = match ReplyPacket::new(&correlation_id, &reply) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::warn!(correlation_id = %correlation_id, error = %err, "reply could not be marshaled");
                return;
            }
        };

        if let Err(err) = self.publisher.publish(&reply_topic, reply_packet.message).await {
            // the caller's timeout is the backstop
            tracing::warn!(
                topic = %reply_topic,
                correlation_id = %correlation_id,
                error = %err,
                "failed to publish reply"
            );
        }
    }
}

/// Run an outgoing operation, turning a panic into [`BusError::Panicked`].
async fn guarded<T, F>(operation: F) -> Result<T, BusError>
where
    F: Future<Output = Result<T, BusError>>,
{
    match AssertUnwindSafe(operation).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let detail = panic_detail(panic);
            tracing::warn!(error = %detail, "outgoing request panicked");
            Err(BusError::Panicked(detail))
        }
    }
}
