//! Service Bus - request/reply messaging between modules.
//!
//! Modules talk through typed requests without depending on each other:
//! the caller publishes a request to a topic derived from its
//! [`RequestType`], the owning module's handler answers on a reply topic
//! unique to that call.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Bus (per service)                         │
//! │  - send() / request() / subscribe() / close()               │
//! │  - registry: one handler per RequestType                    │
//! │  - one receive task per subscription                        │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Publisher + Subscriber Traits                   │
//! │  Publisher: publish(topic, message)                         │
//! │  Subscriber: subscribe(topic, cancel) -> stream of delivery │
//! └─────────────────────────────────────────────────────────────┘
//!          │                  │                     │
//!          ▼                  ▼                     ▼
//! ┌─────────────┐    ┌─────────────┐    ┌─────────────────────┐
//! │InMemoryQueue│    │ StreamQueue │    │ Redis / NATS / Kafka│
//! │ (in-process)│    │  (groups)   │    │    (external)       │
//! └─────────────┘    └─────────────┘    └─────────────────────┘
//! ```
//!
//! ## Request / reply
//!
//! ```text
//! caller                                   handler side
//!   │ subscribe cqrs:<type>:reply:<id>         │
//!   │ publish   cqrs:<type> ─────────────────▶ │ ack, unmarshal, handle
//!   │ ◀──────────────── cqrs:<type>:reply:<id> │ publish Reply
//!   │ (or timeout)                             │
//! ```

mod bus;
mod context;
mod handler;
#[cfg(feature = "in-memory")]
mod in_memory_queue;
mod message;
mod packet;
mod publisher;
mod registry;
mod request;
#[cfg(feature = "stream")]
mod stream_queue;
mod subscriber;
pub mod topic;

pub use bus::Bus;
pub use context::Context;
pub use handler::{handler, BoxedRequest, ErasedRequest, Handler, TypedHandler};
#[cfg(feature = "in-memory")]
pub use in_memory_queue::InMemoryQueue;
pub use message::{
    Message, CORRELATION_ID_KEY, NAME_KEY, NO_REPLY_KEY, REPLY_NAME, REPLY_TOPIC_KEY,
    REQUEST_TOPIC_KEY,
};
pub use packet::{Reply, ReplyPacket, RequestPacket};
pub use publisher::{PublishError, Publisher};
pub use registry::HandlerInfo;
pub use request::{Request, RequestType};
#[cfg(feature = "stream")]
pub use stream_queue::{StreamConsumer, StreamQueue};
pub use subscriber::{Delivery, MessageStream, Subscriber};

/// Bus over the in-process fan-out queue.
#[cfg(feature = "in-memory")]
pub type LocalBus = Bus<InMemoryQueue, InMemoryQueue>;

/// Bus over a durable stream, reading as one consumer group.
#[cfg(feature = "stream")]
pub type DistributedBus = Bus<StreamConsumer, StreamConsumer>;
