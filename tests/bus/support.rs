//! Shared request types and bus builders.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sourced_cqrs::bus::{
    handler, Handler, InMemoryQueue, LocalBus, Message, PublishError, Publisher, RequestPacket,
};
use sourced_cqrs::{Bus, BusConfig, HandlerError, Request, RequestType};

pub const SHORT: Duration = Duration::from_millis(200);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateParty {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyCreated {
    pub id: String,
    pub name: String,
}

impl Request for CreateParty {
    type Result = PartyCreated;

    fn request_type(&self) -> RequestType {
        RequestType::action("contacts", "party", "create")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteParty {
    pub id: String,
}

impl Request for DeleteParty {
    type Result = ();

    fn request_type(&self) -> RequestType {
        RequestType::action("contacts", "party", "delete")
    }
}

/// Echoes its payload back after `delay_ms`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Echo {
    pub payload: String,
    pub delay_ms: u64,
}

impl Request for Echo {
    type Result = String;

    fn request_type(&self) -> RequestType {
        RequestType::action("diagnostics", "echo", "send")
    }
}

/// Panics when `explode` is set, otherwise returns `n`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Volatile {
    pub n: u32,
    pub explode: bool,
}

impl Request for Volatile {
    type Result = u32;

    fn request_type(&self) -> RequestType {
        RequestType::action("diagnostics", "volatile", "run")
    }
}

pub fn local_bus() -> (LocalBus, InMemoryQueue) {
    let queue = InMemoryQueue::new();
    let config = BusConfig::default()
        .request_timeout(Duration::from_secs(5))
        .handler_timeout(Duration::from_secs(5));
    (Bus::from_queue_with_config(queue.clone(), config), queue)
}

pub fn create_party_handler() -> Box<dyn Handler> {
    handler(|_ctx, packet: RequestPacket<CreateParty>| async move {
        if packet.request.name.is_empty() {
            return Err(HandlerError::Rejected("name is required".into()));
        }
        Ok(PartyCreated {
            id: format!("party-{}", packet.request.name.to_lowercase()),
            name: packet.request.name,
        })
    })
}

pub fn echo_handler() -> Box<dyn Handler> {
    handler(|_ctx, packet: RequestPacket<Echo>| async move {
        tokio::time::sleep(Duration::from_millis(packet.request.delay_ms)).await;
        Ok(packet.request.payload)
    })
}

pub fn volatile_handler() -> Box<dyn Handler> {
    handler(|_ctx, packet: RequestPacket<Volatile>| async move {
        if packet.request.explode {
            panic!("volatile request {} exploded", packet.request.n);
        }
        Ok(packet.request.n)
    })
}

/// Publisher wrapper recording every topic published to.
#[derive(Clone)]
pub struct SpyPublisher {
    inner: InMemoryQueue,
    topics: Arc<Mutex<Vec<String>>>,
}

impl SpyPublisher {
    pub fn new(inner: InMemoryQueue) -> Self {
        Self {
            inner,
            topics: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().unwrap().clone()
    }

    pub fn reply_count(&self) -> usize {
        self.topics().iter().filter(|t| t.contains(":reply:")).count()
    }
}

#[async_trait]
impl Publisher for SpyPublisher {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), PublishError> {
        self.topics.lock().unwrap().push(topic.to_string());
        self.inner.publish(topic, message).await
    }
}
