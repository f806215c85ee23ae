//! Timeouts, panics, and malformed messages.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize, Serializer};
use sourced_cqrs::bus::{
    handler, Bus, InMemoryQueue, Message, PublishError, Publisher, RequestPacket,
    CORRELATION_ID_KEY, NAME_KEY, REPLY_TOPIC_KEY, REQUEST_TOPIC_KEY,
};
use sourced_cqrs::{BusConfig, BusError, Request, RequestType};
use tokio_util::sync::CancellationToken;

use crate::support::{local_bus, volatile_handler, CreateParty, Echo, Volatile, SHORT};

#[tokio::test]
async fn request_without_handler_times_out() {
    let (bus, _queue) = local_bus();

    let started = Instant::now();
    let result = bus
        .request_with_timeout(
            CreateParty {
                name: "Ada".into(),
            },
            SHORT,
        )
        .await;
    let elapsed = started.elapsed();

    let err = result.unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert!(err.to_string().contains("cqrs:contacts.party.create"));
    assert!(elapsed >= SHORT, "returned early: {elapsed:?}");
    assert!(elapsed < SHORT + Duration::from_millis(300), "returned late: {elapsed:?}");
}

#[tokio::test]
async fn configured_timeout_applies_to_request() {
    let queue = InMemoryQueue::new();
    let bus = Bus::from_queue_with_config(queue, BusConfig::default().request_timeout(SHORT));

    let started = Instant::now();
    let err = bus.request(Echo::default()).await.unwrap_err();

    assert!(matches!(err, BusError::Timeout { timeout, .. } if timeout == SHORT));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn panic_does_not_stop_the_subscription() {
    let (bus, _queue) = local_bus();
    bus.subscribe(&CancellationToken::new(), [volatile_handler()])
        .await
        .unwrap();

    let err = bus
        .request(Volatile {
            n: 1,
            explode: true,
        })
        .await
        .unwrap_err();
    match err {
        BusError::Handler(message) => assert!(message.contains("exploded"), "{message}"),
        other => panic!("expected handler error, got {other:?}"),
    }

    let next = bus
        .request(Volatile {
            n: 2,
            explode: false,
        })
        .await
        .unwrap();
    assert_eq!(next, 2);
}

#[tokio::test]
async fn malformed_request_is_dropped_and_loop_continues() {
    let (bus, queue) = local_bus();
    bus.subscribe(&CancellationToken::new(), [volatile_handler()])
        .await
        .unwrap();

    let topic = "cqrs:diagnostics.volatile.run";
    let garbage = Message::new(b"not json".to_vec())
        .with_metadata(NAME_KEY, "diagnostics.volatile.run")
        .with_metadata(CORRELATION_ID_KEY, "garbage")
        .with_metadata(REQUEST_TOPIC_KEY, topic)
        .with_metadata(REPLY_TOPIC_KEY, format!("{topic}:reply:garbage"));
    queue.publish(topic, garbage).await.unwrap();

    let wrong_name = Message::marshal("diagnostics.echo.send", &Echo::default()).unwrap();
    queue.publish(topic, wrong_name).await.unwrap();

    let n = bus
        .request(Volatile {
            n: 7,
            explode: false,
        })
        .await
        .unwrap();
    assert_eq!(n, 7);
}

#[tokio::test]
async fn slow_handler_is_cut_off_by_handler_timeout() {
    let queue = InMemoryQueue::new();
    let config = BusConfig::default()
        .request_timeout(Duration::from_secs(5))
        .handler_timeout(Duration::from_millis(50));
    let bus = Bus::from_queue_with_config(queue, config);

    bus.subscribe(
        &CancellationToken::new(),
        [handler(|_ctx, packet: RequestPacket<Echo>| async move {
            tokio::time::sleep(Duration::from_millis(packet.request.delay_ms)).await;
            Ok(packet.request.payload)
        })],
    )
    .await
    .unwrap();

    let started = Instant::now();
    let err = bus
        .request(Echo {
            payload: "late".into(),
            delay_ms: 2_000,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, BusError::Handler(ref m) if m.contains("timed out")), "{err}");
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn bus_closed_mid_request_reports_closed() {
    let (bus, _queue) = local_bus();
    let caller = bus.clone();
    let pending = tokio::spawn(async move { caller.request(Echo::default()).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.close().await;

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("request did not return after close")
        .unwrap();
    assert!(matches!(result, Err(BusError::Closed)), "{result:?}");
}

/// A request whose encoding panics.
#[derive(Debug, Default, Deserialize)]
struct Unencodable;

impl Serialize for Unencodable {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        panic!("payload cannot be encoded")
    }
}

impl Request for Unencodable {
    type Result = ();

    fn request_type(&self) -> RequestType {
        RequestType::action("diagnostics", "broken", "encode")
    }
}

/// Publisher that panics on every publish.
struct PanickingPublisher;

#[async_trait]
impl Publisher for PanickingPublisher {
    async fn publish(&self, topic: &str, _message: Message) -> Result<(), PublishError> {
        panic!("broker exploded publishing to {topic}")
    }
}

#[tokio::test]
async fn panicking_encode_is_returned_to_sender() {
    let (bus, _queue) = local_bus();

    let sender = bus.clone();
    let sent = tokio::spawn(async move { sender.send(Unencodable).await })
        .await
        .expect("send unwound into the caller");
    assert!(
        matches!(sent, Err(BusError::Panicked(ref m)) if m.contains("cannot be encoded")),
        "{sent:?}"
    );

    let caller = bus.clone();
    let requested = tokio::spawn(async move { caller.request(Unencodable).await })
        .await
        .expect("request unwound into the caller");
    assert!(matches!(requested, Err(BusError::Panicked(_))), "{requested:?}");

    // the bus stays usable
    assert!(!bus.is_closed());
    bus.send(Echo::default()).await.unwrap();
}

#[tokio::test]
async fn panicking_publisher_is_returned_to_caller() {
    let queue = InMemoryQueue::new();
    let bus = Bus::with_config(PanickingPublisher, queue.clone(), BusConfig::default());

    let err = bus.request(Echo::default()).await.unwrap_err();
    assert!(matches!(err, BusError::Panicked(ref m) if m.contains("broker exploded")), "{err}");

    // the reply subscription opened before publishing is released
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(queue.topics().is_empty());
}

#[tokio::test]
async fn close_does_not_wait_past_grace_for_stuck_handlers() {
    let queue = InMemoryQueue::new();
    let config = BusConfig::default()
        .request_timeout(Duration::from_secs(5))
        .handler_timeout(Duration::from_secs(30))
        .shutdown_grace(Duration::from_millis(50));
    let bus = Bus::from_queue_with_config(queue, config);

    // ignores its context entirely
    bus.subscribe(
        &CancellationToken::new(),
        [handler(|_ctx, _p: RequestPacket<Echo>| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(String::new())
        })],
    )
    .await
    .unwrap();

    bus.send(Echo::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(2), bus.close())
        .await
        .expect("close waited on a stuck handler");
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(bus.handlers().is_empty());
}
