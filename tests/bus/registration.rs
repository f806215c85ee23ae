//! Handler registration, cancellation, and shutdown.

use std::time::{Duration, Instant};

use sourced_cqrs::bus::{handler, HandlerInfo, RequestPacket};
use sourced_cqrs::{BusError, Request, RequestType};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::support::{
    create_party_handler, echo_handler, local_bus, volatile_handler, CreateParty, Echo,
    PartyCreated, SHORT,
};

#[tokio::test]
async fn second_registration_fails_without_disturbing_first() {
    let (bus, _queue) = local_bus();
    let cancel = CancellationToken::new();
    bus.subscribe(&cancel, [create_party_handler()]).await.unwrap();

    let duplicate = bus.subscribe(&cancel, [create_party_handler()]).await;
    assert!(matches!(
        duplicate,
        Err(BusError::DuplicateHandler(ref key)) if key == "contacts.party.create"
    ));

    let created = bus
        .request(CreateParty {
            name: "Ada".into(),
        })
        .await
        .unwrap();
    assert_eq!(created.id, "party-ada");
}

#[tokio::test]
async fn registration_errors_are_collected() {
    let (bus, _queue) = local_bus();
    let cancel = CancellationToken::new();
    bus.subscribe(&cancel, [create_party_handler()]).await.unwrap();

    let result = bus
        .subscribe(
            &cancel,
            [create_party_handler(), echo_handler(), create_party_handler()],
        )
        .await;

    match result {
        Err(BusError::Multiple(errors)) => {
            assert_eq!(errors.len(), 2);
            assert!(errors
                .iter()
                .all(|e| matches!(e, BusError::DuplicateHandler(_))));
        }
        other => panic!("expected joined errors, got {:?}", other),
    }

    // the valid handler in the batch was still registered
    assert!(bus.is_registered(&Echo::default().request_type()));
}

#[tokio::test]
async fn handlers_lists_registrations() {
    let (bus, _queue) = local_bus();
    bus.subscribe(
        &CancellationToken::new(),
        [echo_handler(), create_party_handler(), volatile_handler()],
    )
    .await
    .unwrap();

    let handlers = bus.handlers();
    let types: Vec<String> = handlers.iter().map(|h| h.request_type.to_string()).collect();
    assert_eq!(
        types,
        vec![
            "contacts.party.create",
            "diagnostics.echo.send",
            "diagnostics.volatile.run",
        ]
    );
    assert_eq!(
        handlers[0],
        HandlerInfo {
            request_type: RequestType::action("contacts", "party", "create"),
            result_type: std::any::type_name::<PartyCreated>(),
        }
    );
}

#[tokio::test]
async fn cancelling_registration_leads_to_timeouts() {
    let (bus, queue) = local_bus();
    let cancel = CancellationToken::new();
    bus.subscribe(&cancel, [create_party_handler(), echo_handler()])
        .await
        .unwrap();

    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(bus.handlers().is_empty());
    assert!(queue.topics().is_empty());

    let started = Instant::now();
    let result = bus
        .request_with_timeout(
            CreateParty {
                name: "Ada".into(),
            },
            SHORT,
        )
        .await;
    assert!(matches!(result, Err(ref e) if e.is_timeout()), "{:?}", result);
    assert!(started.elapsed() >= SHORT);

    // the request type is free again
    bus.subscribe(&CancellationToken::new(), [create_party_handler()])
        .await
        .unwrap();
}

#[tokio::test]
async fn request_type_is_free_as_soon_as_registration_is_cancelled() {
    let (bus, _queue) = local_bus();
    let first = CancellationToken::new();
    bus.subscribe(&first, [create_party_handler()]).await.unwrap();

    first.cancel();
    assert!(!bus.is_registered(&CreateParty::default().request_type()));
    assert!(bus.handlers().is_empty());

    bus.subscribe(&CancellationToken::new(), [create_party_handler()])
        .await
        .unwrap();

    // the first loop winding down must not evict the replacement
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(bus.is_registered(&CreateParty::default().request_type()));
    let created = bus
        .request(CreateParty {
            name: "Ada".into(),
        })
        .await
        .unwrap();
    assert_eq!(created.id, "party-ada");
}

#[tokio::test]
async fn cancellation_is_scoped_to_its_registration() {
    let (bus, _queue) = local_bus();
    let first = CancellationToken::new();
    let second = CancellationToken::new();
    bus.subscribe(&first, [create_party_handler()]).await.unwrap();
    bus.subscribe(&second, [echo_handler()]).await.unwrap();

    first.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!bus.is_registered(&CreateParty::default().request_type()));
    let echoed = bus
        .request(Echo {
            payload: "still here".into(),
            delay_ms: 0,
        })
        .await
        .unwrap();
    assert_eq!(echoed, "still here");
}

#[tokio::test]
async fn close_cancels_in_flight_handlers() {
    let (bus, _queue) = local_bus();
    let (cancelled_tx, cancelled_rx) = oneshot::channel();
    let cancelled_tx = std::sync::Mutex::new(Some(cancelled_tx));

    bus.subscribe(
        &CancellationToken::new(),
        [handler(move |ctx, _p: RequestPacket<Echo>| {
            let notify = cancelled_tx.lock().unwrap().take();
            async move {
                ctx.cancelled().await;
                if let Some(notify) = notify {
                    let _ = notify.send(());
                }
                Ok(String::new())
            }
        })],
    )
    .await
    .unwrap();

    bus.send(Echo::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    bus.close().await;

    tokio::time::timeout(Duration::from_secs(1), cancelled_rx)
        .await
        .expect("handler context was not cancelled")
        .unwrap();
    assert!(bus.handlers().is_empty());
}
