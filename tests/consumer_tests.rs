// Copyright (c) 2025 - Cowboy AI, Inc.
//! Event Consumer Tests
//!
//! Subscriptions over the in-memory broker: acknowledgement per delivery,
//! isolation between messages, subscription bookkeeping and resubscription
//! after the connection drops.

mod fixtures;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cim_messaging::broker::memory::{AckAction, AckRecord};
use cim_messaging::broker::{Broker, InMemoryBroker, MessageProperties};
use cim_messaging::{
    create_event, handler_fn, EventHandler, EventMetadata, MessagingError, SubscribeOptions,
};
use fixtures::*;
use pretty_assertions::assert_eq;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Handler forwarding every event id it sees
fn recording_handler() -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event.id().to_string());
            Ok(())
        }
    });
    (handler, rx)
}

fn acks_for(broker: &InMemoryBroker, message_id: &str) -> Vec<AckRecord> {
    broker
        .ack_log()
        .into_iter()
        .filter(|record| record.message_id.as_deref() == Some(message_id))
        .collect()
}

#[tokio::test]
async fn test_subscribe_before_initialize_is_rejected() {
    let (_broker, bus) = test_bus();
    let (handler, _rx) = recording_handler();

    let result = bus
        .consumer()
        .subscribe("q1", "User.*", handler, SubscribeOptions::default())
        .await;

    assert!(matches!(
        result,
        Err(MessagingError::NotInitialized {
            component: "EventConsumer"
        })
    ));
}

#[tokio::test]
async fn test_failing_message_does_not_affect_the_next() {
    // Given a handler that fails only for the first event
    let (broker, bus) = test_bus();
    bus.start().await.expect("start");
    let handled = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&handled);
    let handler = handler_fn(move |event| {
        let seen = Arc::clone(&seen);
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            if event.id() == EVENT_ID_1 {
                anyhow::bail!("cannot handle {}", event.id());
            }
            Ok(())
        }
    });
    bus.consumer()
        .subscribe("q1", "User.*", handler, SubscribeOptions::default())
        .await
        .expect("subscribe");

    // When two events arrive on the same subscription
    bus.publisher()
        .publish_event(&user_created_fixture())
        .await
        .expect("publish first");
    bus.publisher()
        .publish_event(&user_role_changed_fixture())
        .await
        .expect("publish second");

    // Then the failing one is rejected and the other acknowledged, once each
    eventually("both acknowledgements", || broker.ack_log().len() == 2).await;

    let first = acks_for(&broker, EVENT_ID_1);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].action, AckAction::Nack { requeue: false });
    assert_eq!(first[0].queue, "q1");

    let second = acks_for(&broker, EVENT_ID_3);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].action, AckAction::Ack);

    assert_eq!(handled.load(Ordering::SeqCst), 2);
    assert_eq!(broker.unacked_count("q1"), 0);
}

#[tokio::test]
async fn test_every_delivery_is_settled_exactly_once() {
    // Given a handler that fails for every even-numbered user, with prefetch > 1
    let (broker, bus) = test_bus();
    bus.start().await.expect("start");
    let handler = handler_fn(|event| async move {
        let index: u64 = event
            .aggregate_id
            .trim_start_matches("user-")
            .parse()
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(index % 4)).await;
        if index % 2 == 0 {
            anyhow::bail!("user {} is rejected", index);
        }
        Ok(())
    });
    bus.consumer()
        .subscribe("q1", "User.*", handler, SubscribeOptions::default())
        .await
        .expect("subscribe");

    // When a burst of events arrives
    let mut expected = Vec::new();
    for index in 0..24u64 {
        let event = create_event(
            "UserCreated",
            "User",
            &format!("user-{}", index),
            &user_created_json(EVENT_ID_1)["data"],
            EventMetadata::new(Uuid::new_v4(), SOURCE),
        )
        .expect("valid event");
        bus.publisher().publish_event(&event).await.expect("publish");
        let action = if index % 2 == 0 {
            AckAction::Nack { requeue: false }
        } else {
            AckAction::Ack
        };
        expected.push((event.id().to_string(), action));
    }

    // Then each message is acknowledged or rejected once, as its outcome dictates
    eventually("every delivery settled", || broker.ack_log().len() == expected.len()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.ack_log().len(), expected.len());
    for (id, action) in &expected {
        let records = acks_for(&broker, id);
        assert_eq!(records.len(), 1, "records for {}", id);
        assert_eq!(records[0].action, *action, "action for {}", id);
    }
    assert_eq!(broker.unacked_count("q1"), 0);
}

#[tokio::test]
async fn test_ack_waits_for_handler_to_finish() {
    // Given a handler that blocks until released
    let (broker, bus) = test_bus();
    bus.start().await.expect("start");
    let release = Arc::new(Notify::new());
    let (entered_tx, mut entered) = mpsc::unbounded_channel();
    let gate = Arc::clone(&release);
    let handler = handler_fn(move |_event| {
        let gate = Arc::clone(&gate);
        let entered_tx = entered_tx.clone();
        async move {
            let _ = entered_tx.send(());
            gate.notified().await;
            Ok(())
        }
    });
    bus.consumer()
        .subscribe("q1", "User.*", handler, SubscribeOptions::default())
        .await
        .expect("subscribe");

    bus.publisher()
        .publish_event(&user_created_fixture())
        .await
        .expect("publish");
    within(entered.recv()).await.expect("handler started");

    // While the handler runs nothing is settled
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.unacked_count("q1"), 1);
    assert!(acks_for(&broker, EVENT_ID_1).is_empty());

    // Once it completes the delivery is acknowledged
    release.notify_one();
    eventually("ack after release", || !acks_for(&broker, EVENT_ID_1).is_empty()).await;
    assert_eq!(acks_for(&broker, EVENT_ID_1)[0].action, AckAction::Ack);
    assert_eq!(broker.unacked_count("q1"), 0);
}

#[tokio::test]
async fn test_undecodable_payload_is_rejected_without_calling_handler() {
    let (broker, bus) = test_bus();
    bus.start().await.expect("start");
    let (handler, mut rx) = recording_handler();
    bus.consumer()
        .subscribe("q1", "User.#", handler, SubscribeOptions::default())
        .await
        .expect("subscribe");

    // Raw publish that bypasses the codec
    let connection = broker.connect("memory://raw").await.expect("connect");
    let channel = connection.open_channel().await.expect("channel");
    channel
        .basic_publish(
            "events",
            "User.UserCreated",
            true,
            b"{ not an event".to_vec(),
            MessageProperties {
                message_id: Some("garbage".to_string()),
                ..MessageProperties::default()
            },
        )
        .await
        .expect("raw publish");

    eventually("rejection of the garbage payload", || {
        !acks_for(&broker, "garbage").is_empty()
    })
    .await;
    assert_eq!(
        acks_for(&broker, "garbage")[0].action,
        AckAction::Nack { requeue: false }
    );
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_handler_timeout_rejects_message() {
    let (broker, bus) = test_bus();
    bus.start().await.expect("start");
    let handler = handler_fn(|_event| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    });
    bus.consumer()
        .subscribe(
            "slow",
            "User.*",
            handler,
            SubscribeOptions::default().with_handler_timeout(Duration::from_millis(20)),
        )
        .await
        .expect("subscribe");

    bus.publisher()
        .publish_event(&user_created_fixture())
        .await
        .expect("publish");

    eventually("timeout rejection", || !acks_for(&broker, EVENT_ID_1).is_empty()).await;
    let records = acks_for(&broker, EVENT_ID_1);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].queue, "slow");
    assert_eq!(records[0].routing_key, "User.UserCreated");
    assert_eq!(records[0].action, AckAction::Nack { requeue: false });
}

#[tokio::test]
async fn test_resubscribing_replaces_handler() {
    let (_broker, bus) = test_bus();
    bus.start().await.expect("start");
    let (first, mut first_rx) = recording_handler();
    let (second, mut second_rx) = recording_handler();

    let consumer = bus.consumer();
    consumer
        .subscribe("q1", "User.*", first, SubscribeOptions::default())
        .await
        .expect("first subscribe");
    consumer
        .subscribe("q1", "User.*", second, SubscribeOptions::default())
        .await
        .expect("second subscribe");
    assert_eq!(
        consumer.subscriptions(),
        vec![("q1".to_string(), "User.*".to_string())]
    );

    bus.publisher()
        .publish_event(&user_created_fixture())
        .await
        .expect("publish");

    assert_eq!(within(second_rx.recv()).await.as_deref(), Some(EVENT_ID_1));
    assert!(first_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unsubscribe_unknown_pair_is_noop() {
    let (_broker, bus) = test_bus();
    bus.start().await.expect("start");
    let (handler, _rx) = recording_handler();
    bus.consumer()
        .subscribe("q1", "User.*", handler, SubscribeOptions::default())
        .await
        .expect("subscribe");

    bus.consumer()
        .unsubscribe("q1", "Order.*")
        .await
        .expect("unknown pair is ignored");
    assert_eq!(bus.consumer().subscriptions().len(), 1);

    bus.consumer()
        .unsubscribe("q1", "User.*")
        .await
        .expect("unsubscribe");
    assert!(bus.consumer().subscriptions().is_empty());
}

#[tokio::test]
async fn test_subscriptions_resume_after_connection_loss() {
    // Given an active subscription
    let (broker, bus) = test_bus();
    bus.start().await.expect("start");
    let (handler, mut rx) = recording_handler();
    bus.consumer()
        .subscribe("q1", "User.*", handler, SubscribeOptions::default())
        .await
        .expect("subscribe");
    let before = bus.connection().generation();

    // When the broker drops every connection
    broker.disconnect_all("network partition");

    // Then the manager reconnects and the subscription keeps delivering
    eventually("reconnect", || {
        bus.connection().is_connected() && bus.connection().generation() > before
    })
    .await;
    bus.publisher()
        .publish_event(&user_created_fixture())
        .await
        .expect("publish after reconnect");

    assert_eq!(within(rx.recv()).await.as_deref(), Some(EVENT_ID_1));
    assert!(bus.consumer().is_ready());
}

#[tokio::test]
async fn test_close_cancels_consumers() {
    let (broker, bus) = test_bus();
    bus.start().await.expect("start");
    let (handler, _rx) = recording_handler();
    bus.consumer()
        .subscribe("q1", "User.*", handler, SubscribeOptions::default())
        .await
        .expect("subscribe");

    bus.consumer().close().await.expect("close");

    assert!(!bus.consumer().is_ready());
    assert!(bus.consumer().subscriptions().is_empty());
    assert_eq!(broker.open_connections(), 0);
}
