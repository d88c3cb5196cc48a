// Copyright (c) 2025 - Cowboy AI, Inc.
//! Event Publisher Tests
//!
//! Publishing against the in-memory broker: readiness, validation before any
//! broker interaction, headers and broker backpressure.

mod fixtures;

use std::sync::Arc;

use cim_messaging::broker::{DeliveryMode, InMemoryBroker};
use cim_messaging::publisher::X_ORIGINAL_ROUTING_KEY;
use cim_messaging::{ConnectionManager, EventPublisher, MessagingError};
use fixtures::*;
use pretty_assertions::assert_eq;

fn publisher(broker: &InMemoryBroker) -> EventPublisher {
    EventPublisher::new(ConnectionManager::new(Arc::new(broker.clone()), test_config()))
}

#[tokio::test]
async fn test_publish_before_initialize_is_rejected() {
    // Given a publisher that was never initialized
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker);

    // When publishing
    let result = publisher.publish_event(&user_created_fixture()).await;

    // Then nothing touched the broker
    assert!(matches!(
        result,
        Err(MessagingError::NotInitialized {
            component: "EventPublisher"
        })
    ));
    assert_eq!(broker.connect_attempts(), 0);
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn test_invalid_event_never_reaches_broker() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker);
    publisher.initialize().await.expect("initialize");

    let mut envelope = user_created_fixture();
    envelope.metadata.correlation_id = "not-a-uuid".to_string();

    let err = publisher.publish_event(&envelope).await.unwrap_err();
    let validation = err.validation().expect("validation failure");
    assert!(validation.mentions("metadata.correlationId"));
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn test_publish_routes_with_mirrored_headers() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker);
    publisher.initialize().await.expect("initialize");
    assert!(publisher.is_ready());

    publisher
        .publish_event(&user_created_fixture())
        .await
        .expect("publish");

    let published = broker.published();
    assert_eq!(published.len(), 1);
    let message = &published[0];
    assert_eq!(message.exchange, "events");
    assert_eq!(message.routing_key, "User.UserCreated");

    let properties = &message.properties;
    assert_eq!(properties.message_id.as_deref(), Some(EVENT_ID_1));
    assert_eq!(properties.content_type.as_deref(), Some("application/json"));
    assert_eq!(properties.delivery_mode, DeliveryMode::Persistent);
    assert_eq!(properties.header_str("type"), Some("UserCreated"));
    assert_eq!(properties.header_str("aggregateType"), Some("User"));
    assert_eq!(properties.header_str("aggregateId"), Some(USER_ID_1));
    assert_eq!(properties.header_str("correlationId"), Some(CORRELATION_ID_1));
    assert_eq!(properties.header_str("source"), Some(SOURCE));
    assert_eq!(
        properties.header_str(X_ORIGINAL_ROUTING_KEY),
        Some("User.UserCreated")
    );

    let decoded = cim_messaging::decode(&message.payload).expect("payload is a valid event");
    assert_eq!(decoded, user_created_fixture());
}

#[tokio::test]
async fn test_backpressure_surfaces_as_error() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker);
    publisher.initialize().await.expect("initialize");

    broker.set_flow_control(true);
    let err = publisher
        .publish_event(&user_created_fixture())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MessagingError::PublishBackpressure { ref event_id } if event_id == EVENT_ID_1
    ));

    broker.set_flow_control(false);
    publisher
        .publish_event(&user_created_fixture())
        .await
        .expect("publish after backpressure clears");
}

#[tokio::test]
async fn test_batch_reports_first_failure_and_keeps_successes() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker);
    publisher.initialize().await.expect("initialize");

    let batch = vec![
        user_created_fixture(),
        invalid_user_created_fixture(),
        user_role_changed_fixture(),
    ];
    let err = publisher.publish_events(&batch).await.unwrap_err();
    assert!(err.validation().is_some_and(|v| v.mentions("data.email")));

    let mut ids: Vec<String> = broker
        .published()
        .into_iter()
        .filter_map(|message| message.properties.message_id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec![EVENT_ID_1.to_string(), EVENT_ID_3.to_string()]);
}

#[tokio::test]
async fn test_close_makes_publisher_unready() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker);
    publisher.initialize().await.expect("initialize");

    tokio_test::assert_ok!(publisher.close().await);
    tokio_test::assert_ok!(publisher.close().await);

    assert!(!publisher.is_ready());
    assert_eq!(broker.open_connections(), 0);
    assert!(matches!(
        publisher.publish_event(&user_created_fixture()).await,
        Err(MessagingError::NotInitialized { .. })
    ));
}
