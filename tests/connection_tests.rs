// Copyright (c) 2025 - Cowboy AI, Inc.
//! Connection Manager Tests
//!
//! Reconnection is bounded, driven by the Disconnected/Connecting/Connected
//! state machine and stops for good once the manager is closed.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use cim_messaging::broker::InMemoryBroker;
use cim_messaging::{ConnectionManager, ConnectionState, MessagingError};
use fixtures::*;
use pretty_assertions::assert_eq;

fn manager(broker: &InMemoryBroker, max_attempts: u32) -> Arc<ConnectionManager> {
    let config = test_config()
        .with_reconnect_delay(Duration::from_millis(10))
        .with_max_reconnect_attempts(max_attempts);
    ConnectionManager::new(Arc::new(broker.clone()), config)
}

#[tokio::test]
async fn test_reconnect_attempts_are_bounded() {
    // Given a broker that refuses every connection
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(u32::MAX);
    let manager = manager(&broker, 3);

    // When connecting
    let result = manager.connect().await;

    // Then the first attempt fails and exactly three retries follow
    tokio_test::assert_err!(result);
    eventually("retries to run out", || broker.connect_attempts() == 4).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.connect_attempts(), 4);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(matches!(manager.channel(), Err(MessagingError::NotConnected)));
}

#[tokio::test]
async fn test_transient_failures_recover_in_background() {
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(2);
    let manager = manager(&broker, 5);

    assert!(manager.connect().await.is_err());

    eventually("background reconnect", || manager.is_connected()).await;
    assert_eq!(broker.connect_attempts(), 3);
    assert!(manager.channel().is_ok());
}

#[tokio::test]
async fn test_explicit_connect_resumes_after_giving_up() {
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(u32::MAX);
    let manager = manager(&broker, 1);

    assert!(manager.connect().await.is_err());
    eventually("retries to run out", || broker.connect_attempts() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    broker.fail_next_connects(0);
    manager.connect().await.expect("explicit connect");
    assert!(manager.is_connected());
}

#[tokio::test]
async fn test_connection_loss_triggers_reconnect() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker, 3);
    manager.connect().await.expect("connect");
    assert_eq!(manager.generation(), 1);

    broker.disconnect_all("broker restarted");

    eventually("reconnect", || {
        manager.generation() == 2 && manager.state() == ConnectionState::Connected
    })
    .await;
    assert!(manager.is_connected());
    assert_eq!(broker.open_connections(), 1);
    assert!(broker.exchange_exists("events"));
}

#[tokio::test]
async fn test_concurrent_connects_coalesce() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker, 3);

    let (first, second) = tokio::join!(manager.connect(), manager.connect());
    first.expect("first connect");
    second.expect("second connect");

    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test]
async fn test_close_is_idempotent_and_stops_reconnecting() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker, 3);
    manager.connect().await.expect("connect");

    tokio_test::assert_ok!(manager.close().await);
    tokio_test::assert_ok!(manager.close().await);

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(broker.open_connections(), 0);
    assert!(matches!(manager.connection(), Err(MessagingError::NotConnected)));

    let attempts = broker.connect_attempts();
    broker.disconnect_all("late failure");
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(broker.connect_attempts(), attempts);
}
