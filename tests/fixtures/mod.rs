// Copyright (c) 2025 - Cowboy AI, Inc.
//! Test Fixtures for cim-messaging
//!
//! Deterministic envelopes plus helpers that wire components onto an
//! [`InMemoryBroker`]. All identifiers and timestamps are fixed constants.
#![allow(dead_code)]

use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cim_messaging::broker::InMemoryBroker;
use cim_messaging::{EventBus, EventEnvelope, MessagingConfig};

pub const EVENT_ID_1: &str = "01934f4a-0001-7000-8000-000000000001";
pub const EVENT_ID_2: &str = "01934f4a-0002-7000-8000-000000000002";
pub const EVENT_ID_3: &str = "01934f4a-0003-7000-8000-000000000003";

pub const USER_ID_1: &str = "user-1";

pub const CORRELATION_ID_1: &str = "01934f4a-c001-7000-8000-00000000c001";
pub const CAUSATION_ID_1: &str = "01934f4a-a001-7000-8000-00000000a001";

pub const FIXED_TIMESTAMP: &str = "2026-01-19T12:00:00.000Z";

pub const SOURCE: &str = "user-service";

/// Config with short reconnect delays for tests
pub fn test_config() -> MessagingConfig {
    MessagingConfig::default()
        .with_reconnect_delay(Duration::from_millis(20))
        .with_max_reconnect_attempts(3)
        .with_source(SOURCE)
}

/// Event bus on a fresh in-memory broker
pub fn test_bus() -> (InMemoryBroker, EventBus) {
    let broker = InMemoryBroker::new();
    let bus = EventBus::new(Arc::new(broker.clone()), test_config());
    (broker, bus)
}

/// Wire form of a valid `UserCreated` event
pub fn user_created_json(event_id: &str) -> Value {
    json!({
        "id": event_id,
        "type": "UserCreated",
        "aggregateType": "User",
        "aggregateId": USER_ID_1,
        "data": {
            "email": "ada@example.com",
            "firstName": "Ada",
            "lastName": "Lovelace",
            "role": "admin"
        },
        "metadata": {
            "correlationId": CORRELATION_ID_1,
            "source": SOURCE
        },
        "timestamp": FIXED_TIMESTAMP,
        "version": 1
    })
}

pub fn user_created_fixture() -> EventEnvelope {
    serde_json::from_value(user_created_json(EVENT_ID_1)).expect("Invalid envelope fixture")
}

pub fn user_created_with_id(event_id: &str) -> EventEnvelope {
    serde_json::from_value(user_created_json(event_id)).expect("Invalid envelope fixture")
}

/// `UserCreated` with a malformed email
pub fn invalid_user_created_fixture() -> EventEnvelope {
    let mut value = user_created_json(EVENT_ID_2);
    value["data"]["email"] = json!("not-an-email");
    serde_json::from_value(value).expect("Invalid envelope fixture")
}

/// `UserRoleChanged` caused by the `UserCreated` fixture
pub fn user_role_changed_fixture() -> EventEnvelope {
    serde_json::from_value(json!({
        "id": EVENT_ID_3,
        "type": "UserRoleChanged",
        "aggregateType": "User",
        "aggregateId": USER_ID_1,
        "data": { "previousRole": "customer", "newRole": "agent" },
        "metadata": {
            "correlationId": CORRELATION_ID_1,
            "causationId": CAUSATION_ID_1,
            "userId": "admin-7",
            "source": SOURCE
        },
        "timestamp": FIXED_TIMESTAMP,
        "version": 1
    }))
    .expect("Invalid envelope fixture")
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// Await `future` with a two second limit
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("operation timed out")
}
