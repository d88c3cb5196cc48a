// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests for the Event Codec
//!
//! - valid events survive encode/decode unchanged
//! - an invalid envelope never produces bytes
//! - the routing key always joins aggregate type and event type
//! - payloads of unregistered types pass through untouched

use cim_messaging::{create_event, decode, encode, EventEnvelope, EventMetadata};
use proptest::prelude::*;
use serde_json::json;
use uuid::Uuid;

fn name() -> impl Strategy<Value = String> {
    "[A-Z][a-z]{1,15}( [A-Z][a-z]{1,15})?"
}

fn email() -> impl Strategy<Value = String> {
    ("[a-z][a-z0-9._]{0,10}", "[a-z]{2,10}", "(com|org|io|net)")
        .prop_map(|(local, domain, tld)| format!("{}@{}.{}", local, domain, tld))
}

fn role() -> impl Strategy<Value = Option<&'static str>> {
    prop_oneof![
        Just(None),
        Just(Some("admin")),
        Just(Some("agent")),
        Just(Some("customer")),
    ]
}

fn user_created() -> impl Strategy<Value = EventEnvelope> {
    (name(), name(), email(), role(), "[a-z0-9-]{1,24}", any::<u128>()).prop_map(
        |(first, last, email, role, aggregate_id, correlation)| {
            let mut data = json!({ "email": email, "firstName": first, "lastName": last });
            if let Some(role) = role {
                data["role"] = json!(role);
            }
            create_event(
                "UserCreated",
                "User",
                &aggregate_id,
                &data,
                EventMetadata::new(Uuid::from_u128(correlation), "property-tests"),
            )
            .expect("generated event is valid")
        },
    )
}

proptest! {
    #[test]
    fn prop_valid_events_roundtrip(event in user_created()) {
        let bytes = encode(&event).expect("valid event encodes");
        let decoded = decode(&bytes).expect("encoded event decodes");
        prop_assert_eq!(decoded, event);
    }

    #[test]
    fn prop_invalid_correlation_id_never_encodes(
        event in user_created(),
        junk in "[a-z ]{0,20}",
    ) {
        let mut event = event;
        event.metadata.correlation_id = junk;
        let err = encode(&event).unwrap_err();
        prop_assert!(err.to_string().contains("metadata.correlationId"));
    }

    #[test]
    fn prop_unregistered_payloads_pass_through(
        event_type in "[A-Z][A-Za-z]{2,20}Happened",
        value in any::<i64>(),
        label in "\\PC{0,30}",
    ) {
        let data = json!({ "value": value, "label": label });
        let event = create_event(
            &event_type,
            "Thing",
            "thing-1",
            &data,
            EventMetadata::new(Uuid::new_v4(), "property-tests"),
        )
        .expect("unregistered types are accepted");
        let decoded = decode(&encode(&event).expect("encodes")).expect("decodes");
        prop_assert_eq!(decoded.data, data);
    }

    #[test]
    fn prop_routing_key_joins_type_names(
        aggregate_type in "[A-Z][A-Za-z]{1,15}",
        event_type in "[A-Z][A-Za-z]{1,20}",
    ) {
        let envelope = EventEnvelope::builder(event_type.as_str(), aggregate_type.as_str(), "id-1")
            .build_unvalidated();
        prop_assert_eq!(envelope.routing_key(), format!("{}.{}", aggregate_type, event_type));
    }
}
