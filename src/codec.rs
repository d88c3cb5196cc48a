// Copyright (c) 2025 - Cowboy AI, Inc.
//! Event Codec
//!
//! Converts [`EventEnvelope`]s to and from UTF-8 JSON bytes. Both directions
//! fail closed: nothing invalid is ever encoded, and nothing invalid is ever
//! handed out by `decode`.
//!
//! ```text
//! create_event ──▶ EventEnvelope ──encode──▶ bytes ──decode──▶ EventEnvelope
//!                        │                     ▲                    │
//!                        └──── validate ───────┘──── validate ──────┘
//! ```
//!
//! Timestamps nested inside `data` become ISO-8601 strings when the payload is
//! serialized into the envelope; only the top-level `timestamp` is restored to
//! a typed value on decode.

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::envelope::{EventEnvelope, EventMetadata};
use crate::errors::{
    DecodeError, EncodeError, IssueCode, MessagingResult, ValidationError, ValidationIssue,
};
use crate::schema::EventKind;

/// Result of [`validate_batch`]
#[derive(Debug, Default)]
pub struct BatchValidation {
    /// Valid envelopes, in input order
    pub valid: Vec<EventEnvelope>,
    /// Invalid envelopes with their errors, in input order
    pub invalid: Vec<(EventEnvelope, ValidationError)>,
}

/// Validate the base envelope, then its payload if the type is registered
pub fn validate(envelope: &EventEnvelope) -> Result<(), ValidationError> {
    let mut issues = envelope_issues(envelope);

    match EventKind::from_name(&envelope.event_type) {
        Some(kind) => issues.extend(kind.validate_data(&envelope.data)),
        None if !envelope.event_type.trim().is_empty() => {
            warn!(
                event_type = %envelope.event_type,
                event_id = %envelope.id(),
                "No schema registered for event type, accepting payload unchecked"
            );
        }
        None => {}
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(issues))
    }
}

fn envelope_issues(envelope: &EventEnvelope) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    check_uuid("id", envelope.id(), &mut issues);
    check_present("type", &envelope.event_type, &mut issues);
    check_present("aggregateType", &envelope.aggregate_type, &mut issues);
    check_present("aggregateId", &envelope.aggregate_id, &mut issues);
    check_uuid(
        "metadata.correlationId",
        &envelope.metadata.correlation_id,
        &mut issues,
    );
    if let Some(causation_id) = &envelope.metadata.causation_id {
        check_uuid("metadata.causationId", causation_id, &mut issues);
    }
    check_present("metadata.source", &envelope.metadata.source, &mut issues);

    if envelope.version < 1 {
        issues.push(ValidationIssue::new(
            "version",
            IssueCode::TooSmall,
            format!("must be a positive integer, got {}", envelope.version),
        ));
    }

    issues
}

fn check_present(path: &str, value: &str, issues: &mut Vec<ValidationIssue>) {
    if value.trim().is_empty() {
        issues.push(ValidationIssue::new(path, IssueCode::Required, "must not be empty"));
    }
}

fn check_uuid(path: &str, value: &str, issues: &mut Vec<ValidationIssue>) {
    if value.trim().is_empty() {
        issues.push(ValidationIssue::new(path, IssueCode::Required, "must not be empty"));
    } else if Uuid::parse_str(value).is_err() {
        issues.push(ValidationIssue::new(
            path,
            IssueCode::InvalidUuid,
            format!("'{}' is not a valid UUID", value),
        ));
    }
}

/// Validate then serialize; no bytes are produced for an invalid envelope
pub fn encode(envelope: &EventEnvelope) -> Result<Vec<u8>, EncodeError> {
    validate(envelope)?;
    let bytes = serde_json::to_vec(envelope)?;
    Ok(bytes)
}

/// Parse and re-validate transport bytes
pub fn decode(bytes: &[u8]) -> Result<EventEnvelope, DecodeError> {
    let envelope: EventEnvelope = serde_json::from_slice(bytes)?;
    validate(&envelope)?;
    Ok(envelope)
}

/// Assemble a validated envelope with a fresh id, the current time and version 1
///
/// `data` is serialized through serde, so any `chrono` timestamps inside it
/// (at any depth) end up as ISO-8601 strings.
pub fn create_event<T: Serialize>(
    event_type: &str,
    aggregate_type: &str,
    aggregate_id: &str,
    data: &T,
    metadata: EventMetadata,
) -> MessagingResult<EventEnvelope> {
    let data = serde_json::to_value(data).map_err(EncodeError::Serialization)?;
    let envelope = EventEnvelope::builder(event_type, aggregate_type, aggregate_id)
        .data(data)
        .metadata(metadata)
        .build()?;
    Ok(envelope)
}

/// Split a batch into valid and invalid envelopes without failing
pub fn validate_batch(envelopes: impl IntoIterator<Item = EventEnvelope>) -> BatchValidation {
    let mut result = BatchValidation::default();
    for envelope in envelopes {
        match validate(&envelope) {
            Ok(()) => result.valid.push(envelope),
            Err(err) => result.invalid.push((envelope, err)),
        }
    }
    result
}
