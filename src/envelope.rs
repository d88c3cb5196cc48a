// Copyright (c) 2025 - Cowboy AI, Inc.
//! Event Envelope
//!
//! The canonical, wire-format independent representation of a domain event.
//!
//! # Wire Shape
//!
//! ```json
//! {
//!   "id": "0b6f5c1e-...",
//!   "type": "UserCreated",
//!   "aggregateType": "User",
//!   "aggregateId": "user-123",
//!   "data": { "email": "a@b.com", "firstName": "John", "lastName": "Doe" },
//!   "metadata": { "correlationId": "6d1f...", "source": "svc" },
//!   "timestamp": "2025-01-15T10:30:00.000Z",
//!   "version": 1
//! }
//! ```
//!
//! Identifier fields are kept as strings so that an envelope received from
//! another process can be represented, and reported on, even when it is
//! invalid. [`crate::codec::validate`] decides whether it is acceptable.
//!
//! `id` and `timestamp` are fixed at construction and only readable.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::codec;
use crate::errors::ValidationError;

/// Current envelope schema version
pub const ENVELOPE_VERSION: u32 = 1;

/// Tracing and provenance information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Groups every event of one logical operation (must be a UUID)
    pub correlation_id: String,
    /// Event that directly caused this one (UUID when present)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Emitting service
    pub source: String,
}

impl EventMetadata {
    pub fn new(correlation_id: Uuid, source: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            causation_id: None,
            user_id: None,
            source: source.into(),
        }
    }

    /// Metadata for an event caused by `parent`: same correlation, causation = parent id
    pub fn caused_by(parent: &EventEnvelope, source: impl Into<String>) -> Self {
        Self {
            correlation_id: parent.metadata.correlation_id.clone(),
            causation_id: Some(parent.id().to_string()),
            user_id: parent.metadata.user_id.clone(),
            source: source.into(),
        }
    }

    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id.to_string());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// A domain event as it travels between services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    id: String,
    /// Event variant name, selects the payload schema
    #[serde(rename = "type")]
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    /// Schema-shaped payload
    pub data: Value,
    pub metadata: EventMetadata,
    #[serde(with = "iso_millis")]
    timestamp: DateTime<Utc>,
    pub version: u32,
}

impl EventEnvelope {
    /// Start building an envelope with a fresh id and the current time
    pub fn builder(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
    ) -> EventBuilder {
        EventBuilder {
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            data: Value::Object(Default::default()),
            metadata: EventMetadata::new(Uuid::new_v4(), "cim-messaging"),
        }
    }

    /// Unique event identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation time, millisecond precision
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Topic routing key: `{aggregateType}.{type}`
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.aggregate_type, self.event_type)
    }

    pub fn correlation_id(&self) -> &str {
        &self.metadata.correlation_id
    }
}

/// Assembles an [`EventEnvelope`]
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event_type: String,
    aggregate_type: String,
    aggregate_id: String,
    data: Value,
    metadata: EventMetadata,
}

impl EventBuilder {
    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Build and validate; never returns an invalid envelope
    pub fn build(self) -> Result<EventEnvelope, ValidationError> {
        let envelope = self.build_unvalidated();
        codec::validate(&envelope)?;
        Ok(envelope)
    }

    /// Build without validating
    ///
    /// For replaying or forwarding events whose validity is checked later.
    pub fn build_unvalidated(self) -> EventEnvelope {
        EventEnvelope {
            id: Uuid::new_v4().to_string(),
            event_type: self.event_type,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            data: self.data,
            metadata: self.metadata,
            timestamp: Utc::now().trunc_subsecs(3),
            version: ENVELOPE_VERSION,
        }
    }
}

/// ISO-8601 with millisecond precision and a `Z` suffix
mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(|err| de::Error::custom(format!("invalid timestamp '{}': {}", raw, err)))
    }
}
