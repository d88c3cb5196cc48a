// Copyright (c) 2025 - Cowboy AI, Inc.
//! Event Publisher
//!
//! Validates, encodes and publishes envelopes on the configured topic exchange.
//!
//! Every message is published persistent and `mandatory`, with routing key
//! `{aggregateType}.{type}` and headers mirroring the envelope:
//!
//! | Header | Value |
//! |---|---|
//! | `type` | event type |
//! | `aggregateType` / `aggregateId` | aggregate identity |
//! | `correlationId` | `metadata.correlationId` |
//! | `source` | `metadata.source` |
//! | `x-original-routing-key` | routing key, used by dead-letter replay |

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::broker::{BrokerError, DeliveryMode, MessageProperties, PublishOutcome};
use crate::codec;
use crate::connection::ConnectionManager;
use crate::envelope::EventEnvelope;
use crate::errors::{MessagingError, MessagingResult};

/// Header carrying the routing key an event was first published with
pub const X_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";

/// JSON content type stamped on every message
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Publishes validated events
pub struct EventPublisher {
    connection: Arc<ConnectionManager>,
    ready: AtomicBool,
}

impl EventPublisher {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            ready: AtomicBool::new(false),
        }
    }

    /// Connect through the shared manager and mark the publisher ready
    pub async fn initialize(&self) -> MessagingResult<()> {
        self.connection.connect().await?;
        self.ready.store(true, Ordering::SeqCst);
        info!(exchange = %self.connection.config().exchange, "Event publisher initialized");
        Ok(())
    }

    /// Validate, encode and publish one event
    ///
    /// Invalid events fail before any broker interaction.
    pub async fn publish_event(&self, envelope: &EventEnvelope) -> MessagingResult<()> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(MessagingError::NotInitialized {
                component: "EventPublisher",
            });
        }

        let routing_key = envelope.routing_key();
        let payload = codec::encode(envelope)?;
        let channel = self.connection.channel()?;
        let exchange = &self.connection.config().exchange;

        let properties = message_properties(envelope, &routing_key);
        let outcome = channel
            .basic_publish(exchange, &routing_key, true, payload, properties)
            .await;

        match outcome {
            Ok(PublishOutcome::Routed(queues)) => {
                debug!(
                    event_id = %envelope.id(),
                    event_type = %envelope.event_type,
                    routing_key = %routing_key,
                    queues = queues,
                    "Published event"
                );
                Ok(())
            }
            Ok(PublishOutcome::Unroutable) => {
                warn!(
                    event_id = %envelope.id(),
                    routing_key = %routing_key,
                    exchange = %exchange,
                    "Published event matched no queue binding"
                );
                Ok(())
            }
            Err(BrokerError::BufferFull) => {
                warn!(event_id = %envelope.id(), routing_key = %routing_key, "Broker applied backpressure");
                Err(MessagingError::PublishBackpressure {
                    event_id: envelope.id().to_string(),
                })
            }
            Err(err @ (BrokerError::ChannelClosed | BrokerError::Connection(_))) => {
                Err(MessagingError::ConnectionLost(err.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Publish a batch concurrently
    ///
    /// Every publish runs to completion; the first failure in batch order is
    /// returned. Publishes that succeeded stay published.
    pub async fn publish_events(&self, envelopes: &[EventEnvelope]) -> MessagingResult<()> {
        let results =
            futures::future::join_all(envelopes.iter().map(|envelope| self.publish_event(envelope)))
                .await;

        let failed = results.iter().filter(|result| result.is_err()).count();
        if failed > 0 {
            warn!(
                total = envelopes.len(),
                failed = failed,
                "Batch publish partially failed"
            );
        }
        results.into_iter().collect::<MessagingResult<Vec<()>>>()?;
        Ok(())
    }

    /// Initialized and currently connected
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && self.connection.is_connected()
    }

    /// Mark not ready and close the shared connection; safe to call repeatedly
    pub async fn close(&self) -> MessagingResult<()> {
        self.ready.store(false, Ordering::SeqCst);
        self.connection.close().await
    }
}

fn message_properties(envelope: &EventEnvelope, routing_key: &str) -> MessageProperties {
    MessageProperties {
        message_id: Some(envelope.id().to_string()),
        timestamp: Some(Utc::now()),
        content_type: Some(CONTENT_TYPE_JSON.to_string()),
        delivery_mode: DeliveryMode::Persistent,
        headers: Default::default(),
    }
    .with_header("type", envelope.event_type.as_str())
    .with_header("aggregateType", envelope.aggregate_type.as_str())
    .with_header("aggregateId", envelope.aggregate_id.as_str())
    .with_header("correlationId", envelope.metadata.correlation_id.as_str())
    .with_header("source", envelope.metadata.source.as_str())
    .with_header(X_ORIGINAL_ROUTING_KEY, routing_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventMetadata;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_headers_mirror_envelope() {
        let envelope = EventEnvelope::builder("UserDeleted", "User", "user-7")
            .data(json!({}))
            .metadata(EventMetadata::new(Uuid::nil(), "accounts"))
            .build_unvalidated();

        let properties = message_properties(&envelope, "User.UserDeleted");

        assert_eq!(properties.message_id.as_deref(), Some(envelope.id()));
        assert_eq!(properties.delivery_mode, DeliveryMode::Persistent);
        assert_eq!(properties.content_type.as_deref(), Some("application/json"));
        assert_eq!(properties.header_str("type"), Some("UserDeleted"));
        assert_eq!(properties.header_str("aggregateType"), Some("User"));
        assert_eq!(properties.header_str("aggregateId"), Some("user-7"));
        assert_eq!(
            properties.header_str("correlationId"),
            Some("00000000-0000-0000-0000-000000000000")
        );
        assert_eq!(properties.header_str("source"), Some("accounts"));
        assert_eq!(
            properties.header_str(X_ORIGINAL_ROUTING_KEY),
            Some("User.UserDeleted")
        );
    }
}
