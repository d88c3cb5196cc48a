// Copyright (c) 2025 - Cowboy AI, Inc.
//! Composition root
//!
//! [`EventBus`] builds one [`ConnectionManager`] and hands the same instance to
//! the publisher, consumer and dead-letter handler, so the process holds exactly
//! one logical broker connection.

use std::sync::Arc;
use tracing::info;

use crate::broker::Broker;
use crate::config::MessagingConfig;
use crate::connection::ConnectionManager;
use crate::consumer::EventConsumer;
use crate::dead_letter::DeadLetterHandler;
use crate::errors::MessagingResult;
use crate::publisher::EventPublisher;

/// Publisher, consumer and dead-letter handler over one shared connection
pub struct EventBus {
    connection: Arc<ConnectionManager>,
    publisher: EventPublisher,
    consumer: EventConsumer,
    dead_letters: DeadLetterHandler,
}

impl EventBus {
    pub fn new(broker: Arc<dyn Broker>, config: MessagingConfig) -> Self {
        let connection = ConnectionManager::new(broker, config);
        Self {
            publisher: EventPublisher::new(Arc::clone(&connection)),
            consumer: EventConsumer::new(Arc::clone(&connection)),
            dead_letters: DeadLetterHandler::new(Arc::clone(&connection)),
            connection,
        }
    }

    /// Event bus over NATS JetStream
    #[cfg(feature = "nats")]
    pub fn nats(config: MessagingConfig) -> Self {
        Self::new(Arc::new(crate::broker::NatsBroker::new()), config)
    }

    /// Connect and initialize every component
    pub async fn start(&self) -> MessagingResult<()> {
        self.publisher.initialize().await?;
        self.consumer.initialize().await?;
        self.dead_letters.initialize().await?;
        info!(url = %self.connection.config().broker_url, "Event bus started");
        Ok(())
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn consumer(&self) -> &EventConsumer {
        &self.consumer
    }

    pub fn dead_letters(&self) -> &DeadLetterHandler {
        &self.dead_letters
    }

    /// Shut everything down; safe to call repeatedly
    pub async fn close(&self) -> MessagingResult<()> {
        self.dead_letters.close().await?;
        self.consumer.close().await?;
        self.publisher.close().await?;
        self.connection.close().await
    }
}
