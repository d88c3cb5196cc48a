// Copyright (c) 2025 - Cowboy AI, Inc.
//! Dead-Letter Handler
//!
//! Provisions the quarantine for rejected messages and offers inspection,
//! replay and purge over it.
//!
//! # Topology
//!
//! ```text
//! queue q1 (x-dead-letter-exchange = events.dlx,
//!           x-dead-letter-routing-key = dlq.q1)
//!     │ nack(requeue = false)
//!     ▼
//! events.dlx (topic) ──#──▶ events.dlq (durable, 24h message TTL)
//!                                │
//!                                ▼ process_dead_letter_queue
//!                      processor(message) ──true──▶ republish to `events`
//!                                         └─false─▶ drop
//! ```
//!
//! Replayed messages carry an `x-requeue-count` header, incremented on every
//! replay. The routing key is recovered from `x-original-routing-key`, or from
//! the `aggregateType`/`type` headers when that is missing.
//!
//! Every message leaves the dead-letter queue once the processor has decided.
//! A replay whose publish keeps failing after [`REPLAY_PUBLISH_ATTEMPTS`]
//! tries (spaced by the reconnect delay) is rejected without requeue.

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broker::{
    BrokerChannel, Delivery, DeliveryMode, DeliveryStream, ExchangeKind, ExchangeOptions,
    HeaderValue, MessageProperties, PublishOutcome, QueueArguments, QueueOptions,
    X_FIRST_DEATH_QUEUE, X_FIRST_DEATH_REASON,
};
use crate::codec;
use crate::connection::ConnectionManager;
use crate::consumer::SubscribeOptions;
use crate::envelope::EventEnvelope;
use crate::errors::{MessagingError, MessagingResult};
use crate::publisher::X_ORIGINAL_ROUTING_KEY;

/// Header counting how often a message was replayed from the dead-letter queue
pub const X_REQUEUE_COUNT: &str = "x-requeue-count";

/// Publish attempts per replay before the message is given up
pub const REPLAY_PUBLISH_ATTEMPTS: u32 = 3;

/// Prefix of per-queue dead-letter routing keys
pub const DEAD_LETTER_KEY_PREFIX: &str = "dlq.";

/// A message parked in the dead-letter queue
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetteredMessage {
    /// Decoded envelope, if the payload is a valid event
    pub envelope: Option<EventEnvelope>,
    /// Payload as received
    pub raw: Vec<u8>,
    /// Queue the message was rejected from
    pub original_queue: String,
    /// Dead-letter routing key
    pub routing_key: String,
    /// Replays so far
    pub requeue_count: u32,
    /// Why the broker parked it (`rejected`, `expired`, ...)
    pub reason: Option<String>,
    pub properties: MessageProperties,
}

impl DeadLetteredMessage {
    pub fn from_delivery(delivery: &Delivery) -> Self {
        let properties = delivery.properties.clone();

        let original_queue = delivery
            .routing_key
            .strip_prefix(DEAD_LETTER_KEY_PREFIX)
            .filter(|queue| !queue.is_empty())
            .or_else(|| properties.header_str(X_FIRST_DEATH_QUEUE))
            .unwrap_or("unknown")
            .to_string();

        let requeue_count = properties
            .header(X_REQUEUE_COUNT)
            .and_then(HeaderValue::as_int)
            .and_then(|count| u32::try_from(count).ok())
            .unwrap_or(0);

        Self {
            envelope: codec::decode(&delivery.payload).ok(),
            raw: delivery.payload.clone(),
            original_queue,
            routing_key: delivery.routing_key.clone(),
            requeue_count,
            reason: properties.header_str(X_FIRST_DEATH_REASON).map(str::to_string),
            properties,
        }
    }

    /// Routing key to replay under
    pub fn replay_routing_key(&self) -> Option<String> {
        if let Some(key) = self.properties.header_str(X_ORIGINAL_ROUTING_KEY) {
            return Some(key.to_string());
        }
        let headers = (
            self.properties.header_str("aggregateType"),
            self.properties.header_str("type"),
        );
        if let (Some(aggregate_type), Some(event_type)) = headers {
            return Some(format!("{}.{}", aggregate_type, event_type));
        }
        self.envelope.as_ref().map(EventEnvelope::routing_key)
    }
}

/// Message and consumer counts of the dead-letter queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterStats {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Decides the fate of each dead-lettered message
///
/// `Ok(true)` replays the message, `Ok(false)` discards it. An error (or a
/// panic) drops it without replay.
#[async_trait]
pub trait DeadLetterProcessor: Send + Sync {
    async fn process(&self, message: &DeadLetteredMessage) -> anyhow::Result<bool>;
}

/// [`DeadLetterProcessor`] backed by an async closure
pub struct FnProcessor<F>(F);

#[async_trait]
impl<F, Fut> DeadLetterProcessor for FnProcessor<F>
where
    F: Fn(DeadLetteredMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    async fn process(&self, message: &DeadLetteredMessage) -> anyhow::Result<bool> {
        (self.0)(message.clone()).await
    }
}

/// Wrap an async closure as a shareable processor
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn DeadLetterProcessor>
where
    F: Fn(DeadLetteredMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    Arc::new(FnProcessor(f))
}

struct Drain {
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    task: JoinHandle<()>,
}

/// Owns the dead-letter exchange and queue
pub struct DeadLetterHandler {
    connection: Arc<ConnectionManager>,
    ready: AtomicBool,
    drain: Mutex<Option<Drain>>,
}

impl DeadLetterHandler {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            ready: AtomicBool::new(false),
            drain: Mutex::new(None),
        }
    }

    /// Declare the dead-letter exchange and queue
    pub async fn initialize(&self) -> MessagingResult<()> {
        self.connection.connect().await?;
        let channel = self.connection.channel()?;
        let config = self.connection.config();

        channel
            .exchange_declare(
                &config.dead_letter_exchange,
                ExchangeKind::Topic,
                ExchangeOptions::default(),
            )
            .await?;
        channel
            .queue_declare(
                &config.dead_letter_queue,
                QueueOptions {
                    arguments: QueueArguments {
                        message_ttl: Some(config.dead_letter_ttl),
                        ..QueueArguments::default()
                    },
                    ..QueueOptions::default()
                },
            )
            .await?;
        channel
            .queue_bind(&config.dead_letter_queue, &config.dead_letter_exchange, "#")
            .await?;

        self.ready.store(true, Ordering::SeqCst);
        info!(
            exchange = %config.dead_letter_exchange,
            queue = %config.dead_letter_queue,
            "Dead-letter handler initialized"
        );
        Ok(())
    }

    fn ensure_ready(&self) -> MessagingResult<()> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MessagingError::NotInitialized {
                component: "DeadLetterHandler",
            })
        }
    }

    /// Subscribe options that route rejects from `queue` into the dead-letter queue
    ///
    /// Pass these to [`crate::EventConsumer::subscribe`] so the consumer's
    /// declaration matches the one made by [`setup_dead_letter_queue`](Self::setup_dead_letter_queue).
    pub fn subscribe_options(&self, queue: &str) -> SubscribeOptions {
        SubscribeOptions::default()
            .with_dead_letter_exchange(self.connection.config().dead_letter_exchange.as_str())
            .with_dead_letter_routing_key(format!("{}{}", DEAD_LETTER_KEY_PREFIX, queue))
    }

    /// Declare `queue` with dead-lettering into the dead-letter exchange
    ///
    /// Returns the dead-letter exchange name.
    pub async fn setup_dead_letter_queue(&self, queue: &str) -> MessagingResult<String> {
        self.ensure_ready()?;
        let channel = self.connection.channel()?;
        let options = self.subscribe_options(queue);

        channel.queue_declare(queue, options.queue_options()).await?;

        let exchange = self.connection.config().dead_letter_exchange.clone();
        info!(queue = %queue, dead_letter_exchange = %exchange, "Dead-lettering configured");
        Ok(exchange)
    }

    /// Start draining the dead-letter queue through `processor`
    ///
    /// Replaces any drain already running.
    pub async fn process_dead_letter_queue(
        &self,
        processor: Arc<dyn DeadLetterProcessor>,
    ) -> MessagingResult<()> {
        self.ensure_ready()?;
        let channel = self.connection.channel()?;
        let config = self.connection.config();

        let consumer = channel.basic_consume(&config.dead_letter_queue).await?;
        let task = tokio::spawn(drain(
            Arc::clone(&channel),
            consumer.deliveries,
            processor,
            Replay {
                exchange: config.exchange.clone(),
                retry_delay: config.reconnect_delay,
            },
        ));

        let previous = self.drain.lock().replace(Drain {
            consumer_tag: consumer.consumer_tag,
            channel,
            task,
        });
        if let Some(previous) = previous {
            stop(previous).await;
        }

        info!(queue = %config.dead_letter_queue, "Processing dead-letter queue");
        Ok(())
    }

    pub async fn dead_letter_stats(&self) -> MessagingResult<DeadLetterStats> {
        self.ensure_ready()?;
        let channel = self.connection.channel()?;
        let stats = channel
            .queue_stats(&self.connection.config().dead_letter_queue)
            .await?;
        Ok(DeadLetterStats {
            message_count: stats.message_count,
            consumer_count: stats.consumer_count,
        })
    }

    /// Drop every parked message, returning how many were removed
    pub async fn purge_dead_letter_queue(&self) -> MessagingResult<u32> {
        self.ensure_ready()?;
        let channel = self.connection.channel()?;
        let queue = &self.connection.config().dead_letter_queue;
        let purged = channel.queue_purge(queue).await?;
        warn!(queue = %queue, purged = purged, "Purged dead-letter queue");
        Ok(purged)
    }

    /// Stop draining and release the connection manager
    ///
    /// The shared connection stays open for the other components.
    pub async fn close(&self) -> MessagingResult<()> {
        self.ready.store(false, Ordering::SeqCst);
        let running = self.drain.lock().take();
        if let Some(running) = running {
            stop(running).await;
        }
        Ok(())
    }
}

async fn stop(drain: Drain) {
    if drain.channel.is_open() {
        if let Err(err) = drain.channel.basic_cancel(&drain.consumer_tag).await {
            debug!(error = %err, "Dead-letter consumer cancel failed");
        }
    }
    drain.task.abort();
}

/// Where and how replays are published
struct Replay {
    exchange: String,
    retry_delay: Duration,
}

/// Process parked messages one at a time
async fn drain(
    channel: Arc<dyn BrokerChannel>,
    mut deliveries: DeliveryStream,
    processor: Arc<dyn DeadLetterProcessor>,
    replay: Replay,
) {
    while let Some(delivery) = deliveries.next().await {
        let message = DeadLetteredMessage::from_delivery(&delivery);
        let span = info_span!(
            "process_dead_letter",
            delivery_tag = delivery.delivery_tag,
            original_queue = %message.original_queue,
            requeue_count = message.requeue_count,
        );
        handle_dead_letter(channel.as_ref(), processor.as_ref(), &replay, delivery, message)
            .instrument(span)
            .await;
    }
    debug!("Dead-letter delivery stream ended");
}

async fn handle_dead_letter(
    channel: &dyn BrokerChannel,
    processor: &dyn DeadLetterProcessor,
    replay: &Replay,
    delivery: Delivery,
    message: DeadLetteredMessage,
) {
    let delivery_tag = delivery.delivery_tag;
    let decision = AssertUnwindSafe(processor.process(&message))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("dead-letter processor panicked")));

    let acknowledged = match decision {
        Ok(true) => match republish(channel, replay, &message).await {
            Ok(routing_key) => {
                info!(
                    routing_key = %routing_key,
                    requeue_count = message.requeue_count + 1,
                    "Replayed dead-lettered message"
                );
                channel.basic_ack(delivery_tag).await
            }
            Err(ReplayError::NoRoutingKey) => {
                error!("Cannot replay dead-lettered message without a routing key, dropping it");
                channel.basic_nack(delivery_tag, false).await
            }
            Err(ReplayError::Publish(reason)) => {
                error!(
                    error = %reason,
                    attempts = REPLAY_PUBLISH_ATTEMPTS,
                    "Replay publish failed, dropping dead-lettered message"
                );
                channel.basic_nack(delivery_tag, false).await
            }
        },
        Ok(false) => {
            info!(reason = ?message.reason, "Discarded dead-lettered message");
            channel.basic_ack(delivery_tag).await
        }
        Err(err) => {
            error!(error = %format!("{:#}", err), "Dead-letter processor failed, dropping message");
            channel.basic_nack(delivery_tag, false).await
        }
    };

    if let Err(err) = acknowledged {
        error!(delivery_tag = delivery_tag, error = %err, "Failed to acknowledge dead-lettered message");
    }
}

enum ReplayError {
    NoRoutingKey,
    Publish(String),
}

/// Republish to the main exchange with `x-requeue-count` incremented
async fn republish(
    channel: &dyn BrokerChannel,
    replay: &Replay,
    message: &DeadLetteredMessage,
) -> Result<String, ReplayError> {
    let routing_key = message
        .replay_routing_key()
        .ok_or(ReplayError::NoRoutingKey)?;

    let mut properties = message.properties.clone();
    properties.delivery_mode = DeliveryMode::Persistent;
    properties.headers.insert(
        X_REQUEUE_COUNT.to_string(),
        HeaderValue::Int(i64::from(message.requeue_count) + 1),
    );

    let mut attempt = 1;
    let outcome = loop {
        match channel
            .basic_publish(
                &replay.exchange,
                &routing_key,
                true,
                message.raw.clone(),
                properties.clone(),
            )
            .await
        {
            Ok(outcome) => break outcome,
            Err(err) if attempt >= REPLAY_PUBLISH_ATTEMPTS => {
                return Err(ReplayError::Publish(err.to_string()))
            }
            Err(err) => {
                warn!(attempt = attempt, error = %err, "Replay publish failed, retrying");
                attempt += 1;
                tokio::time::sleep(replay.retry_delay).await;
            }
        }
    };
    if outcome == PublishOutcome::Unroutable {
        warn!(routing_key = %routing_key, "Replayed message matched no queue binding");
    }
    Ok(routing_key)
}
