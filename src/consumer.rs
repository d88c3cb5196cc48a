// Copyright (c) 2025 - Cowboy AI, Inc.
//! Event Consumer
//!
//! Binds queues to the event exchange and feeds validated envelopes to
//! registered handlers.
//!
//! # Delivery Handling
//!
//! ```text
//! delivery ──decode+validate──▶ handler ──Ok──▶ ack
//!      │                           │
//!      └────── error ──────────────┴── error / panic / timeout ──▶ nack(requeue = false)
//! ```
//!
//! Each delivery gets exactly one ack or nack, issued after the handler has
//! finished. Failures are never requeued in place; the queue's dead-letter
//! exchange (if any) receives them instead.
//!
//! Deliveries run as separate tasks, at most `prefetch_count` at a time per
//! subscription. A slow handler therefore throttles intake.
//!
//! # Reconnection
//!
//! The consumer watches the connection manager. After every reconnect it
//! declares, binds and consumes again for each active subscription.

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};

use crate::broker::{BrokerChannel, Delivery, DeliveryStream, QueueArguments, QueueOptions};
use crate::codec;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::envelope::EventEnvelope;
use crate::errors::{MessagingError, MessagingResult};

/// Business logic invoked for each validated event
///
/// Returning an error (or panicking) rejects the message.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: EventEnvelope) -> anyhow::Result<()>;
}

/// [`EventHandler`] backed by an async closure
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: EventEnvelope) -> anyhow::Result<()> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Queue declaration and processing options for a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Exchange receiving rejected messages
    pub dead_letter_exchange: Option<String>,
    /// Routing key used when dead-lettering; the original key if unset
    pub dead_letter_routing_key: Option<String>,
    /// Handler deadline; unbounded if unset
    pub handler_timeout: Option<Duration>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            handler_timeout: None,
        }
    }
}

impl SubscribeOptions {
    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn with_dead_letter_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            arguments: QueueArguments {
                dead_letter_exchange: self.dead_letter_exchange.clone(),
                dead_letter_routing_key: self.dead_letter_routing_key.clone(),
                message_ttl: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubscriptionKey {
    queue: String,
    pattern: String,
}

struct Subscription {
    handler: Arc<dyn EventHandler>,
    options: SubscribeOptions,
    active: Option<ActiveConsumer>,
}

struct ActiveConsumer {
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    task: JoinHandle<()>,
}

impl ActiveConsumer {
    /// Stop new deliveries; in-flight ones still finish and acknowledge
    async fn cancel(&self) {
        if !self.channel.is_open() {
            return;
        }
        if let Err(err) = self.channel.basic_cancel(&self.consumer_tag).await {
            debug!(consumer_tag = %self.consumer_tag, error = %err, "Consumer cancel failed");
        }
    }
}

/// Consumes events from queues bound to the event exchange
pub struct EventConsumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    connection: Arc<ConnectionManager>,
    ready: AtomicBool,
    subscriptions: Mutex<HashMap<SubscriptionKey, Subscription>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventConsumer {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                connection,
                ready: AtomicBool::new(false),
                subscriptions: Mutex::new(HashMap::new()),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Connect through the shared manager and start watching for reconnects
    pub async fn initialize(&self) -> MessagingResult<()> {
        self.inner.connection.connect().await?;
        self.inner.ready.store(true, Ordering::SeqCst);

        let mut watcher = self.inner.watcher.lock();
        if watcher.is_none() {
            *watcher = Some(tokio::spawn(watch_reconnects(Arc::downgrade(&self.inner))));
        }
        info!("Event consumer initialized");
        Ok(())
    }

    /// Declare `queue`, bind it with `pattern` and start consuming into `handler`
    ///
    /// Subscribing an existing `(queue, pattern)` pair replaces its handler.
    pub async fn subscribe(
        &self,
        queue: &str,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> MessagingResult<()> {
        if !self.inner.ready.load(Ordering::SeqCst) {
            return Err(MessagingError::NotInitialized {
                component: "EventConsumer",
            });
        }

        let key = SubscriptionKey {
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        let active = self.inner.start(&key, &handler, &options).await?;
        let consumer_tag = active.consumer_tag.clone();

        let replaced = self.inner.subscriptions.lock().insert(
            key,
            Subscription {
                handler,
                options,
                active: Some(active),
            },
        );
        if let Some(previous) = replaced.and_then(|sub| sub.active) {
            previous.cancel().await;
        }

        info!(queue = %queue, pattern = %pattern, consumer_tag = %consumer_tag, "Subscribed");
        Ok(())
    }

    /// Stop consuming for `(queue, pattern)`; unknown pairs are ignored
    pub async fn unsubscribe(&self, queue: &str, pattern: &str) -> MessagingResult<()> {
        let key = SubscriptionKey {
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        let removed = self.inner.subscriptions.lock().remove(&key);

        match removed {
            Some(subscription) => {
                if let Some(active) = subscription.active {
                    active.cancel().await;
                }
                info!(queue = %queue, pattern = %pattern, "Unsubscribed");
            }
            None => debug!(queue = %queue, pattern = %pattern, "No subscription to remove"),
        }
        Ok(())
    }

    /// Active `(queue, pattern)` pairs, sorted
    pub fn subscriptions(&self) -> Vec<(String, String)> {
        let mut keys: Vec<(String, String)> = self
            .inner
            .subscriptions
            .lock()
            .keys()
            .map(|key| (key.queue.clone(), key.pattern.clone()))
            .collect();
        keys.sort();
        keys
    }

    /// Initialized and currently connected
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst) && self.inner.connection.is_connected()
    }

    /// Cancel every consumer, drop subscriptions and close the shared connection
    ///
    /// Deliveries still in flight are abandoned; the broker requeues them when
    /// the channel closes.
    pub async fn close(&self) -> MessagingResult<()> {
        self.inner.ready.store(false, Ordering::SeqCst);
        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.abort();
        }

        let drained: Vec<Subscription> = self
            .inner
            .subscriptions
            .lock()
            .drain()
            .map(|(_, subscription)| subscription)
            .collect();
        for active in drained.into_iter().filter_map(|sub| sub.active) {
            active.cancel().await;
            active.task.abort();
        }

        self.inner.connection.close().await
    }
}

impl ConsumerInner {
    async fn start(
        &self,
        key: &SubscriptionKey,
        handler: &Arc<dyn EventHandler>,
        options: &SubscribeOptions,
    ) -> MessagingResult<ActiveConsumer> {
        let channel = self.connection.channel()?;
        let config = self.connection.config();

        channel
            .queue_declare(&key.queue, options.queue_options())
            .await?;
        channel
            .queue_bind(&key.queue, &config.exchange, &key.pattern)
            .await?;
        let consumer = channel.basic_consume(&key.queue).await?;

        let task = tokio::spawn(consume(
            Arc::clone(&channel),
            consumer.deliveries,
            Arc::clone(handler),
            key.queue.clone(),
            options.handler_timeout,
            config.prefetch_count,
        ));

        Ok(ActiveConsumer {
            consumer_tag: consumer.consumer_tag,
            channel,
            task,
        })
    }

    /// Start every subscription again on the current channel
    async fn resubscribe_all(&self) {
        let snapshot: Vec<(SubscriptionKey, Arc<dyn EventHandler>, SubscribeOptions)> = self
            .subscriptions
            .lock()
            .iter()
            .map(|(key, sub)| (key.clone(), Arc::clone(&sub.handler), sub.options.clone()))
            .collect();

        for (key, handler, options) in snapshot {
            match self.start(&key, &handler, &options).await {
                Ok(active) => {
                    let stale = match self.subscriptions.lock().get_mut(&key) {
                        Some(subscription) => subscription.active.replace(active),
                        // unsubscribed while we were restarting it
                        None => Some(active),
                    };
                    if let Some(stale) = stale {
                        stale.cancel().await;
                    }
                    info!(queue = %key.queue, pattern = %key.pattern, "Resubscribed after reconnect");
                }
                Err(err) => {
                    error!(
                        queue = %key.queue,
                        pattern = %key.pattern,
                        error = %err,
                        "Failed to resubscribe after reconnect"
                    );
                }
            }
        }
    }
}

/// Restart subscriptions whenever the connection manager reconnects
async fn watch_reconnects(inner: Weak<ConsumerInner>) {
    let (mut states, mut seen) = match inner.upgrade() {
        Some(inner) => (inner.connection.watch_state(), inner.connection.generation()),
        None => return,
    };

    while states.changed().await.is_ok() {
        if *states.borrow_and_update() != ConnectionState::Connected {
            continue;
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let generation = inner.connection.generation();
        if generation == seen {
            continue;
        }
        seen = generation;
        if inner.ready.load(Ordering::SeqCst) {
            inner.resubscribe_all().await;
        }
    }
}

/// Consume one delivery stream, running up to `prefetch` handlers at once
async fn consume(
    channel: Arc<dyn BrokerChannel>,
    mut deliveries: DeliveryStream,
    handler: Arc<dyn EventHandler>,
    queue: String,
    handler_timeout: Option<Duration>,
    prefetch: u16,
) {
    let limit = Arc::new(Semaphore::new(usize::from(prefetch.max(1))));
    let mut in_flight = JoinSet::new();

    while let Some(delivery) = deliveries.next().await {
        let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
            break;
        };

        let span = info_span!(
            "process_event",
            queue = %queue,
            delivery_tag = delivery.delivery_tag,
            routing_key = %delivery.routing_key,
            event_id = field::Empty,
            event_type = field::Empty,
            correlation_id = field::Empty,
        );
        let channel = Arc::clone(&channel);
        let handler = Arc::clone(&handler);
        in_flight.spawn(
            async move {
                process_delivery(channel, handler, delivery, handler_timeout).await;
                drop(permit);
            }
            .instrument(span),
        );

        while let Some(Some(finished)) = in_flight.join_next().now_or_never() {
            if let Err(err) = finished {
                error!(queue = %queue, error = %err, "Delivery task failed");
            }
        }
    }

    while let Some(finished) = in_flight.join_next().await {
        if let Err(err) = finished {
            error!(queue = %queue, error = %err, "Delivery task failed");
        }
    }
    debug!(queue = %queue, "Delivery stream ended");
}

/// Decode, run the handler and issue exactly one ack or nack
async fn process_delivery(
    channel: Arc<dyn BrokerChannel>,
    handler: Arc<dyn EventHandler>,
    delivery: Delivery,
    handler_timeout: Option<Duration>,
) {
    let delivery_tag = delivery.delivery_tag;

    let outcome = match codec::decode(&delivery.payload) {
        Ok(envelope) => {
            let span = Span::current();
            span.record("event_id", envelope.id());
            span.record("event_type", envelope.event_type.as_str());
            span.record("correlation_id", envelope.correlation_id());
            run_handler(handler.as_ref(), envelope, handler_timeout).await
        }
        Err(err) => Err(anyhow::Error::new(err).context("message could not be decoded")),
    };

    let acknowledged = match outcome {
        Ok(()) => {
            debug!("Event handled");
            channel.basic_ack(delivery_tag).await
        }
        Err(err) => {
            warn!(error = %format!("{:#}", err), redelivered = delivery.redelivered, "Rejecting message");
            channel.basic_nack(delivery_tag, false).await
        }
    };

    if let Err(err) = acknowledged {
        error!(delivery_tag = delivery_tag, error = %err, "Failed to acknowledge delivery");
    }
}

async fn run_handler(
    handler: &dyn EventHandler,
    envelope: EventEnvelope,
    handler_timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let call = AssertUnwindSafe(handler.handle(envelope)).catch_unwind();

    let finished = match handler_timeout {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| anyhow::anyhow!("handler did not finish within {:?}", limit))?,
        None => call.await,
    };

    finished.map_err(|_| anyhow::anyhow!("handler panicked"))?
}
