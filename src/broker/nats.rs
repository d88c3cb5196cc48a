// Copyright (c) 2025 - Cowboy AI, Inc.
//! NATS JetStream broker client
//!
//! Maps the AMQP-style broker surface onto JetStream:
//!
//! | Broker concept | JetStream |
//! |---|---|
//! | exchange `events.dlx` | stream `EVENTS_DLX` with subjects `events_dlx.>` |
//! | routing key `User.UserCreated` | subject `events.User.UserCreated` |
//! | queue + binding | durable pull consumer filtered on the binding pattern |
//! | `#` / `*` wildcards | `>` (trailing only) / `*` |
//! | prefetch | `max_ack_pending` |
//! | ack / requeue-nack | `ack` / `Nak` |
//! | reject-nack | republish to the dead-letter exchange, then `Term` |
//! | purge | stream purge filtered on the binding subjects |
//! | message id | `x-message-id`; `Nats-Msg-Id` adds the requeue count |
//!
//! JetStream drops a publish whose `Nats-Msg-Id` it already stored within the
//! stream's duplicate window. Replays and dead-letter republishes of the same
//! event therefore publish under `{id}:{requeue-count}`, and an ack flagged as
//! duplicate is reported as [`BrokerError::Duplicate`].
//!
//! Per-queue message TTL has no JetStream equivalent at consumer level and is
//! not enforced; configure `max_age` on the dead-letter stream instead.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    context::PublishErrorKind,
    AckKind,
};
use async_nats::{ConnectOptions, Event, HeaderMap};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use super::topic;
use super::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerResult, ConnectionEvent,
    ConsumerHandle, Delivery, DeliveryMode, ExchangeKind, ExchangeOptions, HeaderValue,
    MessageProperties, PublishOutcome, QueueOptions, QueueStats, X_FIRST_DEATH_EXCHANGE,
    X_FIRST_DEATH_QUEUE, X_FIRST_DEATH_REASON,
};

const MSG_ID: &str = "Nats-Msg-Id";
const MESSAGE_ID: &str = "x-message-id";
const REQUEUE_COUNT: &str = "x-requeue-count";
const CONTENT_TYPE: &str = "Content-Type";
const TIMESTAMP: &str = "x-timestamp";
const DELIVERY_MODE: &str = "x-delivery-mode";

/// Application headers carried across NATS
const KNOWN_HEADERS: &[&str] = &[
    "type",
    "aggregateType",
    "aggregateId",
    "correlationId",
    "source",
    "x-original-routing-key",
    REQUEUE_COUNT,
    X_FIRST_DEATH_QUEUE,
    X_FIRST_DEATH_REASON,
    X_FIRST_DEATH_EXCHANGE,
];

fn protocol<E: std::fmt::Display>(err: E) -> BrokerError {
    BrokerError::Protocol(err.to_string())
}

/// Subject prefix of an exchange (`events.dlx` becomes `events_dlx`)
fn subject_prefix(exchange: &str) -> String {
    exchange
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Stream backing an exchange
fn stream_name(exchange: &str) -> String {
    subject_prefix(exchange).to_ascii_uppercase()
}

/// NATS JetStream backed [`Broker`]
#[derive(Debug, Clone)]
pub struct NatsBroker {
    client_name: String,
}

impl Default for NatsBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl NatsBroker {
    pub fn new() -> Self {
        Self {
            client_name: "cim-messaging".to_string(),
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn connect(&self, url: &str) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let (events, _) = broadcast::channel(16);
        let notify = events.clone();

        let client = ConnectOptions::new()
            .name(&self.client_name)
            .event_callback(move |event| {
                let notify = notify.clone();
                async move {
                    match event {
                        Event::Disconnected => {
                            let _ = notify.send(ConnectionEvent::Closed(
                                "disconnected from NATS server".to_string(),
                            ));
                        }
                        Event::ServerError(err) => {
                            let _ = notify.send(ConnectionEvent::Error(err.to_string()));
                        }
                        other => debug!(event = %other, "NATS connection event"),
                    }
                }
            })
            .connect(url)
            .await
            .map_err(|err| BrokerError::Connection(err.to_string()))?;

        info!(url = %url, "Connected to NATS");

        Ok(Arc::new(NatsConnection {
            context: jetstream::new(client.clone()),
            client: Mutex::new(Some(client)),
            events,
            open: AtomicBool::new(true),
            topology: Arc::new(Mutex::new(Topology::default())),
            next_tag: Arc::new(AtomicU64::new(0)),
        }))
    }
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, NatsQueue>,
}

#[derive(Clone)]
struct NatsQueue {
    options: QueueOptions,
    bindings: Vec<NatsBinding>,
}

#[derive(Clone)]
struct NatsBinding {
    exchange: String,
    filter: String,
    consumer: String,
}

struct NatsConnection {
    client: Mutex<Option<async_nats::Client>>,
    context: jetstream::Context,
    events: broadcast::Sender<ConnectionEvent>,
    open: AtomicBool,
    topology: Arc<Mutex<Topology>>,
    next_tag: Arc<AtomicU64>,
}

#[async_trait]
impl BrokerConnection for NatsConnection {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        if !self.is_open() {
            return Err(BrokerError::Connection("connection is closed".to_string()));
        }
        Ok(Arc::new(NatsChannel {
            context: self.context.clone(),
            topology: Arc::clone(&self.topology),
            open: AtomicBool::new(true),
            prefetch: AtomicU16::new(0),
            next_tag: Arc::clone(&self.next_tag),
            pending: Arc::new(Mutex::new(HashMap::new())),
            consumers: Mutex::new(HashMap::new()),
        }))
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let client = self.client.lock().take();
        if let Some(client) = client {
            if let Err(err) = client.flush().await {
                debug!(error = %err, "Flush before close failed");
            }
        }
        let _ = self
            .events
            .send(ConnectionEvent::Closed("closed by client".to_string()));
        Ok(())
    }
}

struct PendingAck {
    message: jetstream::Message,
    queue: String,
    routing_key: String,
    properties: MessageProperties,
}

/// A running `basic_consume`
struct ActiveConsumer {
    queue: String,
    cancel: oneshot::Sender<()>,
}

struct NatsChannel {
    context: jetstream::Context,
    topology: Arc<Mutex<Topology>>,
    open: AtomicBool,
    prefetch: AtomicU16,
    next_tag: Arc<AtomicU64>,
    pending: Arc<Mutex<HashMap<u64, PendingAck>>>,
    consumers: Mutex<HashMap<String, ActiveConsumer>>,
}

impl NatsChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    fn queue(&self, name: &str) -> BrokerResult<NatsQueue> {
        self.topology
            .lock()
            .queues
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
    }

    async fn consumer(&self, binding: &NatsBinding) -> BrokerResult<PullConsumer> {
        let stream = self
            .context
            .get_stream(stream_name(&binding.exchange))
            .await
            .map_err(protocol)?;
        stream
            .get_consumer(&binding.consumer)
            .await
            .map_err(protocol)
    }

    async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: &MessageProperties,
    ) -> BrokerResult<PublishOutcome> {
        let subject = format!("{}.{}", subject_prefix(exchange), routing_key);
        let headers = to_header_map(properties);

        let ack = self
            .context
            .publish_with_headers(subject, headers, payload.into())
            .await
            .map_err(protocol)?;

        match ack.await {
            Ok(ack) if ack.duplicate => Err(BrokerError::Duplicate(format!(
                "{} in stream {}",
                dedup_id(properties).unwrap_or_default(),
                ack.stream
            ))),
            Ok(_) => Ok(PublishOutcome::Routed(1)),
            Err(err) => match err.kind() {
                PublishErrorKind::TimedOut => Err(BrokerError::BufferFull),
                PublishErrorKind::StreamNotFound => Ok(PublishOutcome::Unroutable),
                _ => Err(protocol(err)),
            },
        }
    }
}

#[async_trait]
impl BrokerChannel for NatsChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> BrokerResult<()> {
        self.ensure_open()?;
        self.prefetch.store(prefetch_count, Ordering::SeqCst);
        Ok(())
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        let storage = if options.durable {
            jetstream::stream::StorageType::File
        } else {
            jetstream::stream::StorageType::Memory
        };
        self.context
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name(name),
                subjects: vec![format!("{}.>", subject_prefix(name))],
                storage,
                ..Default::default()
            })
            .await
            .map_err(protocol)?;

        self.topology.lock().exchanges.insert(name.to_string(), kind);
        debug!(exchange = %name, stream = %stream_name(name), "Declared exchange stream");
        Ok(())
    }

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> BrokerResult<QueueStats> {
        self.ensure_open()?;
        let mut topology = self.topology.lock();
        let queue = topology
            .queues
            .entry(name.to_string())
            .or_insert_with(|| NatsQueue {
                options: options.clone(),
                bindings: Vec::new(),
            });
        if queue.options != options {
            return Err(BrokerError::PreconditionFailed(format!(
                "queue '{}' already declared with different arguments",
                name
            )));
        }
        if options.arguments.message_ttl.is_some() {
            debug!(queue = %name, "Message TTL is not enforced on JetStream consumers");
        }
        Ok(QueueStats {
            queue: name.to_string(),
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_pattern: &str,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        let (kind, binding_index) = {
            let topology = self.topology.lock();
            let state = topology
                .queues
                .get(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            let kind = topology
                .exchanges
                .get(exchange)
                .copied()
                .unwrap_or(ExchangeKind::Topic);
            (kind, state.bindings.len())
        };

        let prefix = subject_prefix(exchange);
        let filter = match kind {
            ExchangeKind::Topic => topic::to_nats_filter(&prefix, routing_pattern).ok_or_else(|| {
                BrokerError::Protocol(format!(
                    "binding pattern '{}' cannot be expressed as a NATS subject",
                    routing_pattern
                ))
            })?,
            ExchangeKind::Direct => format!("{}.{}", prefix, routing_pattern),
            ExchangeKind::Fanout => format!("{}.>", prefix),
        };

        if let Some(existing) = self.queue(queue)?.bindings.iter().find(|b| {
            b.exchange == exchange && b.filter == filter
        }) {
            debug!(queue = %queue, consumer = %existing.consumer, "Binding already exists");
            return Ok(());
        }

        let consumer = format!("{}_{}", subject_prefix(queue), binding_index);
        let prefetch = self.prefetch.load(Ordering::SeqCst);
        let mut config = pull::Config {
            durable_name: Some(consumer.clone()),
            filter_subject: filter.clone(),
            ack_policy: AckPolicy::Explicit,
            ..Default::default()
        };
        if prefetch > 0 {
            config.max_ack_pending = i64::from(prefetch);
        }

        let stream = self
            .context
            .get_stream(stream_name(exchange))
            .await
            .map_err(|_| BrokerError::ExchangeNotFound(exchange.to_string()))?;
        stream
            .get_or_create_consumer(&consumer, config)
            .await
            .map_err(protocol)?;

        if let Some(state) = self.topology.lock().queues.get_mut(queue) {
            state.bindings.push(NatsBinding {
                exchange: exchange.to_string(),
                filter,
                consumer,
            });
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _mandatory: bool,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> BrokerResult<PublishOutcome> {
        self.ensure_open()?;
        self.publish_raw(exchange, routing_key, payload, &properties)
            .await
    }

    async fn basic_consume(&self, queue: &str) -> BrokerResult<ConsumerHandle> {
        self.ensure_open()?;
        let state = self.queue(queue)?;

        let mut sources = Vec::with_capacity(state.bindings.len());
        for binding in &state.bindings {
            let consumer = self.consumer(binding).await?;
            let messages = consumer.messages().await.map_err(protocol)?;
            let prefix = format!("{}.", subject_prefix(&binding.exchange));
            sources.push(messages.map(move |item| (prefix.clone(), item)).boxed());
        }

        let consumer_tag = format!("{}-{}", subject_prefix(queue), uuid::Uuid::new_v4());
        let (cancel, cancelled) = oneshot::channel();
        self.consumers.lock().insert(
            consumer_tag.clone(),
            ActiveConsumer {
                queue: queue.to_string(),
                cancel,
            },
        );

        let pending = Arc::clone(&self.pending);
        let next_tag = Arc::clone(&self.next_tag);
        let queue_name = queue.to_string();
        let tag = consumer_tag.clone();

        let deliveries = stream::select_all(sources)
            .filter_map(move |(prefix, item)| {
                let delivery = match item {
                    Ok(message) => {
                        let delivery_tag = next_tag.fetch_add(1, Ordering::SeqCst) + 1;
                        let delivery = to_delivery(&message, delivery_tag, &tag, &prefix);
                        pending.lock().insert(
                            delivery_tag,
                            PendingAck {
                                message,
                                queue: queue_name.clone(),
                                routing_key: delivery.routing_key.clone(),
                                properties: delivery.properties.clone(),
                            },
                        );
                        Some(delivery)
                    }
                    Err(err) => {
                        warn!(queue = %queue_name, error = %err, "JetStream message stream error");
                        None
                    }
                };
                futures::future::ready(delivery)
            })
            .take_until(cancelled)
            .boxed();

        Ok(ConsumerHandle {
            consumer_tag,
            deliveries,
        })
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        let consumer = self
            .consumers
            .lock()
            .remove(consumer_tag)
            .ok_or_else(|| BrokerError::UnknownConsumerTag(consumer_tag.to_string()))?;
        let _ = consumer.cancel.send(());
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.ensure_open()?;
        let pending = self
            .pending
            .lock()
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        pending.message.ack().await.map_err(protocol)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.ensure_open()?;
        let pending = self
            .pending
            .lock()
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;

        if requeue {
            return pending
                .message
                .ack_with(AckKind::Nak(None))
                .await
                .map_err(protocol);
        }

        let arguments = self
            .topology
            .lock()
            .queues
            .get(&pending.queue)
            .map(|queue| queue.options.arguments.clone())
            .unwrap_or_default();

        if let Some(dlx) = arguments.dead_letter_exchange {
            let routing_key = arguments
                .dead_letter_routing_key
                .unwrap_or_else(|| pending.routing_key.clone());
            let source_exchange = pending
                .message
                .subject
                .to_string()
                .split('.')
                .next()
                .unwrap_or_default()
                .to_string();

            let mut properties = pending.properties.clone();
            properties
                .headers
                .entry(X_FIRST_DEATH_QUEUE.to_string())
                .or_insert_with(|| pending.queue.as_str().into());
            properties
                .headers
                .entry(X_FIRST_DEATH_REASON.to_string())
                .or_insert_with(|| "rejected".into());
            properties
                .headers
                .entry(X_FIRST_DEATH_EXCHANGE.to_string())
                .or_insert_with(|| source_exchange.into());

            let payload = pending.message.payload.to_vec();
            self.publish_raw(&dlx, &routing_key, payload, &properties)
                .await?;
        }

        pending
            .message
            .ack_with(AckKind::Term)
            .await
            .map_err(protocol)
    }

    async fn queue_purge(&self, queue: &str) -> BrokerResult<u32> {
        self.ensure_open()?;
        let state = self.queue(queue)?;
        let mut purged = 0u64;
        for binding in &state.bindings {
            let stream = self
                .context
                .get_stream(stream_name(&binding.exchange))
                .await
                .map_err(protocol)?;
            let response = stream
                .purge()
                .filter(binding.filter.clone())
                .await
                .map_err(protocol)?;
            purged += response.purged;
        }
        Ok(u32::try_from(purged).unwrap_or(u32::MAX))
    }

    async fn queue_stats(&self, queue: &str) -> BrokerResult<QueueStats> {
        self.ensure_open()?;
        let state = self.queue(queue)?;
        let mut message_count = 0u64;
        for binding in &state.bindings {
            let mut consumer = self.consumer(binding).await?;
            let info = consumer.info().await.map_err(protocol)?;
            message_count += info.num_pending;
        }
        let consumer_count = self
            .consumers
            .lock()
            .values()
            .filter(|consumer| consumer.queue == queue)
            .count();
        Ok(QueueStats {
            queue: queue.to_string(),
            message_count: u32::try_from(message_count).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(consumer_count).unwrap_or(u32::MAX),
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.consumers.lock().clear();
            // Unacked messages are redelivered once their ack wait expires
            self.pending.lock().clear();
        }
        Ok(())
    }
}

/// Deduplication id: the message id, suffixed with the requeue count once replayed
fn dedup_id(properties: &MessageProperties) -> Option<String> {
    let id = properties.message_id.as_ref()?;
    let requeue_count = properties
        .header(REQUEUE_COUNT)
        .and_then(HeaderValue::as_int)
        .unwrap_or(0);
    if requeue_count > 0 {
        Some(format!("{}:{}", id, requeue_count))
    } else {
        Some(id.clone())
    }
}

fn to_header_map(properties: &MessageProperties) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(id) = &properties.message_id {
        headers.insert(MESSAGE_ID, id.as_str());
    }
    if let Some(dedup) = dedup_id(properties) {
        headers.insert(MSG_ID, dedup.as_str());
    }
    if let Some(content_type) = &properties.content_type {
        headers.insert(CONTENT_TYPE, content_type.as_str());
    }
    if let Some(timestamp) = properties.timestamp {
        headers.insert(TIMESTAMP, timestamp.to_rfc3339().as_str());
    }
    if properties.delivery_mode == DeliveryMode::Persistent {
        headers.insert(DELIVERY_MODE, "persistent");
    }
    for (name, value) in &properties.headers {
        headers.insert(name.as_str(), value.to_string().as_str());
    }
    headers
}

fn to_delivery(
    message: &jetstream::Message,
    delivery_tag: u64,
    consumer_tag: &str,
    prefix: &str,
) -> Delivery {
    let subject = message.subject.to_string();
    let routing_key = subject
        .strip_prefix(prefix)
        .unwrap_or(subject.as_str())
        .to_string();

    let mut properties = MessageProperties::default();
    if let Some(headers) = &message.headers {
        let get = |name: &str| headers.get(name).map(|value| value.as_str().to_string());
        properties.message_id = get(MESSAGE_ID).or_else(|| get(MSG_ID));
        properties.content_type = get(CONTENT_TYPE);
        properties.timestamp = get(TIMESTAMP)
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc));
        if get(DELIVERY_MODE).as_deref() == Some("persistent") {
            properties.delivery_mode = DeliveryMode::Persistent;
        }
        for name in KNOWN_HEADERS {
            if let Some(value) = get(name) {
                properties
                    .headers
                    .insert((*name).to_string(), HeaderValue::Text(value));
            }
        }
    }

    let redelivered = message
        .info()
        .map(|info| info.delivered > 1)
        .unwrap_or(false);

    Delivery {
        delivery_tag,
        consumer_tag: consumer_tag.to_string(),
        exchange: prefix.trim_end_matches('.').to_string(),
        routing_key,
        redelivered,
        properties,
        payload: message.payload.to_vec(),
    }
}
