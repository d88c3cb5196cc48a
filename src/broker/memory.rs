// Copyright (c) 2025 - Cowboy AI, Inc.
//! In-process broker for tests and local development
//!
//! Implements the [`Broker`] traits with AMQP 0-9-1 behaviour, so the whole
//! messaging stack can run without an external server:
//!
//! - topic / direct / fanout exchanges (plus the nameless default exchange)
//! - FIFO queues with per-consumer prefetch and manual acknowledgement
//! - `nack(requeue = true)` puts the message back at the head, flagged redelivered
//! - `nack(requeue = false)` and TTL expiry dead-letter through
//!   `x-dead-letter-exchange` / `x-dead-letter-routing-key`, recording `x-death`
//! - closing a channel requeues its unacknowledged deliveries
//!
//! Test hooks let callers inject connection failures, sever live connections,
//! simulate flow control and inspect what the broker saw. The publish and ack
//! logs keep only the most recent [`LOG_CAPACITY`] entries each.
//!
//! # Example
//!
//! ```rust
//! use cim_messaging::broker::{Broker, ExchangeKind, ExchangeOptions, InMemoryBroker};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//! let connection = broker.connect("memory://local").await?;
//! let channel = connection.open_channel().await?;
//! channel
//!     .exchange_declare("events", ExchangeKind::Topic, ExchangeOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::topic;
use super::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerResult, ConnectionEvent,
    ConsumerHandle, Delivery, ExchangeKind, ExchangeOptions, FieldTable, HeaderValue,
    MessageProperties, PublishOutcome, QueueOptions, QueueStats, X_DEATH, X_FIRST_DEATH_EXCHANGE,
    X_FIRST_DEATH_QUEUE, X_FIRST_DEATH_REASON,
};

/// Entries kept in each of the publish and ack logs
pub const LOG_CAPACITY: usize = 10_000;

/// A message as the broker received it from a publisher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
}

/// A message waiting in a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
}

/// Acknowledgement action taken by a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    Ack,
    Nack { requeue: bool },
}

/// One entry of the broker's ack/nack log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub delivery_tag: u64,
    pub queue: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub action: AckAction,
}

/// In-memory AMQP-style broker
///
/// Cloning is cheap; clones share the same exchanges, queues and logs.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
    fail_connects: AtomicU32,
    flow_control: AtomicBool,
    connect_attempts: AtomicU64,
    next_id: AtomicU64,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: MessageProperties,
    payload: Vec<u8>,
    enqueued_at: Instant,
}

impl StoredMessage {
    fn to_queued(&self) -> QueuedMessage {
        QueuedMessage {
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            properties: self.properties.clone(),
            payload: self.payload.clone(),
        }
    }
}

struct Unacked {
    message: StoredMessage,
    channel_id: u64,
    consumer_tag: String,
}

struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    prefetch: u16,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            cursor: 0,
        }
    }

    fn in_flight(&self, consumer_tag: &str) -> usize {
        self.unacked
            .values()
            .filter(|entry| entry.consumer_tag == consumer_tag)
            .count()
    }

    /// Index of the next consumer able to take a delivery, round-robin
    fn next_consumer(&mut self) -> Option<usize> {
        self.consumers.retain(|slot| !slot.sender.is_closed());
        let count = self.consumers.len();
        for offset in 0..count {
            let idx = (self.cursor + offset) % count;
            let slot = &self.consumers[idx];
            if slot.prefetch == 0 || self.in_flight(&slot.tag) < slot.prefetch as usize {
                self.cursor = (idx + 1) % count;
                return Some(idx);
            }
        }
        None
    }
}

struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    delivery_index: HashMap<u64, String>,
    next_delivery_tag: u64,
    next_consumer: u64,
    published: VecDeque<PublishedMessage>,
    ack_log: VecDeque<AckRecord>,
}

/// Append to a bounded log, dropping the oldest entry when full
fn record<T>(log: &mut VecDeque<T>, entry: T, capacity: usize) {
    if log.len() >= capacity {
        log.pop_front();
    }
    log.push_back(entry);
}

impl BrokerState {
    /// Deliver a message to every queue bound to `exchange` for `routing_key`
    fn route(&mut self, exchange: &str, message: StoredMessage) -> usize {
        let targets: Vec<String> = if exchange.is_empty() {
            // Default exchange: routing key names the queue
            if self.queues.contains_key(&message.routing_key) {
                vec![message.routing_key.clone()]
            } else {
                Vec::new()
            }
        } else {
            let Some(kind) = self.exchanges.get(exchange).copied() else {
                return 0;
            };
            let mut targets: Vec<String> = Vec::new();
            for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
                let hit = match kind {
                    ExchangeKind::Topic => topic::matches(&binding.pattern, &message.routing_key),
                    ExchangeKind::Direct => binding.pattern == message.routing_key,
                    ExchangeKind::Fanout => true,
                };
                if hit && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        for queue in &targets {
            if let Some(state) = self.queues.get_mut(queue) {
                let mut copy = message.clone();
                copy.enqueued_at = Instant::now();
                state.ready.push_back(copy);
            }
        }
        for queue in &targets {
            self.dispatch(queue);
        }
        targets.len()
    }

    /// Push ready messages to consumers with spare prefetch capacity
    fn dispatch(&mut self, queue: &str) {
        self.expire(queue);

        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };

        while !state.ready.is_empty() {
            let Some(idx) = state.next_consumer() else {
                break;
            };
            let Some(message) = state.ready.pop_front() else {
                break;
            };

            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            let slot = &state.consumers[idx];
            let delivery = Delivery {
                delivery_tag,
                consumer_tag: slot.tag.clone(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                payload: message.payload.clone(),
            };

            if slot.sender.send(delivery).is_err() {
                // Receiver went away; put the message back and drop the consumer
                state.ready.push_front(message);
                state.consumers.remove(idx);
                continue;
            }

            state.unacked.insert(
                delivery_tag,
                Unacked {
                    message,
                    channel_id: slot.channel_id,
                    consumer_tag: slot.tag.clone(),
                },
            );
            self.delivery_index.insert(delivery_tag, queue.to_string());
        }
    }

    /// Dead-letter messages at the head of `queue` whose TTL elapsed
    fn expire(&mut self, queue: &str) {
        let expired: Vec<StoredMessage> = {
            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            let Some(ttl) = state.options.arguments.message_ttl else {
                return;
            };
            let mut expired = Vec::new();
            while state
                .ready
                .front()
                .is_some_and(|message| message.enqueued_at.elapsed() >= ttl)
            {
                if let Some(message) = state.ready.pop_front() {
                    expired.push(message);
                }
            }
            expired
        };

        for message in expired {
            self.dead_letter(queue, message, "expired");
        }
    }

    /// Republish a rejected or expired message to the queue's dead-letter exchange
    fn dead_letter(&mut self, queue: &str, message: StoredMessage, reason: &str) {
        let Some(arguments) = self.queues.get(queue).map(|q| q.options.arguments.clone()) else {
            return;
        };
        let Some(dlx) = arguments.dead_letter_exchange else {
            debug!(queue = %queue, reason = %reason, "Dropping message, queue has no dead-letter exchange");
            return;
        };

        let mut properties = message.properties.clone();
        record_death(&mut properties.headers, queue, reason, &message);

        let routing_key = arguments
            .dead_letter_routing_key
            .unwrap_or_else(|| message.routing_key.clone());

        let dead = StoredMessage {
            exchange: dlx.clone(),
            routing_key,
            redelivered: false,
            properties,
            payload: message.payload,
            enqueued_at: Instant::now(),
        };
        let routed = self.route(&dlx, dead);
        debug!(queue = %queue, dead_letter_exchange = %dlx, reason = %reason, routed = routed, "Message dead-lettered");
    }

    fn take_unacked(&mut self, channel_id: u64, delivery_tag: u64) -> BrokerResult<(String, Unacked)> {
        let queue = self
            .delivery_index
            .get(&delivery_tag)
            .cloned()
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        let state = self
            .queues
            .get_mut(&queue)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        match state.unacked.get(&delivery_tag) {
            Some(entry) if entry.channel_id == channel_id => {}
            _ => return Err(BrokerError::UnknownDeliveryTag(delivery_tag)),
        }
        let entry = state
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        self.delivery_index.remove(&delivery_tag);
        Ok((queue, entry))
    }

    fn log_ack(&mut self, delivery_tag: u64, queue: &str, entry: &Unacked, action: AckAction) {
        let record_entry = AckRecord {
            delivery_tag,
            queue: queue.to_string(),
            routing_key: entry.message.routing_key.clone(),
            message_id: entry.message.properties.message_id.clone(),
            action,
        };
        record(&mut self.ack_log, record_entry, LOG_CAPACITY);
    }

    fn remove_consumer(&mut self, consumer_tag: &str) -> bool {
        let mut emptied = None;
        let mut found = false;
        for (name, state) in self.queues.iter_mut() {
            let before = state.consumers.len();
            state.consumers.retain(|slot| slot.tag != consumer_tag);
            if state.consumers.len() != before {
                found = true;
                if state.consumers.is_empty() && state.options.auto_delete {
                    emptied = Some(name.clone());
                }
                break;
            }
        }
        if let Some(name) = emptied {
            self.delete_queue(&name);
        }
        found
    }

    fn delete_queue(&mut self, name: &str) {
        if let Some(state) = self.queues.remove(name) {
            for tag in state.unacked.keys() {
                self.delivery_index.remove(tag);
            }
        }
        self.bindings.retain(|binding| binding.queue != name);
    }

    /// Drop a channel's consumers and requeue everything it had not acknowledged
    fn release_channel(&mut self, channel_id: u64) {
        let mut touched = Vec::new();
        let mut emptied = Vec::new();
        for (name, state) in self.queues.iter_mut() {
            let before = state.consumers.len();
            state.consumers.retain(|slot| slot.channel_id != channel_id);
            let lost_consumers = state.consumers.len() != before;

            let mut returned: Vec<(u64, StoredMessage)> = state
                .unacked
                .iter()
                .filter(|(_, entry)| entry.channel_id == channel_id)
                .map(|(tag, entry)| (*tag, entry.message.clone()))
                .collect();
            returned.sort_by_key(|(tag, _)| *tag);
            for (tag, _) in &returned {
                state.unacked.remove(tag);
                self.delivery_index.remove(tag);
            }
            for (_, mut message) in returned.into_iter().rev() {
                message.redelivered = true;
                state.ready.push_front(message);
            }

            if lost_consumers || !state.ready.is_empty() {
                touched.push(name.clone());
            }
            if lost_consumers && state.consumers.is_empty() && state.options.auto_delete {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            self.delete_queue(&name);
        }
        for name in touched {
            self.dispatch(&name);
        }
    }
}

/// Append or bump the `x-death` entry for (queue, reason) and set `x-first-death-*`
fn record_death(headers: &mut FieldTable, queue: &str, reason: &str, message: &StoredMessage) {
    let mut deaths: Vec<HeaderValue> = headers
        .get(X_DEATH)
        .and_then(HeaderValue::as_list)
        .map(|list| list.to_vec())
        .unwrap_or_default();

    let existing = deaths.iter_mut().find_map(|entry| match entry {
        HeaderValue::Table(table)
            if table.get("queue").and_then(HeaderValue::as_str) == Some(queue)
                && table.get("reason").and_then(HeaderValue::as_str) == Some(reason) =>
        {
            Some(table)
        }
        _ => None,
    });

    match existing {
        Some(table) => {
            let count = table.get("count").and_then(HeaderValue::as_int).unwrap_or(0);
            table.insert("count".to_string(), HeaderValue::Int(count + 1));
        }
        None => {
            let mut table = FieldTable::new();
            table.insert("count".to_string(), HeaderValue::Int(1));
            table.insert("reason".to_string(), reason.into());
            table.insert("queue".to_string(), queue.into());
            table.insert("exchange".to_string(), message.exchange.as_str().into());
            table.insert(
                "routing-keys".to_string(),
                HeaderValue::List(vec![message.routing_key.as_str().into()]),
            );
            deaths.insert(0, HeaderValue::Table(table));
        }
    }
    headers.insert(X_DEATH.to_string(), HeaderValue::List(deaths));

    headers
        .entry(X_FIRST_DEATH_QUEUE.to_string())
        .or_insert_with(|| queue.into());
    headers
        .entry(X_FIRST_DEATH_REASON.to_string())
        .or_insert_with(|| reason.into());
    headers
        .entry(X_FIRST_DEATH_EXCHANGE.to_string())
        .or_insert_with(|| message.exchange.as_str().into());
}

impl InMemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Number of connection attempts seen so far (including failed ones)
    pub fn connect_attempts(&self) -> u64 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of connections currently open
    pub fn open_connections(&self) -> usize {
        self.shared
            .connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|conn| conn.is_open())
            .count()
    }

    /// Drop every open connection as if the network failed
    pub fn disconnect_all(&self, reason: &str) {
        let connections: Vec<Arc<MemoryConnection>> = self
            .shared
            .connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for connection in connections {
            if connection.shutdown() {
                let _ = connection.events.send(ConnectionEvent::Error(reason.to_string()));
                let _ = connection.events.send(ConnectionEvent::Closed(reason.to_string()));
            }
        }
    }

    /// While enabled, every publish fails with [`BrokerError::BufferFull`]
    pub fn set_flow_control(&self, blocked: bool) {
        self.shared.flow_control.store(blocked, Ordering::SeqCst);
    }

    /// Messages published so far, oldest first
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.state.lock().published.iter().cloned().collect()
    }

    /// Acks and nacks issued so far, oldest first
    pub fn ack_log(&self) -> Vec<AckRecord> {
        self.shared.state.lock().ack_log.iter().cloned().collect()
    }

    /// Snapshot of the ready messages in `queue`
    pub fn queue_messages(&self, queue: &str) -> Vec<QueuedMessage> {
        let mut state = self.shared.state.lock();
        state.expire(queue);
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(StoredMessage::to_queued).collect())
            .unwrap_or_default()
    }

    /// Number of deliveries of `queue` awaiting ack
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.shared.state.lock().exchanges.contains_key(name)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.shared.state.lock().queues.contains_key(name)
    }

    /// Arguments a queue was declared with
    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.shared
            .state
            .lock()
            .queues
            .get(name)
            .map(|q| q.options.clone())
    }

    /// `(exchange, pattern)` bindings of `queue`
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.shared
            .state
            .lock()
            .bindings
            .iter()
            .filter(|binding| binding.queue == queue)
            .map(|binding| (binding.exchange.clone(), binding.pattern.clone()))
            .collect()
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, url: &str) -> BrokerResult<Arc<dyn BrokerConnection>> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .shared
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BrokerError::Connection(format!("connection refused: {}", url)));
        }

        let (events, _) = broadcast::channel(16);
        let connection = Arc::new(MemoryConnection {
            id: self.next_id(),
            broker: self.clone(),
            open: AtomicBool::new(true),
            events,
            channels: Mutex::new(Vec::new()),
        });

        let mut connections = self.shared.connections.lock();
        connections.retain(|weak| weak.strong_count() > 0);
        connections.push(Arc::downgrade(&connection));

        debug!(url = %url, connection_id = connection.id, "In-memory connection opened");
        Ok(connection)
    }
}

struct MemoryConnection {
    id: u64,
    broker: InMemoryBroker,
    open: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryConnection {
    /// Mark closed and release all channels; false if it was already closed
    fn shutdown(&self) -> bool {
        if !self.open.swap(false, Ordering::SeqCst) {
            return false;
        }
        let channels: Vec<Arc<MemoryChannel>> = self.channels.lock().drain(..).collect();
        for channel in channels {
            channel.shutdown();
        }
        true
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        if !self.is_open() {
            return Err(BrokerError::Connection("connection is closed".to_string()));
        }
        let channel = Arc::new(MemoryChannel {
            id: self.broker.next_id(),
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
            prefetch: AtomicU16::new(0),
        });
        self.channels.lock().push(Arc::clone(&channel));
        Ok(channel)
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.shutdown() {
            let _ = self
                .events
                .send(ConnectionEvent::Closed("closed by client".to_string()));
        }
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    broker: InMemoryBroker,
    open: AtomicBool,
    prefetch: AtomicU16,
}

impl MemoryChannel {
    fn shutdown(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.shared.state.lock().release_channel(self.id);
        }
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    fn state(&self) -> parking_lot::MutexGuard<'_, BrokerState> {
        self.broker.shared.state.lock()
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> BrokerResult<()> {
        self.ensure_open()?;
        self.prefetch.store(prefetch_count, Ordering::SeqCst);
        Ok(())
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        _options: ExchangeOptions,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.state();
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::PreconditionFailed(format!(
                "exchange '{}' already declared as {}",
                name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> BrokerResult<QueueStats> {
        self.ensure_open()?;
        let mut state = self.state();
        let queue = state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState::new(options.clone()));
        if queue.options != options {
            return Err(BrokerError::PreconditionFailed(format!(
                "queue '{}' already declared with different arguments",
                name
            )));
        }
        Ok(QueueStats {
            queue: name.to_string(),
            message_count: queue.ready.len() as u32,
            consumer_count: queue.consumers.len() as u32,
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_pattern: &str,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.state();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        }
        let duplicate = state.bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.pattern == routing_pattern
        });
        if !duplicate {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                pattern: routing_pattern.to_string(),
            });
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> BrokerResult<PublishOutcome> {
        self.ensure_open()?;
        if self.broker.shared.flow_control.load(Ordering::SeqCst) {
            return Err(BrokerError::BufferFull);
        }

        let mut state = self.state();
        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        }

        let published = PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: properties.clone(),
            payload: payload.clone(),
        };
        record(&mut state.published, published, LOG_CAPACITY);

        let routed = state.route(
            exchange,
            StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                redelivered: false,
                properties,
                payload,
                enqueued_at: Instant::now(),
            },
        );

        if routed == 0 && mandatory {
            Ok(PublishOutcome::Unroutable)
        } else {
            Ok(PublishOutcome::Routed(routed))
        }
    }

    async fn basic_consume(&self, queue: &str) -> BrokerResult<ConsumerHandle> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let consumer_tag = {
            let mut state = self.state();
            state.next_consumer += 1;
            let consumer_tag = format!("ctag-{}.{}", self.id, state.next_consumer);
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            queue_state.consumers.push(ConsumerSlot {
                tag: consumer_tag.clone(),
                channel_id: self.id,
                prefetch: self.prefetch.load(Ordering::SeqCst),
                sender,
            });
            state.dispatch(queue);
            consumer_tag
        };

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed();

        Ok(ConsumerHandle {
            consumer_tag,
            deliveries,
        })
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        if self.state().remove_consumer(consumer_tag) {
            Ok(())
        } else {
            Err(BrokerError::UnknownConsumerTag(consumer_tag.to_string()))
        }
    }

    async fn basic_ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.state();
        let (queue, entry) = state.take_unacked(self.id, delivery_tag)?;
        state.log_ack(delivery_tag, &queue, &entry, AckAction::Ack);
        state.dispatch(&queue);
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.state();
        let (queue, entry) = state.take_unacked(self.id, delivery_tag)?;
        state.log_ack(delivery_tag, &queue, &entry, AckAction::Nack { requeue });

        let mut message = entry.message;
        if requeue {
            message.redelivered = true;
            if let Some(queue_state) = state.queues.get_mut(&queue) {
                queue_state.ready.push_front(message);
            }
        } else {
            state.dead_letter(&queue, message, "rejected");
        }
        state.dispatch(&queue);
        Ok(())
    }

    async fn queue_purge(&self, queue: &str) -> BrokerResult<u32> {
        self.ensure_open()?;
        let mut state = self.state();
        state.expire(queue);
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        let purged = queue_state.ready.len() as u32;
        queue_state.ready.clear();
        Ok(purged)
    }

    async fn queue_stats(&self, queue: &str) -> BrokerResult<QueueStats> {
        self.ensure_open()?;
        let mut state = self.state();
        state.expire(queue);
        let queue_state = state
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        Ok(QueueStats {
            queue: queue.to_string(),
            message_count: queue_state.ready.len() as u32,
            consumer_count: queue_state.consumers.len() as u32,
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> BrokerResult<()> {
        self.shutdown();
        Ok(())
    }
}
