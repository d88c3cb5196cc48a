// Copyright (c) 2025 - Cowboy AI, Inc.
//! Broker client abstraction
//!
//! The messaging core is a client over an external topic broker. This module
//! captures the slice of the broker protocol the core relies on as a set of
//! async traits, so the connection manager, publisher, consumer and
//! dead-letter handler never depend on a particular client library.
//!
//! # Protocol Surface
//!
//! ```text
//! Broker ──connect──▶ BrokerConnection ──open_channel──▶ BrokerChannel
//!                          │                                 │
//!                    events() (error/close)       qos, declare, bind, publish,
//!                                                 consume, ack/nack, purge, stats
//! ```
//!
//! The semantics follow AMQP 0-9-1: durable topic exchanges, queues with
//! optional dead-letter arguments, manual acknowledgement and per-consumer
//! prefetch.
//!
//! # Implementations
//!
//! - [`InMemoryBroker`] - in-process broker for tests and local development
//! - `NatsBroker` (feature `nats`) - NATS JetStream backed client

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;
pub mod topic;

pub use memory::InMemoryBroker;
#[cfg(feature = "nats")]
pub use nats::NatsBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Header carrying the per-message dead-letter history
pub const X_DEATH: &str = "x-death";
/// Queue a message was first dead-lettered from
pub const X_FIRST_DEATH_QUEUE: &str = "x-first-death-queue";
/// Reason a message was first dead-lettered
pub const X_FIRST_DEATH_REASON: &str = "x-first-death-reason";
/// Exchange a message was first dead-lettered from
pub const X_FIRST_DEATH_EXCHANGE: &str = "x-first-death-exchange";

/// Errors raised by broker clients
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("outbound buffer is full")]
    BufferFull,

    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    #[error("unknown consumer tag: {0}")]
    UnknownConsumerTag(String),

    #[error("message id already stored, publish dropped: {0}")]
    Duplicate(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Exchange routing behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Routing key matched against binding patterns with `*` and `#`
    Topic,
    /// Routing key compared for equality
    Direct,
    /// Every bound queue receives every message
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Topic => write!(f, "topic"),
            ExchangeKind::Direct => write!(f, "direct"),
            ExchangeKind::Fanout => write!(f, "fanout"),
        }
    }
}

impl std::str::FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "topic" => Ok(ExchangeKind::Topic),
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            other => Err(format!("unsupported exchange type '{}'", other)),
        }
    }
}

/// Flags used when declaring an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

/// Optional `x-` arguments attached to a queue declaration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key`
    pub dead_letter_routing_key: Option<String>,
    /// `x-message-ttl`
    pub message_ttl: Option<Duration>,
}

impl QueueArguments {
    /// Render as the AMQP argument table
    pub fn to_field_table(&self) -> FieldTable {
        let mut table = FieldTable::new();
        if let Some(exchange) = &self.dead_letter_exchange {
            table.insert("x-dead-letter-exchange".to_string(), exchange.as_str().into());
        }
        if let Some(key) = &self.dead_letter_routing_key {
            table.insert("x-dead-letter-routing-key".to_string(), key.as_str().into());
        }
        if let Some(ttl) = self.message_ttl {
            table.insert(
                "x-message-ttl".to_string(),
                HeaderValue::Int(ttl.as_millis() as i64),
            );
        }
        table
    }
}

/// Flags used when declaring a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: QueueArguments,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: QueueArguments::default(),
        }
    }
}

/// A header value (subset of the AMQP field-value types)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<HeaderValue>),
    Table(FieldTable),
}

/// Header or argument table
pub type FieldTable = BTreeMap<String, HeaderValue>;

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(value) => Some(*value),
            HeaderValue::Text(value) => value.parse().ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[HeaderValue]> {
        match self {
            HeaderValue::List(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&FieldTable> {
        match self {
            HeaderValue::Table(table) => Some(table),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Bool(value) => write!(f, "{}", value),
            HeaderValue::Int(value) => write!(f, "{}", value),
            HeaderValue::Text(value) => f.write_str(value),
            HeaderValue::List(_) | HeaderValue::Table(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Text(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Whether the broker should write the message to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    #[default]
    Transient,
    Persistent,
}

/// Basic properties travelling with a message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub content_type: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub headers: FieldTable,
}

impl MessageProperties {
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(HeaderValue::as_str)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// What the broker did with a published message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Message was routed to this many queues
    Routed(usize),
    /// No binding matched; returned to the publisher (mandatory flag)
    Unroutable,
}

/// A message handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or nack this delivery
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
}

/// Stream of deliveries for one consumer; ends when the consumer is cancelled
/// or its channel closes
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// A started consumer
pub struct ConsumerHandle {
    /// Broker-assigned tag used for cancellation
    pub consumer_tag: String,
    pub deliveries: DeliveryStream,
}

impl fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("consumer_tag", &self.consumer_tag)
            .finish()
    }
}

/// Message and consumer counts of a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection reported an error
    Error(String),
    /// The connection is gone
    Closed(String),
}

/// Entry point of a broker client
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a connection to the broker at `url`
    async fn connect(&self, url: &str) -> BrokerResult<Arc<dyn BrokerConnection>>;
}

/// An open broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new channel on this connection
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;

    /// Subscribe to error/close notifications
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    fn is_open(&self) -> bool;

    /// Close the connection and every channel on it
    async fn close(&self) -> BrokerResult<()>;
}

/// A channel: the unit that declares topology, publishes and consumes
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Limit unacknowledged deliveries per consumer started afterwards
    async fn basic_qos(&self, prefetch_count: u16) -> BrokerResult<()>;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> BrokerResult<()>;

    /// Declare (or re-declare) a queue and return its current counts
    async fn queue_declare(&self, name: &str, options: QueueOptions) -> BrokerResult<QueueStats>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_pattern: &str)
        -> BrokerResult<()>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> BrokerResult<PublishOutcome>;

    /// Start a manual-ack consumer on `queue`
    async fn basic_consume(&self, queue: &str) -> BrokerResult<ConsumerHandle>;

    async fn basic_cancel(&self, consumer_tag: &str) -> BrokerResult<()>;

    async fn basic_ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    /// Drop every ready message in `queue`, returning how many were removed
    async fn queue_purge(&self, queue: &str) -> BrokerResult<u32>;

    /// Passive declare: counts of an existing queue
    async fn queue_stats(&self, queue: &str) -> BrokerResult<QueueStats>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> BrokerResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_kind_parsing() {
        assert_eq!("topic".parse::<ExchangeKind>(), Ok(ExchangeKind::Topic));
        assert_eq!(" Fanout ".parse::<ExchangeKind>(), Ok(ExchangeKind::Fanout));
        assert!("headers".parse::<ExchangeKind>().is_err());
        assert_eq!(ExchangeKind::Direct.to_string(), "direct");
    }

    #[test]
    fn test_queue_arguments_field_table() {
        let args = QueueArguments {
            dead_letter_exchange: Some("events.dlx".to_string()),
            dead_letter_routing_key: Some("dlq.orders".to_string()),
            message_ttl: Some(Duration::from_secs(60)),
        };

        let table = args.to_field_table();
        assert_eq!(
            table.get("x-dead-letter-exchange").and_then(HeaderValue::as_str),
            Some("events.dlx")
        );
        assert_eq!(
            table.get("x-dead-letter-routing-key").and_then(HeaderValue::as_str),
            Some("dlq.orders")
        );
        assert_eq!(table.get("x-message-ttl").and_then(HeaderValue::as_int), Some(60_000));
        assert!(QueueArguments::default().to_field_table().is_empty());
    }

    #[test]
    fn test_header_value_accessors() {
        assert_eq!(HeaderValue::from("abc").as_str(), Some("abc"));
        assert_eq!(HeaderValue::from("42").as_int(), Some(42));
        assert_eq!(HeaderValue::from(7i64).as_int(), Some(7));
        assert_eq!(HeaderValue::from(true).as_str(), None);
        assert_eq!(HeaderValue::from(3i64).to_string(), "3");
    }
}
