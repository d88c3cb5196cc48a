// Copyright (c) 2025 - Cowboy AI, Inc.
//! Messaging configuration
//!
//! Every setting has a default and can be overridden from the environment:
//!
//! | Variable | Field | Default |
//! |---|---|---|
//! | `BROKER_URL` | `broker_url` | `amqp://localhost:5672` |
//! | `EVENT_EXCHANGE` | `exchange` | `events` |
//! | `EVENT_EXCHANGE_TYPE` | `exchange_kind` | `topic` |
//! | `BROKER_RECONNECT_DELAY_MS` | `reconnect_delay` | `5000` |
//! | `BROKER_MAX_RECONNECT_ATTEMPTS` | `max_reconnect_attempts` | `10` |
//! | `BROKER_PREFETCH_COUNT` | `prefetch_count` | `10` |
//! | `DEAD_LETTER_EXCHANGE` | `dead_letter_exchange` | `events.dlx` |
//! | `DEAD_LETTER_QUEUE` | `dead_letter_queue` | `events.dlq` |
//! | `SERVICE_NAME` | `source` | `cim-messaging` |

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::broker::ExchangeKind;

/// Dead-letter queue message TTL: 24 hours
pub const DEAD_LETTER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {variable}: {reason}")]
    InvalidValue {
        variable: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings shared by the connection manager, publisher, consumer and
/// dead-letter handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Broker endpoint
    pub broker_url: String,
    /// Exchange events are published to
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    /// Fixed delay between reconnect attempts
    #[serde(with = "duration_ms")]
    pub reconnect_delay: Duration,
    /// Reconnect attempts before giving up until the next explicit connect
    pub max_reconnect_attempts: u32,
    /// Unacknowledged deliveries allowed per consumer
    pub prefetch_count: u16,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    #[serde(with = "duration_ms")]
    pub dead_letter_ttl: Duration,
    /// Service name stamped into event metadata
    pub source: String,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            broker_url: "amqp://localhost:5672".to_string(),
            exchange: "events".to_string(),
            exchange_kind: ExchangeKind::Topic,
            reconnect_delay: Duration::from_millis(5000),
            max_reconnect_attempts: 10,
            prefetch_count: 10,
            dead_letter_exchange: "events.dlx".to_string(),
            dead_letter_queue: "events.dlq".to_string(),
            dead_letter_ttl: DEAD_LETTER_TTL,
            source: "cim-messaging".to_string(),
        }
    }
}

impl MessagingConfig {
    /// Defaults overridden by environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("BROKER_URL") {
            config.broker_url = url;
        }
        if let Some(exchange) = lookup("EVENT_EXCHANGE") {
            config.exchange = exchange;
        }
        if let Some(kind) = lookup("EVENT_EXCHANGE_TYPE") {
            config.exchange_kind =
                kind.parse::<ExchangeKind>()
                    .map_err(|reason| ConfigError::InvalidValue {
                        variable: "EVENT_EXCHANGE_TYPE",
                        value: kind.clone(),
                        reason,
                    })?;
        }
        if let Some(delay) = parse_var::<u64, _>(&lookup, "BROKER_RECONNECT_DELAY_MS")? {
            config.reconnect_delay = Duration::from_millis(delay);
        }
        if let Some(attempts) = parse_var(&lookup, "BROKER_MAX_RECONNECT_ATTEMPTS")? {
            config.max_reconnect_attempts = attempts;
        }
        if let Some(prefetch) = parse_var(&lookup, "BROKER_PREFETCH_COUNT")? {
            config.prefetch_count = prefetch;
        }
        if let Some(exchange) = lookup("DEAD_LETTER_EXCHANGE") {
            config.dead_letter_exchange = exchange;
        }
        if let Some(queue) = lookup("DEAD_LETTER_QUEUE") {
            config.dead_letter_queue = queue;
        }
        if let Some(source) = lookup("SERVICE_NAME") {
            config.source = source;
        }

        Ok(config)
    }

    pub fn with_broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = url.into();
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_prefetch_count(mut self, prefetch: u16) -> Self {
        self.prefetch_count = prefetch;
        self
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = exchange.into();
        self
    }

    pub fn with_dead_letter_queue(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = queue.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

fn parse_var<T, F>(lookup: &F, variable: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(variable) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|err: T::Err| ConfigError::InvalidValue {
                variable,
                reason: err.to_string(),
                value,
            }),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = MessagingConfig::default();
        assert_eq!(config.broker_url, "amqp://localhost:5672");
        assert_eq!(config.exchange, "events");
        assert_eq!(config.exchange_kind, ExchangeKind::Topic);
        assert_eq!(config.reconnect_delay, Duration::from_millis(5000));
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.prefetch_count, 10);
        assert_eq!(config.dead_letter_ttl, Duration::from_secs(86_400));
    }

    #[test]
    fn test_environment_overrides() {
        let config = MessagingConfig::from_lookup(lookup(&[
            ("BROKER_URL", "amqp://rabbit:5672"),
            ("EVENT_EXCHANGE", "domain"),
            ("BROKER_RECONNECT_DELAY_MS", "250"),
            ("BROKER_MAX_RECONNECT_ATTEMPTS", "3"),
            ("BROKER_PREFETCH_COUNT", " 32 "),
            ("SERVICE_NAME", "billing"),
        ]))
        .unwrap();

        assert_eq!(config.broker_url, "amqp://rabbit:5672");
        assert_eq!(config.exchange, "domain");
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.prefetch_count, 32);
        assert_eq!(config.source, "billing");
        assert_eq!(config.dead_letter_queue, "events.dlq");
    }

    #[test]
    fn test_unparsable_values_are_errors() {
        let err = MessagingConfig::from_lookup(lookup(&[("BROKER_PREFETCH_COUNT", "lots")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { variable: "BROKER_PREFETCH_COUNT", .. }
        ));

        let err = MessagingConfig::from_lookup(lookup(&[("EVENT_EXCHANGE_TYPE", "headers")]))
            .unwrap_err();
        assert!(err.to_string().contains("EVENT_EXCHANGE_TYPE"));
    }

    #[test]
    fn test_serde_uses_milliseconds() {
        let config = MessagingConfig::default().with_reconnect_delay(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["reconnect_delay"], 1500);

        let back: MessagingConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
