//! Event messaging for the Composable Information Machine
//!
//! Moves validated domain events between services over a topic broker with
//! at-least-once delivery, automatic reconnection and dead-letter quarantine.
//!
//! Producers talk to [`EventPublisher`], consumers register [`EventHandler`]s
//! on an [`EventConsumer`], and rejected messages are parked for inspection and
//! replay by the [`DeadLetterHandler`]. All three share one
//! [`ConnectionManager`], wired together by [`EventBus`].

pub mod broker;
pub mod bus;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dead_letter;
pub mod envelope;
pub mod errors;
pub mod publisher;
pub mod schema;

// Re-export commonly used types
pub use bus::EventBus;
pub use codec::{create_event, decode, encode, validate, validate_batch, BatchValidation};
pub use config::{ConfigError, MessagingConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::{handler_fn, EventConsumer, EventHandler, SubscribeOptions};
pub use dead_letter::{
    processor_fn, DeadLetterHandler, DeadLetterProcessor, DeadLetterStats, DeadLetteredMessage,
};
pub use envelope::{EventEnvelope, EventMetadata};
pub use errors::{
    DecodeError, EncodeError, IssueCode, MessagingError, MessagingResult, ValidationError,
    ValidationIssue,
};
pub use publisher::EventPublisher;
pub use schema::{EventKind, TypedEvent};
