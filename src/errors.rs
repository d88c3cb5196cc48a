//! Error types for event messaging operations

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::config::ConfigError;

/// Machine-readable category of a validation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    /// A required field is missing or empty
    Required,
    /// A field has the wrong JSON type
    InvalidType,
    /// A field must be a UUID
    InvalidUuid,
    /// A field must be an email address
    InvalidEmail,
    /// A field must be a timestamp
    InvalidDate,
    /// A numeric field is below its minimum
    TooSmall,
    /// The payload carries fields the schema does not know
    UnrecognizedKeys,
    /// A schema-specific rule failed
    Custom,
}

impl IssueCode {
    /// Wire name of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::Required => "required",
            IssueCode::InvalidType => "invalid_type",
            IssueCode::InvalidUuid => "invalid_uuid",
            IssueCode::InvalidEmail => "invalid_email",
            IssueCode::InvalidDate => "invalid_date",
            IssueCode::TooSmall => "too_small",
            IssueCode::UnrecognizedKeys => "unrecognized_keys",
            IssueCode::Custom => "custom",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single violated field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    /// Dotted path to the offending field (e.g. `metadata.correlationId`)
    pub field_path: String,
    /// Human-readable description
    pub message: String,
    /// Failure category
    pub code: IssueCode,
}

impl ValidationIssue {
    pub fn new(field_path: impl Into<String>, code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            field_path: field_path.into(),
            message: message.into(),
            code,
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} [{}]", self.field_path, self.message, self.code)
    }
}

/// An envelope or payload failed schema validation
///
/// Always lists every violated field, never a generic failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("event failed validation ({}){}", issue_count(.issues), issue_list(.issues))]
pub struct ValidationError {
    issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn new(issues: Vec<ValidationIssue>) -> Self {
        Self { issues }
    }

    /// All violated fields, envelope fields before payload fields
    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    pub fn into_issues(self) -> Vec<ValidationIssue> {
        self.issues
    }

    /// Whether any issue refers to `field_path`
    pub fn mentions(&self, field_path: &str) -> bool {
        self.issues.iter().any(|issue| issue.field_path == field_path)
    }
}

fn issue_count(issues: &[ValidationIssue]) -> String {
    match issues.len() {
        1 => "1 issue".to_string(),
        n => format!("{} issues", n),
    }
}

fn issue_list(issues: &[ValidationIssue]) -> String {
    issues.iter().map(|issue| format!("; {}", issue)).collect()
}

/// Failure while turning an envelope into transport bytes
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("refusing to encode invalid event: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure while turning transport bytes into an envelope
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to parse event payload: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("decoded event is invalid: {0}")]
    Validation(#[from] ValidationError),
}

/// Errors surfaced by the messaging components
#[derive(Debug, Error)]
pub enum MessagingError {
    /// Event or payload failed schema validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Serialization boundary failure on the way out
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Serialization boundary failure on the way in
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Component used before `initialize()`
    #[error("{component} used before initialize()")]
    NotInitialized { component: &'static str },

    /// Channel or connection accessed before a successful connect
    #[error("not connected to the message broker")]
    NotConnected,

    /// Broker signalled that its outbound buffer is full
    #[error("broker outbound buffer is full, event {event_id} was not published")]
    PublishBackpressure { event_id: String },

    /// Connection dropped underneath an operation
    #[error("connection to the message broker was lost: {0}")]
    ConnectionLost(String),

    /// Broker client error
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl MessagingError {
    /// The validation failure behind this error, if any
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            MessagingError::Validation(err) => Some(err),
            MessagingError::Encode(EncodeError::Validation(err)) => Some(err),
            MessagingError::Decode(DecodeError::Validation(err)) => Some(err),
            _ => None,
        }
    }
}

/// Result type for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;
