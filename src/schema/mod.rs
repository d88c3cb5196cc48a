// Copyright (c) 2025 - Cowboy AI, Inc.
//! Schema Registry
//!
//! Registered event types form a closed sum type, [`EventKind`]. Adding an event
//! type means adding a payload struct, a variant and its arms; the compiler
//! points at every match that needs updating.
//!
//! Types without a variant are *unregistered*: their payload is accepted
//! unchecked (with a warning) so that producers rolling out a new event are
//! never blocked by consumers that do not know it yet.
//!
//! # Structural Checks
//!
//! Each payload implements [`EventSchema`]. A payload is checked in two passes
//! that both run to completion:
//!
//! 1. its JSON Schema (required fields, types, enums, unknown keys), compiled
//!    once per registered type
//! 2. [`EventSchema::refine`] applies format rules (emails, non-blank names) to
//!    every field that has the right JSON type
//!
//! Every violation is reported, each with a `data.`-prefixed field path. Only a
//! payload with no issues is deserialized into its struct.

pub mod user;

use std::collections::HashMap;

use jsonschema::error::ValidationErrorKind;
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::error;

use crate::envelope::EventEnvelope;
use crate::errors::{IssueCode, ValidationError, ValidationIssue};

pub use user::{UserCreated, UserDeleted, UserEvent, UserRole, UserRoleChanged, UserUpdated};

/// A payload with a structural schema
pub trait EventSchema: Serialize + DeserializeOwned {
    /// Event type name this payload belongs to
    const EVENT_TYPE: &'static str;

    /// JSON Schema of the payload object
    fn json_schema() -> Value;

    /// Format rules beyond the structural schema, applied to the raw payload
    fn refine(_data: &Map<String, Value>, _issues: &mut Vec<ValidationIssue>) {}
}

/// Registered event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    UserCreated,
    UserUpdated,
    UserDeleted,
    UserRoleChanged,
}

impl EventKind {
    /// Every registered type
    pub const ALL: [EventKind; 4] = [
        EventKind::UserCreated,
        EventKind::UserUpdated,
        EventKind::UserDeleted,
        EventKind::UserRoleChanged,
    ];

    /// Look up a registered type by its wire name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::UserCreated => UserCreated::EVENT_TYPE,
            EventKind::UserUpdated => UserUpdated::EVENT_TYPE,
            EventKind::UserDeleted => UserDeleted::EVENT_TYPE,
            EventKind::UserRoleChanged => UserRoleChanged::EVENT_TYPE,
        }
    }

    /// Aggregate family the type belongs to
    pub fn family(&self) -> &'static str {
        match self {
            EventKind::UserCreated
            | EventKind::UserUpdated
            | EventKind::UserDeleted
            | EventKind::UserRoleChanged => "User",
        }
    }

    fn json_schema(&self) -> Value {
        match self {
            EventKind::UserCreated => UserCreated::json_schema(),
            EventKind::UserUpdated => UserUpdated::json_schema(),
            EventKind::UserDeleted => UserDeleted::json_schema(),
            EventKind::UserRoleChanged => UserRoleChanged::json_schema(),
        }
    }

    /// Structural check of `data` against this type's schema
    pub fn validate_data(&self, data: &Value) -> Vec<ValidationIssue> {
        match self {
            EventKind::UserCreated => issues_of(check::<UserCreated>(data)),
            EventKind::UserUpdated => issues_of(check::<UserUpdated>(data)),
            EventKind::UserDeleted => issues_of(check::<UserDeleted>(data)),
            EventKind::UserRoleChanged => issues_of(check::<UserRoleChanged>(data)),
        }
    }
}

/// Typed view of an envelope's payload
#[derive(Debug, Clone, PartialEq)]
pub enum TypedEvent {
    User(UserEvent),
    /// A type with no registered schema; payload left as JSON
    Unregistered { event_type: String, data: Value },
}

impl TypedEvent {
    /// Parse the payload of `envelope` into its registered type
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, ValidationError> {
        let data = &envelope.data;
        let Some(kind) = EventKind::from_name(&envelope.event_type) else {
            return Ok(TypedEvent::Unregistered {
                event_type: envelope.event_type.clone(),
                data: data.clone(),
            });
        };

        let event = match kind {
            EventKind::UserCreated => UserEvent::Created(check(data).map_err(ValidationError::new)?),
            EventKind::UserUpdated => UserEvent::Updated(check(data).map_err(ValidationError::new)?),
            EventKind::UserDeleted => UserEvent::Deleted(check(data).map_err(ValidationError::new)?),
            EventKind::UserRoleChanged => {
                UserEvent::RoleChanged(check(data).map_err(ValidationError::new)?)
            }
        };
        Ok(TypedEvent::User(event))
    }

    pub fn kind(&self) -> Option<EventKind> {
        match self {
            TypedEvent::User(event) => Some(event.kind()),
            TypedEvent::Unregistered { .. } => None,
        }
    }
}

fn issues_of<T>(result: Result<T, Vec<ValidationIssue>>) -> Vec<ValidationIssue> {
    result.err().unwrap_or_default()
}

/// Compiled schemas of every registered type, keyed by type name
static SCHEMAS: Lazy<HashMap<&'static str, JSONSchema>> = Lazy::new(|| {
    EventKind::ALL
        .into_iter()
        .filter_map(|kind| match JSONSchema::compile(&kind.json_schema()) {
            Ok(schema) => Some((kind.name(), schema)),
            Err(err) => {
                error!(event_type = kind.name(), error = %err, "Event schema failed to compile");
                None
            }
        })
        .collect()
});

/// Check payload `S` and collect every violated field
pub fn check<S: EventSchema>(data: &Value) -> Result<S, Vec<ValidationIssue>> {
    let Some(object) = data.as_object() else {
        return Err(vec![ValidationIssue::new(
            "data",
            IssueCode::InvalidType,
            format!("expected an object, found {}", json_type(data)),
        )]);
    };

    let mut issues = SCHEMAS
        .get(S::EVENT_TYPE)
        .map(|schema| structural_issues(schema, data))
        .unwrap_or_default();
    S::refine(object, &mut issues);

    if !issues.is_empty() {
        issues.sort_by(|a, b| a.field_path.cmp(&b.field_path));
        return Err(issues);
    }
    serde_json::from_value(data.clone()).map_err(|err| vec![issue_from_serde(&err)])
}

fn structural_issues(schema: &JSONSchema, data: &Value) -> Vec<ValidationIssue> {
    match schema.validate(data) {
        Ok(()) => Vec::new(),
        Err(errors) => errors.flat_map(|err| issues_from_schema_error(&err)).collect(),
    }
}

fn issues_from_schema_error(err: &jsonschema::ValidationError<'_>) -> Vec<ValidationIssue> {
    let path = data_path(&err.instance_path.to_string());
    match &err.kind {
        ValidationErrorKind::Required { property } => {
            let name = property
                .as_str()
                .map_or_else(|| property.to_string(), str::to_string);
            vec![ValidationIssue::new(
                format!("{}.{}", path, name),
                IssueCode::Required,
                "is required",
            )]
        }
        ValidationErrorKind::AdditionalProperties { unexpected } => unexpected
            .iter()
            .map(|key| {
                ValidationIssue::new(
                    format!("{}.{}", path, key),
                    IssueCode::UnrecognizedKeys,
                    "is not part of the schema",
                )
            })
            .collect(),
        ValidationErrorKind::Type { .. } | ValidationErrorKind::Enum { .. }
            if err.instance.is_null() =>
        {
            vec![ValidationIssue::new(path, IssueCode::Required, "is required")]
        }
        ValidationErrorKind::Type { .. } | ValidationErrorKind::Enum { .. } => {
            vec![ValidationIssue::new(path, IssueCode::InvalidType, err.to_string())]
        }
        _ => vec![ValidationIssue::new(path, IssueCode::Custom, err.to_string())],
    }
}

/// `/a/b` instance pointer as a `data.a.b` field path
fn data_path(pointer: &str) -> String {
    pointer
        .split('/')
        .filter(|segment| !segment.is_empty())
        .fold("data".to_string(), |path, segment| {
            format!("{}.{}", path, segment.replace("~1", "/").replace("~0", "~"))
        })
}

/// String value of `field`, if present with that type
pub(crate) fn string_field<'a>(data: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    data.get(field).and_then(Value::as_str)
}

/// Map a serde_json error onto a field-level issue
fn issue_from_serde(err: &serde_json::Error) -> ValidationIssue {
    let message = err.to_string();
    let field = backticked(&message);

    if message.starts_with("missing field") {
        let path = field.map_or_else(|| "data".to_string(), |f| format!("data.{}", f));
        ValidationIssue::new(path, IssueCode::Required, "is required")
    } else if message.starts_with("unknown field") {
        let path = field.map_or_else(|| "data".to_string(), |f| format!("data.{}", f));
        ValidationIssue::new(path, IssueCode::UnrecognizedKeys, "is not part of the schema")
    } else {
        ValidationIssue::new("data", IssueCode::InvalidType, strip_position(&message))
    }
}

fn backticked(message: &str) -> Option<&str> {
    let start = message.find('`')? + 1;
    let len = message[start..].find('`')?;
    Some(&message[start..start + len])
}

fn strip_position(message: &str) -> String {
    match message.find(" at line ") {
        Some(idx) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Trimmed value is empty
pub(crate) fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

/// Loose address check: one `@`, non-empty local part, dotted domain, no spaces
pub(crate) fn is_email(value: &str) -> bool {
    let mut parts = value.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    !local.is_empty()
        && !value.chars().any(char::is_whitespace)
        && domain.split('.').count() >= 2
        && domain.split('.').all(|label| !label.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test]
    fn test_registry_lookup() {
        assert_eq!(EventKind::from_name("UserCreated"), Some(EventKind::UserCreated));
        assert_eq!(EventKind::from_name("userCreated"), None);
        assert_eq!(EventKind::from_name("TicketOpened"), None);
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.name()), Some(kind));
            assert_eq!(kind.family(), "User");
        }
    }

    #[test]
    fn test_every_missing_field_is_reported() {
        let issues = EventKind::UserCreated.validate_data(&json!({ "firstName": "John" }));
        let paths: Vec<&str> = issues.iter().map(|i| i.field_path.as_str()).collect();
        assert_eq!(paths, vec!["data.email", "data.lastName"]);
        assert!(issues.iter().all(|i| i.code == IssueCode::Required));
    }

    #[test]
    fn test_every_mistyped_field_is_reported() {
        let issues = EventKind::UserCreated
            .validate_data(&json!({ "email": 5, "firstName": 6, "lastName": 7 }));
        let found: Vec<(&str, IssueCode)> = issues
            .iter()
            .map(|i| (i.field_path.as_str(), i.code))
            .collect();
        assert_eq!(
            found,
            vec![
                ("data.email", IssueCode::InvalidType),
                ("data.firstName", IssueCode::InvalidType),
                ("data.lastName", IssueCode::InvalidType),
            ]
        );
    }

    #[test]
    fn test_format_rules_run_alongside_missing_fields() {
        let issues = EventKind::UserCreated
            .validate_data(&json!({ "email": "not-an-email", "firstName": "J", "extra": true }));
        let found: Vec<(&str, IssueCode)> = issues
            .iter()
            .map(|i| (i.field_path.as_str(), i.code))
            .collect();
        assert_eq!(
            found,
            vec![
                ("data.email", IssueCode::InvalidEmail),
                ("data.extra", IssueCode::UnrecognizedKeys),
                ("data.lastName", IssueCode::Required),
            ]
        );
    }

    #[test]
    fn test_null_required_field_counts_as_missing() {
        let issues = EventKind::UserRoleChanged
            .validate_data(&json!({ "previousRole": null, "newRole": "agent" }));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field_path, "data.previousRole");
        assert_eq!(issues[0].code, IssueCode::Required);
    }

    #[test]
    fn test_every_registered_schema_compiles() {
        for kind in EventKind::ALL {
            assert!(SCHEMAS.contains_key(kind.name()), "{} has no compiled schema", kind.name());
        }
    }

    #[test_case("", "data" ; "root")]
    #[test_case("/email", "data.email" ; "field")]
    #[test_case("/address/city", "data.address.city" ; "nested")]
    fn test_instance_pointer_to_field_path(pointer: &str, expected: &str) {
        assert_eq!(data_path(pointer), expected);
    }

    #[test]
    fn test_wrong_payload_shape() {
        let issues = EventKind::UserDeleted.validate_data(&json!(["not", "an", "object"]));
        assert_eq!(issues[0].field_path, "data");
        assert_eq!(issues[0].code, IssueCode::InvalidType);
        assert!(issues[0].message.contains("array"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let issues = EventKind::UserDeleted.validate_data(&json!({ "surprise": true }));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field_path, "data.surprise");
        assert_eq!(issues[0].code, IssueCode::UnrecognizedKeys);
    }

    #[test]
    fn test_type_mismatch_is_reported_without_position() {
        let issues = EventKind::UserCreated
            .validate_data(&json!({ "email": 5, "firstName": "J", "lastName": "D" }));
        assert_eq!(issues[0].code, IssueCode::InvalidType);
        assert!(!issues[0].message.contains("line"));
    }

    #[test_case("a@b.com", true ; "simple")]
    #[test_case("first.last@mail.example.org", true ; "subdomain")]
    #[test_case("a@b", false ; "undotted domain")]
    #[test_case("@b.com", false ; "empty local part")]
    #[test_case("a@@b.com", false ; "double at")]
    #[test_case("a b@c.com", false ; "whitespace")]
    #[test_case("a@b..com", false ; "empty label")]
    fn test_email_check(value: &str, expected: bool) {
        assert_eq!(is_email(value), expected);
    }

    #[test]
    fn test_typed_view_of_unregistered_event() {
        let envelope = EventEnvelope::builder("TicketOpened", "Ticket", "t-1")
            .data(json!({ "subject": "help" }))
            .build_unvalidated();

        let typed = TypedEvent::from_envelope(&envelope).unwrap();
        assert_eq!(typed.kind(), None);
        assert!(matches!(
            typed,
            TypedEvent::Unregistered { ref event_type, .. } if event_type == "TicketOpened"
        ));
    }
}
