// Copyright (c) 2025 - Cowboy AI, Inc.
//! User event family

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{is_blank, is_email, string_field, EventKind, EventSchema};
use crate::errors::{IssueCode, ValidationIssue};

/// Role a user holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Agent,
    Customer,
}

/// Wire names of [`UserRole`]
const ROLE_NAMES: [&str; 3] = ["admin", "agent", "customer"];

/// A user account was created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserCreated {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<UserRole>,
}

impl EventSchema for UserCreated {
    const EVENT_TYPE: &'static str = "UserCreated";

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "email": { "type": "string" },
                "firstName": { "type": "string" },
                "lastName": { "type": "string" },
                "role": { "enum": [ROLE_NAMES[0], ROLE_NAMES[1], ROLE_NAMES[2], null] }
            },
            "required": ["email", "firstName", "lastName"],
            "additionalProperties": false
        })
    }

    fn refine(data: &Map<String, Value>, issues: &mut Vec<ValidationIssue>) {
        check_email(string_field(data, "email"), issues);
        check_name("data.firstName", string_field(data, "firstName"), issues);
        check_name("data.lastName", string_field(data, "lastName"), issues);
    }
}

/// Profile fields changed; only the changed fields are present
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserUpdated {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

impl EventSchema for UserUpdated {
    const EVENT_TYPE: &'static str = "UserUpdated";

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "email": { "type": ["string", "null"] },
                "firstName": { "type": ["string", "null"] },
                "lastName": { "type": ["string", "null"] }
            },
            "additionalProperties": false
        })
    }

    fn refine(data: &Map<String, Value>, issues: &mut Vec<ValidationIssue>) {
        let changed = ["email", "firstName", "lastName"]
            .iter()
            .any(|field| data.get(*field).is_some_and(|value| !value.is_null()));
        if !changed {
            issues.push(ValidationIssue::new(
                "data",
                IssueCode::Custom,
                "at least one of email, firstName or lastName must change",
            ));
        }
        check_email(string_field(data, "email"), issues);
        check_name("data.firstName", string_field(data, "firstName"), issues);
        check_name("data.lastName", string_field(data, "lastName"), issues);
    }
}

/// A user account was removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserDeleted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EventSchema for UserDeleted {
    const EVENT_TYPE: &'static str = "UserDeleted";

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": { "reason": { "type": ["string", "null"] } },
            "additionalProperties": false
        })
    }
}

/// A user's role changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserRoleChanged {
    pub previous_role: UserRole,
    pub new_role: UserRole,
}

impl EventSchema for UserRoleChanged {
    const EVENT_TYPE: &'static str = "UserRoleChanged";

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "previousRole": { "enum": ROLE_NAMES },
                "newRole": { "enum": ROLE_NAMES }
            },
            "required": ["previousRole", "newRole"],
            "additionalProperties": false
        })
    }

    fn refine(data: &Map<String, Value>, issues: &mut Vec<ValidationIssue>) {
        let previous = string_field(data, "previousRole");
        if previous.is_some() && previous == string_field(data, "newRole") {
            issues.push(ValidationIssue::new(
                "data.newRole",
                IssueCode::Custom,
                "must differ from previousRole",
            ));
        }
    }
}

/// Typed user events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    Created(UserCreated),
    Updated(UserUpdated),
    Deleted(UserDeleted),
    RoleChanged(UserRoleChanged),
}

impl UserEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            UserEvent::Created(_) => EventKind::UserCreated,
            UserEvent::Updated(_) => EventKind::UserUpdated,
            UserEvent::Deleted(_) => EventKind::UserDeleted,
            UserEvent::RoleChanged(_) => EventKind::UserRoleChanged,
        }
    }
}

fn check_email(email: Option<&str>, issues: &mut Vec<ValidationIssue>) {
    if let Some(email) = email {
        if !is_email(email) {
            issues.push(ValidationIssue::new(
                "data.email",
                IssueCode::InvalidEmail,
                format!("'{}' is not a valid email address", email),
            ));
        }
    }
}

fn check_name(path: &str, name: Option<&str>, issues: &mut Vec<ValidationIssue>) {
    if name.is_some_and(is_blank) {
        issues.push(ValidationIssue::new(path, IssueCode::Required, "must not be blank"));
    }
}
