//! Declarative authorization rules evaluated against a session.
//!
//! Evaluation is pure: the same policy and session always produce the same
//! verdict. Rules run in order and the first failing one decides the reason.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use crate::session::Session;

/// A session field as seen by the rule evaluator.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Objects and arrays. Never equal to anything under strict comparison.
    Object(Value),
}

impl FieldValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Self::String(s.clone()),
            Value::Array(_) | Value::Object(_) => Self::Object(value.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_falsy(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Bool(b) => !b,
            Self::Number(n) => *n == 0.0 || n.is_nan(),
            Self::String(s) => s.is_empty(),
            Self::Object(_) => false,
        }
    }

    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(FieldType::Boolean),
            Self::Number(_) => Some(FieldType::Number),
            Self::String(_) => Some(FieldType::String),
            Self::Object(_) => Some(FieldType::Object),
        }
    }

    /// Strict equality against an expected JSON value.
    pub fn strictly_equals(&self, expected: &Value) -> bool {
        match (self, expected) {
            (Self::Null, Value::Null) => true,
            (Self::Bool(a), Value::Bool(b)) => a == b,
            (Self::Number(a), Value::Number(b)) => b.as_f64().is_some_and(|b| *a == b),
            (Self::String(a), Value::String(b)) => a == b,
            _ => false,
        }
    }
}

/// Expected runtime type of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Undefined,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Undefined => "undefined",
        };
        f.write_str(s)
    }
}

/// One condition on a single session field.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Session field name. Empty means the policy is malformed.
    #[serde(default)]
    pub key: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
    /// `Some(Value::Null)` is a real expectation of null.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub exact_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub must_be_falsy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullish: Option<bool>,
}

impl Rule {
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn of_type(mut self, field_type: FieldType) -> Self {
        self.field_type = Some(field_type);
        self
    }

    pub fn equals(mut self, value: impl Into<Value>) -> Self {
        self.exact_value = Some(value.into());
        self
    }

    pub fn falsy(mut self, must_be_falsy: bool) -> Self {
        self.must_be_falsy = Some(must_be_falsy);
        self
    }

    pub fn nullish(mut self, nullish: bool) -> Self {
        self.nullish = Some(nullish);
        self
    }

    fn check(&self, session: &serde_json::Map<String, Value>) -> Result<(), String> {
        if self.key.is_empty() {
            return Err("Missing key in auth rule".into());
        }
        let key = &self.key;
        let Some(raw) = session.get(key) else {
            return Err(format!("Key {key} not found in session"));
        };
        let value = FieldValue::from_json(raw);

        if let Some(expect_null) = self.nullish {
            match (expect_null, value.is_null()) {
                (true, false) => return Err(format!("Expected {key} to be null or undefined")),
                (false, true) => {
                    return Err(format!("Expected {key} to be not null and not undefined"))
                }
                _ => {}
            }
        }

        if let Some(expected) = self.field_type {
            if let Some(actual) = value.field_type() {
                if actual != expected {
                    return Err(format!("Expected {key} to be of type {expected}"));
                }
            }
        }

        if let Some(expected) = &self.exact_value {
            if !value.strictly_equals(expected) {
                return Err(format!("Expected {key} to equal {expected}"));
            }
        }

        if let Some(must_be_falsy) = self.must_be_falsy {
            match (must_be_falsy, value.is_falsy()) {
                (true, false) => return Err(format!("Expected {key} to be falsy")),
                (false, true) => return Err(format!("Expected {key} to be truthy")),
                _ => {}
            }
        }

        Ok(())
    }
}

/// Outcome of evaluating a policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

pub const NOT_LOGGED_IN: &str = "not logged in";

/// Authorization requirements attached to a handler.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPolicy {
    #[serde(default)]
    pub requires_login: bool,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl AuthPolicy {
    /// Anyone, logged in or not.
    pub fn public() -> Self {
        Self::default()
    }

    pub fn login_required() -> Self {
        Self {
            requires_login: true,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn evaluate(&self, session: &Session) -> Verdict {
        if self.requires_login && !session.is_logged_in() {
            return Verdict::Reject(NOT_LOGGED_IN.into());
        }
        if self.rules.is_empty() {
            return Verdict::Accept;
        }
        let fields = session.to_fields();
        for rule in &self.rules {
            if let Err(reason) = rule.check(&fields) {
                return Verdict::Reject(reason);
            }
        }
        Verdict::Accept
    }
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}
