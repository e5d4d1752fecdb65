//! Session record stored per token.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::Token;

/// Where a user currently is inside the client application.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub path_name: String,
    #[serde(default)]
    pub search_params: Map<String, Value>,
}

impl Location {
    pub fn new(path_name: impl Into<String>) -> Self {
        Self {
            path_name: path_name.into(),
            search_params: Map::new(),
        }
    }
}

/// The mutable record of a logged-in identity's attributes.
///
/// Absent optional fields are omitted from the stored JSON, so a policy rule
/// naming them sees the key as missing. Fields the login flow adds beyond
/// the known layout are kept in `extra` and round-trip untouched. A known
/// field stored as `null` or with an unexpected type also lands in `extra`
/// under its own name: the typed accessor reads `None` while the raw value
/// stays visible to policy rules.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Session {
    /// Identity id. `None` means the token is not logged in.
    pub id: Option<String>,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub language: Option<String>,
    pub theme: Option<String>,
    pub admin: Option<bool>,
    /// Code of the group room the user last joined.
    pub code: Option<String>,
    pub location: Option<Location>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Token the record was read under. Attached on read, never trusted on write.
    pub token: Option<Token>,
    pub extra: Map<String, Value>,
}

impl Session {
    /// A fresh logged-in session for `user_id`.
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn is_logged_in(&self) -> bool {
        self.user_id().is_some()
    }

    /// The room code the user is currently considered "in".
    pub fn room(&self) -> Option<&str> {
        self.code.as_deref().filter(|c| !c.is_empty())
    }

    pub fn path_name(&self) -> Option<&str> {
        self.location.as_ref().map(|l| l.path_name.as_str())
    }

    /// Parse a stored record. Never fails on an object; anything else is
    /// treated as an empty record.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self::from(fields),
            _ => Self::default(),
        }
    }

    /// Flatten the record into its JSON object form, including raw values
    /// the typed fields could not hold.
    pub fn to_fields(&self) -> Map<String, Value> {
        Map::from(self.clone())
    }

    /// Look up a field by its wire name.
    pub fn field(&self, key: &str) -> Option<Value> {
        self.to_fields().remove(key)
    }

    /// Stamp write timestamps.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if self.created_at.is_none() {
            self.created_at = Some(now);
        }
        self.updated_at = Some(now);
    }
}

/// Remove `key` from `fields` when `parse` accepts its value. Rejected
/// values stay behind.
fn take<T>(
    fields: &mut Map<String, Value>,
    key: &str,
    parse: impl FnOnce(&Value) -> Option<T>,
) -> Option<T> {
    let parsed = parse(fields.get(key)?)?;
    fields.remove(key);
    Some(parsed)
}

fn as_string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

fn as_typed<T: DeserializeOwned>(value: &Value) -> Option<T> {
    if value.is_null() {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

fn put(fields: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        fields.insert(key.to_string(), value);
    }
}

impl From<Map<String, Value>> for Session {
    fn from(mut fields: Map<String, Value>) -> Self {
        let id = take(&mut fields, "id", |v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        Self {
            id,
            name: take(&mut fields, "name", as_string),
            avatar: take(&mut fields, "avatar", as_string),
            language: take(&mut fields, "language", as_string),
            theme: take(&mut fields, "theme", as_string),
            admin: take(&mut fields, "admin", Value::as_bool),
            code: take(&mut fields, "code", as_string),
            location: take(&mut fields, "location", as_typed),
            created_at: take(&mut fields, "createdAt", as_typed),
            updated_at: take(&mut fields, "updatedAt", as_typed),
            token: take(&mut fields, "token", |v| v.as_str().map(Token::new)),
            extra: fields,
        }
    }
}

impl From<Session> for Map<String, Value> {
    fn from(session: Session) -> Self {
        let mut fields = session.extra;
        put(&mut fields, "id", session.id.map(Value::String));
        put(&mut fields, "name", session.name.map(Value::String));
        put(&mut fields, "avatar", session.avatar.map(Value::String));
        put(&mut fields, "language", session.language.map(Value::String));
        put(&mut fields, "theme", session.theme.map(Value::String));
        put(&mut fields, "admin", session.admin.map(Value::Bool));
        put(&mut fields, "code", session.code.map(Value::String));
        put(
            &mut fields,
            "location",
            session.location.and_then(|l| serde_json::to_value(l).ok()),
        );
        put(
            &mut fields,
            "createdAt",
            session.created_at.and_then(|t| serde_json::to_value(t).ok()),
        );
        put(
            &mut fields,
            "updatedAt",
            session.updated_at.and_then(|t| serde_json::to_value(t).ok()),
        );
        put(
            &mut fields,
            "token",
            session.token.map(|t| Value::String(t.as_str().to_string())),
        );
        fields
    }
}
