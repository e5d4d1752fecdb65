//! Wire envelopes exchanged over the WebSocket.
//!
//! Every frame in both directions is a JSON text message
//! `{"event": string, "data": any}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound event names.
pub mod inbound {
    pub const API_REQUEST: &str = "apiRequest";
    pub const SYNC: &str = "sync";
    pub const JOIN_ROOM: &str = "joinRoom";
    pub const LEAVE_ROOM: &str = "leaveRoom";
    pub const UPDATE_LOCATION: &str = "updateLocation";
    pub const INTENTIONAL_DISCONNECT: &str = "intentionalDisconnect";
}

/// Outbound event names.
pub mod outbound {
    pub const SYNC: &str = "sync";
    pub const USER_AFK: &str = "userAfk";
    pub const USER_BACK: &str = "userBack";
    pub const UPDATE_SESSION: &str = "updateSession";
    pub const FORCE_LOGOUT: &str = "forceLogout";
    pub const LOGOUT: &str = "logout";
    pub const CONNECTION_ESTABLISHED: &str = "connection.established";
}

/// Reasons the transport reports for a closed connection.
pub mod reason {
    pub const TRANSPORT_CLOSE: &str = "transport close";
    pub const TRANSPORT_ERROR: &str = "transport error";
    pub const PING_TIMEOUT: &str = "ping timeout";
    pub const SERVER_DISCONNECT: &str = "server namespace disconnect";
    pub const SERVER_SHUTDOWN: &str = "server shutting down";
}

/// Reserved request names answered without the handler registry.
pub const SESSION_REQUEST: &str = "session";
pub const LOGOUT_REQUEST: &str = "logout";

/// Receiver value that targets every live connection.
pub const RECEIVER_ALL: &str = "all";

pub fn api_response_event(index: u64) -> String {
    format!("apiResponse-{index}")
}

pub fn sync_ack_event(index: u64) -> String {
    format!("sync-{index}")
}

pub fn join_room_event(index: u64) -> String {
    format!("joinRoom-{index}")
}

pub fn leave_room_event(index: u64) -> String {
    format!("leaveRoom-{index}")
}

/// A single frame on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Point-to-point call. Fields are loose so that malformed envelopes can be
/// answered with a descriptive error instead of being dropped.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequest {
    #[serde(default)]
    pub name: Value,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_index: Option<u64>,
}

/// Terminal status of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

/// Reply to an [`ApiRequest`], sent on `apiResponse-{responseIndex}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiReply {
    pub fn success(result: Value) -> Self {
        Self {
            status: ReplyStatus::Success,
            result: Some(result),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            result: None,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Room broadcast call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(default)]
    pub name: Value,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub cb: Value,
    #[serde(default)]
    pub receiver: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_index: Option<u64>,
    #[serde(default)]
    pub ignore_self: bool,
}

/// Event delivered to each recipient of a sync call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFanout {
    pub cb: String,
    pub server_data: Value,
    pub client_data: Value,
    pub message: String,
    pub status: ReplyStatus,
}

/// Caller acknowledgement sent on `sync-{responseIndex}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncAck {
    pub status: ReplyStatus,
    pub message: String,
}

impl SyncAck {
    pub fn success(name: &str) -> Self {
        Self {
            status: ReplyStatus::Success,
            message: format!("sync {name} success"),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            message: message.into(),
        }
    }
}

/// `joinRoom` / `leaveRoom` request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRequest {
    #[serde(default)]
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_index: Option<u64>,
}

/// `userAfk` notice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAfk {
    pub user_id: String,
    /// Milliseconds since the Unix epoch when the grace period ends.
    pub end_time: i64,
}

/// `userBack` notice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBack {
    pub user_id: String,
}

/// Human-readable rendering of a loosely-typed envelope field.
pub fn describe(value: &Value) -> String {
    match value {
        Value::Null => "undefined".into(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_round_trip_text() {
        let frame = Frame::new("apiRequest", json!({"name": "x"}));
        let parsed = Frame::parse(&frame.to_text()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn frame_without_data_parses() {
        let frame = Frame::parse(r#"{"event":"intentionalDisconnect"}"#).unwrap();
        assert_eq!(frame.data, Value::Null);
    }

    #[test]
    fn api_request_tolerates_missing_fields() {
        let req: ApiRequest = serde_json::from_value(json!({"name": "x"})).unwrap();
        assert_eq!(req.response_index, None);
        assert_eq!(req.data, Value::Null);
    }

    #[test]
    fn reply_shapes() {
        let ok = ApiReply::success(json!({"n": 1})).to_value();
        assert_eq!(ok, json!({"status": "success", "result": {"n": 1}}));
        let err = ApiReply::error("not found").to_value();
        assert_eq!(err, json!({"status": "error", "message": "not found"}));
    }

    #[test]
    fn fanout_uses_camel_case() {
        let fanout = SyncFanout {
            cb: "moved".into(),
            server_data: json!({}),
            client_data: json!({}),
            message: "move sync success".into(),
            status: ReplyStatus::Success,
        };
        let v = serde_json::to_value(&fanout).unwrap();
        assert!(v.get("serverData").is_some());
        assert!(v.get("clientData").is_some());
    }

    #[test]
    fn sync_request_reads_ignore_self() {
        let req: SyncRequest = serde_json::from_value(json!({
            "name": "move", "data": {}, "cb": "moved", "receiver": "R",
            "responseIndex": 3, "ignoreSelf": true
        }))
        .unwrap();
        assert!(req.ignore_self);
        assert_eq!(req.response_index, Some(3));
    }

    #[test]
    fn event_names() {
        assert_eq!(api_response_event(7), "apiResponse-7");
        assert_eq!(sync_ack_event(2), "sync-2");
        assert_eq!(join_room_event(1), "joinRoom-1");
    }
}
