//! Room broadcasts available to handlers.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use lobby_core::protocol::RECEIVER_ALL;
use lobby_core::Token;
use lobby_store::{SessionStore, StoreError};

use crate::registry::ConnectionRegistry;

#[derive(Clone, Debug, Default)]
pub struct BroadcastOptions {
    /// Attach each recipient's own session under `session`.
    pub with_session: bool,
    /// Skip the connections of this token.
    pub ignore: Option<Token>,
}

impl BroadcastOptions {
    pub fn with_session(mut self) -> Self {
        self.with_session = true;
        self
    }

    pub fn ignoring(mut self, token: Token) -> Self {
        self.ignore = Some(token);
        self
    }
}

/// Sends server-originated events to rooms, tokens or everyone.
#[derive(Clone)]
pub struct Broadcaster {
    connections: Arc<ConnectionRegistry>,
    sessions: Arc<SessionStore>,
}

impl Broadcaster {
    pub fn new(connections: Arc<ConnectionRegistry>, sessions: Arc<SessionStore>) -> Self {
        Self {
            connections,
            sessions,
        }
    }

    /// Emit `event` to every member of `room` (`"all"` targets everyone).
    /// Returns how many frames were queued.
    pub async fn to_room(
        &self,
        room: &str,
        event: &str,
        data: Value,
        opts: BroadcastOptions,
    ) -> Result<usize, StoreError> {
        if !opts.with_session {
            if room == RECEIVER_ALL {
                return Ok(self.emit_to_all(event, &data, opts.ignore.as_ref()));
            }
            return Ok(self
                .connections
                .emit_to_room(room, event, data, opts.ignore.as_ref()));
        }

        let members = if room == RECEIVER_ALL {
            self.connections.all_connections()
        } else {
            self.connections.room_members(room)
        };
        let mut sent = 0;
        for id in members {
            let Some(token) = self.connections.token_of(&id) else {
                continue;
            };
            if opts.ignore.as_ref() == Some(&token) {
                continue;
            }
            let session = self.sessions.load(Some(&token)).await?;
            let payload = attach_session(data.clone(), serde_json::to_value(&session)?);
            if self.connections.emit(&id, event, payload) {
                sent += 1;
            }
        }
        debug!(room, event, sent, "room broadcast");
        Ok(sent)
    }

    /// Emit to every connection of one token.
    pub fn to_token(&self, token: &Token, event: &str, data: Value) -> usize {
        self.connections.emit_to_room(token.room(), event, data, None)
    }

    fn emit_to_all(&self, event: &str, data: &Value, ignore: Option<&Token>) -> usize {
        self.connections
            .all_connections()
            .iter()
            .filter(|id| ignore.is_none() || self.connections.token_of(id).as_ref() != ignore)
            .filter(|id| self.connections.emit(id, event, data))
            .count()
    }
}

fn attach_session(data: Value, session: Value) -> Value {
    match data {
        Value::Object(mut map) => {
            map.insert("session".into(), session);
            Value::Object(map)
        }
        Value::Null => json!({ "session": session }),
        other => json!({ "data": other, "session": session }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lobby_core::protocol::Frame;
    use lobby_core::Session;
    use lobby_store::{KvStore, MemoryKv};
    use std::time::Duration;

    fn setup() -> (Arc<ConnectionRegistry>, Arc<SessionStore>, Broadcaster) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let sessions = Arc::new(SessionStore::new(kv, "test", Duration::from_secs(60)));
        let connections = Arc::new(ConnectionRegistry::new(16));
        let broadcaster = Broadcaster::new(connections.clone(), sessions.clone());
        (connections, sessions, broadcaster)
    }

    #[tokio::test]
    async fn with_session_attaches_each_recipients_record() {
        let (connections, sessions, broadcaster) = setup();
        let a = Token::new("A");
        let b = Token::new("B");
        sessions.set(&a, Session::for_user("u1"), true).await.unwrap();
        sessions.set(&b, Session::for_user("u2"), true).await.unwrap();
        let mut ra = connections.register(a.clone());
        let mut rb = connections.register(b.clone());
        connections.join_room(&ra.id, "G1");
        connections.join_room(&rb.id, "G1");

        let sent = broadcaster
            .to_room("G1", "gameUpdate", json!({"turn": 3}), BroadcastOptions::default().with_session())
            .await
            .unwrap();
        assert_eq!(sent, 2);

        let fa = Frame::parse(&ra.outbound.try_recv().unwrap()).unwrap();
        let fb = Frame::parse(&rb.outbound.try_recv().unwrap()).unwrap();
        assert_eq!(fa.data["turn"], 3);
        assert_eq!(fa.data["session"]["id"], "u1");
        assert_eq!(fb.data["session"]["id"], "u2");
    }

    #[tokio::test]
    async fn ignore_skips_token() {
        let (connections, _, broadcaster) = setup();
        let a = Token::new("A");
        let mut ra = connections.register(a.clone());
        let mut rb = connections.register(Token::new("B"));
        let sent = broadcaster
            .to_room(RECEIVER_ALL, "notice", json!({}), BroadcastOptions::default().ignoring(a))
            .await
            .unwrap();
        assert_eq!(sent, 1);
        assert!(ra.outbound.try_recv().is_err());
        assert!(rb.outbound.try_recv().is_ok());
    }

    #[test]
    fn non_object_payload_is_wrapped() {
        let v = attach_session(json!(5), json!({"id": "u1"}));
        assert_eq!(v, json!({"data": 5, "session": {"id": "u1"}}));
    }
}
