//! Live connections, their outbound queues and room membership.
//!
//! Every connection is bound to one token at handshake and joins the room
//! named after it. Rooms keep join order so fanout visits members
//! deterministically.

use std::sync::Arc;

use dashmap::DashMap;
use indexmap::{IndexMap, IndexSet};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use lobby_core::protocol::Frame;
use lobby_core::{ConnectionId, Token};

use crate::metrics::WS_SEND_DROPS_TOTAL;

struct Connection {
    token: Token,
    tx: mpsc::Sender<Arc<String>>,
    close: CancellationToken,
    close_reason: Mutex<Option<String>>,
}

/// Handle the socket task uses to learn about server-initiated closes.
#[derive(Clone)]
pub struct CloseSignal {
    token: CancellationToken,
}

impl CloseSignal {
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// What `register` hands back to the socket task.
pub struct Registration {
    pub id: ConnectionId,
    pub outbound: mpsc::Receiver<Arc<String>>,
    pub close: CloseSignal,
}

pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    order: Mutex<IndexSet<ConnectionId>>,
    rooms: Mutex<IndexMap<String, IndexSet<ConnectionId>>>,
    queue_size: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_size: usize) -> Self {
        Self {
            connections: DashMap::new(),
            order: Mutex::new(IndexSet::new()),
            rooms: Mutex::new(IndexMap::new()),
            queue_size: queue_size.max(1),
        }
    }

    /// Register a connection for `token` and join its token room.
    pub fn register(&self, token: Token) -> Registration {
        let id = ConnectionId::new();
        let (tx, outbound) = mpsc::channel(self.queue_size);
        let close = CancellationToken::new();
        let room = token.room().to_string();
        let conn = Arc::new(Connection {
            token,
            tx,
            close: close.clone(),
            close_reason: Mutex::new(None),
        });
        self.connections.insert(id.clone(), conn);
        self.order.lock().insert(id.clone());
        self.join_room(&id, &room);
        Registration {
            id,
            outbound,
            close: CloseSignal { token: close },
        }
    }

    /// Drop a connection from every room. Returns its token.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Token> {
        let (_, conn) = self.connections.remove(id)?;
        self.order.lock().shift_remove(id);
        let mut rooms = self.rooms.lock();
        rooms.retain(|_, members| {
            members.shift_remove(id);
            !members.is_empty()
        });
        Some(conn.token.clone())
    }

    pub fn join_room(&self, id: &ConnectionId, room: &str) -> bool {
        if !self.connections.contains_key(id) {
            return false;
        }
        let mut rooms = self.rooms.lock();
        rooms
            .entry(room.to_string())
            .or_default()
            .insert(id.clone())
    }

    pub fn leave_room(&self, id: &ConnectionId, room: &str) -> bool {
        let mut rooms = self.rooms.lock();
        let Some(members) = rooms.get_mut(room) else {
            return false;
        };
        let removed = members.shift_remove(id);
        if members.is_empty() {
            rooms.shift_remove(room);
        }
        removed
    }

    /// Members of `room` in join order.
    pub fn room_members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .lock()
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rooms `id` is currently in.
    pub fn rooms_of(&self, id: &ConnectionId) -> Vec<String> {
        self.rooms
            .lock()
            .iter()
            .filter(|(_, members)| members.contains(id))
            .map(|(room, _)| room.clone())
            .collect()
    }

    /// Every live connection in registration order.
    pub fn all_connections(&self) -> Vec<ConnectionId> {
        self.order.lock().iter().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn token_of(&self, id: &ConnectionId) -> Option<Token> {
        self.connections.get(id).map(|c| c.token.clone())
    }

    /// Connections currently in the token's room.
    pub fn connections_of(&self, token: &Token) -> Vec<ConnectionId> {
        self.room_members(token.room())
    }

    pub fn is_online(&self, token: &Token) -> bool {
        self.rooms
            .lock()
            .get(token.room())
            .is_some_and(|m| !m.is_empty())
    }

    /// Queue a frame for one connection. A full queue drops the frame.
    pub fn emit(&self, id: &ConnectionId, event: &str, data: impl Serialize) -> bool {
        let data = serde_json::to_value(data).unwrap_or(Value::Null);
        let text = Arc::new(Frame::new(event, data).to_text());
        self.send_text(id, text)
    }

    fn send_text(&self, id: &ConnectionId, text: Arc<String>) -> bool {
        let Some(conn) = self.connections.get(id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        match conn.tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                counter!(WS_SEND_DROPS_TOTAL).increment(1);
                warn!(
                    connection_id = %id,
                    msg_len = msg.len(),
                    "Send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Emit to every member of `room`, skipping connections of `except`.
    /// Returns how many frames were queued.
    pub fn emit_to_room(
        &self,
        room: &str,
        event: &str,
        data: impl Serialize,
        except: Option<&Token>,
    ) -> usize {
        let data = serde_json::to_value(data).unwrap_or(Value::Null);
        let text = Arc::new(Frame::new(event, data).to_text());
        let mut sent = 0;
        for id in self.room_members(room) {
            if except.is_some() && self.token_of(&id).as_ref() == except {
                continue;
            }
            if self.send_text(&id, Arc::clone(&text)) {
                sent += 1;
            }
        }
        sent
    }

    /// Ask the socket task to close with `reason`.
    pub fn close(&self, id: &ConnectionId, reason: &str) -> bool {
        let Some(conn) = self.connections.get(id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        conn.close_reason.lock().get_or_insert_with(|| reason.to_string());
        conn.close.cancel();
        debug!(connection_id = %id, reason, "server-initiated close");
        true
    }

    /// Reason recorded by [`close`](Self::close), if any.
    pub fn close_reason(&self, id: &ConnectionId) -> Option<String> {
        self.connections
            .get(id)
            .and_then(|c| c.close_reason.lock().clone())
    }

    /// Close every connection.
    pub fn close_all(&self, reason: &str) {
        for id in self.all_connections() {
            self.close(&id, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recv_frame(reg: &mut Registration) -> Frame {
        let text = reg.outbound.try_recv().expect("frame queued");
        Frame::parse(&text).unwrap()
    }

    #[test]
    fn register_joins_token_room() {
        let reg = ConnectionRegistry::new(8);
        let t = Token::new("T1");
        let r = reg.register(t.clone());
        assert!(reg.is_online(&t));
        assert_eq!(reg.connections_of(&t), vec![r.id.clone()]);
        assert_eq!(reg.token_of(&r.id), Some(t));
        assert_eq!(reg.rooms_of(&r.id), vec!["T1".to_string()]);
    }

    #[test]
    fn unregister_leaves_all_rooms() {
        let reg = ConnectionRegistry::new(8);
        let t = Token::new("T1");
        let r = reg.register(t.clone());
        reg.join_room(&r.id, "ROOM");
        assert_eq!(reg.unregister(&r.id), Some(t.clone()));
        assert!(!reg.is_online(&t));
        assert!(reg.room_members("ROOM").is_empty());
        assert_eq!(reg.connection_count(), 0);
        assert_eq!(reg.unregister(&r.id), None);
    }

    #[test]
    fn rooms_keep_join_order() {
        let reg = ConnectionRegistry::new(8);
        let ids: Vec<_> = (0..5)
            .map(|i| reg.register(Token::new(format!("T{i}"))).id)
            .collect();
        for id in ids.iter().rev() {
            reg.join_room(id, "ROOM");
        }
        let expected: Vec<_> = ids.iter().rev().cloned().collect();
        assert_eq!(reg.room_members("ROOM"), expected);

        reg.leave_room(&ids[2], "ROOM");
        let expected: Vec<_> = ids.iter().rev().filter(|i| *i != &ids[2]).cloned().collect();
        assert_eq!(reg.room_members("ROOM"), expected);
        assert_eq!(reg.all_connections(), ids);
    }

    #[test]
    fn join_unknown_connection_fails() {
        let reg = ConnectionRegistry::new(8);
        assert!(!reg.join_room(&ConnectionId::new(), "ROOM"));
    }

    #[test]
    fn emit_queues_frame() {
        let reg = ConnectionRegistry::new(8);
        let mut r = reg.register(Token::new("T1"));
        assert!(reg.emit(&r.id, "apiResponse-1", json!({"status": "success"})));
        let frame = recv_frame(&mut r);
        assert_eq!(frame.event, "apiResponse-1");
        assert_eq!(frame.data["status"], "success");
    }

    #[test]
    fn full_queue_drops() {
        let reg = ConnectionRegistry::new(1);
        let r = reg.register(Token::new("T1"));
        assert!(reg.emit(&r.id, "a", json!(1)));
        assert!(!reg.emit(&r.id, "b", json!(2)));
    }

    #[test]
    fn emit_to_room_skips_excepted_token() {
        let reg = ConnectionRegistry::new(8);
        let a = Token::new("A");
        let mut a1 = reg.register(a.clone());
        let mut a2 = reg.register(a.clone());
        let mut b = reg.register(Token::new("B"));
        for id in [&a1.id, &a2.id, &b.id] {
            reg.join_room(id, "ROOM");
        }
        assert_eq!(reg.emit_to_room("ROOM", "userBack", json!({"userId": "u1"}), Some(&a)), 1);
        assert_eq!(recv_frame(&mut b).event, "userBack");
        assert!(a1.outbound.try_recv().is_err());
        assert!(a2.outbound.try_recv().is_err());
    }

    #[test]
    fn emit_to_token_room_reaches_every_tab() {
        let reg = ConnectionRegistry::new(8);
        let a = Token::new("A");
        let mut a1 = reg.register(a.clone());
        let mut a2 = reg.register(a.clone());
        assert_eq!(reg.emit_to_room(a.room(), "forceLogout", Value::Null, None), 2);
        assert_eq!(recv_frame(&mut a1).event, "forceLogout");
        assert_eq!(recv_frame(&mut a2).event, "forceLogout");
    }

    #[tokio::test]
    async fn close_signals_socket_task() {
        let reg = ConnectionRegistry::new(8);
        let r = reg.register(Token::new("A"));
        assert!(!r.close.is_closed());
        assert!(reg.close(&r.id, "server namespace disconnect"));
        r.close.closed().await;
        assert_eq!(
            reg.close_reason(&r.id).as_deref(),
            Some("server namespace disconnect")
        );
    }

    #[test]
    fn first_close_reason_wins() {
        let reg = ConnectionRegistry::new(8);
        let r = reg.register(Token::new("A"));
        reg.close(&r.id, "server namespace disconnect");
        reg.close(&r.id, "server shutting down");
        assert_eq!(
            reg.close_reason(&r.id).as_deref(),
            Some("server namespace disconnect")
        );
    }
}
