//! What a handler can see and touch while it runs.

use std::sync::Arc;

use lobby_core::{ConnectionId, Token};
use lobby_store::SessionStore;

use crate::broadcast::Broadcaster;
use crate::registry::ConnectionRegistry;

/// Who issued a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    pub token: Token,
    /// `None` for calls the server makes on a user's behalf.
    pub connection: Option<ConnectionId>,
}

impl Caller {
    pub fn connection(token: Token, id: ConnectionId) -> Self {
        Self {
            token,
            connection: Some(id),
        }
    }

    pub fn on_behalf_of(token: Token) -> Self {
        Self {
            token,
            connection: None,
        }
    }
}

/// Services passed to every API and sync handler.
#[derive(Clone)]
pub struct HandlerContext {
    pub sessions: Arc<SessionStore>,
    pub connections: Arc<ConnectionRegistry>,
    pub broadcaster: Broadcaster,
    pub token: Token,
    pub connection: Option<ConnectionId>,
    /// Caller's current room for API calls, the sync receiver for sync calls.
    pub room: Option<String>,
}
