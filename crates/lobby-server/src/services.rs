//! The wired service graph and the inbound event router.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use lobby_core::protocol::{inbound, join_room_event, leave_room_event, Frame, RoomRequest};
use lobby_core::{ConnectionId, Location, Token};
use lobby_store::SessionStore;

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::context::Caller;
use crate::dispatch::{ApiRegistry, Dispatcher};
use crate::presence::PresenceCoordinator;
use crate::registry::ConnectionRegistry;
use crate::sync::{SyncEngine, SyncRegistry};

/// `updateLocation` payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationUpdate {
    path_name: String,
    #[serde(default)]
    search_params: Map<String, Value>,
}

pub struct Services {
    pub sessions: Arc<SessionStore>,
    pub connections: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceCoordinator>,
    pub dispatcher: Dispatcher,
    pub sync: Arc<SyncEngine>,
    pub broadcaster: Broadcaster,
}

impl Services {
    /// Wire every component around one session store.
    pub fn new(
        config: &ServerConfig,
        sessions: Arc<SessionStore>,
        api: ApiRegistry,
        syncs: SyncRegistry,
    ) -> Arc<Self> {
        let connections = Arc::new(ConnectionRegistry::new(config.send_queue_size));
        let sync = Arc::new(SyncEngine::new(
            syncs,
            sessions.clone(),
            connections.clone(),
            config.yield_every,
        ));
        let presence = PresenceCoordinator::new(
            config.presence.clone(),
            sessions.clone(),
            connections.clone(),
            Some(sync.clone()),
        );
        presence.attach();
        let dispatcher = Dispatcher::new(
            api,
            sessions.clone(),
            connections.clone(),
            presence.clone(),
            config.handler_timeout,
        );
        let broadcaster = Broadcaster::new(connections.clone(), sessions.clone());
        Arc::new(Self {
            sessions,
            connections,
            presence,
            dispatcher,
            sync,
            broadcaster,
        })
    }

    /// Route one inbound frame from connection `id`.
    pub async fn route(&self, id: &ConnectionId, token: &Token, frame: Frame) {
        let caller = Caller::connection(token.clone(), id.clone());
        match frame.event.as_str() {
            inbound::API_REQUEST => {
                self.dispatcher.handle(&caller, frame.data).await;
            }
            inbound::SYNC => {
                self.sync.handle(&caller, frame.data).await;
            }
            inbound::JOIN_ROOM => self.join_room(id, token, frame.data).await,
            inbound::LEAVE_ROOM => self.leave_room(id, token, frame.data).await,
            inbound::UPDATE_LOCATION => self.update_location(token, frame.data).await,
            inbound::INTENTIONAL_DISCONNECT => {
                self.presence.intentional_disconnect(id, token).await;
            }
            other => debug!(event = other, "unknown event ignored"),
        }
    }

    async fn join_room(&self, id: &ConnectionId, token: &Token, data: Value) {
        let Ok(req) = serde_json::from_value::<RoomRequest>(data) else {
            warn!(token = %token, "unparseable joinRoom envelope");
            return;
        };
        if req.group.is_empty() {
            warn!(token = %token, "joinRoom without a group");
            return;
        }
        self.connections.join_room(id, &req.group);
        let group = req.group.clone();
        if let Err(e) = self.sessions.update(token, |s| s.code = Some(group)).await {
            warn!(token = %token, error = %e, "storing room code failed");
        }
        if let Some(index) = req.response_index {
            self.connections.emit(id, &join_room_event(index), Value::Null);
        }
        debug!(connection_id = %id, group = %req.group, "joined room");
    }

    async fn leave_room(&self, id: &ConnectionId, token: &Token, data: Value) {
        let Ok(req) = serde_json::from_value::<RoomRequest>(data) else {
            warn!(token = %token, "unparseable leaveRoom envelope");
            return;
        };
        self.connections.leave_room(id, &req.group);
        let group = req.group.clone();
        let cleared = self
            .sessions
            .update(token, |s| {
                if s.code.as_deref() == Some(group.as_str()) {
                    s.code = None;
                }
            })
            .await;
        if let Err(e) = cleared {
            warn!(token = %token, error = %e, "clearing room code failed");
        }
        if let Some(index) = req.response_index {
            self.connections.emit(id, &leave_room_event(index), Value::Null);
        }
        debug!(connection_id = %id, group = %req.group, "left room");
    }

    async fn update_location(&self, token: &Token, data: Value) {
        let update: LocationUpdate = match serde_json::from_value(data) {
            Ok(u) => u,
            Err(e) => {
                warn!(token = %token, error = %e, "unparseable updateLocation envelope");
                return;
            }
        };
        debug!(token = %token, path = %update.path_name, "updating location");

        let Some(mut session) = self.presence.leave_room(token, Some(&update.path_name)).await else {
            return;
        };
        session.location = Some(Location {
            path_name: update.path_name,
            search_params: update.search_params,
        });
        if let Err(e) = self.sessions.set(token, session, false).await {
            warn!(token = %token, error = %e, "storing location failed");
        }
    }
}
