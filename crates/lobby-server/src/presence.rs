//! Presence: grace periods after disconnects, away/back notices and the
//! logout path.
//!
//! Each token is connected, in a grace period, or gone. A token has at most
//! one pending grace timer; a timer only acts if it is still the token's
//! current one when it fires.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use lobby_core::protocol::{outbound, reason, UserAfk, UserBack};
use lobby_core::{ConnectionId, Session, Token};
use lobby_settings::{DisconnectClass, PresenceSettings};
use lobby_store::{SessionEvents, SessionStore, StoreError};

use crate::context::Caller;
use crate::metrics::{PRESENCE_GRACE_EXPIRED_TOTAL, PRESENCE_GRACE_STARTED_TOTAL};
use crate::registry::ConnectionRegistry;
use crate::sync::{SyncCall, SyncEngine};

/// Who asked for a logout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogoutOrigin {
    /// The connection sent a `logout` request itself.
    SelfRequested(ConnectionId),
    /// Another login of the same identity took the active slot.
    Evicted,
}

struct GraceTimer {
    generation: u64,
    abort: AbortHandle,
    preserve_session: bool,
}

#[derive(Default)]
struct PresenceState {
    timers: HashMap<Token, GraceTimer>,
    /// Tokens that announced a voluntary disconnect.
    switched_away: HashSet<Token>,
    /// Tokens whose room has been told they are away.
    away: HashSet<Token>,
}

pub struct PresenceCoordinator {
    settings: PresenceSettings,
    sessions: Arc<SessionStore>,
    connections: Arc<ConnectionRegistry>,
    leave_sync: Option<Arc<SyncEngine>>,
    state: Mutex<PresenceState>,
    generation: AtomicU64,
    this: Weak<PresenceCoordinator>,
}

impl PresenceCoordinator {
    pub fn new(
        settings: PresenceSettings,
        sessions: Arc<SessionStore>,
        connections: Arc<ConnectionRegistry>,
        leave_sync: Option<Arc<SyncEngine>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            settings,
            sessions,
            connections,
            leave_sync,
            state: Mutex::new(PresenceState::default()),
            generation: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    /// Route session-store side effects through this coordinator.
    pub fn attach(self: &Arc<Self>) {
        let events: Arc<dyn SessionEvents> = self.clone();
        self.sessions.attach_events(&events);
    }

    pub fn has_pending_timer(&self, token: &Token) -> bool {
        self.state.lock().timers.contains_key(token)
    }

    pub fn pending_timers(&self) -> usize {
        self.state.lock().timers.len()
    }

    /// A connection for `token` registered. Cancels any grace period and
    /// tells the room the user is back.
    pub async fn on_connect(&self, token: &Token) {
        if !self.settings.enabled {
            return;
        }
        let returning = {
            let mut state = self.state.lock();
            let had_timer = match state.timers.remove(token) {
                Some(timer) => {
                    timer.abort.abort();
                    true
                }
                None => false,
            };
            let was_away = state.away.remove(token);
            state.switched_away.remove(token);
            had_timer || was_away
        };
        if !returning {
            return;
        }

        debug!(token = %token, "grace period cancelled by reconnect");
        let session = match self.sessions.get(token).await {
            Ok(Some(s)) => s,
            Ok(None) => return,
            Err(e) => {
                warn!(token = %token, error = %e, "session lookup failed on reconnect");
                return;
            }
        };
        if let (Some(user_id), Some(room)) = (session.user_id(), session.room()) {
            let notice = UserBack {
                user_id: user_id.to_string(),
            };
            self.connections
                .emit_to_room(room, outbound::USER_BACK, notice, Some(token));
        }
    }

    /// A connection for `token` went away with `reason`. The connection must
    /// already be unregistered.
    pub fn on_disconnect(&self, token: &Token, reason: &str) {
        if !self.settings.enabled {
            return;
        }
        let mut state = self.state.lock();
        let switched = state.switched_away.contains(token);
        let class = self.settings.classify(reason, switched);
        if class == DisconnectClass::Ignored {
            debug!(token = %token, reason, "ignored disconnect reason");
            return;
        }
        if switched {
            state.switched_away.remove(token);
        }
        if self.connections.is_online(token) {
            if switched {
                state.away.remove(token);
            }
            debug!(token = %token, reason, "token still has live connections");
            return;
        }

        let grace = self.settings.grace_for(class);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let this = self.this.clone();
        let timer_token = token.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(this) = this.upgrade() {
                this.expire(&timer_token, generation).await;
            }
        });

        let timer = GraceTimer {
            generation,
            abort: handle.abort_handle(),
            preserve_session: class == DisconnectClass::Voluntary,
        };
        if let Some(previous) = state.timers.insert(token.clone(), timer) {
            previous.abort.abort();
        }
        counter!(PRESENCE_GRACE_STARTED_TOTAL, "class" => class_label(class)).increment(1);
        info!(token = %token, reason, grace_ms = grace.as_millis() as u64, "grace period started");
    }

    /// Fire path of a grace timer. Stale generations do nothing.
    async fn expire(&self, token: &Token, generation: u64) {
        let preserve_session = {
            let mut state = self.state.lock();
            match state.timers.get(token) {
                Some(timer) if timer.generation == generation => {}
                _ => return,
            }
            let Some(timer) = state.timers.remove(token) else {
                return;
            };
            state.away.remove(token);
            timer.preserve_session
        };

        counter!(PRESENCE_GRACE_EXPIRED_TOTAL).increment(1);
        info!(token = %token, preserve_session, "grace period expired");

        self.leave_room(token, None).await;
        if preserve_session {
            return;
        }
        let returned =
            self.connections.is_online(token) || self.state.lock().timers.contains_key(token);
        if returned {
            debug!(token = %token, "token came back during expiry, session kept");
            return;
        }
        if let Err(e) = self.sessions.delete(token).await {
            warn!(token = %token, error = %e, "session delete after grace failed");
        }
    }

    /// The client is switching away on purpose: tell the room and close.
    pub async fn intentional_disconnect(&self, id: &ConnectionId, token: &Token) {
        if self.settings.enabled {
            {
                let mut state = self.state.lock();
                state.switched_away.insert(token.clone());
                state.away.insert(token.clone());
            }
            let grace = self.settings.grace_for(DisconnectClass::Voluntary);
            match self.sessions.get(token).await {
                Ok(Some(session)) => self.announce_away(token, &session, grace),
                Ok(None) => {}
                Err(e) => warn!(token = %token, error = %e, "session lookup failed"),
            }
        }
        self.connections.close(id, reason::SERVER_DISCONNECT);
    }

    fn announce_away(&self, token: &Token, session: &Session, grace: Duration) {
        let (Some(user_id), Some(room)) = (session.user_id(), session.room()) else {
            return;
        };
        let end_time = Utc::now().timestamp_millis() + grace.as_millis() as i64;
        let notice = UserAfk {
            user_id: user_id.to_string(),
            end_time,
        };
        self.connections
            .emit_to_room(room, outbound::USER_AFK, notice, Some(token));
    }

    /// Log `token` out. Returns whether the session was removed cleanly.
    pub async fn logout(&self, token: &Token, origin: LogoutOrigin) -> bool {
        {
            let mut state = self.state.lock();
            if let Some(timer) = state.timers.remove(token) {
                timer.abort.abort();
            }
            state.switched_away.remove(token);
            state.away.remove(token);
        }

        let targets = match &origin {
            LogoutOrigin::SelfRequested(id) => vec![id.clone()],
            LogoutOrigin::Evicted => self.connections.connections_of(token),
        };

        let result: Result<(), StoreError> = async {
            self.leave_room(token, None).await;
            if let LogoutOrigin::SelfRequested(id) = &origin {
                self.connections.leave_room(id, token.room());
            }
            self.sessions.delete(token).await?;
            Ok(())
        }
        .await;

        let ok = match &result {
            Ok(()) => true,
            Err(e) => {
                warn!(token = %token, error = %e, "logout failed");
                false
            }
        };
        let status = if ok { "success" } else { "error" };
        for id in &targets {
            self.connections.emit(id, outbound::LOGOUT, status);
        }
        if origin == LogoutOrigin::Evicted {
            for id in &targets {
                self.connections.leave_room(id, token.room());
            }
        }
        info!(token = %token, ?origin, ok, "logged out");
        ok
    }

    /// Take the token's connections out of its current room when it moves to
    /// `new_path` (or disappears, when `None`). Returns the session read.
    pub async fn leave_room(&self, token: &Token, new_path: Option<&str>) -> Option<Session> {
        let session = match self.sessions.get(token).await {
            Ok(Some(s)) => s,
            Ok(None) => return None,
            Err(e) => {
                warn!(token = %token, error = %e, "session lookup failed in room leave");
                return None;
            }
        };
        let (Some(room), Some(path)) = (session.room(), session.path_name()) else {
            return Some(session);
        };
        if new_path == Some(path) {
            return Some(session);
        }

        for id in self.connections.connections_of(token) {
            self.connections.leave_room(&id, room);
        }
        debug!(token = %token, room, "left room");

        if let (Some(name), Some(engine)) = (&self.settings.leave_sync, &self.leave_sync) {
            let call = SyncCall {
                name: name.clone(),
                data: json!({ "roomCode": room, "session": session }),
                cb: name.clone(),
                receiver: room.to_string(),
                ignore_self: true,
            };
            if let Err(e) = engine.run(&Caller::on_behalf_of(token.clone()), &call).await {
                debug!(token = %token, room, error = %e, "room leave sync not delivered");
            }
        }
        Some(session)
    }
}

fn class_label(class: DisconnectClass) -> &'static str {
    match class {
        DisconnectClass::Ignored => "ignored",
        DisconnectClass::Voluntary => "voluntary",
        DisconnectClass::Abrupt => "abrupt",
        DisconnectClass::Other => "other",
    }
}

#[async_trait]
impl SessionEvents for PresenceCoordinator {
    fn is_online(&self, token: &Token) -> bool {
        self.connections.is_online(token)
    }

    fn session_updated(&self, token: &Token, session: &Session) {
        self.connections
            .emit_to_room(token.room(), outbound::UPDATE_SESSION, session, None);
    }

    fn session_deleted(&self, token: &Token) {
        self.connections
            .emit_to_room(token.room(), outbound::FORCE_LOGOUT, Value::Null, None);
    }

    async fn evict(&self, token: &Token, user_id: &str) {
        info!(token = %token, user_id, "evicting previous login");
        self.logout(token, LogoutOrigin::Evicted).await;
    }
}
