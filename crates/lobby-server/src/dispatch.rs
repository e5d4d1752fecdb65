//! API handler registry and request dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use lobby_core::protocol::{
    api_response_event, describe, ApiReply, ApiRequest, LOGOUT_REQUEST, SESSION_REQUEST,
};
use lobby_core::{AuthPolicy, HandlerError, Session, Verdict};
use lobby_store::{SessionStore, StoreError};

use crate::broadcast::Broadcaster;
use crate::context::{Caller, HandlerContext};
use crate::metrics::{API_ERRORS_TOTAL, API_REQUESTS_TOTAL, API_REQUEST_DURATION_SECONDS};
use crate::presence::{LogoutOrigin, PresenceCoordinator};
use crate::registry::ConnectionRegistry;

/// Trait implemented by every API handler.
#[async_trait]
pub trait ApiHandler: Send + Sync {
    /// Checked against the caller's session before `handle` runs.
    fn policy(&self) -> AuthPolicy {
        AuthPolicy::public()
    }

    /// `Ok(None)` (or `Some(null)`) is reported to the caller as an error.
    async fn handle(
        &self,
        data: Value,
        session: Session,
        ctx: HandlerContext,
    ) -> Result<Option<Value>, HandlerError>;
}

/// Registry mapping request names to handlers.
#[derive(Default)]
pub struct ApiRegistry {
    handlers: HashMap<String, Arc<dyn ApiHandler>>,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Reserved names are never reached. Returns whether
    /// an earlier handler under `name` was replaced.
    pub fn register(&mut self, name: &str, handler: impl ApiHandler + 'static) -> bool {
        if name == SESSION_REQUEST || name == LOGOUT_REQUEST {
            warn!(name, "handler registered under a reserved name will never run");
        }
        let replaced = self.handlers.insert(name.to_owned(), Arc::new(handler)).is_some();
        if replaced {
            warn!(name, "handler replaced by a later registration");
        }
        replaced
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ApiHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names (sorted).
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, thiserror::Error)]
enum DispatchError {
    #[error("socket message was incomplete, needs a name {name} and data: {data}")]
    Malformed { name: String, data: String },
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Handler(HandlerError),
    #[error("handler timed out")]
    Timeout,
    #[error("handler panicked")]
    Panicked,
    #[error("handler returned nothing")]
    Empty,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl DispatchError {
    fn error_kind(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "malformed",
            Self::NotFound => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::Handler(e) => e.error_kind(),
            Self::Timeout => "timeout",
            Self::Panicked => "panic",
            Self::Empty => "empty",
            Self::Store(_) => "store",
        }
    }
}

pub struct Dispatcher {
    registry: ApiRegistry,
    sessions: Arc<SessionStore>,
    connections: Arc<ConnectionRegistry>,
    presence: Arc<PresenceCoordinator>,
    broadcaster: Broadcaster,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: ApiRegistry,
        sessions: Arc<SessionStore>,
        connections: Arc<ConnectionRegistry>,
        presence: Arc<PresenceCoordinator>,
        timeout: Duration,
    ) -> Self {
        let broadcaster = Broadcaster::new(connections.clone(), sessions.clone());
        Self {
            registry,
            sessions,
            connections,
            presence,
            broadcaster,
            timeout,
        }
    }

    pub fn registry(&self) -> &ApiRegistry {
        &self.registry
    }

    /// Handle an inbound `apiRequest` frame. Exactly one reply is sent on
    /// `apiResponse-{responseIndex}`; envelopes without an index are dropped.
    pub async fn handle(&self, caller: &Caller, raw: Value) -> Option<ApiReply> {
        let request: ApiRequest = match serde_json::from_value(raw) {
            Ok(r) => r,
            Err(e) => {
                warn!(token = %caller.token, error = %e, "unparseable api envelope");
                return None;
            }
        };
        let Some(index) = request.response_index else {
            debug!(name = %describe(&request.name), "api request without responseIndex dropped");
            return None;
        };
        let reply = self.dispatch(caller, request).await;
        if let Some(conn) = &caller.connection {
            self.connections
                .emit(conn, &api_response_event(index), reply.to_value());
        }
        Some(reply)
    }

    /// Resolve one request into its reply.
    #[instrument(skip_all, fields(name = %describe(&request.name), token = %caller.token))]
    pub async fn dispatch(&self, caller: &Caller, request: ApiRequest) -> ApiReply {
        let name = request.name.as_str().unwrap_or_default().to_string();
        match name.as_str() {
            SESSION_REQUEST => return self.current_session(caller).await,
            LOGOUT_REQUEST => return self.logout(caller).await,
            _ => {}
        }

        counter!(API_REQUESTS_TOTAL, "name" => name.clone()).increment(1);
        let start = Instant::now();
        let result = self.invoke(caller, &name, request).await;
        let duration = start.elapsed();
        histogram!(API_REQUEST_DURATION_SECONDS, "name" => name.clone())
            .record(duration.as_secs_f64());
        if duration.as_secs() >= 5 {
            warn!(name, duration_secs = duration.as_secs_f64(), "slow api request");
        }

        match result {
            Ok(value) => ApiReply::success(value),
            Err(e) => {
                counter!(API_ERRORS_TOTAL, "name" => name.clone(), "error_type" => e.error_kind())
                    .increment(1);
                match &e {
                    DispatchError::Unauthorized(reason) => {
                        warn!(name, reason = %reason, "api request rejected by auth policy")
                    }
                    DispatchError::NotFound | DispatchError::Malformed { .. } => {
                        debug!(name, error = %e, "api request refused")
                    }
                    _ => warn!(name, error = %e, "api request failed"),
                }
                ApiReply::error(e.to_string())
            }
        }
    }

    async fn invoke(
        &self,
        caller: &Caller,
        name: &str,
        request: ApiRequest,
    ) -> Result<Value, DispatchError> {
        if name.is_empty() || !request.data.is_object() {
            return Err(DispatchError::Malformed {
                name: describe(&request.name),
                data: describe(&request.data),
            });
        }
        let handler = self.registry.get(name).ok_or(DispatchError::NotFound)?;

        let session = self.sessions.load(Some(&caller.token)).await?;
        if let Verdict::Reject(reason) = handler.policy().evaluate(&session) {
            return Err(DispatchError::Unauthorized(reason));
        }

        let ctx = HandlerContext {
            sessions: self.sessions.clone(),
            connections: self.connections.clone(),
            broadcaster: self.broadcaster.clone(),
            token: caller.token.clone(),
            connection: caller.connection.clone(),
            room: session.room().map(str::to_string),
        };
        let task = tokio::spawn(async move { handler.handle(request.data, session, ctx).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(self.timeout, task).await {
            Err(_elapsed) => {
                abort.abort();
                Err(DispatchError::Timeout)
            }
            Ok(Err(join)) if join.is_panic() => Err(DispatchError::Panicked),
            Ok(Err(_cancelled)) => Err(DispatchError::Timeout),
            Ok(Ok(Err(e))) => Err(DispatchError::Handler(e)),
            Ok(Ok(Ok(None | Some(Value::Null)))) => Err(DispatchError::Empty),
            Ok(Ok(Ok(Some(value)))) => Ok(value),
        }
    }

    async fn current_session(&self, caller: &Caller) -> ApiReply {
        match self.sessions.load(Some(&caller.token)).await {
            Ok(session) => match serde_json::to_value(&session) {
                Ok(value) => ApiReply::success(value),
                Err(e) => ApiReply::error(e.to_string()),
            },
            Err(e) => {
                warn!(token = %caller.token, error = %e, "session read failed");
                ApiReply::error(DispatchError::from(e).to_string())
            }
        }
    }

    async fn logout(&self, caller: &Caller) -> ApiReply {
        let origin = match &caller.connection {
            Some(id) => LogoutOrigin::SelfRequested(id.clone()),
            None => LogoutOrigin::Evicted,
        };
        self.presence.logout(&caller.token, origin).await;
        ApiReply::success(Value::Bool(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registration;
    use lobby_core::protocol::Frame;
    use lobby_core::{FieldType, Rule, Token};
    use lobby_settings::PresenceSettings;
    use lobby_store::{KvStore, MemoryKv};
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ApiHandler for Echo {
        async fn handle(&self, data: Value, _: Session, _: HandlerContext) -> Result<Option<Value>, HandlerError> {
            Ok(Some(data))
        }
    }

    struct AdminOnly;

    #[async_trait]
    impl ApiHandler for AdminOnly {
        fn policy(&self) -> AuthPolicy {
            AuthPolicy::login_required().with_rule(Rule::key("admin").of_type(FieldType::Boolean).equals(true))
        }

        async fn handle(&self, _: Value, session: Session, _: HandlerContext) -> Result<Option<Value>, HandlerError> {
            Ok(Some(json!({ "admin": session.user_id() })))
        }
    }

    struct Nothing;

    #[async_trait]
    impl ApiHandler for Nothing {
        async fn handle(&self, _: Value, _: Session, _: HandlerContext) -> Result<Option<Value>, HandlerError> {
            Ok(None)
        }
    }

    struct Falsy;

    #[async_trait]
    impl ApiHandler for Falsy {
        async fn handle(&self, _: Value, _: Session, _: HandlerContext) -> Result<Option<Value>, HandlerError> {
            Ok(Some(json!(false)))
        }
    }

    struct Fails;

    #[async_trait]
    impl ApiHandler for Fails {
        async fn handle(&self, _: Value, _: Session, _: HandlerContext) -> Result<Option<Value>, HandlerError> {
            Err(HandlerError::failed("board is full"))
        }
    }

    struct Panics;

    #[async_trait]
    impl ApiHandler for Panics {
        async fn handle(&self, _: Value, _: Session, _: HandlerContext) -> Result<Option<Value>, HandlerError> {
            panic!("handler bug");
        }
    }

    struct Slow;

    #[async_trait]
    impl ApiHandler for Slow {
        async fn handle(&self, _: Value, _: Session, _: HandlerContext) -> Result<Option<Value>, HandlerError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Some(json!(1)))
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        sessions: Arc<SessionStore>,
        connections: Arc<ConnectionRegistry>,
        presence: Arc<PresenceCoordinator>,
    }

    fn fixture() -> Fixture {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let sessions = Arc::new(SessionStore::new(kv, "test", Duration::from_secs(3600)));
        let connections = Arc::new(ConnectionRegistry::new(32));
        let presence = PresenceCoordinator::new(
            PresenceSettings::default(),
            sessions.clone(),
            connections.clone(),
            None,
        );
        presence.attach();

        let mut registry = ApiRegistry::new();
        registry.register("echo", Echo);
        registry.register("adminOnly", AdminOnly);
        registry.register("nothing", Nothing);
        registry.register("falsy", Falsy);
        registry.register("fails", Fails);
        registry.register("panics", Panics);
        registry.register("slow", Slow);

        let dispatcher = Dispatcher::new(
            registry,
            sessions.clone(),
            connections.clone(),
            presence.clone(),
            Duration::from_secs(30),
        );
        Fixture {
            dispatcher,
            sessions,
            connections,
            presence,
        }
    }

    fn caller(f: &Fixture, token: &str) -> (Caller, Registration) {
        let t = Token::new(token);
        let r = f.connections.register(t.clone());
        (Caller::connection(t, r.id.clone()), r)
    }

    fn req(name: &str, data: Value) -> ApiRequest {
        ApiRequest {
            name: json!(name),
            data,
            response_index: Some(1),
        }
    }

    #[tokio::test]
    async fn success_reply() {
        let f = fixture();
        let (c, _r) = caller(&f, "A");
        let reply = f.dispatcher.dispatch(&c, req("echo", json!({"x": 1}))).await;
        assert_eq!(reply.to_value(), json!({"status": "success", "result": {"x": 1}}));
    }

    #[tokio::test]
    async fn later_registration_wins() {
        let mut registry = ApiRegistry::new();
        assert!(!registry.register("echo", Echo));
        assert!(registry.register("echo", Nothing));
        assert_eq!(registry.names(), vec!["echo".to_string()]);

        let f = fixture();
        let dispatcher = Dispatcher::new(
            registry,
            f.sessions.clone(),
            f.connections.clone(),
            f.presence.clone(),
            Duration::from_secs(30),
        );
        let (c, _r) = caller(&f, "A");
        let reply = dispatcher.dispatch(&c, req("echo", json!({"x": 1}))).await;
        assert_eq!(reply.message.as_deref(), Some("handler returned nothing"));
    }

    #[tokio::test]
    async fn unknown_name_is_not_found() {
        let f = fixture();
        let (c, _r) = caller(&f, "A");
        let reply = f.dispatcher.dispatch(&c, req("nope", json!({}))).await;
        assert_eq!(reply.message.as_deref(), Some("not found"));
    }

    #[tokio::test]
    async fn malformed_envelopes() {
        let f = fixture();
        let (c, _r) = caller(&f, "A");
        let reply = f.dispatcher.dispatch(&c, req("", json!({}))).await;
        assert!(!reply.is_success());
        assert!(reply.message.unwrap().starts_with("socket message was incomplete"));
        let reply = f.dispatcher.dispatch(&c, req("echo", json!("text"))).await;
        assert!(!reply.is_success());
    }

    #[tokio::test]
    async fn admin_policy_rejects_non_admin() {
        let f = fixture();
        let (c, _r) = caller(&f, "A");
        let mut s = Session::for_user("u1");
        s.admin = Some(false);
        f.sessions.set(&c.token, s, true).await.unwrap();
        let reply = f.dispatcher.dispatch(&c, req("adminOnly", json!({}))).await;
        assert_eq!(reply.message.as_deref(), Some("Expected admin to equal true"));
    }

    #[tokio::test]
    async fn admin_policy_accepts_admin() {
        let f = fixture();
        let (c, _r) = caller(&f, "A");
        let mut s = Session::for_user("u1");
        s.admin = Some(true);
        f.sessions.set(&c.token, s, true).await.unwrap();
        let reply = f.dispatcher.dispatch(&c, req("adminOnly", json!({}))).await;
        assert_eq!(reply.result, Some(json!({"admin": "u1"})));
    }

    #[tokio::test]
    async fn anonymous_caller_not_logged_in() {
        let f = fixture();
        let (c, _r) = caller(&f, "A");
        let reply = f.dispatcher.dispatch(&c, req("adminOnly", json!({}))).await;
        assert_eq!(reply.message.as_deref(), Some("not logged in"));
    }

    #[tokio::test]
    async fn handler_faults_become_errors() {
        let f = fixture();
        let (c, _r) = caller(&f, "A");
        let reply = f.dispatcher.dispatch(&c, req("fails", json!({}))).await;
        assert_eq!(reply.message.as_deref(), Some("board is full"));
        let reply = f.dispatcher.dispatch(&c, req("panics", json!({}))).await;
        assert_eq!(reply.message.as_deref(), Some("handler panicked"));
        let reply = f.dispatcher.dispatch(&c, req("nothing", json!({}))).await;
        assert_eq!(reply.message.as_deref(), Some("handler returned nothing"));
    }

    #[tokio::test]
    async fn false_is_a_result() {
        let f = fixture();
        let (c, _r) = caller(&f, "A");
        let reply = f.dispatcher.dispatch(&c, req("falsy", json!({}))).await;
        assert_eq!(reply.to_value(), json!({"status": "success", "result": false}));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        let f = fixture();
        let (c, _r) = caller(&f, "A");
        let reply = f.dispatcher.dispatch(&c, req("slow", json!({}))).await;
        assert_eq!(reply.message.as_deref(), Some("handler timed out"));
    }

    #[tokio::test]
    async fn session_request_returns_record() {
        let f = fixture();
        let (c, _r) = caller(&f, "A");
        f.sessions.set(&c.token, Session::for_user("u1"), true).await.unwrap();
        let reply = f.dispatcher.dispatch(&c, req("session", json!({}))).await;
        assert_eq!(reply.result.unwrap()["id"], "u1");

        let (anon, _r2) = caller(&f, "B");
        let reply = f.dispatcher.dispatch(&anon, req("session", Value::Null)).await;
        assert!(reply.is_success());
    }

    #[tokio::test]
    async fn request_without_index_is_dropped() {
        let f = fixture();
        let (c, mut r) = caller(&f, "A");
        let out = f.dispatcher.handle(&c, json!({"name": "echo", "data": {}})).await;
        assert!(out.is_none());
        assert!(r.outbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn logout_with_pending_timer_replies_true() {
        let f = fixture();
        let t = Token::new("A");
        f.sessions.set(&t, Session::for_user("u1"), true).await.unwrap();

        let first = f.connections.register(t.clone());
        f.connections.unregister(&first.id);
        f.presence.on_disconnect(&t, "transport close");
        assert!(f.presence.has_pending_timer(&t));

        let mut r = f.connections.register(t.clone());
        let c = Caller::connection(t.clone(), r.id.clone());
        f.dispatcher
            .handle(&c, json!({"name": "logout", "data": {}, "responseIndex": 7}))
            .await;

        let mut frames = Vec::new();
        while let Ok(text) = r.outbound.try_recv() {
            frames.push(Frame::parse(&text).unwrap());
        }
        let reply = frames.iter().find(|f| f.event == "apiResponse-7").unwrap();
        assert_eq!(reply.data, json!({"status": "success", "result": true}));
        assert!(frames.iter().any(|f| f.event == "logout" && f.data == json!("success")));

        assert!(!f.presence.has_pending_timer(&t));
        assert!(f.sessions.get(&t).await.unwrap().is_none());
        assert!(f.sessions.list_by_user("u1").await.unwrap().is_empty());
    }

    #[test]
    fn registry_lists_sorted_names() {
        let mut registry = ApiRegistry::new();
        registry.register("b", Echo);
        registry.register("a", Echo);
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.has("a"));
        assert!(!registry.has("c"));
    }
}
