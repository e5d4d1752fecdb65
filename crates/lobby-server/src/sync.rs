//! Room sync: one caller event, an optional authoritative step, then a
//! per-recipient fanout to a room or to everyone.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, histogram};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use lobby_core::protocol::{
    describe, outbound, sync_ack_event, ReplyStatus, SyncAck, SyncFanout, SyncRequest,
    RECEIVER_ALL,
};
use lobby_core::{AuthPolicy, ConnectionId, HandlerError, Session, Verdict};
use lobby_store::{SessionStore, StoreError};

use crate::broadcast::Broadcaster;
use crate::context::{Caller, HandlerContext};
use crate::metrics::{SYNC_ERRORS_TOTAL, SYNC_FANOUT_RECIPIENTS, SYNC_REQUESTS_TOTAL};
use crate::registry::ConnectionRegistry;

/// Runs once per sync call with the caller's session. Its result becomes
/// `serverData` and must carry `status: "success"`.
#[async_trait]
pub trait ServerSyncHandler: Send + Sync {
    fn policy(&self) -> AuthPolicy {
        AuthPolicy::public()
    }

    async fn handle(
        &self,
        data: &Value,
        session: &Session,
        ctx: &HandlerContext,
    ) -> Result<Value, HandlerError>;
}

/// Runs once per recipient with that recipient's session.
///
/// A result tagged `status: "error"` skips the recipient; one tagged
/// `status: "success"` is delivered as `clientData`.
#[async_trait]
pub trait ClientSyncHandler: Send + Sync {
    async fn handle(
        &self,
        data: &Value,
        recipient: &Session,
        server_data: &Value,
        receiver: &str,
    ) -> Result<Value, HandlerError>;
}

/// Sync handlers by name. Either role may be absent, not both.
#[derive(Default)]
pub struct SyncRegistry {
    server: HashMap<String, Arc<dyn ServerSyncHandler>>,
    client: HashMap<String, Arc<dyn ClientSyncHandler>>,
}

impl SyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the server-side handler. Returns whether one was replaced.
    pub fn register_server(&mut self, name: impl Into<String>, handler: impl ServerSyncHandler + 'static) -> bool {
        let name = name.into();
        let replaced = self.server.insert(name.clone(), Arc::new(handler)).is_some();
        if replaced {
            warn!(name, "server sync handler replaced by a later registration");
        }
        replaced
    }

    /// Register the per-recipient handler. Returns whether one was replaced.
    pub fn register_client(&mut self, name: impl Into<String>, handler: impl ClientSyncHandler + 'static) -> bool {
        let name = name.into();
        let replaced = self.client.insert(name.clone(), Arc::new(handler)).is_some();
        if replaced {
            warn!(name, "client sync handler replaced by a later registration");
        }
        replaced
    }

    pub fn has(&self, name: &str) -> bool {
        self.server.contains_key(name) || self.client.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .server
            .keys()
            .chain(self.client.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Why a sync call produced no fanout.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("socket message was incomplete, syncName: {name}, syncData: {data}")]
    Incomplete { name: String, data: String },
    #[error("socket message was incomplete, cb: {0}")]
    MissingCallback(String),
    #[error("sync {0} needs a receiver")]
    MissingReceiver(String),
    #[error("no sync handler registered for {0}")]
    NoHandler(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Server(String),
    #[error("sync {0} server handler did not report success")]
    BadServerResult(String),
    #[error("no receivers in {0}")]
    NoTargets(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Incomplete { .. } | Self::MissingCallback(_) | Self::MissingReceiver(_) => {
                "malformed"
            }
            Self::NoHandler(_) => "no_handler",
            Self::Unauthorized(_) => "unauthorized",
            Self::Server(_) | Self::BadServerResult(_) => "server_handler",
            Self::NoTargets(_) => "no_targets",
            Self::Store(_) => "store",
        }
    }
}

/// Outcome counters of one fanout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Success frames queued.
    pub delivered: usize,
    /// Members passed over (self, error-tagged, queue full).
    pub skipped: usize,
    /// Members whose recipient handler failed.
    pub failed: usize,
    /// Times the loop yielded to the scheduler.
    pub yields: usize,
}

/// A validated sync call.
#[derive(Clone, Debug)]
pub struct SyncCall {
    pub name: String,
    pub data: Value,
    pub cb: String,
    pub receiver: String,
    pub ignore_self: bool,
}

impl SyncCall {
    pub fn from_request(req: &SyncRequest) -> Result<Self, SyncError> {
        let name = req.name.as_str().unwrap_or_default();
        if name.is_empty() || !req.data.is_object() {
            return Err(SyncError::Incomplete {
                name: describe(&req.name),
                data: describe(&req.data),
            });
        }
        let cb = req.cb.as_str().unwrap_or_default();
        if cb.is_empty() {
            return Err(SyncError::MissingCallback(describe(&req.cb)));
        }
        let receiver = req.receiver.as_str().unwrap_or_default();
        if receiver.is_empty() {
            return Err(SyncError::MissingReceiver(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            data: req.data.clone(),
            cb: cb.to_string(),
            receiver: receiver.to_string(),
            ignore_self: req.ignore_self,
        })
    }
}

pub struct SyncEngine {
    registry: SyncRegistry,
    sessions: Arc<SessionStore>,
    connections: Arc<ConnectionRegistry>,
    broadcaster: Broadcaster,
    yield_every: usize,
}

impl SyncEngine {
    pub fn new(
        registry: SyncRegistry,
        sessions: Arc<SessionStore>,
        connections: Arc<ConnectionRegistry>,
        yield_every: usize,
    ) -> Self {
        let broadcaster = Broadcaster::new(connections.clone(), sessions.clone());
        Self {
            registry,
            sessions,
            connections,
            broadcaster,
            yield_every: yield_every.max(1),
        }
    }

    pub fn registry(&self) -> &SyncRegistry {
        &self.registry
    }

    /// Handle an inbound `sync` frame and ack the caller on `sync-{i}`.
    pub async fn handle(&self, caller: &Caller, raw: Value) -> Option<FanoutReport> {
        let req: SyncRequest = match serde_json::from_value(raw) {
            Ok(req) => req,
            Err(e) => {
                warn!(token = %caller.token, error = %e, "unparseable sync envelope");
                return None;
            }
        };
        let result = match SyncCall::from_request(&req) {
            Ok(call) => self.run(caller, &call).await,
            Err(e) => Err(e),
        };

        let ack = match &result {
            Ok(_) => SyncAck::success(&describe(&req.name)),
            Err(e) => {
                counter!(SYNC_ERRORS_TOTAL, "error_type" => e.error_kind()).increment(1);
                SyncAck::error(e.to_string())
            }
        };
        if let (Some(conn), Some(index)) = (&caller.connection, req.response_index) {
            self.connections.emit(conn, &sync_ack_event(index), ack);
        }
        result.ok()
    }

    /// Run a validated call. Recipients are visited in room order.
    #[instrument(skip_all, fields(name = %call.name, receiver = %call.receiver, token = %caller.token))]
    pub async fn run(&self, caller: &Caller, call: &SyncCall) -> Result<FanoutReport, SyncError> {
        counter!(SYNC_REQUESTS_TOTAL, "name" => call.name.clone()).increment(1);

        let server = self.registry.server.get(&call.name).cloned();
        let client = self.registry.client.get(&call.name).cloned();
        if server.is_none() && client.is_none() {
            return Err(SyncError::NoHandler(call.name.clone()));
        }

        let server_data = match server {
            Some(handler) => self.run_server(caller, call, handler).await?,
            None => json!({}),
        };

        let targets = if call.receiver == RECEIVER_ALL {
            self.connections.all_connections()
        } else {
            self.connections.room_members(&call.receiver)
        };
        if targets.is_empty() {
            return Err(SyncError::NoTargets(call.receiver.clone()));
        }

        let mut report = FanoutReport::default();
        for (processed, id) in targets.iter().enumerate() {
            if processed > 0 && processed % self.yield_every == 0 {
                tokio::task::yield_now().await;
                report.yields += 1;
            }

            let Some(token) = self.connections.token_of(id) else {
                report.skipped += 1;
                continue;
            };
            if call.ignore_self && token == caller.token {
                report.skipped += 1;
                continue;
            }

            let Some(handler) = &client else {
                let frame = fanout(call, &server_data, json!({}), format!("{} sync success", call.name));
                self.deliver(id, frame, &mut report);
                continue;
            };

            let recipient = match self.sessions.load(Some(&token)).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(recipient = %token, error = %e, "recipient session unavailable");
                    Session::default()
                }
            };
            let outcome = AssertUnwindSafe(handler.handle(
                &call.data,
                &recipient,
                &server_data,
                &call.receiver,
            ))
            .catch_unwind()
            .await;

            match outcome {
                Ok(Ok(client_data)) => match status_of(&client_data) {
                    Some(ReplyStatus::Success) => {
                        let message = message_of(&client_data)
                            .unwrap_or_else(|| format!("{} sync success", call.name));
                        let frame = fanout(call, &server_data, client_data, message);
                        self.deliver(id, frame, &mut report);
                    }
                    Some(ReplyStatus::Error) => report.skipped += 1,
                    None => {
                        debug!(recipient = %token, "recipient result carried no status, skipping");
                        report.skipped += 1;
                    }
                },
                Ok(Err(e)) => {
                    warn!(recipient = %token, error = %e, "recipient handler failed");
                    self.connections.emit(id, outbound::SYNC, SyncAck::error(e.to_string()));
                    report.failed += 1;
                }
                Err(_) => {
                    warn!(recipient = %token, "recipient handler panicked");
                    self.connections
                        .emit(id, outbound::SYNC, SyncAck::error("sync handler panicked"));
                    report.failed += 1;
                }
            }
        }

        histogram!(SYNC_FANOUT_RECIPIENTS).record(report.delivered as f64);
        debug!(
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed,
            yields = report.yields,
            "sync fanout complete"
        );
        Ok(report)
    }

    async fn run_server(
        &self,
        caller: &Caller,
        call: &SyncCall,
        handler: Arc<dyn ServerSyncHandler>,
    ) -> Result<Value, SyncError> {
        let session = self.sessions.load(Some(&caller.token)).await?;
        if let Verdict::Reject(reason) = handler.policy().evaluate(&session) {
            warn!(name = %call.name, reason = %reason, "sync rejected by auth policy");
            return Err(SyncError::Unauthorized(reason));
        }

        let ctx = HandlerContext {
            sessions: self.sessions.clone(),
            connections: self.connections.clone(),
            broadcaster: self.broadcaster.clone(),
            token: caller.token.clone(),
            connection: caller.connection.clone(),
            room: Some(call.receiver.clone()),
        };
        let outcome = AssertUnwindSafe(handler.handle(&call.data, &session, &ctx))
            .catch_unwind()
            .await;
        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return Err(SyncError::Server(e.to_string())),
            Err(_) => return Err(SyncError::Server("sync handler panicked".into())),
        };
        match status_of(&value) {
            Some(ReplyStatus::Success) => Ok(value),
            Some(ReplyStatus::Error) => Err(SyncError::Server(
                message_of(&value).unwrap_or_else(|| format!("sync {} failed", call.name)),
            )),
            None => Err(SyncError::BadServerResult(call.name.clone())),
        }
    }

    fn deliver(&self, id: &ConnectionId, frame: SyncFanout, report: &mut FanoutReport) {
        if self.connections.emit(id, outbound::SYNC, frame) {
            report.delivered += 1;
        } else {
            report.skipped += 1;
        }
    }
}

fn fanout(call: &SyncCall, server_data: &Value, client_data: Value, message: String) -> SyncFanout {
    SyncFanout {
        cb: call.cb.clone(),
        server_data: server_data.clone(),
        client_data,
        message,
        status: ReplyStatus::Success,
    }
}

fn status_of(value: &Value) -> Option<ReplyStatus> {
    value
        .get("status")
        .cloned()
        .and_then(|s| serde_json::from_value(s).ok())
}

fn message_of(value: &Value) -> Option<String> {
    value.get("message").and_then(Value::as_str).map(str::to_string)
}
