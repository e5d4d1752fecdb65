//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use lobby_core::protocol::{outbound, reason, Frame};
use lobby_core::Token;

use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};
use crate::registry::CloseSignal;
use crate::services::Services;

/// Timing knobs for one session.
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    pub interval: Duration,
    pub pong_timeout: Duration,
}

/// Why the outbound half stopped.
#[derive(Debug, PartialEq, Eq)]
enum OutboundEnd {
    QueueClosed,
    SendFailed,
    PongTimeout,
    ServerClosed,
    Shutdown,
}

/// Last time the peer proved it was alive.
struct Liveness {
    last_pong: Mutex<Instant>,
}

impl Liveness {
    fn new() -> Self {
        Self {
            last_pong: Mutex::new(Instant::now()),
        }
    }

    fn mark_alive(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    fn elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }
}

/// Run a WebSocket session bound to `token`.
///
/// 1. Registers the connection (joining the token room) and sends
///    `connection.established`
/// 2. Lets presence cancel any grace period for the token
/// 3. Routes each inbound frame on its own task
/// 4. Forwards queued outbound frames and pings the client
/// 5. On disconnect, unregisters and hands the reason to presence
#[instrument(skip_all, fields(token = %token))]
pub async fn run_ws_session(
    ws: WebSocket,
    token: Token,
    services: Arc<Services>,
    heartbeat: Heartbeat,
    shutdown: CancellationToken,
) {
    let (ws_tx, mut ws_rx) = ws.split();

    let registration = services.connections.register(token.clone());
    let id = registration.id.clone();
    let connection_start = std::time::Instant::now();
    info!(connection_id = %id, "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    services.connections.emit(
        &id,
        outbound::CONNECTION_ESTABLISHED,
        json!({ "connectionId": id }),
    );
    services.presence.on_connect(&token).await;

    let liveness = Arc::new(Liveness::new());
    let mut outbound_task = tokio::spawn(forward_outbound(
        ws_tx,
        registration.outbound,
        registration.close,
        shutdown,
        liveness.clone(),
        heartbeat,
    ));

    let disconnect_reason = loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(connection_id = %id, error = %e, "websocket read failed");
                        break reason::TRANSPORT_ERROR.to_string();
                    }
                    None => break reason::TRANSPORT_CLOSE.to_string(),
                };
                let text = match msg {
                    Message::Text(t) => t.to_string(),
                    Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                        Ok(s) => s,
                        Err(_) => {
                            info!(connection_id = %id, len = data.len(), "received non-UTF8 binary frame");
                            continue;
                        }
                    },
                    Message::Close(_) => {
                        debug!(connection_id = %id, "client sent close frame");
                        break reason::TRANSPORT_CLOSE.to_string();
                    }
                    Message::Ping(_) | Message::Pong(_) => {
                        liveness.mark_alive();
                        continue;
                    }
                };
                liveness.mark_alive();

                let frame = match Frame::parse(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(connection_id = %id, error = %e, "unparseable frame dropped");
                        continue;
                    }
                };
                let services = services.clone();
                let conn = id.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    services.route(&conn, &token, frame).await;
                });
            }
            end = &mut outbound_task => {
                let end = end.unwrap_or(OutboundEnd::SendFailed);
                break match end {
                    OutboundEnd::PongTimeout => reason::PING_TIMEOUT.to_string(),
                    OutboundEnd::Shutdown => reason::SERVER_SHUTDOWN.to_string(),
                    OutboundEnd::ServerClosed => services
                        .connections
                        .close_reason(&id)
                        .unwrap_or_else(|| reason::SERVER_DISCONNECT.to_string()),
                    OutboundEnd::QueueClosed | OutboundEnd::SendFailed => {
                        reason::TRANSPORT_ERROR.to_string()
                    }
                };
            }
        }
    };

    outbound_task.abort();
    services.connections.unregister(&id);
    services.presence.on_disconnect(&token, &disconnect_reason);

    info!(connection_id = %id, reason = %disconnect_reason, "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => disconnect_reason.clone()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(connection_start.elapsed().as_secs_f64());
}

/// Outbound half: queued frames, periodic pings, and server-side closes.
async fn forward_outbound(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<Arc<String>>,
    close: CloseSignal,
    shutdown: CancellationToken,
    liveness: Arc<Liveness>,
    heartbeat: Heartbeat,
) -> OutboundEnd {
    let mut ping_interval = tokio::time::interval(heartbeat.interval);
    // Skip the immediate first tick
    let _ = ping_interval.tick().await;

    let end = loop {
        tokio::select! {
            msg = queue.recv() => match msg {
                Some(text) => {
                    if ws_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                        break OutboundEnd::SendFailed;
                    }
                }
                None => break OutboundEnd::QueueClosed,
            },
            () = close.closed() => break OutboundEnd::ServerClosed,
            () = shutdown.cancelled() => break OutboundEnd::Shutdown,
            _ = ping_interval.tick() => {
                if liveness.elapsed() > heartbeat.pong_timeout {
                    warn!("client unresponsive for {:?}, disconnecting", heartbeat.pong_timeout);
                    break OutboundEnd::PongTimeout;
                }
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break OutboundEnd::SendFailed;
                }
            }
        }
    };

    if matches!(end, OutboundEnd::ServerClosed | OutboundEnd::Shutdown) {
        while let Ok(text) = queue.try_recv() {
            if ws_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                return end;
            }
        }
        let frame = CloseFrame {
            code: axum::extract::ws::close_code::NORMAL,
            reason: String::new().into(),
        };
        let _ = ws_tx.send(Message::Close(Some(frame))).await;
    }
    end
}
