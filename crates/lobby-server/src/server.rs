//! Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::{AUTHORIZATION, ORIGIN};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use axum_extra::extract::cookie::CookieJar;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use lobby_core::Token;
use lobby_settings::TokenSource;
use lobby_store::{SessionStore, StoreError};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::services::Services;
use crate::session::{run_ws_session, Heartbeat};
use crate::shutdown::{DrainOutcome, ShutdownCoordinator};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    pub config: Arc<ServerConfig>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub start_time: Instant,
    /// Present when the Prometheus recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Handle returned by [`start`].
pub struct ServerHandle {
    pub port: u16,
    pub addr: SocketAddr,
    pub services: Arc<Services>,
    shutdown: Arc<ShutdownCoordinator>,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    /// Close every session, wait for them to drain, then stop the listener.
    pub async fn shutdown(self) -> DrainOutcome {
        self.shutdown.drain(&self.services.connections, self.server).await
    }
}

/// Bind the listener and serve until [`ServerHandle::shutdown`].
pub async fn start(
    config: ServerConfig,
    services: Arc<Services>,
    metrics: Option<PrometheusHandle>,
) -> Result<ServerHandle, ServerError> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    let shutdown = Arc::new(ShutdownCoordinator::new(config.shutdown_timeout));
    let state = AppState {
        services: services.clone(),
        config: Arc::new(config),
        shutdown: shutdown.clone(),
        start_time: Instant::now(),
        metrics,
    };
    let router = build_router(state);

    info!(addr = %local_addr, "lobby server started");

    let token = shutdown.listener_token();
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await });
        if let Err(e) = serve.await {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        addr: local_addr,
        services,
        shutdown,
        server,
    })
}

/// Delete stale keys under each prefix. Skipped in development mode.
pub async fn purge_stale_keys(
    sessions: &SessionStore,
    prefixes: &[String],
    development: bool,
) -> Result<usize, StoreError> {
    if development {
        info!("development mode, keeping stored keys");
        return Ok(0);
    }
    let mut total = 0;
    for prefix in prefixes {
        total += sessions.purge_prefix(prefix).await?;
    }
    Ok(total)
}

#[derive(Debug, Default, Deserialize)]
struct HandshakeQuery {
    token: Option<String>,
}

fn extract_token(
    config: &ServerConfig,
    jar: &CookieJar,
    query: &HandshakeQuery,
    headers: &HeaderMap,
) -> Option<Token> {
    let raw = match config.token_source {
        TokenSource::Cookie => jar.get(&config.token_cookie).map(|c| c.value().to_string()),
        TokenSource::Handshake => query.token.clone().or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        }),
    };
    raw.map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .map(Token::new)
}

/// GET /ws
async fn ws_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
    if !state.config.origin_allowed(origin) {
        warn!(origin = origin.unwrap_or_default(), "websocket origin rejected");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }
    let Some(token) = extract_token(&state.config, &jar, &query, &headers) else {
        return (StatusCode::UNAUTHORIZED, "missing session token").into_response();
    };
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let heartbeat = Heartbeat {
        interval: state.config.heartbeat_interval,
        pong_timeout: state.config.pong_timeout,
    };
    let services = state.services.clone();
    let shutdown = state.shutdown.sessions_token();
    ws.max_message_size(state.config.max_message_bytes)
        .on_upgrade(move |socket| run_ws_session(socket, token, services, heartbeat, shutdown))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.services.connections.connection_count();
    Json(health::health_check(state.start_time, connections))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match (&state.metrics, state.config.metrics_enabled) {
        (Some(handle), true) => handle.render().into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}
