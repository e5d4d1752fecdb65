//! Server configuration.

use std::time::Duration;

use lobby_settings::{LobbySettings, PresenceSettings, ServerSettings, TokenSource};

/// Runtime configuration for the lobby server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_bytes: usize,
    /// Outbound queue length per connection.
    pub send_queue_size: usize,
    pub heartbeat_interval: Duration,
    /// Close a connection whose last pong is older than this.
    pub pong_timeout: Duration,
    pub handler_timeout: Duration,
    /// Upper bound on waiting for sessions to close at shutdown.
    pub shutdown_timeout: Duration,
    pub token_source: TokenSource,
    pub token_cookie: String,
    /// Empty accepts any origin.
    pub allowed_origins: Vec<String>,
    pub metrics_enabled: bool,
    /// Fanout yields to the scheduler after this many recipients.
    pub yield_every: usize,
    pub presence: PresenceSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_message_bytes: 5 * 1024 * 1024,
            send_queue_size: 256,
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            token_source: TokenSource::Cookie,
            token_cookie: "token".into(),
            allowed_origins: Vec::new(),
            metrics_enabled: true,
            yield_every: 100,
            presence: PresenceSettings::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &LobbySettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_message_bytes: server.max_message_bytes,
            send_queue_size: server.send_queue_size,
            heartbeat_interval: Duration::from_millis(server.heartbeat_interval_ms),
            pong_timeout: Duration::from_millis(server.pong_timeout_ms),
            handler_timeout: Duration::from_millis(server.handler_timeout_ms),
            shutdown_timeout: Duration::from_millis(server.shutdown_timeout_ms),
            token_source: server.token_source,
            token_cookie: server.token_cookie.clone(),
            allowed_origins: server.allowed_origins.clone(),
            metrics_enabled: server.metrics_enabled,
            yield_every: settings.sync.yield_every,
            presence: settings.presence.clone(),
        }
    }

    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        let settings = ServerSettings {
            allowed_origins: self.allowed_origins.clone(),
            ..ServerSettings::default()
        };
        settings.origin_allowed(origin)
    }
}
