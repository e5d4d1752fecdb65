//! Transport and HTTP listener settings.

use serde::{Deserialize, Serialize};

/// Where the session token is read from during the upgrade handshake.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenSource {
    /// `token` cookie on the upgrade request.
    #[default]
    Cookie,
    /// `token` query parameter or `Authorization: Bearer` header.
    Handshake,
}

/// Server network and runtime settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. `0` picks a free port.
    pub port: u16,
    /// Largest accepted inbound frame in bytes.
    pub max_message_bytes: usize,
    /// Bounded outbound queue length per connection.
    pub send_queue_size: usize,
    /// WebSocket ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Close a connection that has not answered a ping for this long.
    pub pong_timeout_ms: u64,
    /// Upper bound on a single API handler invocation.
    pub handler_timeout_ms: u64,
    /// How long shutdown waits for open sessions to close.
    pub shutdown_timeout_ms: u64,
    pub token_source: TokenSource,
    /// Cookie name used when `token_source` is `cookie`.
    pub token_cookie: String,
    /// Accepted `Origin` headers. Empty accepts any origin.
    pub allowed_origins: Vec<String>,
    /// Development mode skips the startup key purge.
    pub development: bool,
    /// Serve Prometheus text at `/metrics`.
    pub metrics_enabled: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_bytes: 5 * 1024 * 1024,
            send_queue_size: 256,
            heartbeat_interval_ms: 30_000,
            pong_timeout_ms: 60_000,
            handler_timeout_ms: 30_000,
            shutdown_timeout_ms: 10_000,
            token_source: TokenSource::Cookie,
            token_cookie: "token".to_string(),
            allowed_origins: Vec::new(),
            development: false,
            metrics_enabled: true,
        }
    }
}

impl ServerSettings {
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(_) if self.allowed_origins.is_empty() => true,
            Some(o) => self
                .allowed_origins
                .iter()
                .any(|allowed| allowed.trim_end_matches('/') == o.trim_end_matches('/')),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_accepts_all() {
        let s = ServerSettings::default();
        assert!(s.origin_allowed(Some("https://evil.example")));
        assert!(s.origin_allowed(None));
    }

    #[test]
    fn allow_list_matches_exactly() {
        let s = ServerSettings {
            allowed_origins: vec!["https://play.example/".into()],
            ..ServerSettings::default()
        };
        assert!(s.origin_allowed(Some("https://play.example")));
        assert!(!s.origin_allowed(Some("https://other.example")));
        assert!(s.origin_allowed(None));
    }

    #[test]
    fn token_source_wire_names() {
        let v: TokenSource = serde_json::from_str("\"handshake\"").unwrap();
        assert_eq!(v, TokenSource::Handshake);
    }
}
