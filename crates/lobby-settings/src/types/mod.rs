//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and implement
//! [`Default`] with production values. Types marked `#[serde(default)]`
//! accept partial JSON.

mod presence;
mod server;
mod store;

pub use presence::*;
pub use server::*;
pub use store::*;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Root settings type for the lobby server.
///
/// ```json
/// {
///   "server": { "port": 9090, "tokenSource": "handshake" },
///   "presence": { "abruptGraceMs": 30000 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LobbySettings {
    pub version: String,
    pub name: String,
    pub server: ServerSettings,
    pub presence: PresenceSettings,
    pub store: StoreSettings,
    pub sync: SyncSettings,
    pub logging: LoggingSettings,
}

impl Default for LobbySettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            name: "lobby".to_string(),
            server: ServerSettings::default(),
            presence: PresenceSettings::default(),
            store: StoreSettings::default(),
            sync: SyncSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Room fanout tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Yield to the scheduler after this many recipients.
    pub yield_every: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self { yield_every: 100 }
    }
}

/// Log output configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Per-module level overrides, e.g. `{"lobby_server::sync": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}
