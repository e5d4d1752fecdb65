//! Session store backend settings.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Key namespace, e.g. `{project}-session:{token}`.
    pub project: String,
    pub backend: StoreBackend,
    /// Database file for the `sqlite` backend (relative to `~/.lobby`).
    pub sqlite_path: String,
    /// Sliding TTL for session records and active-token sets.
    pub session_ttl_secs: u64,
    /// Key prefixes deleted at startup outside development mode.
    pub purge_prefixes: Vec<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            project: "lobby".to_string(),
            backend: StoreBackend::Memory,
            sqlite_path: "lobby.db".to_string(),
            session_ttl_secs: 7 * 24 * 60 * 60,
            purge_prefixes: Vec::new(),
        }
    }
}
