//! # lobby-settings
//!
//! Layered configuration for the lobby server:
//! 1. **Compiled defaults**: [`LobbySettings::default()`]
//! 2. **User file**: `~/.lobby/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `LOBBY_*` overrides (highest priority)
//!
//! ```no_run
//! use lobby_settings::get_settings;
//!
//! let settings = get_settings();
//! println!("listening on {}:{}", settings.server.host, settings.server.port);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, lobby_home, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<LobbySettings> = OnceLock::new();

/// Get the global settings instance, loading it on first access.
///
/// Falls back to compiled defaults if loading fails.
pub fn get_settings() -> &'static LobbySettings {
    SETTINGS.get_or_init(|| load_settings().unwrap_or_default())
}

/// Initialize the global settings with a specific value.
///
/// # Errors
///
/// Returns the provided settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: LobbySettings) -> std::result::Result<(), LobbySettings> {
    SETTINGS.set(settings)
}
