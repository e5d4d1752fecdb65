//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`LobbySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `LOBBY_*` environment variable overrides (highest priority)
//!
//! Objects merge recursively, arrays and primitives are replaced, and nulls
//! in the file are skipped.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{LobbySettings, StoreBackend, TokenSource};

/// Root directory for lobby state (`~/.lobby`).
pub fn lobby_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".lobby")
}

/// Resolve the path to the settings file (`~/.lobby/settings.json`).
pub fn settings_path() -> PathBuf {
    lobby_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LobbySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LobbySettings> {
    let defaults = serde_json::to_value(LobbySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: LobbySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Reject combinations that cannot run.
pub fn validate(settings: &LobbySettings) -> Result<()> {
    if settings.store.project.is_empty() {
        return Err(SettingsError::InvalidValue("store.project must not be empty".into()));
    }
    if settings.sync.yield_every == 0 {
        return Err(SettingsError::InvalidValue("sync.yieldEvery must be at least 1".into()));
    }
    if settings.server.send_queue_size == 0 {
        return Err(SettingsError::InvalidValue(
            "server.sendQueueSize must be at least 1".into(),
        ));
    }
    if settings.store.session_ttl_secs == 0 {
        return Err(SettingsError::InvalidValue(
            "store.sessionTtlSecs must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Apply process environment overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut LobbySettings) {
    apply_overrides(settings, &|name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Invalid values are ignored with a warning and the file/default value is
/// kept.
pub fn apply_overrides(settings: &mut LobbySettings, lookup: &dyn Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("LOBBY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("LOBBY_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.u64("LOBBY_HANDLER_TIMEOUT_MS", 100, 600_000) {
        settings.server.handler_timeout_ms = v;
    }
    if let Some(v) = env.u64("LOBBY_HEARTBEAT_INTERVAL_MS", 1000, 600_000) {
        settings.server.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.string("LOBBY_TOKEN_SOURCE") {
        match parse_token_source(&v) {
            Some(source) => settings.server.token_source = source,
            None => warn!(key = "LOBBY_TOKEN_SOURCE", value = %v, "invalid token source, ignoring"),
        }
    }
    if let Some(v) = env.string("LOBBY_ALLOWED_ORIGINS") {
        settings.server.allowed_origins = parse_list(&v);
    }
    if let Some(v) = env.bool("LOBBY_DEV") {
        settings.server.development = v;
    }
    if let Some(v) = env.bool("LOBBY_METRICS") {
        settings.server.metrics_enabled = v;
    }

    // ── Presence ────────────────────────────────────────────────────
    if let Some(v) = env.bool("LOBBY_PRESENCE") {
        settings.presence.enabled = v;
    }
    if let Some(v) = env.u64("LOBBY_VOLUNTARY_GRACE_MS", 0, 3_600_000) {
        settings.presence.voluntary_grace_ms = v;
    }
    if let Some(v) = env.u64("LOBBY_ABRUPT_GRACE_MS", 0, 3_600_000) {
        settings.presence.abrupt_grace_ms = v;
    }
    if let Some(v) = env.u64("LOBBY_DEFAULT_GRACE_MS", 0, 3_600_000) {
        settings.presence.default_grace_ms = v;
    }
    if let Some(v) = env.string("LOBBY_LEAVE_SYNC") {
        settings.presence.leave_sync = Some(v);
    }

    // ── Store ───────────────────────────────────────────────────────
    if let Some(v) = env.string("LOBBY_PROJECT") {
        settings.store.project = v;
    }
    if let Some(v) = env.string("LOBBY_STORE") {
        match parse_backend(&v) {
            Some(backend) => settings.store.backend = backend,
            None => warn!(key = "LOBBY_STORE", value = %v, "invalid store backend, ignoring"),
        }
    }
    if let Some(v) = env.string("LOBBY_SQLITE_PATH") {
        settings.store.sqlite_path = v;
    }
    if let Some(v) = env.string("LOBBY_PURGE_PREFIXES") {
        settings.store.purge_prefixes = parse_list(&v);
    }

    // ── Sync / logging ──────────────────────────────────────────────
    if let Some(v) = env.usize("LOBBY_SYNC_YIELD_EVERY", 1, 100_000) {
        settings.sync.yield_every = v;
    }
    if let Some(v) = env.string("LOBBY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("LOBBY_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Comma-separated list, blanks dropped.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_token_source(val: &str) -> Option<TokenSource> {
    match val.to_lowercase().as_str() {
        "cookie" => Some(TokenSource::Cookie),
        "handshake" | "session" => Some(TokenSource::Handshake),
        _ => None,
    }
}

pub fn parse_backend(val: &str) -> Option<StoreBackend> {
    match val.to_lowercase().as_str() {
        "memory" => Some(StoreBackend::Memory),
        "sqlite" => Some(StoreBackend::Sqlite),
        _ => None,
    }
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}
