//! # lobby
//!
//! Lobby server binary: loads settings, wires the session store, handler
//! registries and presence, then serves WebSockets until Ctrl+C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lobby_server::{
    metrics, purge_stale_keys, register_builtins, ApiRegistry, ServerConfig, Services,
    SyncRegistry,
};
use lobby_settings::{LobbySettings, StoreBackend};
use lobby_store::{Database, KvStore, MemoryKv, SessionStore, SqliteKv};
use lobby_telemetry::{init_telemetry, TelemetryConfig};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Real-time lobby server.
#[derive(Parser, Debug)]
#[command(name = "lobby", about = "Real-time presence and message dispatch server")]
struct Cli {
    /// Settings file (defaults to `~/.lobby/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Keep stored keys at startup.
    #[arg(long)]
    development: bool,
}

fn load(cli: &Cli) -> Result<LobbySettings> {
    let mut settings = match &cli.config {
        Some(path) => lobby_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => lobby_settings::load_settings().context("Failed to load settings")?,
    };
    if let Some(host) = &cli.host {
        settings.server.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if cli.development {
        settings.server.development = true;
    }
    Ok(settings)
}

/// Open the configured key-value backend.
fn open_store(settings: &LobbySettings) -> Result<Arc<dyn KvStore>> {
    match settings.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryKv::new())),
        StoreBackend::Sqlite => {
            let path = lobby_settings::lobby_home().join(&settings.store.sqlite_path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
            let db = Database::open(&path)
                .with_context(|| format!("Failed to open database: {}", path.display()))?;
            tracing::info!(path = %path.display(), "session database opened");

            let kv = Arc::new(SqliteKv::new(db));
            let sweeper = kv.clone();
            let _sweep = tokio::spawn(async move {
                let mut tick = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    let _ = tick.tick().await;
                    match sweeper.sweep_expired() {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!(removed = n, "expired keys swept"),
                        Err(e) => tracing::warn!(error = %e, "expired key sweep failed"),
                    }
                }
            });
            Ok(kv)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    let telemetry = TelemetryConfig::from_names(
        &settings.logging.level,
        &settings.logging.modules,
        settings.logging.json,
    );
    init_telemetry(&telemetry).context("Failed to initialize telemetry")?;

    let metrics_handle = if settings.server.metrics_enabled {
        Some(metrics::install_recorder().context("Failed to install metrics recorder")?)
    } else {
        None
    };

    let kv = open_store(&settings)?;
    let sessions = Arc::new(SessionStore::new(
        kv,
        settings.store.project.clone(),
        Duration::from_secs(settings.store.session_ttl_secs),
    ));
    let purged = purge_stale_keys(
        &sessions,
        &settings.store.purge_prefixes,
        settings.server.development,
    )
    .await
    .context("Failed to purge stale keys")?;
    if purged > 0 {
        tracing::info!(purged, "stale keys removed");
    }

    let mut api = ApiRegistry::new();
    register_builtins(&mut api);
    let syncs = SyncRegistry::new();
    tracing::info!(apis = api.names().len(), syncs = syncs.names().len(), "handlers registered");

    let config = ServerConfig::from_settings(&settings);
    let services = Services::new(&config, sessions, api, syncs);
    let handle = lobby_server::start(config, services, metrics_handle)
        .await
        .context("Failed to start server")?;
    tracing::info!(port = handle.port, "lobby server ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    let outcome = handle.shutdown().await;
    tracing::info!(
        closed = outcome.closed,
        remaining = outcome.remaining,
        "shut down"
    );
    Ok(())
}
