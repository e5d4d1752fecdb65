//! # lobby-server
//!
//! Axum HTTP + `WebSocket` server for real-time lobbies.
//!
//! - Connection registry with rooms and bounded per-connection send queues
//! - Session-aware presence: grace periods, away/back notices, forced logout
//! - `apiRequest` dispatch with declarative auth policies and timeouts
//! - `sync` fan-out with per-recipient client handlers
//! - Health and Prometheus endpoints, graceful shutdown

#![deny(unsafe_code)]

pub mod broadcast;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod presence;
pub mod registry;
pub mod server;
pub mod services;
pub mod session;
pub mod shutdown;
pub mod sync;

pub use broadcast::{BroadcastOptions, Broadcaster};
pub use config::ServerConfig;
pub use context::{Caller, HandlerContext};
pub use dispatch::{ApiHandler, ApiRegistry, Dispatcher};
pub use handlers::register_builtins;
pub use presence::{LogoutOrigin, PresenceCoordinator};
pub use registry::ConnectionRegistry;
pub use server::{build_router, purge_stale_keys, start, AppState, ServerError, ServerHandle};
pub use services::Services;
pub use shutdown::{DrainOutcome, ShutdownCoordinator};
pub use sync::{
    ClientSyncHandler, FanoutReport, ServerSyncHandler, SyncCall, SyncEngine, SyncError,
    SyncRegistry,
};
