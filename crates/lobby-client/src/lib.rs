//! # lobby-client
//!
//! WebSocket client for the lobby server. Correlates requests with their
//! `{event}-{responseIndex}` replies, aborts superseded read calls and fans
//! every other server event out to subscribers.

pub mod client;
pub mod error;

pub use client::{is_read_like, ClientOptions, LobbyClient, TokenPlacement};
pub use error::ClientError;
