//! Minimal TTL key-value contract the session layer is written against.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// String values and string sets under one key namespace, each key with an
/// optional expiry. Expired keys behave as absent.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value. `ttl: None` keeps the key until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Reset the expiry of an existing key. Returns false when absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remove a value or set. Returns false when absent.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Live keys starting with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Returns true when the member was newly added.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Returns true when the member was present.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Members in insertion order.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
}
