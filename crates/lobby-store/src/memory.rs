//! In-process [`KvStore`] for tests and single-node deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexSet;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::kv::KvStore;

enum Slot {
    Value(String),
    Set(IndexSet<String>),
}

struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Expiry is checked lazily on access against the Tokio clock, so paused-time
/// tests can advance past a TTL.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
    offline: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`] until cleared.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn with_live<T>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> T) -> T {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        f(entries.get_mut(key))
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Database(format!("wrong kind of value at key {key}"))
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.with_live(key, |entry| match entry {
            None => Ok(None),
            Some(Entry { slot: Slot::Value(v), .. }) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check()?;
        let entry = Entry {
            slot: Slot::Value(value.to_string()),
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.with_live(key, |entry| match entry {
            Some(e) => {
                e.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .is_some_and(|e| e.is_live(now)))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.is_live(now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Set(IndexSet::new()),
            expires_at: None,
        });
        match &mut entry.slot {
            Slot::Set(members) => Ok(members.insert(member.to_string())),
            Slot::Value(_) => Err(wrong_type(key)),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let Some(entry) = entries.get_mut(key).filter(|e| e.is_live(now)) else {
            return Ok(false);
        };
        let removed = match &mut entry.slot {
            Slot::Set(members) => members.shift_remove(member),
            Slot::Value(_) => return Err(wrong_type(key)),
        };
        if matches!(&entry.slot, Slot::Set(m) if m.is_empty()) {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        self.with_live(key, |entry| match entry {
            None => Ok(Vec::new()),
            Some(Entry { slot: Slot::Set(m), .. }) => Ok(m.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }
}
