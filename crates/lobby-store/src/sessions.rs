//! Session records keyed by token, plus the per-identity active-token set.
//!
//! Keys:
//! - `{project}-session:{token}` holds the JSON record
//! - `{project}-activeUsers:{userId}` holds the set of logged-in tokens
//!
//! Both carry a sliding TTL refreshed on every write.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use lobby_core::{Session, Token};

use crate::error::StoreError;
use crate::kv::KvStore;

/// Live-connection side effects of session writes.
///
/// Implemented by the presence layer and attached after construction.
#[async_trait]
pub trait SessionEvents: Send + Sync {
    /// Whether any connection is currently bound to `token`.
    fn is_online(&self, token: &Token) -> bool;

    /// Push the new record to the token's connections.
    fn session_updated(&self, token: &Token, session: &Session);

    /// Tell the token's connections they have been logged out.
    fn session_deleted(&self, token: &Token);

    /// Log out a live token that lost its active-session slot to another login.
    async fn evict(&self, token: &Token, user_id: &str);
}

pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    project: String,
    ttl: Duration,
    events: RwLock<Option<Weak<dyn SessionEvents>>>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvStore>, project: impl Into<String>, ttl: Duration) -> Self {
        Self {
            kv,
            project: project.into(),
            ttl,
            events: RwLock::new(None),
        }
    }

    /// Route live-connection effects to `events`. Held weakly.
    pub fn attach_events(&self, events: &Arc<dyn SessionEvents>) {
        *self.events.write() = Some(Arc::downgrade(events));
    }

    fn events(&self) -> Option<Arc<dyn SessionEvents>> {
        self.events.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn session_key(&self, token: &Token) -> String {
        format!("{}-session:{}", self.project, token)
    }

    pub fn active_key(&self, user_id: &str) -> String {
        format!("{}-activeUsers:{}", self.project, user_id)
    }

    fn session_prefix(&self) -> String {
        format!("{}-session:", self.project)
    }

    /// The stored record, carrying its own token. `None` when absent.
    pub async fn get(&self, token: &Token) -> Result<Option<Session>, StoreError> {
        let Some(raw) = self.kv.get(&self.session_key(token)).await? else {
            return Ok(None);
        };
        let mut session: Session = serde_json::from_str(&raw)?;
        session.token = Some(token.clone());
        Ok(Some(session))
    }

    /// The caller's session, or an empty anonymous one.
    pub async fn load(&self, token: Option<&Token>) -> Result<Session, StoreError> {
        match token {
            Some(t) => Ok(self.get(t).await?.unwrap_or_default()),
            None => Ok(Session::default()),
        }
    }

    /// Write a record and refresh its TTL.
    ///
    /// With `new_login`, every other token in the identity's active set is
    /// logged out (live) or deleted (offline) before this token is added.
    #[instrument(skip_all, fields(token = %token, new_login = new_login))]
    pub async fn set(
        &self,
        token: &Token,
        session: Session,
        new_login: bool,
    ) -> Result<Session, StoreError> {
        let mut record = session;
        record.token = None;
        record.touch(Utc::now());

        let key = self.session_key(token);
        let raw = serde_json::to_string(&record)?;
        self.kv.set(&key, &raw, Some(self.ttl)).await?;

        let events = self.events();
        if let Some(user_id) = record.user_id() {
            let active = self.active_key(user_id);
            if new_login {
                for other in self.kv.set_members(&active).await? {
                    let other = Token::new(other);
                    if &other == token {
                        continue;
                    }
                    match &events {
                        Some(ev) if ev.is_online(&other) => {
                            info!(user_id, evicted = %other, "evicting live session");
                            ev.evict(&other, user_id).await;
                        }
                        _ => {
                            debug!(user_id, evicted = %other, "dropping offline session");
                            self.kv.delete(&self.session_key(&other)).await?;
                            self.kv.set_remove(&active, other.as_str()).await?;
                        }
                    }
                }
                self.kv.set_add(&active, token.as_str()).await?;
            }
            self.kv.expire(&active, self.ttl).await?;
        }

        record.token = Some(token.clone());
        if let Some(ev) = &events {
            if ev.is_online(token) {
                ev.session_updated(token, &record);
            }
        }
        Ok(record)
    }

    /// Read-modify-write of the caller's record.
    pub async fn update<F>(&self, token: &Token, f: F) -> Result<Session, StoreError>
    where
        F: FnOnce(&mut Session) + Send,
    {
        let mut session = self.get(token).await?.unwrap_or_default();
        f(&mut session);
        self.set(token, session, false).await
    }

    /// Remove a record, notifying its live connections.
    #[instrument(skip_all, fields(token = %token))]
    pub async fn delete(&self, token: &Token) -> Result<bool, StoreError> {
        let key = self.session_key(token);
        let existing = match self.get(token).await {
            Ok(s) => s,
            Err(StoreError::Serialization(e)) => {
                warn!(error = %e, "unreadable session record, deleting");
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(user_id) = existing.as_ref().and_then(Session::user_id) {
            if let Some(ev) = self.events() {
                if ev.is_online(token) {
                    ev.session_deleted(token);
                }
            }
            self.kv
                .set_remove(&self.active_key(user_id), token.as_str())
                .await?;
        }

        self.kv.delete(&key).await
    }

    /// Tokens currently holding the identity's active slot.
    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<Token>, StoreError> {
        Ok(self
            .kv
            .set_members(&self.active_key(user_id))
            .await?
            .into_iter()
            .map(Token::new)
            .collect())
    }

    /// Every stored session.
    pub async fn all(&self) -> Result<Vec<Session>, StoreError> {
        let prefix = self.session_prefix();
        let mut sessions = Vec::new();
        for key in self.kv.scan(&prefix).await? {
            let token = Token::new(&key[prefix.len()..]);
            if let Some(session) = self.get(&token).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// Delete every key under `{project}-{prefix}`.
    pub async fn purge_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let full = format!("{}-{}", self.project, prefix);
        let keys = self.kv.scan(&full).await?;
        let mut deleted = 0;
        for key in &keys {
            if self.kv.delete(key).await? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!(prefix = %full, deleted, "purged keys");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKv;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    struct Recorder {
        online: Mutex<HashSet<Token>>,
        updated: Mutex<Vec<Token>>,
        deleted: Mutex<Vec<Token>>,
        evicted: Mutex<Vec<(Token, String)>>,
        store: Mutex<Option<Arc<SessionStore>>>,
    }

    #[async_trait]
    impl SessionEvents for Recorder {
        fn is_online(&self, token: &Token) -> bool {
            self.online.lock().contains(token)
        }
        fn session_updated(&self, token: &Token, _session: &Session) {
            self.updated.lock().push(token.clone());
        }
        fn session_deleted(&self, token: &Token) {
            self.deleted.lock().push(token.clone());
        }
        async fn evict(&self, token: &Token, user_id: &str) {
            self.evicted.lock().push((token.clone(), user_id.to_string()));
            let store = self.store.lock().clone();
            if let Some(store) = store {
                store.delete(token).await.unwrap();
            }
        }
    }

    fn setup() -> (Arc<SessionStore>, Arc<Recorder>) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let store = Arc::new(SessionStore::new(kv, "test", Duration::from_secs(604_800)));
        let recorder = Arc::new(Recorder::default());
        *recorder.store.lock() = Some(store.clone());
        let events: Arc<dyn SessionEvents> = recorder.clone();
        store.attach_events(&events);
        (store, recorder)
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let (store, _) = setup();
        assert!(store.get(&Token::new("nope")).await.unwrap().is_none());
        assert!(!store.load(None).await.unwrap().is_logged_in());
    }

    #[tokio::test]
    async fn set_then_get_carries_token() {
        let (store, _) = setup();
        let t = Token::new("t1");
        store.set(&t, Session::for_user("u1"), true).await.unwrap();
        let s = store.get(&t).await.unwrap().unwrap();
        assert_eq!(s.user_id(), Some("u1"));
        assert_eq!(s.token, Some(t.clone()));
        assert!(s.updated_at.is_some());

        let raw = store.kv().get(&store.session_key(&t)).await.unwrap().unwrap();
        assert!(!raw.contains("\"token\""));
    }

    #[tokio::test]
    async fn loosely_typed_record_still_loads() {
        let (store, _) = setup();
        let t = Token::new("t1");
        let raw = r#"{"id":"u1","admin":1,"avatar":null}"#;
        store.kv().set(&store.session_key(&t), raw, None).await.unwrap();

        let s = store.get(&t).await.unwrap().unwrap();
        assert_eq!(s.user_id(), Some("u1"));
        assert_eq!(s.admin, None);
        let fields = s.to_fields();
        assert_eq!(fields["admin"], 1);
        assert!(fields["avatar"].is_null());
    }

    #[tokio::test]
    async fn new_login_evicts_other_tokens() {
        let (store, rec) = setup();
        let a = Token::new("A");
        let b = Token::new("B");
        store.set(&a, Session::for_user("u1"), true).await.unwrap();
        rec.online.lock().insert(a.clone());

        store.set(&b, Session::for_user("u1"), true).await.unwrap();

        assert_eq!(rec.evicted.lock().as_slice(), &[(a.clone(), "u1".to_string())]);
        assert_eq!(rec.deleted.lock().as_slice(), &[a.clone()]);
        assert_eq!(store.list_by_user("u1").await.unwrap(), vec![b]);
        assert!(store.get(&a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn new_login_drops_offline_tokens() {
        let (store, rec) = setup();
        let a = Token::new("A");
        let b = Token::new("B");
        store.set(&a, Session::for_user("u1"), true).await.unwrap();
        store.set(&b, Session::for_user("u1"), true).await.unwrap();

        assert!(rec.evicted.lock().is_empty());
        assert!(rec.deleted.lock().is_empty());
        assert!(store.get(&a).await.unwrap().is_none());
        assert_eq!(store.list_by_user("u1").await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn relogin_same_token_keeps_it() {
        let (store, rec) = setup();
        let a = Token::new("A");
        rec.online.lock().insert(a.clone());
        store.set(&a, Session::for_user("u1"), true).await.unwrap();
        store.set(&a, Session::for_user("u1"), true).await.unwrap();
        assert!(rec.evicted.lock().is_empty());
        assert_eq!(store.list_by_user("u1").await.unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn update_pushes_only_when_online() {
        let (store, rec) = setup();
        let a = Token::new("A");
        store.set(&a, Session::for_user("u1"), false).await.unwrap();
        assert!(rec.updated.lock().is_empty());

        rec.online.lock().insert(a.clone());
        let s = store.update(&a, |s| s.theme = Some("dark".into())).await.unwrap();
        assert_eq!(s.theme.as_deref(), Some("dark"));
        assert_eq!(rec.updated.lock().as_slice(), &[a]);
    }

    #[tokio::test]
    async fn delete_notifies_and_clears_active_set() {
        let (store, rec) = setup();
        let a = Token::new("A");
        store.set(&a, Session::for_user("u1"), true).await.unwrap();
        rec.online.lock().insert(a.clone());

        assert!(store.delete(&a).await.unwrap());
        assert_eq!(rec.deleted.lock().as_slice(), &[a.clone()]);
        assert!(store.list_by_user("u1").await.unwrap().is_empty());
        assert!(!store.delete(&a).await.unwrap());
    }

    #[tokio::test]
    async fn anonymous_delete_sends_nothing() {
        let (store, rec) = setup();
        let a = Token::new("A");
        rec.online.lock().insert(a.clone());
        store.set(&a, Session::default(), false).await.unwrap();
        store.delete(&a).await.unwrap();
        assert!(rec.deleted.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_expire_after_ttl() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let store = SessionStore::new(kv, "test", Duration::from_secs(60));
        let a = Token::new("A");
        store.set(&a, Session::for_user("u1"), true).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get(&a).await.unwrap().is_none());
        assert!(store.list_by_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn all_lists_every_session() {
        let (store, _) = setup();
        store.set(&Token::new("A"), Session::for_user("u1"), true).await.unwrap();
        store.set(&Token::new("B"), Session::for_user("u2"), true).await.unwrap();
        let mut ids: Vec<String> = store
            .all()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|s| s.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn purge_prefix_only_touches_prefix() {
        let (store, _) = setup();
        store.kv().set("test-games:1", "{}", None).await.unwrap();
        store.kv().set("test-games:2", "{}", None).await.unwrap();
        store.set(&Token::new("A"), Session::for_user("u1"), true).await.unwrap();
        assert_eq!(store.purge_prefix("games:").await.unwrap(), 2);
        assert!(store.get(&Token::new("A")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn store_errors_surface() {
        let mem = Arc::new(MemoryKv::new());
        let kv: Arc<dyn KvStore> = mem.clone();
        let store = SessionStore::new(kv, "test", Duration::from_secs(60));
        mem.set_offline(true);
        let err = store.set(&Token::new("A"), Session::for_user("u1"), true).await;
        assert!(matches!(err, Err(StoreError::Unavailable(_))));
    }
}
