//! SQLite-backed [`KvStore`]. Expiry uses wall-clock milliseconds.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::Database;
use crate::error::StoreError;
use crate::kv::KvStore;

const KIND_VALUE: &str = "value";
const KIND_SET: &str = "set";

#[derive(Clone)]
pub struct SqliteKv {
    db: Database,
}

impl SqliteKv {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Drop every expired key. Reads already ignore them.
    pub fn sweep_expired(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM kv_keys WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                [now_ms()],
            )?)
        })
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn deadline(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

fn drop_if_expired(conn: &Connection, key: &str) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM kv_keys WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
        params![key, now_ms()],
    )?;
    Ok(())
}

fn kind_of(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    drop_if_expired(conn, key)?;
    Ok(conn
        .query_row("SELECT kind FROM kv_keys WHERE key = ?1", [key], |r| r.get(0))
        .optional()?)
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Database(format!("wrong kind of value at key {key}"))
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            drop_if_expired(conn, key)?;
            let row: Option<(String, Option<String>)> = conn
                .query_row("SELECT kind, value FROM kv_keys WHERE key = ?1", [key], |r| {
                    Ok((r.get(0)?, r.get(1)?))
                })
                .optional()?;
            match row {
                None => Ok(None),
                Some((kind, value)) if kind == KIND_VALUE => Ok(value),
                Some(_) => Err(wrong_type(key)),
            }
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(deadline);
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM kv_members WHERE key = ?1", [key])?;
            conn.execute(
                "INSERT OR REPLACE INTO kv_keys (key, kind, value, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![key, KIND_VALUE, value, expires_at],
            )?;
            Ok(())
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            drop_if_expired(conn, key)?;
            let changed = conn.execute(
                "UPDATE kv_keys SET expires_at = ?2 WHERE key = ?1",
                params![key, deadline(ttl)],
            )?;
            Ok(changed > 0)
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            drop_if_expired(conn, key)?;
            Ok(conn.execute("DELETE FROM kv_keys WHERE key = ?1", [key])? > 0)
        })
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM kv_keys
                 WHERE substr(key, 1, length(?1)) = ?1
                   AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY key",
            )?;
            let keys = stmt
                .query_map(params![prefix, now_ms()], |r| r.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(keys)
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            match kind_of(conn, key)?.as_deref() {
                None => {
                    conn.execute(
                        "INSERT INTO kv_keys (key, kind, value, expires_at) VALUES (?1, ?2, NULL, NULL)",
                        params![key, KIND_SET],
                    )?;
                }
                Some(KIND_SET) => {}
                Some(_) => return Err(wrong_type(key)),
            }
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO kv_members (key, member) VALUES (?1, ?2)",
                params![key, member],
            )?;
            Ok(inserted > 0)
        })
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            match kind_of(conn, key)?.as_deref() {
                None => return Ok(false),
                Some(KIND_SET) => {}
                Some(_) => return Err(wrong_type(key)),
            }
            let removed = conn.execute(
                "DELETE FROM kv_members WHERE key = ?1 AND member = ?2",
                params![key, member],
            )? > 0;
            let remaining: i64 =
                conn.query_row("SELECT COUNT(*) FROM kv_members WHERE key = ?1", [key], |r| r.get(0))?;
            if remaining == 0 {
                conn.execute("DELETE FROM kv_keys WHERE key = ?1", [key])?;
            }
            Ok(removed)
        })
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.db.with_conn(|conn| {
            match kind_of(conn, key)?.as_deref() {
                None => return Ok(Vec::new()),
                Some(KIND_SET) => {}
                Some(_) => return Err(wrong_type(key)),
            }
            let mut stmt = conn.prepare("SELECT member FROM kv_members WHERE key = ?1 ORDER BY seq")?;
            let members = stmt
                .query_map([key], |r| r.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(members)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn kv() -> SqliteKv {
        SqliteKv::new(Database::in_memory().unwrap())
    }

    #[tokio::test]
    async fn set_get_delete() {
        let kv = kv();
        kv.set("a", "{\"id\":\"u1\"}", Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("{\"id\":\"u1\"}"));
        assert!(kv.delete("a").await.unwrap());
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zero_ttl_expires_immediately() {
        let kv = kv();
        kv.set("a", "1", Some(Duration::ZERO)).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
        assert!(kv.scan("a").await.unwrap().is_empty());
        assert!(!kv.expire("a", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn expire_on_set_key() {
        let kv = kv();
        kv.set_add("s", "t1").await.unwrap();
        assert!(kv.expire("s", Duration::from_secs(60)).await.unwrap());
        kv.expire("s", Duration::ZERO).await.unwrap();
        assert!(kv.set_members("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_members_in_order() {
        let kv = kv();
        assert!(kv.set_add("s", "t2").await.unwrap());
        assert!(kv.set_add("s", "t1").await.unwrap());
        assert!(!kv.set_add("s", "t2").await.unwrap());
        assert_eq!(kv.set_members("s").await.unwrap(), vec!["t2", "t1"]);
        assert!(kv.set_remove("s", "t2").await.unwrap());
        assert!(kv.set_remove("s", "t1").await.unwrap());
        assert!(kv.scan("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overwriting_a_set_drops_members() {
        let kv = kv();
        kv.set_add("k", "m").await.unwrap();
        kv.set("k", "v", None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        assert_matches!(kv.set_members("k").await, Err(StoreError::Database(_)));
    }

    #[tokio::test]
    async fn scan_treats_prefix_literally() {
        let kv = kv();
        kv.set("lobby-games:1", "x", None).await.unwrap();
        kv.set("lobby-games%2", "x", None).await.unwrap();
        kv.set("lobby-session:1", "x", None).await.unwrap();
        assert_eq!(kv.scan("lobby-games:").await.unwrap(), vec!["lobby-games:1"]);
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lobby.db");
        {
            let kv = SqliteKv::new(Database::open(&path).unwrap());
            kv.set("a", "1", None).await.unwrap();
            kv.set_add("s", "t").await.unwrap();
        }
        let kv = SqliteKv::new(Database::open(&path).unwrap());
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(kv.set_members("s").await.unwrap(), vec!["t"]);
    }

    #[tokio::test]
    async fn sweep_removes_expired() {
        let kv = kv();
        kv.set("gone", "1", Some(Duration::ZERO)).await.unwrap();
        kv.set("kept", "1", None).await.unwrap();
        assert_eq!(kv.sweep_expired().unwrap(), 1);
    }
}
