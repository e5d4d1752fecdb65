/// SQL DDL for the lobby key-value database.
pub const SCHEMA_VERSION: u32 = 1;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
"#;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

-- One row per key. `kind` is 'value' or 'set'; set members live in kv_members.
CREATE TABLE IF NOT EXISTS kv_keys (
    key TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    value TEXT,
    expires_at INTEGER
);

CREATE TABLE IF NOT EXISTS kv_members (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL REFERENCES kv_keys(key) ON DELETE CASCADE,
    member TEXT NOT NULL,
    UNIQUE (key, member)
);

CREATE INDEX IF NOT EXISTS idx_kv_keys_expires ON kv_keys(expires_at);
"#;
