pub mod database;
pub mod error;
pub mod kv;
pub mod memory;
pub mod schema;
pub mod sessions;
pub mod sqlite;

pub use database::Database;
pub use error::StoreError;
pub use kv::KvStore;
pub use memory::MemoryKv;
pub use sessions::{SessionEvents, SessionStore};
pub use sqlite::SqliteKv;
