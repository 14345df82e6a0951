//! Persistent key-value storage behind the planner's stores.
//!
//! Everything the planner persists lives under one well-known key per
//! concern, serialized as a single JSON blob. Tests substitute the
//! in-memory implementation.

pub mod kv;
pub mod memory;
pub mod sqlite;

pub use kv::{KvStore, StorageError, GEOCODE_CACHE_KEY, ROUTES_KEY, WAREHOUSE_ORIGIN_KEY};
pub use memory::MemoryKv;
pub use sqlite::SqliteKv;
