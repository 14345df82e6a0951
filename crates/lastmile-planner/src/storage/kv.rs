//! Key-value store contract.

use std::future::Future;

use thiserror::Error;

/// Serialized route list.
pub const ROUTES_KEY: &str = "routes.v1";
/// Serialized geocode cache map.
pub const GEOCODE_CACHE_KEY: &str = "geocode_cache.v1";
/// Serialized warehouse origin record.
pub const WAREHOUSE_ORIGIN_KEY: &str = "warehouse_origin.v1";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("storage unavailable")]
    Unavailable,
}

/// String-to-string durable storage.
///
/// Callers treat failures as soft: in-memory state stays authoritative
/// and a failed write is logged, not surfaced.
pub trait KvStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, StorageError>> + Send;
    fn put(&self, key: &str, value: &str) -> impl Future<Output = Result<(), StorageError>> + Send;
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), StorageError>> + Send;
}
