//! Storage adapter contract for shared counters.
//!
//! The rate limiter and throttle persist their counters through a
//! [`StorageAdapter`]. Implementations must make `increment`/`decrement`
//! atomic per key even under concurrent callers; the engine never performs
//! read-modify-write on a counter itself.

mod memory;

pub use memory::InMemoryStorage;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors raised by a storage adapter.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("value at '{key}' is not an integer counter")]
    NotNumeric { key: String },
    #[error("invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Atomic key/value store with per-key TTL.
#[async_trait]
pub trait StorageAdapter: Send + Sync + Debug {
    /// Fetch a live value.
    async fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Store a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StorageResult<()>;

    /// Atomically add `delta` to an integer counter, creating it at zero
    /// first if absent. Returns the new value. A newly created counter has
    /// no expiry.
    async fn increment(&self, key: &str, delta: i64) -> StorageResult<i64>;

    /// Atomically subtract `delta` from an integer counter.
    async fn decrement(&self, key: &str, delta: i64) -> StorageResult<i64>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Set the expiry of a live key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool>;

    /// Remaining lifetime of a key, or `None` if absent or persistent.
    async fn ttl(&self, key: &str) -> StorageResult<Option<Duration>>;

    /// Remove a key. Returns `true` if a live key was removed.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Live keys matching a glob pattern (`*` and `?`).
    async fn scan(&self, pattern: &str) -> StorageResult<Vec<String>>;

    async fn clear(&self) -> StorageResult<()>;
}

/// Shareable storage reference.
pub type SharedStorage = Arc<dyn StorageAdapter>;

/// Adapter whose every call fails, for exercising fail-open paths.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FailingStorage;

#[cfg(test)]
#[async_trait]
impl StorageAdapter for FailingStorage {
    async fn get(&self, _key: &str) -> StorageResult<Option<Value>> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
    async fn set(&self, _key: &str, _value: Value, _ttl: Option<Duration>) -> StorageResult<()> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
    async fn increment(&self, _key: &str, _delta: i64) -> StorageResult<i64> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
    async fn decrement(&self, _key: &str, _delta: i64) -> StorageResult<i64> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
    async fn exists(&self, _key: &str) -> StorageResult<bool> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
    async fn expire(&self, _key: &str, _ttl: Duration) -> StorageResult<bool> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
    async fn ttl(&self, _key: &str) -> StorageResult<Option<Duration>> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
    async fn delete(&self, _key: &str) -> StorageResult<bool> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
    async fn scan(&self, _pattern: &str) -> StorageResult<Vec<String>> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
    async fn clear(&self) -> StorageResult<()> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
}
