//! In-process storage adapter backed by DashMap.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use tracing::trace;

use super::{StorageAdapter, StorageError, StorageResult};
use crate::clock::{SharedClock, SystemClock};

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Value,
    /// Absolute expiry in epoch milliseconds.
    expires_at: Option<u64>,
}

impl StoredEntry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Thread-safe in-memory storage with lazy TTL expiry.
///
/// Per-key atomicity comes from DashMap's shard locks: `increment` holds the
/// entry lock across the read and the write.
#[derive(Debug)]
pub struct InMemoryStorage {
    map: DashMap<String, StoredEntry>,
    clock: SharedClock,
}

impl InMemoryStorage {
    /// Create a storage instance driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(std::sync::Arc::new(SystemClock::new()))
    }

    /// Create a storage instance driven by the given clock.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            map: DashMap::new(),
            clock,
        }
    }

    /// Number of stored entries, including ones expired but not yet purged.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.map.len();
        self.map.retain(|_, entry| !entry.is_expired(now));
        let purged = before.saturating_sub(self.map.len());
        if purged > 0 {
            trace!(purged, "Purged expired storage entries");
        }
        purged
    }

    fn live<R>(&self, key: &str, f: impl FnOnce(&StoredEntry) -> R) -> Option<R> {
        let now = self.clock.now_millis();
        let expired = match self.map.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(f(&entry)),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.map.remove_if(key, |_, entry| entry.is_expired(now));
        }
        None
    }

    fn expiry_from(&self, ttl: Duration) -> u64 {
        self.clock.now_millis().saturating_add(ttl.as_millis() as u64)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Translate a glob pattern into an anchored regex.
fn glob_to_regex(pattern: &str) -> StorageResult<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 2);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| StorageError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl StorageAdapter for InMemoryStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.live(key, |entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StorageResult<()> {
        let expires_at = ttl.map(|ttl| self.expiry_from(ttl));
        self.map
            .insert(key.to_string(), StoredEntry { value, expires_at });
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64) -> StorageResult<i64> {
        let now = self.clock.now_millis();
        match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = StoredEntry {
                        value: Value::from(delta),
                        expires_at: None,
                    };
                    return Ok(delta);
                }
                let current = entry.value.as_i64().ok_or_else(|| StorageError::NotNumeric {
                    key: key.to_string(),
                })?;
                let next = current.saturating_add(delta);
                entry.value = Value::from(next);
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry {
                    value: Value::from(delta),
                    expires_at: None,
                });
                Ok(delta)
            }
        }
    }

    async fn decrement(&self, key: &str, delta: i64) -> StorageResult<i64> {
        self.increment(key, -delta).await
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.live(key, |_| ()).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool> {
        let now = self.clock.now_millis();
        let expires_at = self.expiry_from(ttl);
        match self.map.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> StorageResult<Option<Duration>> {
        let now = self.clock.now_millis();
        Ok(self
            .live(key, |entry| entry.expires_at)
            .flatten()
            .map(|at| Duration::from_millis(at.saturating_sub(now))))
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let now = self.clock.now_millis();
        Ok(self
            .map
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn scan(&self, pattern: &str) -> StorageResult<Vec<String>> {
        let matcher = glob_to_regex(pattern)?;
        let now = self.clock.now_millis();
        let mut keys: Vec<String> = self
            .map
            .iter()
            .filter(|entry| !entry.value().is_expired(now) && matcher.is_match(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self) -> StorageResult<()> {
        self.map.clear();
        Ok(())
    }
}
