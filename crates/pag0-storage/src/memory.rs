//! In-memory fast store implementation.
//!
//! Uses [`DashMap`] with per-entry TTL expiry. Intended for dev/test use;
//! production deployments would use the Redis-backed implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use pag0_core::{FastStore, Pag0Error, Result};
use std::time::{Duration, Instant};

/// A stored value with an optional expiry instant.
struct StoreEntry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoreEntry {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if Instant::now() >= at)
    }
}

/// In-memory fast store backed by [`DashMap`] with TTL expiry.
///
/// Expired entries are lazily evicted on access. Counter values are stored
/// as ASCII decimal bytes so that `get` on a counter key behaves the same
/// as it does against Redis.
pub struct InMemoryFastStore {
    map: DashMap<String, StoreEntry>,
}

impl InMemoryFastStore {
    /// Create a new, empty in-memory store.
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Translate a `*` glob pattern into a literal prefix/suffix/infix check.
    fn glob_matches(pattern: &str, key: &str) -> bool {
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 1 {
            return pattern == key;
        }
        let mut pos = 0;
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            if i == 0 {
                if !key.starts_with(part) {
                    return false;
                }
                pos = part.len();
            } else if i == parts.len() - 1 && !pattern.ends_with('*') {
                return key.len() >= pos + part.len() && key.ends_with(part);
            } else {
                match key[pos..].find(part) {
                    Some(found) => pos += found + part.len(),
                    None => return false,
                }
            }
        }
        true
    }
}

impl Default for InMemoryFastStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FastStore for InMemoryFastStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.map.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.data.clone()));
            }
            // Entry expired — drop the ref before removing
            drop(entry);
            self.map.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.map.insert(
            key.to_string(),
            StoreEntry {
                data: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut created = false;
        let mut entry = self.map.entry(key.to_string()).or_insert_with(|| {
            created = true;
            StoreEntry {
                data: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            }
        });
        if !created && entry.is_expired() {
            // Expired marker is as good as absent
            entry.data = value.to_vec();
            entry.expires_at = Some(Instant::now() + ttl);
            created = true;
        }
        Ok(created)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut entry = self.map.entry(key.to_string()).or_insert(StoreEntry {
            data: b"0".to_vec(),
            expires_at: None,
        });
        if entry.is_expired() {
            entry.data = b"0".to_vec();
            entry.expires_at = None;
        }
        let current: i64 = std::str::from_utf8(&entry.data)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Pag0Error::Storage(format!("key '{key}' holds a non-integer value")))?;
        let next = current
            .checked_add(delta)
            .ok_or_else(|| Pag0Error::Storage(format!("counter overflow on key '{key}'")))?;
        entry.data = next.to_string().into_bytes();
        Ok(next)
    }

    async fn expire_if_unset(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(mut entry) = self.map.get_mut(key) {
            if entry.expires_at.is_none() {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }

    async fn scan_delete(&self, pattern: &str) -> Result<u64> {
        let matching: Vec<String> = self
            .map
            .iter()
            .filter(|e| Self::glob_matches(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        let mut removed = 0;
        for key in matching {
            if self.map.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
