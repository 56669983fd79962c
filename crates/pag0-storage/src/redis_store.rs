//! Redis-backed fast store implementation.
//!
//! The fast store backing multi-replica deployments: replay markers and
//! spend counters must be shared across proxy instances, which the
//! per-process [`InMemoryFastStore`](crate::InMemoryFastStore) cannot do.
//! Connections go through [`redis::aio::ConnectionManager`] so dropped
//! links are re-established without surfacing to callers.

use async_trait::async_trait;
use pag0_core::{FastStore, Pag0Error, Result};
use redis::AsyncCommands;
use std::time::Duration;

/// Redis-backed fast store with automatic reconnection.
///
/// Uses `SET EX` for writes, `SET NX EX` for atomic create-if-absent
/// (replay markers), `INCRBY` for counters, `EXPIRE NX` for lazy counter
/// expiry, `KEYS` + `DEL` for pattern invalidation, and `PING` for health
/// checks.
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> pag0_core::Result<()> {
/// use pag0_core::FastStore;
/// let store = pag0_storage::RedisFastStore::new("redis://127.0.0.1:6379").await?;
/// store.health_check().await?;
/// # Ok(())
/// # }
/// ```
pub struct RedisFastStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisFastStore {
    /// Connect to a Redis instance.
    ///
    /// The `url` should be a valid Redis connection string,
    /// e.g. `redis://127.0.0.1:6379` or `redis://:password@host:port/db`.
    pub async fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Pag0Error::Storage(format!("Invalid Redis URL: {e}")))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| Pag0Error::Storage(format!("Failed to connect to Redis: {e}")))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl FastStore for RedisFastStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let result: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|e| Pag0Error::Storage(format!("Redis GET failed: {e}")))?;
        Ok(result)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, seconds)
            .await
            .map_err(|e| Pag0Error::Storage(format!("Redis SET EX failed: {e}")))?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        // SET key value NX EX n is a single atomic command
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(seconds)
            .query_async(&mut conn)
            .await
            .map_err(|e| Pag0Error::Storage(format!("Redis SET NX failed: {e}")))?;
        Ok(reply.is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn
            .incr(key, delta)
            .await
            .map_err(|e| Pag0Error::Storage(format!("Redis INCRBY failed: {e}")))?;
        Ok(value)
    }

    async fn expire_if_unset(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .arg("NX")
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| Pag0Error::Storage(format!("Redis EXPIRE NX failed: {e}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| Pag0Error::Storage(format!("Redis DEL failed: {e}")))?;
        Ok(())
    }

    async fn scan_delete(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn
            .keys(pattern)
            .await
            .map_err(|e| Pag0Error::Storage(format!("Redis KEYS failed: {e}")))?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: u64 = conn
            .del(&keys)
            .await
            .map_err(|e| Pag0Error::Storage(format!("Redis DEL failed: {e}")))?;
        Ok(removed)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| Pag0Error::Storage(format!("Redis PING failed: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    /// Return a [`RedisFastStore`] connected to the test instance,
    /// or panic if `PAG0_REDIS_URL` is not set.
    async fn test_store() -> RedisFastStore {
        let url = env::var("PAG0_REDIS_URL").expect("PAG0_REDIS_URL must be set for Redis tests");
        RedisFastStore::new(&url).await.unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a running Redis instance"]
    async fn test_set_and_get() {
        let store = test_store().await;
        store
            .set("test:key1", b"value1", Duration::from_secs(60))
            .await
            .unwrap();

        let result = store.get("test:key1").await.unwrap();
        assert_eq!(result, Some(b"value1".to_vec()));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis instance"]
    async fn test_get_missing_key() {
        let store = test_store().await;
        let result = store.get("test:nonexistent_key_abc123").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis instance"]
    async fn test_set_nx_creates_once() {
        let store = test_store().await;
        store.delete("test:nonce1").await.unwrap();

        let first = store
            .set_nx("test:nonce1", b"1", Duration::from_secs(60))
            .await
            .unwrap();
        let second = store
            .set_nx("test:nonce1", b"1", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis instance"]
    async fn test_incr_by_accumulates() {
        let store = test_store().await;
        store.delete("test:counter1").await.unwrap();

        assert_eq!(store.incr_by("test:counter1", 5).await.unwrap(), 5);
        assert_eq!(store.incr_by("test:counter1", 3).await.unwrap(), 8);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis instance"]
    async fn test_expire_if_unset_does_not_extend() {
        let store = test_store().await;
        store.delete("test:spend1").await.unwrap();
        store.incr_by("test:spend1", 10).await.unwrap();

        store
            .expire_if_unset("test:spend1", Duration::from_secs(1))
            .await
            .unwrap();
        store
            .expire_if_unset("test:spend1", Duration::from_secs(3600))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.get("test:spend1").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis instance"]
    async fn test_scan_delete() {
        let store = test_store().await;
        store
            .set("test:scan:a", b"1", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set("test:scan:b", b"2", Duration::from_secs(60))
            .await
            .unwrap();

        let removed = store.scan_delete("test:scan:*").await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.get("test:scan:a").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis instance"]
    async fn test_health_check() {
        let store = test_store().await;
        assert!(store.health_check().await.is_ok());
    }
}
