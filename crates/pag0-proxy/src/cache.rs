//! Response caching over the fast store.
//!
//! Cache keys are the hex sha256 of `"METHOD:url"` (plus `":body"` when a
//! body is present), so the same logical request hits the same entry from
//! both proxy surfaces. Cached entries hold the raw upstream body base64-
//! encoded next to the status and content type.
//!
//! The cache degrades, never gates: a failed read is a miss and a failed
//! write is logged and dropped.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use pag0_core::{CacheConfig, FastStore, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::wildcard;

/// A cached upstream response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Upstream status code at capture time.
    pub status: u16,
    /// Upstream `Content-Type`, when present.
    pub content_type: Option<String>,
    /// Base64 of the raw upstream body bytes.
    pub body_b64: String,
    /// When the entry was stored.
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Decode the stored body back into raw bytes.
    pub fn body(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.body_b64)
            .map_err(|e| pag0_core::Pag0Error::Storage(format!("corrupt cache entry body: {e}")))
    }

    /// Entry age in whole seconds.
    #[must_use]
    pub fn age_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.stored_at).num_seconds().max(0) as u64
    }
}

// ---------------------------------------------------------------------------
// ResponseCache
// ---------------------------------------------------------------------------

/// Pattern-driven response cache with hit/miss counters.
pub struct ResponseCache {
    fast: Arc<dyn FastStore>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    /// Create a cache over the fast store.
    pub fn new(fast: Arc<dyn FastStore>, config: CacheConfig) -> Self {
        Self {
            fast,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Deterministic cache key for a request.
    #[must_use]
    pub fn generate_key(method: &str, url: &str, body: Option<&[u8]>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(method.to_uppercase().as_bytes());
        hasher.update(b":");
        hasher.update(url.as_bytes());
        if let Some(body) = body {
            hasher.update(b":");
            hasher.update(body);
        }
        hex_encode(&hasher.finalize())
    }

    /// Whether a response qualifies for caching.
    ///
    /// Requires a safe method, a 2xx status, a body under the size ceiling,
    /// no prohibitive `Cache-Control` directives, and a URL outside the
    /// exclusion list.
    #[must_use]
    pub fn is_cacheable(
        &self,
        method: &str,
        status: u16,
        url: &str,
        body_len: usize,
        cache_control: Option<&str>,
    ) -> bool {
        if !matches!(
            method.to_uppercase().as_str(),
            "GET" | "HEAD" | "OPTIONS"
        ) {
            return false;
        }
        if !(200..300).contains(&status) {
            return false;
        }
        if body_len > self.config.max_body_bytes {
            return false;
        }
        if let Some(cc) = cache_control {
            let cc = cc.to_lowercase();
            if cc.contains("no-store") || cc.contains("no-cache") || cc.contains("private") {
                return false;
            }
        }
        if wildcard::matches_any(&self.config.exclude_patterns, url) {
            return false;
        }
        true
    }

    /// TTL for a URL: first matching rule wins, else the default.
    #[must_use]
    pub fn ttl_for(&self, url: &str) -> Duration {
        let secs = self
            .config
            .ttl_rules
            .iter()
            .find(|rule| wildcard::matches(&rule.pattern, url))
            .map_or(self.config.default_ttl_secs, |rule| rule.ttl_secs);
        Duration::from_secs(secs)
    }

    /// Look up a cached response. Read failures count as misses.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let entry = match self.fast.get(&entry_key(key)).await {
            Ok(Some(bytes)) => serde_json::from_slice::<CacheEntry>(&bytes).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, treating as miss");
                None
            }
        };
        match entry {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a response. Write failures are logged and dropped.
    pub async fn put(&self, key: &str, url: &str, status: u16, content_type: Option<&str>, body: &[u8]) {
        let entry = CacheEntry {
            status,
            content_type: content_type.map(str::to_string),
            body_b64: base64::engine::general_purpose::STANDARD.encode(body),
            stored_at: Utc::now(),
        };
        let serialized = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "Cache entry serialization failed");
                return;
            }
        };
        if let Err(e) = self
            .fast
            .set(&entry_key(key), &serialized, self.ttl_for(url))
            .await
        {
            warn!(key, error = %e, "Cache write failed, response not cached");
        }
    }

    /// Delete all entries whose key matches a `*`-glob. Returns the number
    /// of entries removed.
    pub async fn invalidate(&self, pattern: &str) -> Result<u64> {
        self.fast.scan_delete(&entry_key(pattern)).await
    }

    /// Lifetime hit count.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lifetime miss count.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

fn entry_key(key: &str) -> String {
    format!("cache:{key}")
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pag0_core::CacheTtlRule;
    use pag0_storage::InMemoryFastStore;

    fn test_cache(config: CacheConfig) -> ResponseCache {
        ResponseCache::new(Arc::new(InMemoryFastStore::new()), config)
    }

    #[test]
    fn test_key_is_deterministic_and_method_sensitive() {
        let a = ResponseCache::generate_key("GET", "https://api.example.com/x", None);
        let b = ResponseCache::generate_key("get", "https://api.example.com/x", None);
        let c = ResponseCache::generate_key("POST", "https://api.example.com/x", None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_key_includes_body_when_present() {
        let without = ResponseCache::generate_key("GET", "https://api.example.com/x", None);
        let with = ResponseCache::generate_key("GET", "https://api.example.com/x", Some(b"{}"));
        assert_ne!(without, with);
    }

    #[test]
    fn test_cacheability_rules() {
        let cache = test_cache(CacheConfig {
            exclude_patterns: vec!["*/private/*".to_string()],
            ..CacheConfig::default()
        });
        let url = "https://api.example.com/data";

        assert!(cache.is_cacheable("GET", 200, url, 100, None));
        assert!(cache.is_cacheable("HEAD", 204, url, 0, None));
        assert!(cache.is_cacheable("OPTIONS", 200, url, 0, None));

        assert!(!cache.is_cacheable("POST", 200, url, 100, None));
        assert!(!cache.is_cacheable("GET", 301, url, 100, None));
        assert!(!cache.is_cacheable("GET", 404, url, 100, None));
        assert!(!cache.is_cacheable("GET", 200, url, 100, Some("no-store")));
        assert!(!cache.is_cacheable("GET", 200, url, 100, Some("No-Cache, max-age=60")));
        assert!(!cache.is_cacheable("GET", 200, url, 100, Some("private")));
        assert!(cache.is_cacheable("GET", 200, url, 100, Some("public, max-age=60")));
        assert!(!cache.is_cacheable(
            "GET",
            200,
            "https://api.example.com/private/key",
            100,
            None
        ));
    }

    #[test]
    fn test_body_size_ceiling() {
        let cache = test_cache(CacheConfig {
            max_body_bytes: 10,
            ..CacheConfig::default()
        });
        assert!(cache.is_cacheable("GET", 200, "https://e.com/x", 10, None));
        assert!(!cache.is_cacheable("GET", 200, "https://e.com/x", 11, None));
    }

    #[test]
    fn test_ttl_rules_first_match_wins() {
        let cache = test_cache(CacheConfig {
            default_ttl_secs: 300,
            ttl_rules: vec![
                CacheTtlRule {
                    pattern: "*/weather/*".to_string(),
                    ttl_secs: 60,
                },
                CacheTtlRule {
                    pattern: "*weather*".to_string(),
                    ttl_secs: 600,
                },
            ],
            ..CacheConfig::default()
        });
        assert_eq!(
            cache.ttl_for("https://api.example.com/weather/today"),
            Duration::from_secs(60)
        );
        assert_eq!(
            cache.ttl_for("https://weather.example.com/"),
            Duration::from_secs(600)
        );
        assert_eq!(
            cache.ttl_for("https://api.example.com/search"),
            Duration::from_secs(300)
        );
    }

    #[tokio::test]
    async fn test_put_get_roundtrip_preserves_bytes() {
        let cache = test_cache(CacheConfig::default());
        let key = ResponseCache::generate_key("GET", "https://e.com/x", None);
        let body = b"\x00\x01binary\xff";

        cache
            .put(&key, "https://e.com/x", 200, Some("application/octet-stream"), body)
            .await;

        let entry = cache.get(&key).await.unwrap();
        assert_eq!(entry.status, 200);
        assert_eq!(
            entry.content_type.as_deref(),
            Some("application/octet-stream")
        );
        assert_eq!(entry.body().unwrap(), body);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 0);
    }

    #[tokio::test]
    async fn test_miss_counts() {
        let cache = test_cache(CacheConfig::default());
        assert!(cache.get("absent").await.is_none());
        assert_eq!(cache.misses(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern() {
        let cache = test_cache(CacheConfig::default());
        let k1 = ResponseCache::generate_key("GET", "https://e.com/a", None);
        let k2 = ResponseCache::generate_key("GET", "https://e.com/b", None);
        cache.put(&k1, "https://e.com/a", 200, None, b"a").await;
        cache.put(&k2, "https://e.com/b", 200, None, b"b").await;

        let removed = cache.invalidate("*").await.unwrap();
        assert_eq!(removed, 2);
        assert!(cache.get(&k1).await.is_none());
    }

    #[test]
    fn test_entry_age() {
        let entry = CacheEntry {
            status: 200,
            content_type: None,
            body_b64: String::new(),
            stored_at: Utc::now() - chrono::Duration::seconds(42),
        };
        assert_eq!(entry.age_secs(Utc::now()), 42);
    }
}
