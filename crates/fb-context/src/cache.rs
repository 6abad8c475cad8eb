use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// CacheEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    expires_at: Option<DateTime<Utc>>,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() > at)
    }
}

// ---------------------------------------------------------------------------
// CacheStats
// ---------------------------------------------------------------------------

/// Hit/miss accounting for monitoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// ---------------------------------------------------------------------------
// TtlCache
// ---------------------------------------------------------------------------

/// Thread-safe LRU cache with TTL-based expiration.
pub struct TtlCache<T> {
    inner: Mutex<TtlCacheInner<T>>,
    default_ttl: Duration,
}

struct TtlCacheInner<T> {
    entries: LruCache<String, CacheEntry<T>>,
    stats: CacheStats,
}

impl<T: Clone> TtlCache<T> {
    /// Create a cache holding up to `max_size` entries, each expiring
    /// `default_ttl_seconds` after insertion.
    pub fn new(max_size: usize, default_ttl_seconds: i64) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).expect("non-zero capacity");
        Self {
            inner: Mutex::new(TtlCacheInner {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
            default_ttl: Duration::seconds(default_ttl_seconds),
        }
    }

    /// Fetch a value, counting hits/misses and dropping expired entries.
    pub fn get(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");

        let expired = inner.entries.get(key).is_some_and(CacheEntry::is_expired);
        if expired {
            inner.entries.pop(key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            return None;
        }

        match inner.entries.get(key) {
            Some(entry) => {
                let value = entry.value.clone();
                inner.stats.hits += 1;
                Some(value)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Insert a value with the default TTL (or a custom one).
    pub fn set(&self, key: impl Into<String>, value: T, ttl_seconds: Option<i64>) {
        let key = key.into();
        let ttl = ttl_seconds.map(Duration::seconds).unwrap_or(self.default_ttl);
        let entry = CacheEntry {
            value,
            expires_at: Some(Utc::now() + ttl),
        };
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let at_capacity = inner.entries.len() == usize::from(inner.entries.cap());
        if at_capacity && !inner.entries.contains(&key) {
            inner.stats.evictions += 1;
        }
        inner.entries.put(key, entry);
    }

    /// Drop one entry. Returns `true` when it existed.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.pop(key).is_some()
    }

    /// Drop every entry whose key starts with `prefix`. Returns the count.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            inner.entries.pop(key);
        }
        keys.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().expect("cache lock poisoned").stats.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
