//! Response caching keyed by request fingerprint.
//!
//! Repeated identical requests are served from memory instead of paying for a
//! second provider call.
//!
//! ## Behaviour
//!
//! - **LRU bound**: once `max_entries` is exceeded the least-recently-used entry
//!   is evicted. Both `get` and `put` refresh recency.
//! - **TTL**: every entry carries an absolute `expires_at`. Expired entries are
//!   removed lazily on the next lookup and reported as a miss.
//! - **Write-through**: with a [`KeyValueStore`] attached, entries are mirrored
//!   as JSON and an in-memory miss falls back to the store.
//!
//! A single mutex guards the LRU list and the counters. Lookups are short and
//! never await, so the cache is usable from sync and async code alike.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::storage::KeyValueStore;
use crate::traits::GenerationResult;

/// Prefix for keys written to a [`KeyValueStore`].
const STORE_KEY_PREFIX: &str = "edgequake:cache:";

/// Configuration for the response cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of entries kept in memory.
    pub max_entries: usize,
    /// TTL applied when the caller does not choose one.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with specified max entries.
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            ..Default::default()
        }
    }

    /// Set the default TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// A cached result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Fingerprint the entry is stored under.
    pub fingerprint: String,
    /// The successful result as originally produced.
    pub result: GenerationResult,
    /// Absolute expiry time.
    pub expires_at: SystemTime,
}

impl CacheEntry {
    fn new(fingerprint: &str, result: GenerationResult, ttl: Duration) -> Self {
        let now = SystemTime::now();
        // Overflowing TTLs mean "never" in practice.
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 3600));
        Self {
            fingerprint: fingerprint.to_string(),
            result,
            expires_at,
        }
    }

    /// Whether the entry has passed its expiry time.
    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    /// Lookups that returned a result.
    pub hits: u64,
    /// Lookups that returned nothing (including expired entries).
    pub misses: u64,
    /// Entries dropped to honour the size bound.
    pub evictions: u64,
    /// Entries dropped because their TTL passed.
    pub expirations: u64,
    /// Current number of in-memory entries.
    pub entries: usize,
}

impl CacheStats {
    /// Get the cache hit rate.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheInner {
    entries: LruCache<String, CacheEntry>,
    stats: CacheStats,
}

impl CacheInner {
    /// Insert and account for an eviction. Returns the evicted fingerprint.
    fn insert(&mut self, entry: CacheEntry) -> Option<String> {
        let fingerprint = entry.fingerprint.clone();
        match self.entries.push(fingerprint.clone(), entry) {
            Some((evicted, _)) if evicted != fingerprint => {
                self.stats.evictions += 1;
                Some(evicted)
            }
            _ => None,
        }
    }
}

/// Bounded, TTL-expiring result cache.
pub struct ResponseCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ResponseCache {
    /// Create an in-memory cache.
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
            store: None,
        }
    }

    /// Mirror entries into a persistent store.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// TTL used by [`ResponseCache::put_default`].
    pub fn default_ttl(&self) -> Duration {
        self.config.ttl
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn store_key(fingerprint: &str) -> String {
        format!("{}{}", STORE_KEY_PREFIX, fingerprint)
    }

    /// Look up a result. Refreshes recency and drops the entry if expired.
    pub fn get(&self, fingerprint: &str) -> Option<GenerationResult> {
        let mut inner = self.lock();
        let lookup = inner.entries.get(fingerprint).map(|entry| {
            if entry.is_expired() {
                None
            } else {
                Some(entry.result.clone())
            }
        });

        match lookup {
            Some(Some(result)) => {
                inner.stats.hits += 1;
                return Some(result);
            }
            Some(None) => {
                inner.entries.pop(fingerprint);
                inner.stats.expirations += 1;
                inner.stats.misses += 1;
                drop(inner);
                debug!(fingerprint = %short(fingerprint), "Cache entry expired");
                if let Some(store) = &self.store {
                    store.delete(&Self::store_key(fingerprint));
                }
                return None;
            }
            None => drop(inner),
        }

        if let Some(entry) = self.read_through(fingerprint) {
            let result = entry.result.clone();
            let mut inner = self.lock();
            inner.stats.hits += 1;
            let evicted = inner.insert(entry);
            drop(inner);
            self.forget_in_store(evicted);
            return Some(result);
        }

        self.lock().stats.misses += 1;
        None
    }

    /// Store a result, overwriting any entry with the same fingerprint.
    pub fn put(&self, fingerprint: &str, result: GenerationResult, ttl: Duration) {
        let entry = CacheEntry::new(fingerprint, result, ttl);
        let serialized = self.store.as_ref().map(|_| serde_json::to_string(&entry));

        let evicted = self.lock().insert(entry);
        if let Some(key) = &evicted {
            debug!(fingerprint = %short(key), "Evicted least-recently-used cache entry");
        }
        self.forget_in_store(evicted);

        if let (Some(store), Some(serialized)) = (&self.store, serialized) {
            match serialized {
                Ok(json) => store.set(&Self::store_key(fingerprint), json),
                Err(e) => warn!(error = %e, "Failed to serialize cache entry"),
            }
        }
    }

    /// Store a result with the configured default TTL.
    pub fn put_default(&self, fingerprint: &str, result: GenerationResult) {
        self.put(fingerprint, result, self.config.ttl);
    }

    /// Remove one entry. Returns whether it was present in memory.
    pub fn remove(&self, fingerprint: &str) -> bool {
        let removed = self.lock().entries.pop(fingerprint).is_some();
        if let Some(store) = &self.store {
            store.delete(&Self::store_key(fingerprint));
        }
        removed
    }

    /// Whether a live entry exists, without touching recency or stats.
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.lock()
            .entries
            .peek(fingerprint)
            .map(|e| !e.is_expired())
            .unwrap_or(false)
    }

    /// Drop every entry, including mirrored ones.
    pub fn clear(&self) {
        let keys: Vec<String> = {
            let mut inner = self.lock();
            let keys = inner.entries.iter().map(|(k, _)| k.clone()).collect();
            inner.entries.clear();
            keys
        };
        if let Some(store) = &self.store {
            for key in keys {
                store.delete(&Self::store_key(&key));
            }
        }
    }

    /// Number of in-memory entries (expired ones included until looked up).
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }

    fn read_through(&self, fingerprint: &str) -> Option<CacheEntry> {
        let store = self.store.as_ref()?;
        let key = Self::store_key(fingerprint);
        let raw = store.get(&key)?;
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) if entry.fingerprint == fingerprint && !entry.is_expired() => {
                debug!(fingerprint = %short(fingerprint), "Cache entry restored from store");
                Some(entry)
            }
            Ok(_) => {
                store.delete(&key);
                None
            }
            Err(e) => {
                warn!(error = %e, "Discarding unreadable cache entry");
                store.delete(&key);
                None
            }
        }
    }

    fn forget_in_store(&self, evicted: Option<String>) {
        if let (Some(store), Some(key)) = (&self.store, evicted) {
            store.delete(&Self::store_key(&key));
        }
    }
}

/// Shortened fingerprint for log output.
fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}
