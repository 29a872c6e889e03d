//! Key/value persistence capability.
//!
//! The response cache can mirror its entries into any [`KeyValueStore`] so
//! cached results survive an orchestrator restart. Values are opaque strings
//! (the cache stores JSON). Implementations must be safe to share across
//! threads; the cache calls them while holding no locks of its own.

use std::collections::HashMap;
use std::sync::Mutex;

/// Minimal string key/value store.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Option<String>;

    /// Insert or overwrite a value.
    fn set(&self, key: &str, value: String);

    /// Remove a value. Missing keys are ignored.
    fn delete(&self, key: &str);
}

/// Process-local store backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.lock().insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) {
        self.lock().remove(key);
    }
}
