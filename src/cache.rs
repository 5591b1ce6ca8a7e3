//! TTL cache for idempotent call results.
//!
//! Expiry is lazy: an expired entry is evicted by the `get` that finds it,
//! no background sweep required. The cache is bounded; inserting into a full
//! cache evicts the oldest entry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

/// Tuning knobs for a cache instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied when `set` is called without an explicit one.
    pub default_ttl: Duration,
    /// Maximum number of live entries.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            max_entries: 100,
        }
    }
}

struct CacheEntry {
    value: Value,
    expires_at: Instant,
    inserted_at: Instant,
}

/// Keyed store of call results with per-entry expiry. Shares key
/// normalization with the dedup registry.
pub struct ResultCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    config: CacheConfig,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Look up a live entry. An expired entry counts as a miss and is
    /// evicted on the spot.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get(key) {
            Some(entry) if Instant::now() <= entry.expires_at => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                debug!(key, "cache entry expired");
                None
            }
            None => None,
        }
    }

    /// Store a value under `key` with the given TTL (engine default when
    /// None). A full cache evicts its oldest entry first.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if entries.len() >= self.config.max_entries && !entries.contains_key(key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                debug!(key = %oldest, "evicted oldest cache entry");
            }
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: now + ttl.unwrap_or(self.config.default_ttl),
                inserted_at: now,
            },
        );
    }

    /// Rewrite a live entry in place, refreshing its TTL. Expired or absent
    /// entries are left alone; returns whether an update happened.
    pub fn update(&self, key: &str, f: impl FnOnce(Value) -> Value) -> bool {
        let Some(current) = self.get(key) else {
            return false;
        };
        self.set(key, f(current), None);
        true
    }

    /// Drop entries whose key contains `pattern`, or everything when no
    /// pattern is given. Returns the number of entries removed.
    pub fn clear(&self, pattern: Option<&str>) -> usize {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match pattern {
            None => {
                let count = entries.len();
                entries.clear();
                count
            }
            Some(pattern) => {
                let before = entries.len();
                entries.retain(|key, _| !key.contains(pattern));
                before - entries.len()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
