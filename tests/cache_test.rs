//! Tests for the TTL result cache.

use std::thread::sleep;
use std::time::Duration;

use fetchq::cache::{CacheConfig, ResultCache};
use serde_json::json;

fn test_cache() -> ResultCache {
    ResultCache::new(CacheConfig::default())
}

// ---------------------------------------------------------------------------
// Lazy expiry
// ---------------------------------------------------------------------------

#[test]
fn hit_before_expiry_miss_after() {
    let cache = test_cache();
    cache.set("GET:/users", json!({"id": 1}), Some(Duration::from_millis(50)));

    assert_eq!(cache.get("GET:/users"), Some(json!({"id": 1})));

    sleep(Duration::from_millis(60));
    assert_eq!(cache.get("GET:/users"), None);
    // The expired entry was evicted by the lookup itself.
    assert!(cache.is_empty());
}

#[test]
fn default_ttl_applies_when_unspecified() {
    let cache = test_cache();
    cache.set("GET:/users", json!("value"), None);
    assert_eq!(cache.get("GET:/users"), Some(json!("value")));
}

#[test]
fn missing_key_is_a_miss() {
    let cache = test_cache();
    assert_eq!(cache.get("GET:/absent"), None);
}

// ---------------------------------------------------------------------------
// Invalidation
// ---------------------------------------------------------------------------

#[test]
fn clear_without_pattern_drops_everything() {
    let cache = test_cache();
    cache.set("GET:/users", json!(1), None);
    cache.set("GET:/books", json!(2), None);

    assert_eq!(cache.clear(None), 2);
    assert!(cache.is_empty());
}

#[test]
fn clear_with_pattern_drops_matching_keys_only() {
    let cache = test_cache();
    cache.set("GET:/users/1", json!(1), None);
    cache.set("GET:/users/2", json!(2), None);
    cache.set("GET:/books", json!(3), None);

    assert_eq!(cache.clear(Some("/users")), 2);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get("GET:/books"), Some(json!(3)));
}

// ---------------------------------------------------------------------------
// Bounds and updates
// ---------------------------------------------------------------------------

#[test]
fn full_cache_evicts_oldest_entry() {
    let cache = ResultCache::new(CacheConfig {
        max_entries: 2,
        ..CacheConfig::default()
    });

    cache.set("a", json!(1), None);
    sleep(Duration::from_millis(5));
    cache.set("b", json!(2), None);
    sleep(Duration::from_millis(5));
    cache.set("c", json!(3), None);

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get("a"), None);
    assert_eq!(cache.get("c"), Some(json!(3)));
}

#[test]
fn overwriting_existing_key_does_not_evict() {
    let cache = ResultCache::new(CacheConfig {
        max_entries: 2,
        ..CacheConfig::default()
    });

    cache.set("a", json!(1), None);
    cache.set("b", json!(2), None);
    cache.set("a", json!(10), None);

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get("a"), Some(json!(10)));
    assert_eq!(cache.get("b"), Some(json!(2)));
}

#[test]
fn update_rewrites_live_entry() {
    let cache = test_cache();
    cache.set("GET:/users", json!({"count": 1}), None);

    let updated = cache.update("GET:/users", |_| json!({"count": 2}));
    assert!(updated);
    assert_eq!(cache.get("GET:/users"), Some(json!({"count": 2})));
}

#[test]
fn update_skips_absent_or_expired_entries() {
    let cache = test_cache();
    assert!(!cache.update("GET:/absent", |v| v));

    cache.set("GET:/stale", json!(1), Some(Duration::from_millis(20)));
    sleep(Duration::from_millis(30));
    assert!(!cache.update("GET:/stale", |v| v));
}
