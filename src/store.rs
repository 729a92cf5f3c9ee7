//! In-memory cache store (thread-safe, no I/O).
//!
//! Uses DashMap for concurrent access with per-key sharding.
//! Entries carry their own TTL; stale entries stay stored until swept
//! but are never reported as fresh.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A cached value with its creation time and time-to-live.
#[derive(Clone, Debug)]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        CacheEntry {
            value,
            created_at: Instant::now(),
            ttl,
        }
    }

    /// Age of the entry at `now`.
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Fresh iff `now - created_at < ttl`.
    pub fn is_fresh_at(&self, now: Instant) -> bool {
        self.age_at(now) < self.ttl
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Instant::now())
    }

    /// Remaining lifetime, zero once expired.
    pub fn ttl_remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.age_at(Instant::now()))
    }
}

/// Thread-safe keyed store of [`CacheEntry`] values.
///
/// Cloning is cheap and clones share the same map.
///
/// # Example
///
/// ```no_run
/// use fetch_kit::store::CacheStore;
/// use std::time::Duration;
///
/// let store: CacheStore<String> = CacheStore::new();
/// store.set("preset_config_1", "v1".to_string(), Duration::from_secs(600));
/// assert!(store.get_fresh("preset_config_1").is_some());
/// ```
#[derive(Clone)]
pub struct CacheStore<T> {
    entries: Arc<DashMap<String, CacheEntry<T>>>,
}

impl<T: Clone> CacheStore<T> {
    pub fn new() -> Self {
        CacheStore {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Stored entry for `key`, fresh or not.
    pub fn get(&self, key: &str) -> Option<CacheEntry<T>> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Stored entry for `key` only if it is still fresh.
    pub fn get_fresh(&self, key: &str) -> Option<CacheEntry<T>> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_fresh_at(now) {
            debug!("✓ Store GET {} -> HIT", key);
            Some(entry.clone())
        } else {
            debug!("✓ Store GET {} -> STALE", key);
            None
        }
    }

    /// Overwrite the entry for `key`; `created_at` becomes now.
    pub fn set(&self, key: &str, value: T, ttl: Duration) {
        self.entries
            .insert(key.to_string(), CacheEntry::new(value, ttl));
        debug!("✓ Store SET {} (TTL: {:?})", key, ttl);
    }

    /// Remove `key`. Returns whether an entry was present.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            debug!("✓ Store DELETE {}", key);
        }
        removed
    }

    /// Remove every entry that is expired at the current instant.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    /// Remove every entry where `now - created_at >= ttl`.
    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh_at(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Store sweep removed {} expired entries", removed);
        }
        removed
    }

    /// Keep only the keys for which `keep` returns true. Returns the count removed.
    pub fn retain_keys<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|key, _| keep(key));
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone + Serialize> CacheStore<T> {
    /// Entry counts and an approximate memory footprint.
    ///
    /// The size of a value is its JSON-encoded length; values that fail to
    /// encode count as zero.
    pub fn stats(&self) -> StoreStats {
        let now = Instant::now();
        let mut stats = StoreStats::default();
        for entry in self.entries.iter() {
            stats.total_entries += 1;
            if !entry.is_fresh_at(now) {
                stats.expired_entries += 1;
            }
            let value_bytes = serde_json::to_vec(&entry.value)
                .map(|bytes| bytes.len())
                .unwrap_or(0);
            stats.approx_size_bytes += entry.key().len() + value_bytes;
        }
        stats
    }

    /// Print store statistics to debug log.
    pub fn log_stats(&self) {
        let stats = self.stats();
        debug!(
            "Store Stats: {} entries ({} expired), ~{} bytes",
            stats.total_entries, stats.expired_entries, stats.approx_size_bytes
        );
    }
}

impl<T: Clone> Default for CacheStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub approx_size_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_store_set_get() {
        let store = CacheStore::new();
        store.set("key1", "value1".to_string(), Duration::from_secs(60));

        let entry = store.get_fresh("key1").expect("entry should be fresh");
        assert_eq!(entry.value, "value1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_miss() {
        let store: CacheStore<String> = CacheStore::new();
        assert!(store.get("nonexistent").is_none());
        assert!(store.get_fresh("nonexistent").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_delete() {
        let store = CacheStore::new();
        store.set("key1", 1u32, Duration::from_secs(60));

        assert!(store.delete("key1"));
        assert!(!store.delete("key1"));
        assert!(store.get("key1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_freshness_boundary() {
        let store = CacheStore::new();
        store.set("key1", 1u32, Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(store.get_fresh("key1").is_some());

        // age == ttl is no longer fresh
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(store.get_fresh("key1").is_none());
        // but the entry is still stored until swept
        assert!(store.get("key1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_set_overwrites_and_resets_age() {
        let store = CacheStore::new();
        store.set("key1", 1u32, Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(80)).await;

        store.set("key1", 2u32, Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(80)).await;

        let entry = store.get_fresh("key1").expect("overwritten entry is fresh");
        assert_eq!(entry.value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_sweep_expired() {
        let store = CacheStore::new();
        store.set("short", 1u32, Duration::from_millis(50));
        store.set("long", 2u32, Duration::from_secs(60));

        tokio::time::advance(Duration::from_millis(60)).await;

        assert_eq!(store.sweep_expired(), 1);
        // idempotent
        assert_eq!(store.sweep_expired(), 0);
        assert_eq!(store.keys(), vec!["long".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_stats() {
        let store = CacheStore::new();
        store.set("a", "value_with_data".to_string(), Duration::from_millis(10));
        store.set("b", "data".to_string(), Duration::from_secs(60));

        tokio::time::advance(Duration::from_millis(20)).await;

        let stats = store.stats();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.expired_entries, 1);
        // "a" + "\"value_with_data\"" + "b" + "\"data\""
        assert_eq!(stats.approx_size_bytes, 1 + 17 + 1 + 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_retain_keys() {
        let store = CacheStore::new();
        store.set("user:1", 1u32, Duration::from_secs(60));
        store.set("user:2", 2u32, Duration::from_secs(60));
        store.set("order:1", 3u32, Duration::from_secs(60));

        let removed = store.retain_keys(|key| !key.starts_with("user:"));
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_store_clone_shares_entries() {
        let store1 = CacheStore::new();
        let store2 = store1.clone();

        store1.set("key", 7u32, Duration::from_secs(60));
        assert_eq!(store2.get("key").map(|e| e.value), Some(7));
    }

    #[tokio::test]
    async fn test_store_thread_safe() {
        let store = CacheStore::new();
        let mut handles = vec![];

        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.set(&format!("key_{}", i), i, Duration::from_secs(60));
            }));
        }

        for handle in handles {
            handle.await.expect("Task failed");
        }

        assert_eq!(store.len(), 10);
    }
}
