//! Administrative operations across cache stores.
//!
//! A [`CacheManager`] holds type-erased handles to any number of
//! [`CacheStore`]s or whole [`FetchContext`]s and runs clears, pattern
//! clears, expiry sweeps and stats over all of them. Sweeping a context also
//! drops the per-key bookkeeping of keys that went idle.
//! [`CacheManager::init`] starts a periodic sweep on the tokio runtime;
//! [`CacheManager::dispose`] stops it.
//!
//! ```ignore
//! let manager = CacheManager::new();
//! manager.register("presets", preset_context.clone());
//! manager.register("users", user_context.clone());
//! manager.init(ManagerConfig::default())?;
//!
//! // admin route
//! let removed = manager.clear_by_pattern(r"^preset_config_\d+$");
//! let stats = serde_json::to_string(&manager.stats())?;
//! ```

use crate::context::FetchContext;
use crate::error::Result;
use crate::options::ManagerConfig;
use crate::store::{CacheStore, StoreStats};
use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Type-erased view of a [`CacheStore`] or [`FetchContext`].
pub trait ManagedStore: Send + Sync {
    fn clear(&self);

    /// Remove every key `matches` accepts. Returns the count removed.
    fn remove_matching(&self, matches: &dyn Fn(&str) -> bool) -> usize;

    fn sweep_expired_at(&self, now: Instant) -> usize;

    fn stats(&self) -> StoreStats;
}

impl<T> ManagedStore for CacheStore<T>
where
    T: Clone + Serialize + Send + Sync + 'static,
{
    fn clear(&self) {
        CacheStore::clear(self);
    }

    fn remove_matching(&self, matches: &dyn Fn(&str) -> bool) -> usize {
        self.retain_keys(|key| !matches(key))
    }

    fn sweep_expired_at(&self, now: Instant) -> usize {
        CacheStore::sweep_expired_at(self, now)
    }

    fn stats(&self) -> StoreStats {
        CacheStore::stats(self)
    }
}

impl<T> ManagedStore for FetchContext<T>
where
    T: Clone + Serialize + Send + Sync + 'static,
{
    fn clear(&self) {
        self.store().clear();
    }

    fn remove_matching(&self, matches: &dyn Fn(&str) -> bool) -> usize {
        self.store().retain_keys(|key| !matches(key))
    }

    fn sweep_expired_at(&self, now: Instant) -> usize {
        FetchContext::sweep_expired_at(self, now)
    }

    fn stats(&self) -> StoreStats {
        self.store().stats()
    }
}

/// Key pattern for [`CacheManager::clear_by_pattern`].
#[derive(Clone, Debug)]
pub enum KeyPattern {
    Regex(Regex),
    Substring(String),
}

impl KeyPattern {
    /// Compile `pattern` as a regex, falling back to a plain substring
    /// match when it is not a valid one.
    pub fn compile(pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(regex) => KeyPattern::Regex(regex),
            Err(e) => {
                debug!("Pattern {:?} is not a regex ({}), matching as substring", pattern, e);
                KeyPattern::Substring(pattern.to_string())
            }
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Regex(regex) => regex.is_match(key),
            KeyPattern::Substring(needle) => key.contains(needle.as_str()),
        }
    }
}

/// Result of one expiry sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub cleaned: usize,
}

/// Aggregate statistics across every registered store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub total: usize,
    pub expired: usize,
    pub active: usize,
    pub approx_size_bytes: usize,
}

type Registry = Arc<DashMap<String, Arc<dyn ManagedStore>>>;

/// Administrative handle over registered cache stores.
pub struct CacheManager {
    stores: Registry,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl CacheManager {
    pub fn new() -> Self {
        CacheManager {
            stores: Arc::new(DashMap::new()),
            cleanup_task: Mutex::new(None),
        }
    }

    /// Put `store` under management as `name`, replacing any store
    /// registered under the same name.
    pub fn register<S>(&self, name: impl Into<String>, store: S)
    where
        S: ManagedStore + 'static,
    {
        let name = name.into();
        debug!("✓ Manager registered store {}", name);
        self.stores.insert(name, Arc::new(store));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.stores.remove(name).is_some()
    }

    pub fn store_names(&self) -> Vec<String> {
        self.stores.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Empty every registered store.
    pub fn clear(&self) {
        for store in self.stores.iter() {
            store.clear();
        }
        info!("✓ Manager cleared {} stores", self.stores.len());
    }

    /// Remove every key matching `pattern` from every store.
    ///
    /// `pattern` is compiled as a regex; if that fails it is matched as a
    /// substring. Returns the number of entries removed.
    pub fn clear_by_pattern(&self, pattern: &str) -> usize {
        let pattern = KeyPattern::compile(pattern);
        let removed: usize = self
            .stores
            .iter()
            .map(|store| store.remove_matching(&|key: &str| pattern.matches(key)))
            .sum();
        debug!("✓ Manager CLEAR {:?} removed {} entries", pattern, removed);
        removed
    }

    /// Sweep expired entries from every store.
    pub fn cleanup(&self) -> CleanupReport {
        Self::sweep(&self.stores)
    }

    fn sweep(stores: &Registry) -> CleanupReport {
        let now = Instant::now();
        let cleaned: usize = stores
            .iter()
            .map(|store| store.sweep_expired_at(now))
            .sum();
        if cleaned > 0 {
            info!("✓ Manager cleanup removed {} expired entries", cleaned);
        }
        CleanupReport { cleaned }
    }

    /// Aggregate entry counts and size across every store.
    pub fn stats(&self) -> ManagerStats {
        let mut stats = ManagerStats::default();
        for store in self.stores.iter() {
            let store_stats = store.stats();
            stats.total += store_stats.total_entries;
            stats.expired += store_stats.expired_entries;
            stats.approx_size_bytes += store_stats.approx_size_bytes;
        }
        stats.active = stats.total.saturating_sub(stats.expired);
        stats
    }

    /// Start the periodic cleanup task, replacing one already running.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if `config` does not validate.
    pub fn init(&self, config: ManagerConfig) -> Result<()> {
        config.validate()?;

        let stores = Arc::clone(&self.stores);
        let interval = config.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                Self::sweep(&stores);
            }
        });

        let mut task = self
            .cleanup_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
        info!("✓ Manager cleanup scheduled every {:?}", interval);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.cleanup_task
            .lock()
            .map(|task| task.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Stop the periodic cleanup task.
    pub fn dispose(&self) {
        let task = self
            .cleanup_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = task {
            handle.abort();
            info!("✓ Manager cleanup stopped");
        }
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn populated() -> (CacheManager, CacheStore<String>, CacheStore<u32>) {
        let presets: CacheStore<String> = CacheStore::new();
        let counters: CacheStore<u32> = CacheStore::new();
        presets.set("preset_config_1", "v1".into(), Duration::from_secs(600));
        presets.set("preset_config_2", "v2".into(), Duration::from_secs(600));
        presets.set("user_1", "alice".into(), Duration::from_secs(10));
        counters.set("count:a", 1, Duration::from_secs(10));

        let manager = CacheManager::new();
        manager.register("presets", presets.clone());
        manager.register("counters", counters.clone());
        (manager, presets, counters)
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_empties_every_store() {
        let (manager, presets, counters) = populated();

        manager.clear();

        assert!(presets.is_empty());
        assert!(counters.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_by_regex_pattern() {
        let (manager, presets, counters) = populated();

        let removed = manager.clear_by_pattern(r"^preset_config_\d+$");

        assert_eq!(removed, 2);
        assert_eq!(presets.keys(), vec!["user_1".to_string()]);
        assert_eq!(counters.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_regex_falls_back_to_substring() {
        let presets: CacheStore<u32> = CacheStore::new();
        presets.set("weird(key", 1, Duration::from_secs(10));
        presets.set("plain", 2, Duration::from_secs(10));
        let manager = CacheManager::new();
        manager.register("presets", presets.clone());

        assert!(matches!(KeyPattern::compile("weird("), KeyPattern::Substring(_)));
        assert_eq!(manager.clear_by_pattern("weird("), 1);
        assert_eq!(presets.keys(), vec!["plain".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_and_stats() {
        let (manager, _presets, _counters) = populated();

        let stats = manager.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.expired, 0);
        assert_eq!(stats.active, 4);
        assert!(stats.approx_size_bytes > 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        let stats = manager.stats();
        assert_eq!(stats.expired, 2);
        assert_eq!(stats.active, 2);

        assert_eq!(manager.cleanup(), CleanupReport { cleaned: 2 });
        assert_eq!(manager.cleanup(), CleanupReport { cleaned: 0 });
        assert_eq!(manager.stats().total, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_cleanup_runs_until_disposed() {
        let (manager, presets, counters) = populated();
        manager
            .init(ManagerConfig::default().with_cleanup_interval(Duration::from_secs(30)))
            .expect("Failed to start cleanup");
        assert!(manager.is_running());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(presets.len(), 2);
        assert!(counters.is_empty());

        manager.dispose();
        assert!(!manager.is_running());

        presets.set("short", "x".into(), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(presets.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_serialize_for_admin_routes() {
        let (manager, _presets, _counters) = populated();

        let json = serde_json::to_value(manager.stats()).expect("Failed to serialize");
        assert_eq!(json["total"], 4);
        assert_eq!(json["active"], 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_prunes_registered_context_bookkeeping() {
        let context: FetchContext<u32> = FetchContext::init();
        let manager = CacheManager::new();
        manager.register("counters", context.clone());

        for id in 0..100u32 {
            let key = format!("count:{}", id);
            context
                .dedup()
                .join_or_start(&key, |_, _| async move { Ok(id) })
                .wait()
                .await
                .expect("operation should succeed");
            context.store().set(&key, id, Duration::from_millis(10));
        }
        assert_eq!(context.stats().tracked_keys, 100);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(manager.cleanup(), CleanupReport { cleaned: 100 });
        assert_eq!(context.stats().tracked_keys, 0);
    }

    #[test]
    fn test_unregister() {
        let manager = CacheManager::new();
        manager.register("a", CacheStore::<u32>::new());
        assert_eq!(manager.store_names(), vec!["a".to_string()]);
        assert!(manager.unregister("a"));
        assert!(!manager.unregister("a"));
    }
}
