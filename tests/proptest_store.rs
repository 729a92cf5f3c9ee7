//! Property-based tests for the cache store and key helpers.
//!
//! # Properties Tested
//!
//! 1. **Sweep Property**: after `sweep_expired_at(now)` exactly the entries with `age < ttl` remain
//! 2. **Idempotence Property**: a second sweep at the same instant removes nothing
//! 3. **Freshness Property**: `is_fresh_at` agrees with the sweep
//! 4. **Key Property**: parameter order never changes a built key
//! 5. **Key Uniqueness Property**: distinct parameter lists never build the same key

use fetch_kit::{CacheStore, KeyBuilder};
use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::time::Duration;
use tokio::time::Instant;

fn populate(entries: &HashMap<String, u64>) -> CacheStore<u64> {
    let store = CacheStore::new();
    for (key, ttl_ms) in entries {
        store.set(key, *ttl_ms, Duration::from_millis(*ttl_ms));
    }
    store
}

proptest! {
    #[test]
    fn prop_sweep_keeps_exactly_fresh_entries(
        entries in prop::collection::hash_map("[a-z_]{1,12}", 1u64..10_000, 0..64),
        elapsed_ms in 0u64..12_000,
    ) {
        let store = populate(&entries);
        let now = Instant::now() + Duration::from_millis(elapsed_ms);

        let expected_expired = entries.values().filter(|ttl| **ttl <= elapsed_ms).count();
        let removed = store.sweep_expired_at(now);

        prop_assert_eq!(removed, expected_expired);
        prop_assert_eq!(store.len(), entries.len() - expected_expired);
        for key in store.keys() {
            let ttl = entries[&key];
            prop_assert!(ttl > elapsed_ms, "{} (ttl {}) survived past {}", key, ttl, elapsed_ms);
        }
    }

    #[test]
    fn prop_sweep_is_idempotent(
        entries in prop::collection::hash_map("[a-z_]{1,12}", 1u64..10_000, 0..64),
        elapsed_ms in 0u64..12_000,
    ) {
        let store = populate(&entries);
        let now = Instant::now() + Duration::from_millis(elapsed_ms);

        store.sweep_expired_at(now);
        prop_assert_eq!(store.sweep_expired_at(now), 0);
    }

    #[test]
    fn prop_freshness_agrees_with_sweep(
        ttl_ms in 1u64..10_000,
        elapsed_ms in 0u64..12_000,
    ) {
        let store: CacheStore<u64> = CacheStore::new();
        store.set("key", 1, Duration::from_millis(ttl_ms));
        let entry = store.get("key").expect("entry was just stored");
        let now = entry.created_at + Duration::from_millis(elapsed_ms);

        let fresh = entry.is_fresh_at(now);
        prop_assert_eq!(fresh, elapsed_ms < ttl_ms);
        prop_assert_eq!(store.sweep_expired_at(now), usize::from(!fresh));
    }

    #[test]
    fn prop_stats_count_every_entry(
        entries in prop::collection::hash_map("[a-z_]{1,12}", 1u64..10_000, 0..64),
    ) {
        let store = populate(&entries);
        let stats = store.stats();

        let key_bytes: usize = entries.keys().map(|k| k.len()).sum();
        prop_assert_eq!(stats.total_entries, entries.len());
        prop_assert!(stats.approx_size_bytes >= key_bytes);
    }

    #[test]
    fn prop_param_order_is_irrelevant(
        params in prop::collection::btree_map("[a-z]{1,6}", 0u32..1000, 0..8),
    ) {
        let forward: Vec<(&str, &dyn Display)> = params
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn Display))
            .collect();
        let mut reversed = forward.clone();
        reversed.reverse();

        prop_assert_eq!(
            KeyBuilder::build_with_params("presets", &forward),
            KeyBuilder::build_with_params("presets", &reversed)
        );
    }

    #[test]
    fn prop_distinct_params_build_distinct_keys(
        left in prop::collection::btree_map("[a-z&=?% ]{1,4}", "[a-z0-9&=?% ]{0,6}", 0..4),
        right in prop::collection::btree_map("[a-z&=?% ]{1,4}", "[a-z0-9&=?% ]{0,6}", 0..4),
    ) {
        prop_assume!(left != right);
        let key = |params: &BTreeMap<String, String>| -> String {
            let params: Vec<(&str, &dyn Display)> = params
                .iter()
                .map(|(name, value)| (name.as_str(), value as &dyn Display))
                .collect();
            KeyBuilder::build_with_params("presets", &params)
        };

        prop_assert_ne!(key(&left), key(&right));
    }
}
