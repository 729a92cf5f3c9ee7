//! Per-key generation counters.
//!
//! A generation identifies one underlying operation for a key. Whoever
//! writes shared state for a key first checks, while holding the key's
//! counter entry, that its generation is still the latest one.
//!
//! Generation numbers are drawn from one sequence shared by every key, so a
//! key whose entry was forgotten never reissues a number an older operation
//! still holds.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Latest generation per request key.
#[derive(Clone, Default)]
pub struct Generations {
    counters: Arc<DashMap<String, u64>>,
    sequence: Arc<AtomicU64>,
}

impl Generations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest generation for `key`; 0 when nothing has started yet.
    pub fn current(&self, key: &str) -> u64 {
        self.counters.get(key).map(|g| *g).unwrap_or(0)
    }

    /// Start a new generation and return it.
    pub fn bump(&self, key: &str) -> u64 {
        let mut counter = self.counters.entry(key.to_string()).or_insert(0);
        *counter = self.next();
        *counter
    }

    fn next(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn is_current(&self, key: &str, generation: u64) -> bool {
        self.current(key) == generation
    }

    /// Run `write` only if `generation` is still the latest for `key`.
    ///
    /// The counter entry stays locked for the duration of `write`, so a
    /// concurrent [`bump`](Self::bump) cannot interleave between the check
    /// and the write.
    pub fn write_if_current<F>(&self, key: &str, generation: u64, write: F) -> bool
    where
        F: FnOnce(),
    {
        self.with_lock(key, |current| {
            if current != generation {
                return false;
            }
            write();
            true
        })
    }

    /// Run `f` with the current generation while holding the key's entry.
    ///
    /// A key without an entry runs `f` with 0, which matches no operation.
    pub fn with_lock<F, R>(&self, key: &str, f: F) -> R
    where
        F: FnOnce(u64) -> R,
    {
        match self.counters.get_mut(key) {
            Some(counter) => f(*counter),
            None => f(0),
        }
    }

    /// Start a new generation and run `write` under it, atomically.
    pub fn bump_and_write<F>(&self, key: &str, write: F) -> u64
    where
        F: FnOnce(),
    {
        let mut counter = self.counters.entry(key.to_string()).or_insert(0);
        *counter = self.next();
        write();
        *counter
    }

    /// Keys that currently have a counter entry.
    pub fn keys(&self) -> Vec<String> {
        self.counters.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Forget the entry for `key` if `idle` holds while the entry is locked.
    /// Every generation issued for the key so far becomes stale.
    pub fn forget_if<F>(&self, key: &str, idle: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        self.counters.remove_if(key, |_, _| idle()).is_some()
    }

    /// Forget every entry. Operations still running can no longer write.
    pub fn reset(&self) {
        self.counters.clear();
    }
}
