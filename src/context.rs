//! Process-scoped fetch context.
//!
//! A [`FetchContext`] owns the shared pieces every coordinator for one value
//! type works against: the cache store, the generation counters, the
//! deduplicator and the scheduler. It replaces a hidden process-wide cache
//! map with an explicit value that tests can create in isolation.
//!
//! # Example
//!
//! ```ignore
//! use fetch_kit::{CacheManager, FetchContext, FetchCoordinator, FetchOptions};
//!
//! let context: FetchContext<PresetConfig> = FetchContext::init();
//! let manager = CacheManager::new();
//! manager.register("preset_config", context.clone());
//!
//! let coordinator = FetchCoordinator::new(
//!     "preset_config_1",
//!     move || repo.load_preset(1),
//!     FetchOptions::default(),
//!     &context,
//! )?;
//!
//! // shutdown
//! context.dispose();
//! ```

use crate::dedup::{Deduplicator, Joined};
use crate::generation::Generations;
use crate::observability::{FetchMetrics, LogMetrics};
use crate::scheduler::Scheduler;
use crate::store::{CacheStore, StoreStats};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

struct ContextInner<T> {
    store: CacheStore<T>,
    generations: Generations,
    dedup: Deduplicator<T>,
    scheduler: Scheduler<Option<Joined<T>>>,
    metrics: Arc<dyn FetchMetrics>,
    disposed: AtomicBool,
}

/// Shared state for every coordinator of one value type.
///
/// Cloning is cheap (`Arc` increment) and clones share everything.
pub struct FetchContext<T> {
    inner: Arc<ContextInner<T>>,
}

impl<T> Clone for FetchContext<T> {
    fn clone(&self) -> Self {
        FetchContext {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> FetchContext<T> {
    /// Create a context that logs coordinator events through `log`.
    pub fn init() -> Self {
        Self::with_metrics(Arc::new(LogMetrics))
    }

    /// Create a context with a custom metrics handler.
    pub fn with_metrics(metrics: Arc<dyn FetchMetrics>) -> Self {
        let generations = Generations::new();
        FetchContext {
            inner: Arc::new(ContextInner {
                store: CacheStore::new(),
                dedup: Deduplicator::new(generations.clone()),
                generations,
                scheduler: Scheduler::new(),
                metrics,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn store(&self) -> &CacheStore<T> {
        &self.inner.store
    }

    pub fn generations(&self) -> &Generations {
        &self.inner.generations
    }

    pub fn dedup(&self) -> &Deduplicator<T> {
        &self.inner.dedup
    }

    pub fn scheduler(&self) -> &Scheduler<Option<Joined<T>>> {
        &self.inner.scheduler
    }

    pub fn metrics(&self) -> &dyn FetchMetrics {
        self.inner.metrics.as_ref()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Tear the context down.
    ///
    /// Cancels every in-flight operation and queued call, then empties the
    /// store. Coordinators bound to a disposed context stay inert.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.dedup.cancel_all();
        self.inner.scheduler.clear();
        self.inner.store.clear();
        self.inner.generations.reset();
        info!("✓ Fetch context disposed");
    }

    /// Sweep expired entries, then drop per-key bookkeeping of keys that
    /// are idle at `now`. Returns the number of expired entries removed.
    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let expired = self.inner.store.sweep_expired_at(now);
        self.prune_idle(now);
        expired
    }

    /// Drop generation counters and scheduling state of keys with nothing
    /// in flight, nothing queued and no stored entry. Returns the number of
    /// bookkeeping entries dropped.
    pub fn prune_idle(&self, now: Instant) -> usize {
        let store = &self.inner.store;
        let scheduled = self.inner.scheduler.prune_idle(now);
        let counters = self
            .inner
            .dedup
            .prune_idle(|key| store.get(key).is_some());
        debug!(
            "Fetch context pruned {} scheduler states and {} generation counters",
            scheduled, counters
        );
        scheduled + counters
    }
}

impl<T: Clone + Serialize + Send + Sync + 'static> FetchContext<T> {
    /// Store statistics plus the number of operations in flight.
    pub fn stats(&self) -> ContextStats {
        ContextStats {
            store: self.inner.store.stats(),
            in_flight: self.inner.dedup.in_flight(),
            scheduled: self.inner.scheduler.pending(),
            tracked_keys: self.inner.generations.len().max(self.inner.scheduler.tracked()),
        }
    }
}

/// Snapshot of a context's shared state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ContextStats {
    pub store: StoreStats,
    pub in_flight: usize,
    pub scheduled: usize,
    /// Per-key bookkeeping entries: the larger of the generation counters
    /// and the scheduling states held.
    pub tracked_keys: usize,
}
