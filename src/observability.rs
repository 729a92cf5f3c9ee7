//! Observability hooks for fetch coordination.
//!
//! Implement [`FetchMetrics`] to feed coordinator events into your
//! monitoring system:
//!
//! ```ignore
//! use fetch_kit::observability::FetchMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl FetchMetrics for PrometheusMetrics {
//!     fn record_hit(&self, _key: &str) {
//!         // counter!("fetch_cache_hits").inc();
//!     }
//!     fn record_fetch(&self, _key: &str, _duration: Duration) {
//!         // histogram!("fetch_latency").record(duration);
//!     }
//! }
//!
//! // let context = FetchContext::with_metrics(Arc::new(PrometheusMetrics));
//! ```
//!
//! Every method has a default that logs through the `log` crate.
//! [`NoOpMetrics`] silences all of them.
//!
//! | Method | Fired when |
//! |--------|-----------|
//! | `record_hit` | a fresh cached value answers a request |
//! | `record_miss` | a request has to go to the operation |
//! | `record_join` | a request joins an operation already in flight |
//! | `record_fetch` | an operation result was applied |
//! | `record_discard` | a result arrived for a superseded generation |
//! | `record_error` | a request ended with a caller-visible error |

use std::time::Duration;

/// Trait for fetch metrics collection.
pub trait FetchMetrics: Send + Sync {
    fn record_hit(&self, key: &str) {
        debug!("Fetch HIT: {}", key);
    }

    fn record_miss(&self, key: &str) {
        debug!("Fetch MISS: {}", key);
    }

    fn record_join(&self, key: &str, generation: u64) {
        debug!("Fetch JOIN: {} (generation {})", key, generation);
    }

    fn record_fetch(&self, key: &str, duration: Duration) {
        debug!("Fetch APPLIED: {} took {:?}", key, duration);
    }

    fn record_discard(&self, key: &str, generation: u64) {
        debug!("Fetch DISCARD: {} (stale generation {})", key, generation);
    }

    fn record_error(&self, key: &str, error: &str) {
        warn!("Fetch ERROR for {}: {}", key, error);
    }
}

/// Metrics implementation that uses the logging defaults.
#[derive(Clone, Default)]
pub struct LogMetrics;

impl FetchMetrics for LogMetrics {}

/// Metrics implementation that records nothing.
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl FetchMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &str) {}
    fn record_miss(&self, _key: &str) {}
    fn record_join(&self, _key: &str, _generation: u64) {}
    fn record_fetch(&self, _key: &str, _duration: Duration) {}
    fn record_discard(&self, _key: &str, _generation: u64) {}
    fn record_error(&self, _key: &str, _error: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_noop_metrics() {
        let metrics = NoOpMetrics;
        metrics.record_hit("key");
        metrics.record_fetch("key", Duration::from_millis(2));
        metrics.record_error("key", "boom");
    }

    #[test]
    fn test_partial_override_keeps_defaults() {
        #[derive(Default)]
        struct HitCounter(AtomicUsize);

        impl FetchMetrics for HitCounter {
            fn record_hit(&self, _key: &str) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let metrics = HitCounter::default();
        metrics.record_hit("a");
        metrics.record_hit("b");
        metrics.record_miss("c");
        assert_eq!(metrics.0.load(Ordering::SeqCst), 2);
    }
}
