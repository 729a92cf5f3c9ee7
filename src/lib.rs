//! # fetch-kit
//!
//! Cached, deduplicated, retried data fetching for async Rust.
//!
//! ## Features
//!
//! - **Freshness cache:** values are stored per request key with a TTL and served without calling the backend while fresh
//! - **Request deduplication:** concurrent callers for one key share a single in-flight operation and see the same outcome
//! - **Generation ordering:** a late response from an older operation never overwrites newer data
//! - **Retry with backoff:** transient failures are retried with exponential backoff; permanent ones surface at once
//! - **Debounce / throttle:** bursts of calls per key collapse into one
//! - **Cancellation:** a cancelled coordinator leaves no trace in shared state
//!
//! ## Quick Start
//!
//! ```ignore
//! use fetch_kit::{FetchContext, FetchCoordinator, FetchOptions};
//! use std::time::Duration;
//!
//! #[derive(Clone, serde::Serialize)]
//! struct PresetConfig {
//!     id: u64,
//!     name: String,
//! }
//!
//! // 1. One context per value type, created at startup
//! let context: FetchContext<PresetConfig> = FetchContext::init();
//!
//! // 2. One coordinator per request key
//! let presets = FetchCoordinator::new(
//!     "preset_config_1",
//!     move || repository.load_preset(1),
//!     FetchOptions::default().with_cache_time(Duration::from_secs(600)),
//!     &context,
//! )?;
//!
//! // 3. Resolve: cache hit, joined in-flight call, or a new call
//! let state = presets.request().await;
//! if let Some(config) = state.data {
//!     println!("{} (cached: {})", config.name, state.from_cache);
//! }
//!
//! // 4. Control
//! presets.mutate(updated);      // optimistic local write
//! presets.invalidate();         // next request calls the backend
//! presets.refetch().await;      // bypass the cache now
//! presets.cancel();             // teardown; never publishes again
//! ```
//!
//! ## Administration
//!
//! [`CacheManager`] runs clears, pattern clears, expiry sweeps and stats
//! across every registered store, and owns the periodic cleanup task.

#[macro_use]
extern crate log;

pub mod context;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod generation;
pub mod key;
pub mod lifecycle;
pub mod manager;
pub mod observability;
pub mod options;
pub mod retry;
pub mod scheduler;
pub mod store;

// Re-exports for convenience
pub use context::FetchContext;
pub use coordinator::{FetchCoordinator, FetchPhase, FetchState};
pub use error::{Error, Result};
pub use key::KeyBuilder;
pub use lifecycle::{LifecycleEvent, LifecycleSignals};
pub use manager::{CacheManager, CleanupReport, ManagerStats};
pub use options::{FetchOptions, ManagerConfig};
pub use store::{CacheEntry, CacheStore, StoreStats};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
