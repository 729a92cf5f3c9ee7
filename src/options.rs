//! Options for coordinators and the cache manager.
//!
//! Both are plain builder structs:
//!
//! ```
//! use fetch_kit::options::FetchOptions;
//! use std::time::Duration;
//!
//! let options = FetchOptions::default()
//!     .with_cache_time(Duration::from_secs(600))
//!     .with_retries(3, Duration::from_millis(500))
//!     .with_debounce(Duration::from_millis(300));
//! assert!(options.validate().is_ok());
//! ```
//!
//! # Freshness knobs
//!
//! | Option | Effect |
//! |--------|--------|
//! | `cache_time` | TTL of a stored value; the only freshness gate |
//! | `stale_time` | when set, a value older than this (but still within `cache_time`) is served and revalidated in the background |

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::scheduler::SchedulePolicy;
use std::time::Duration;

/// Per-coordinator options.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchOptions {
    /// If false the coordinator never calls its operation.
    pub enabled: bool,

    /// Time-to-live of a successful value.
    pub cache_time: Duration,

    /// Age after which a fresh value is served but revalidated in the
    /// background. `None` disables revalidation.
    pub stale_time: Option<Duration>,

    /// Maximum attempts per operation.
    pub retries: u32,

    /// Backoff before the second attempt; doubles afterwards.
    pub retry_delay: Duration,

    /// Quiet period for last-call-wins debouncing. Zero disables.
    pub debounce: Duration,

    /// Minimum interval between runs. Zero disables.
    pub throttle: Duration,

    /// Refetch when the host reports window focus.
    pub refetch_on_focus: bool,

    /// Refetch when the host reports the network came back.
    pub refetch_on_reconnect: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            enabled: true,
            cache_time: Duration::from_secs(5 * 60),
            stale_time: None,
            retries: 3,
            retry_delay: Duration::from_secs(1),
            debounce: Duration::ZERO,
            throttle: Duration::ZERO,
            refetch_on_focus: false,
            refetch_on_reconnect: false,
        }
    }
}

impl FetchOptions {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_cache_time(mut self, ttl: Duration) -> Self {
        self.cache_time = ttl;
        self
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Set the attempt budget and the base backoff delay.
    pub fn with_retries(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_refetch_on_focus(mut self, refetch: bool) -> Self {
        self.refetch_on_focus = refetch;
        self
    }

    pub fn with_refetch_on_reconnect(mut self, refetch: bool) -> Self {
        self.refetch_on_reconnect = refetch;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, self.retry_delay)
    }

    /// # Errors
    ///
    /// Returns `Error::ConfigError` if both debounce and throttle are set.
    pub fn schedule_policy(&self) -> Result<SchedulePolicy> {
        SchedulePolicy::from_knobs(self.debounce, self.throttle)
    }

    /// # Errors
    ///
    /// Returns `Error::ConfigError` when:
    /// - both `debounce` and `throttle` are non-zero
    /// - `cache_time` is zero
    /// - `stale_time` is not shorter than `cache_time`
    pub fn validate(&self) -> Result<()> {
        self.schedule_policy()?;
        if self.cache_time.is_zero() {
            return Err(Error::ConfigError("cache_time must be non-zero".to_string()));
        }
        if let Some(stale_time) = self.stale_time {
            if stale_time >= self.cache_time {
                return Err(Error::ConfigError(format!(
                    "stale_time ({:?}) must be shorter than cache_time ({:?})",
                    stale_time, self.cache_time
                )));
            }
        }
        Ok(())
    }
}

/// Cache manager configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    /// How often the background task sweeps expired entries.
    pub cleanup_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl ManagerConfig {
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the cleanup interval is zero.
    pub fn validate(&self) -> Result<()> {
        if self.cleanup_interval.is_zero() {
            return Err(Error::ConfigError(
                "cleanup_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
