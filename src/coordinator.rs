//! Per-key fetch coordination.
//!
//! A [`FetchCoordinator`] is what a consumer holds for one request key. It
//! decides, for every call, whether to answer from the cache, join an
//! operation already in flight, or start a new one, and it keeps a caller
//! state ([`FetchState`]) that observers can read or watch.
//!
//! ```text
//! request() ──► fresh entry? ──yes──► serve (from_cache = true)
//!                   │ no                   └─ older than stale_time? revalidate in background
//!                   ▼
//!              scheduler gate (debounce / throttle)
//!                   ▼
//!              join or start the per-key operation (retry inside)
//!                   ▼
//!              generation still current? ──no──► discard, then follow the newer
//!                   │ yes                            operation or its stored value
//!                   ▼
//!              publish data / error
//! ```
//!
//! Every result is tagged with the generation of the operation that
//! produced it. Only the latest generation may write the store or the
//! caller state; anything older is dropped on arrival and its caller
//! picks up the newer result instead. After
//! [`cancel`](FetchCoordinator::cancel) the coordinator never publishes
//! again.

use crate::context::FetchContext;
use crate::dedup::{Joined, Subscription};
use crate::error::{Error, Result};
use crate::lifecycle::{LifecycleEvent, LifecycleSignals};
use crate::options::FetchOptions;
use crate::scheduler::SchedulePolicy;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use serde::{Serialize, Serializer};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The user-supplied async operation behind a key.
pub type Operation<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Where a coordinator is in its request lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
pub enum FetchPhase {
    #[default]
    Idle,
    Fetching,
    Success,
    Error,
    /// Terminal: the coordinator was cancelled and reports nothing further.
    Aborted,
}

/// Caller-visible state of one coordinator.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FetchState<T> {
    /// Last successful value. Kept when a later request fails.
    pub data: Option<T>,

    /// Error of the latest applied request, cleared by the next success.
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<Error>,

    /// True while at least one request of this coordinator is in flight.
    pub loading: bool,

    /// Whether `data` was served from the store rather than a fresh call.
    pub from_cache: bool,

    pub phase: FetchPhase,
}

impl<T> Default for FetchState<T> {
    fn default() -> Self {
        FetchState {
            data: None,
            error: None,
            loading: false,
            from_cache: false,
            phase: FetchPhase::Idle,
        }
    }
}

impl<T> FetchState<T> {
    fn resting_phase(&self) -> FetchPhase {
        if self.error.is_some() {
            FetchPhase::Error
        } else if self.data.is_some() {
            FetchPhase::Success
        } else {
            FetchPhase::Idle
        }
    }
}

fn serialize_error<S: Serializer>(
    error: &Option<Error>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.serialize_some(&error.to_string()),
        None => serializer.serialize_none(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunMode {
    /// Join whatever is in flight, else start.
    Request,
    /// Always start a new generation.
    Refetch,
    /// Background refresh of a stale-but-fresh value.
    Revalidate,
}

/// How a settled call related to the latest generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Settled {
    /// Applied, or nothing newer to follow.
    Final,
    /// A newer generation started before this one could apply.
    Superseded,
}

struct CoordinatorInner<T> {
    key: String,
    operation: Operation<T>,
    options: FetchOptions,
    policy: SchedulePolicy,
    context: FetchContext<T>,
    state: watch::Sender<FetchState<T>>,
    in_flight: AtomicUsize,
    subscriptions: DashMap<u64, Subscription<T>>,
    next_request: AtomicU64,
    teardown: CancellationToken,
}

impl<T> CoordinatorInner<T> {
    /// Apply `update` to the caller state unless the coordinator was torn
    /// down. The teardown check runs under the state lock.
    fn publish<F>(&self, update: F) -> bool
    where
        F: FnOnce(&mut FetchState<T>),
    {
        let teardown = &self.teardown;
        self.state.send_if_modified(|state| {
            if teardown.is_cancelled() {
                return false;
            }
            update(state);
            true
        })
    }
}

/// Marks the coordinator as loading for as long as it lives.
struct FlightGuard<'a, T> {
    inner: &'a CoordinatorInner<T>,
}

impl<'a, T> FlightGuard<'a, T> {
    fn begin(inner: &'a CoordinatorInner<T>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        inner.publish(|state| {
            state.loading = true;
            state.phase = FetchPhase::Fetching;
        });
        FlightGuard { inner }
    }
}

impl<T> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        let remaining = self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        self.inner.publish(|state| {
            state.loading = remaining > 0;
            if remaining == 0 && state.phase == FetchPhase::Fetching {
                state.phase = state.resting_phase();
            }
        });
    }
}

/// Coordinates fetches for one request key.
///
/// Cloning is cheap; clones share the caller state and the teardown token.
pub struct FetchCoordinator<T> {
    inner: Arc<CoordinatorInner<T>>,
}

impl<T> Clone for FetchCoordinator<T> {
    fn clone(&self) -> Self {
        FetchCoordinator {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> FetchCoordinator<T> {
    /// Create a coordinator for `key` backed by `operation`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if `options` do not validate or `key`
    /// is empty.
    pub fn new<F, Fut>(
        key: impl Into<String>,
        operation: F,
        options: FetchOptions,
        context: &FetchContext<T>,
    ) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::ConfigError("request key must not be empty".to_string()));
        }
        options.validate()?;
        let policy = options.schedule_policy()?;

        let operation: Operation<T> = Arc::new(move || operation().boxed());
        let (state, _) = watch::channel(FetchState::default());
        debug!("Coordinator {} created ({})", key, policy);

        Ok(FetchCoordinator {
            inner: Arc::new(CoordinatorInner {
                key,
                operation,
                options,
                policy,
                context: context.clone(),
                state,
                in_flight: AtomicUsize::new(0),
                subscriptions: DashMap::new(),
                next_request: AtomicU64::new(0),
                teardown: CancellationToken::new(),
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn options(&self) -> &FetchOptions {
        &self.inner.options
    }

    /// Snapshot of the caller state.
    pub fn state(&self) -> FetchState<T> {
        self.inner.state.borrow().clone()
    }

    pub fn phase(&self) -> FetchPhase {
        self.inner.state.borrow().phase
    }

    /// Watch the caller state for changes.
    pub fn subscribe(&self) -> watch::Receiver<FetchState<T>> {
        self.inner.state.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.teardown.is_cancelled()
    }

    fn is_active(&self) -> bool {
        if !self.inner.options.enabled {
            debug!("Coordinator {} is disabled", self.inner.key);
            return false;
        }
        !self.inner.teardown.is_cancelled() && !self.inner.context.is_disposed()
    }

    /// Resolve the key: fresh cache entry, in-flight operation, or a new
    /// call. Returns the caller state after this request settled.
    ///
    /// Never calls the operation when the coordinator is disabled or
    /// cancelled.
    pub async fn request(&self) -> FetchState<T> {
        if !self.is_active() {
            return self.state();
        }

        let inner = &*self.inner;
        let metrics = inner.context.metrics();
        if let Some(entry) = inner.context.store().get_fresh(&inner.key) {
            metrics.record_hit(&inner.key);
            let revalidate = inner
                .options
                .stale_time
                .is_some_and(|stale| entry.age_at(Instant::now()) >= stale);

            inner.publish(|state| {
                state.data = Some(entry.value);
                state.error = None;
                state.from_cache = true;
                if state.phase != FetchPhase::Fetching {
                    state.phase = FetchPhase::Success;
                }
            });
            if revalidate {
                self.spawn_revalidation();
            }
            return self.state();
        }

        metrics.record_miss(&inner.key);
        self.fetch(RunMode::Request).await
    }

    /// Bypass the cache and start a new generation.
    pub async fn refetch(&self) -> FetchState<T> {
        self.fetch(RunMode::Refetch).await
    }

    fn spawn_revalidation(&self) {
        debug!("Coordinator {} revalidating in background", self.inner.key);
        let this = self.clone();
        tokio::spawn(async move {
            this.fetch(RunMode::Revalidate).await;
        });
    }

    async fn fetch(&self, mode: RunMode) -> FetchState<T> {
        if !self.is_active() {
            return self.state();
        }

        let flight = FlightGuard::begin(&self.inner);
        self.run(mode).await;
        drop(flight);
        self.state()
    }

    /// Schedule, wait and settle one call. A call overtaken by a newer
    /// generation follows that generation instead of settling empty.
    async fn run(&self, mode: RunMode) {
        let inner = &*self.inner;
        let started = Instant::now();

        let Some(mut joined) = self.schedule(mode).await else {
            return;
        };
        loop {
            if joined.joined_existing() {
                inner
                    .context
                    .metrics()
                    .record_join(&inner.key, joined.generation());
            }

            let request_id = inner.next_request.fetch_add(1, Ordering::Relaxed);
            inner.subscriptions.insert(request_id, joined.subscribe());
            if inner.teardown.is_cancelled() {
                if let Some((_, subscription)) = inner.subscriptions.remove(&request_id) {
                    subscription.cancel(inner.context.generations());
                }
                return;
            }

            let result = tokio::select! {
                biased;
                _ = inner.teardown.cancelled() => Err(Error::Aborted),
                result = joined.wait() => result,
            };
            inner.subscriptions.remove(&request_id);

            if self.settle(joined.generation(), result, started) != Settled::Superseded
                || !self.is_active()
            {
                return;
            }
            match inner.context.dedup().join_current(&inner.key) {
                Some(current) => joined = current,
                None => {
                    self.adopt_stored();
                    return;
                }
            }
        }
    }

    /// Publish the stored value written by a newer generation.
    fn adopt_stored(&self) {
        let inner = &*self.inner;
        let Some(entry) = inner.context.store().get_fresh(&inner.key) else {
            return;
        };
        debug!("Coordinator {} adopting stored value of a newer generation", inner.key);
        inner.publish(|state| {
            state.data = Some(entry.value);
            state.error = None;
            state.from_cache = true;
            state.phase = FetchPhase::Success;
        });
    }

    /// Pass through the scheduler and come out holding an operation.
    async fn schedule(&self, mode: RunMode) -> Option<Joined<T>> {
        let inner = &*self.inner;
        loop {
            let gate = inner
                .context
                .scheduler()
                .gate(&inner.key, inner.policy, self.dispatch(mode));
            let gated = tokio::select! {
                biased;
                _ = inner.teardown.cancelled() => return None,
                gated = gate => gated,
            };

            match gated {
                Ok(Some(joined)) => return Some(joined),
                // the call that won the slot belonged to a cancelled coordinator
                Ok(None) if self.is_active() => {
                    debug!("Coordinator {} rescheduling after dropped slot", inner.key);
                }
                Ok(None) => return None,
                Err(error) => {
                    debug!("Coordinator {} scheduling ended: {}", inner.key, error);
                    return None;
                }
            }
        }
    }

    /// The task run when the scheduler lets this call through.
    fn dispatch(&self, mode: RunMode) -> impl FnOnce() -> Option<Joined<T>> + Send + Sync + 'static {
        let context = self.inner.context.clone();
        let key = self.inner.key.clone();
        let teardown = self.inner.teardown.clone();
        let start = self.start_fn();

        move || {
            if teardown.is_cancelled() || context.is_disposed() {
                return None;
            }
            let joined = match mode {
                RunMode::Refetch => context.dedup().start(&key, start),
                RunMode::Request | RunMode::Revalidate => context.dedup().join_or_start(&key, start),
            };
            Some(joined)
        }
    }

    /// Build the operation body: retries, then a generation-checked store
    /// write.
    fn start_fn(
        &self,
    ) -> impl FnOnce(u64, CancellationToken) -> BoxFuture<'static, Result<T>> + Send + Sync + 'static
    {
        let operation = Arc::clone(&self.inner.operation);
        let retry = self.inner.options.retry_policy();
        let ttl = self.inner.options.cache_time;
        let store = self.inner.context.store().clone();
        let generations = self.inner.context.generations().clone();
        let key = self.inner.key.clone();

        move |generation: u64, cancel: CancellationToken| -> BoxFuture<'static, Result<T>> {
            async move {
                let result = retry.execute(&cancel, || operation()).await;
                if let Ok(value) = &result {
                    let written = generations.with_lock(&key, |current| {
                        let live = current == generation && !cancel.is_cancelled();
                        if live {
                            store.set(&key, value.clone(), ttl);
                        }
                        live
                    });
                    if !written {
                        debug!(
                            "Coordinator {} skipped store write for generation {}",
                            key, generation
                        );
                    }
                }
                result
            }
            .boxed()
        }
    }

    fn settle(&self, generation: u64, result: Result<T>, started: Instant) -> Settled {
        let inner = &*self.inner;
        let key = &inner.key;
        let metrics = inner.context.metrics();
        let generations = inner.context.generations();

        match result {
            Err(Error::Aborted) => {
                debug!("Coordinator {} request aborted (generation {})", key, generation);
                if generations.is_current(key, generation) {
                    Settled::Final
                } else {
                    Settled::Superseded
                }
            }
            Ok(value) => {
                let applied = generations.write_if_current(key, generation, || {
                    inner.publish(|state| {
                        state.data = Some(value);
                        state.error = None;
                        state.from_cache = false;
                        state.phase = FetchPhase::Success;
                    });
                });
                if applied {
                    metrics.record_fetch(key, started.elapsed());
                    Settled::Final
                } else {
                    metrics.record_discard(key, generation);
                    Settled::Superseded
                }
            }
            Err(error) => {
                let message = error.to_string();
                let applied = generations.write_if_current(key, generation, || {
                    inner.publish(|state| {
                        state.error = Some(error);
                        state.phase = FetchPhase::Error;
                    });
                });
                if applied {
                    metrics.record_error(key, &message);
                    Settled::Final
                } else {
                    metrics.record_discard(key, generation);
                    Settled::Superseded
                }
            }
        }
    }

    /// Replace the value locally, without calling the operation.
    ///
    /// Starts a new generation, so any operation still in flight for the
    /// key can no longer overwrite this value; such an operation is
    /// cancelled.
    pub fn mutate(&self, value: T) {
        let inner = &*self.inner;
        if inner.teardown.is_cancelled() {
            return;
        }

        let ttl = inner.options.cache_time;
        let generation = inner.context.generations().bump_and_write(&inner.key, || {
            inner.context.store().set(&inner.key, value.clone(), ttl);
            inner.publish(|state| {
                state.data = Some(value);
                state.error = None;
                state.from_cache = false;
                state.phase = FetchPhase::Success;
            });
        });
        inner.context.dedup().cancel_stale(&inner.key);
        debug!("Coordinator {} mutated (generation {})", inner.key, generation);
    }

    /// Drop the stored entry so the next request calls the operation.
    /// The caller state keeps its data.
    pub fn invalidate(&self) -> bool {
        self.inner.context.store().delete(&self.inner.key)
    }

    /// Tear the coordinator down.
    ///
    /// Publishes a final `Aborted` state, withdraws this coordinator from
    /// every operation it waits on (cancelling operations nobody else
    /// waits on) and never publishes again.
    pub fn cancel(&self) {
        let inner = &*self.inner;
        if inner.teardown.is_cancelled() {
            return;
        }

        let teardown = &inner.teardown;
        inner.state.send_modify(|state| {
            teardown.cancel();
            state.loading = false;
            state.phase = FetchPhase::Aborted;
        });

        let request_ids: Vec<u64> = inner.subscriptions.iter().map(|entry| *entry.key()).collect();
        for request_id in request_ids {
            if let Some((_, subscription)) = inner.subscriptions.remove(&request_id) {
                subscription.cancel(inner.context.generations());
            }
        }
        debug!("Coordinator {} cancelled", inner.key);
    }

    /// React to a host lifecycle event. Returns the state after the
    /// refetch, or `None` if this coordinator ignores the event.
    pub async fn handle_lifecycle(&self, event: LifecycleEvent) -> Option<FetchState<T>> {
        let wanted = match event {
            LifecycleEvent::Focus => self.inner.options.refetch_on_focus,
            LifecycleEvent::Reconnect => self.inner.options.refetch_on_reconnect,
        };
        if !wanted {
            return None;
        }
        debug!("Coordinator {} refetching on {}", self.inner.key, event);
        Some(self.refetch().await)
    }

    /// Spawn a task that feeds `signals` into
    /// [`handle_lifecycle`](Self::handle_lifecycle) until the coordinator is
    /// cancelled.
    pub fn listen(&self, signals: &LifecycleSignals) -> JoinHandle<()> {
        let mut events = signals.subscribe();
        let this = self.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = this.inner.teardown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => {
                        this.handle_lifecycle(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            "Coordinator {} missed {} lifecycle events",
                            this.inner.key, skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
