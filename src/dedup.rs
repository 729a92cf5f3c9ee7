//! Request deduplication.
//!
//! Tracks at most one in-flight operation per key. Callers that arrive while
//! an operation is running join it through a [`Shared`] future instead of
//! starting a duplicate.
//!
//! Operations are spawned on the tokio runtime, so they make progress even
//! if every caller stops polling, and their bookkeeping entry is removed by a
//! drop guard inside the spawned task once they settle.

use crate::error::{Error, Result};
use crate::generation::Generations;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;
type PendingMap<T> = Arc<DashMap<String, PendingOperation<T>>>;

/// Runs a closure when dropped.
struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send>>,
}

impl CallOnDrop {
    fn new<F: FnOnce() + Send + 'static>(f: F) -> Self {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

/// The recorded in-flight operation for one key.
struct PendingOperation<T> {
    generation: u64,
    started_at: Instant,
    cancel: CancellationToken,
    subscribers: Arc<AtomicUsize>,
    future: SharedResult<T>,
}

impl<T> PendingOperation<T> {
    fn joined(&self, key: &str, joined_existing: bool, pending: &PendingMap<T>) -> Joined<T> {
        Joined {
            key: key.to_string(),
            generation: self.generation,
            joined_existing,
            cancel: self.cancel.clone(),
            subscribers: Arc::clone(&self.subscribers),
            future: self.future.clone(),
            pending: Arc::clone(pending),
        }
    }
}

/// Handle to an in-flight operation, obtained by starting or joining it.
pub struct Joined<T> {
    key: String,
    generation: u64,
    joined_existing: bool,
    cancel: CancellationToken,
    subscribers: Arc<AtomicUsize>,
    future: SharedResult<T>,
    pending: PendingMap<T>,
}

impl<T> Clone for Joined<T> {
    fn clone(&self) -> Self {
        Joined {
            key: self.key.clone(),
            generation: self.generation,
            joined_existing: self.joined_existing,
            cancel: self.cancel.clone(),
            subscribers: Arc::clone(&self.subscribers),
            future: self.future.clone(),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Joined<T> {
    /// Generation of the underlying operation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this handle joined an operation that was already running.
    pub fn joined_existing(&self) -> bool {
        self.joined_existing
    }

    /// Whether the underlying operation has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Register interest in the outcome.
    ///
    /// The operation is cancelled once every subscription taken on it has
    /// been explicitly [cancelled](Subscription::cancel). Dropping a
    /// subscription only gives up interest.
    pub fn subscribe(&self) -> Subscription<T> {
        self.subscribers.fetch_add(1, Ordering::AcqRel);
        Subscription {
            joined: self.clone(),
            released: false,
        }
    }

    /// Wait for the shared outcome. Every waiter observes the same result.
    pub async fn wait(&self) -> Result<T> {
        self.future.clone().await
    }
}

/// Interest in one in-flight operation.
pub struct Subscription<T> {
    joined: Joined<T>,
    released: bool,
}

impl<T> Subscription<T> {
    /// Withdraw interest; the last subscriber to cancel aborts the operation
    /// and removes its record.
    pub fn cancel(mut self, generations: &Generations) {
        self.released = true;
        let last = self.joined.subscribers.fetch_sub(1, Ordering::AcqRel) == 1;
        if !last {
            return;
        }

        let key = &self.joined.key;
        let generation = self.joined.generation;
        // Cancel under the generation entry so no store write can slip in
        // after this point.
        generations.with_lock(key, |_| self.joined.cancel.cancel());
        self.joined
            .pending
            .remove_if(key, |_, op| op.generation == generation);
        debug!("Dedup CANCEL {} (generation {})", key, generation);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if !self.released {
            self.joined.subscribers.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Tracks one in-flight operation per key.
///
/// Cloning is cheap and clones share the same bookkeeping.
pub struct Deduplicator<T> {
    pending: PendingMap<T>,
    generations: Generations,
}

impl<T> Clone for Deduplicator<T> {
    fn clone(&self) -> Self {
        Deduplicator {
            pending: Arc::clone(&self.pending),
            generations: self.generations.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Deduplicator<T> {
    /// Create a deduplicator that draws generations from `generations`.
    pub fn new(generations: Generations) -> Self {
        Deduplicator {
            pending: Arc::new(DashMap::new()),
            generations,
        }
    }

    /// Join the in-flight operation for `key`, or start one.
    ///
    /// `start_fn` runs at most once for any set of overlapping calls. It
    /// receives the new generation and the operation's cancel token.
    ///
    /// Must be called from within a tokio runtime.
    pub fn join_or_start<F, Fut>(&self, key: &str, start_fn: F) -> Joined<T>
    where
        F: FnOnce(u64, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        match self.pending.entry(key.to_string()) {
            Entry::Occupied(occ) => {
                let op = occ.get();
                debug!(
                    "Dedup JOIN {} (generation {}, running for {:?})",
                    key,
                    op.generation,
                    op.started_at.elapsed()
                );
                op.joined(key, true, &self.pending)
            }
            Entry::Vacant(vac) => {
                let op = self.spawn(key, start_fn);
                let joined = op.joined(key, false, &self.pending);
                vac.insert(op);
                joined
            }
        }
    }

    /// Start a new generation for `key` unconditionally.
    ///
    /// A previously recorded operation keeps running for the callers that
    /// already joined it, but is no longer the one new callers join.
    pub fn start<F, Fut>(&self, key: &str, start_fn: F) -> Joined<T>
    where
        F: FnOnce(u64, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let entry = self.pending.entry(key.to_string());
        let op = self.spawn(key, start_fn);
        let joined = op.joined(key, false, &self.pending);
        if let Entry::Occupied(occ) = &entry {
            debug!(
                "Dedup SUPERSEDE {} (generation {} -> {})",
                key,
                occ.get().generation,
                op.generation
            );
        }
        entry.insert(op);
        joined
    }

    fn spawn<F, Fut>(&self, key: &str, start_fn: F) -> PendingOperation<T>
    where
        F: FnOnce(u64, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let generation = self.generations.bump(key);
        let cancel = CancellationToken::new();
        let operation = start_fn(generation, cancel.clone());

        let pending = Arc::clone(&self.pending);
        let owned_key = key.to_string();
        let remove_pending = CallOnDrop::new(move || {
            pending.remove_if(&owned_key, |_, op| op.generation == generation);
        });

        let (sender, receiver) = oneshot::channel();
        let token = cancel.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::Aborted),
                result = operation => result,
            };
            // Evict before publishing so callers either join a channel that
            // will receive data or start a new one.
            drop(remove_pending);
            sender.send(result).ok();
        });

        debug!("Dedup START {} (generation {})", key, generation);

        PendingOperation {
            generation,
            started_at: Instant::now(),
            cancel,
            subscribers: Arc::new(AtomicUsize::new(0)),
            future: receiver
                .map(|received| received.unwrap_or(Err(Error::Aborted)))
                .boxed()
                .shared(),
        }
    }

    /// Number of operations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Generation of the in-flight operation for `key`, if any.
    pub fn pending_generation(&self, key: &str) -> Option<u64> {
        self.pending.get(key).map(|op| op.generation)
    }

    /// Join the recorded operation for `key` only if it carries the latest
    /// generation. Never starts one.
    pub fn join_current(&self, key: &str) -> Option<Joined<T>> {
        let op = self.pending.get(key)?;
        if !self.generations.is_current(key, op.generation) {
            return None;
        }
        debug!("Dedup FOLLOW {} (generation {})", key, op.generation);
        Some(op.joined(key, true, &self.pending))
    }

    /// Forget generation counters of keys with no recorded operation for
    /// which `in_use` is false. Returns the number of keys forgotten.
    pub fn prune_idle<F>(&self, in_use: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut pruned = 0;
        for key in self.generations.keys() {
            // the vacant entry keeps operations from starting for `key` meanwhile
            let Entry::Vacant(_slot) = self.pending.entry(key.clone()) else {
                continue;
            };
            if self.generations.forget_if(&key, || !in_use(&key)) {
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!("Dedup PRUNE {} idle keys", pruned);
        }
        pruned
    }

    /// Cancel and forget the in-flight operation for `key`.
    pub fn cancel(&self, key: &str) -> bool {
        match self.pending.remove(key) {
            Some((_, op)) => {
                self.generations.with_lock(key, |_| op.cancel.cancel());
                debug!("Dedup CANCEL {} (generation {})", key, op.generation);
                true
            }
            None => false,
        }
    }

    /// Cancel the recorded operation for `key` if its generation has been
    /// superseded. Its result would be discarded anyway.
    pub fn cancel_stale(&self, key: &str) -> bool {
        let generations = &self.generations;
        let removed = self
            .pending
            .remove_if(key, |_, op| !generations.is_current(key, op.generation));
        match removed {
            Some((_, op)) => {
                self.generations.with_lock(key, |_| op.cancel.cancel());
                debug!("Dedup CANCEL stale {} (generation {})", key, op.generation);
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight operation.
    pub fn cancel_all(&self) {
        let keys: Vec<String> = self.pending.iter().map(|op| op.key().clone()).collect();
        for key in keys {
            self.cancel(&key);
        }
    }
}
