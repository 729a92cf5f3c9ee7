//! Per-key debounce and throttle gate.
//!
//! Every key owns exactly one [`ScheduleState`]: the time of its last run and
//! at most one pending slot. A pending slot holds the task that will run
//! when the slot fires; later calls for the same key replace that task
//! (last call wins) and share the slot's outcome. Replacing or cancelling a
//! pending call is therefore a single operation on the key's state.

use crate::error::{Error, Result};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

type Task<O> = Box<dyn FnOnce() -> O + Send + Sync>;
type SlotOutcome<O> = Shared<BoxFuture<'static, Result<O>>>;

/// How often a key may trigger real work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SchedulePolicy {
    /// Run every call right away.
    #[default]
    Immediate,

    /// Run only the last call of a burst, once `Duration` passes without a
    /// new call.
    Debounce(Duration),

    /// Run at most once per `Duration`; excess calls are coalesced into a
    /// single queued call that fires when the interval has elapsed.
    Throttle(Duration),
}

impl SchedulePolicy {
    /// Build a policy from the two option knobs. Zero disables a knob.
    pub fn from_knobs(debounce: Duration, throttle: Duration) -> Result<Self> {
        match (debounce.is_zero(), throttle.is_zero()) {
            (true, true) => Ok(SchedulePolicy::Immediate),
            (false, true) => Ok(SchedulePolicy::Debounce(debounce)),
            (true, false) => Ok(SchedulePolicy::Throttle(throttle)),
            (false, false) => Err(Error::ConfigError(
                "debounce and throttle are mutually exclusive".to_string(),
            )),
        }
    }
}

impl std::fmt::Display for SchedulePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulePolicy::Immediate => write!(f, "Immediate"),
            SchedulePolicy::Debounce(d) => write!(f, "Debounce({:?})", d),
            SchedulePolicy::Throttle(d) => write!(f, "Throttle({:?})", d),
        }
    }
}

/// A queued call waiting for its timer.
struct PendingSlot<O> {
    id: u64,
    fire_at: Instant,
    task: Task<O>,
    sender: oneshot::Sender<Result<O>>,
    outcome: SlotOutcome<O>,
    coalesced: usize,
}

/// Scheduling bookkeeping for one key.
pub struct ScheduleState<O> {
    last_run_at: Option<Instant>,
    /// Throttle interval the last run counts against; zero otherwise.
    window: Duration,
    pending: Option<PendingSlot<O>>,
}

impl<O> Default for ScheduleState<O> {
    fn default() -> Self {
        ScheduleState {
            last_run_at: None,
            window: Duration::ZERO,
            pending: None,
        }
    }
}

impl<O> ScheduleState<O> {
    pub fn last_run_at(&self) -> Option<Instant> {
        self.last_run_at
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Nothing queued and no throttle window still open at `now`.
    pub fn is_idle_at(&self, now: Instant) -> bool {
        self.pending.is_none()
            && self
                .last_run_at
                .map_or(true, |last| now.saturating_duration_since(last) >= self.window)
    }
}

enum Admission<O> {
    Run(Task<O>),
    Wait(SlotOutcome<O>),
}

enum TimerStep<O> {
    Sleep(Instant),
    Fire(PendingSlot<O>),
    Gone,
}

/// Debounce / throttle gate keyed by request key.
///
/// Cloning is cheap and clones share the same per-key state.
pub struct Scheduler<O> {
    states: Arc<DashMap<String, ScheduleState<O>>>,
    next_slot: Arc<AtomicU64>,
}

impl<O> Clone for Scheduler<O> {
    fn clone(&self) -> Self {
        Scheduler {
            states: Arc::clone(&self.states),
            next_slot: Arc::clone(&self.next_slot),
        }
    }
}

impl<O: Clone + Send + Sync + 'static> Default for Scheduler<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: Clone + Send + Sync + 'static> Scheduler<O> {
    pub fn new() -> Self {
        Scheduler {
            states: Arc::new(DashMap::new()),
            next_slot: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Pass `task` through the gate for `key` under `policy`.
    ///
    /// Callers coalesced into the same pending slot all receive the output
    /// of the one task that runs. A slot dropped by [`cancel`](Self::cancel)
    /// resolves to [`Error::Aborted`].
    pub async fn gate<F>(&self, key: &str, policy: SchedulePolicy, task: F) -> Result<O>
    where
        F: FnOnce() -> O + Send + Sync + 'static,
    {
        let admission = match policy {
            SchedulePolicy::Immediate => {
                self.record_run(key);
                Admission::Run(Box::new(task))
            }
            SchedulePolicy::Debounce(delay) if delay.is_zero() => {
                self.record_run(key);
                Admission::Run(Box::new(task))
            }
            SchedulePolicy::Debounce(delay) => self.admit_debounced(key, delay, Box::new(task)),
            SchedulePolicy::Throttle(interval) => {
                self.admit_throttled(key, interval, Box::new(task))
            }
        };

        match admission {
            Admission::Run(task) => Ok(task()),
            Admission::Wait(outcome) => outcome.await,
        }
    }

    fn record_run(&self, key: &str) {
        let mut state = self.states.entry(key.to_string()).or_default();
        state.last_run_at = Some(Instant::now());
        state.window = Duration::ZERO;
    }

    fn admit_debounced(&self, key: &str, delay: Duration, task: Task<O>) -> Admission<O> {
        let fire_at = Instant::now() + delay;
        let mut state = self.states.entry(key.to_string()).or_default();

        if let Some(slot) = state.pending.as_mut() {
            slot.task = task;
            slot.fire_at = fire_at;
            slot.coalesced += 1;
            debug!(
                "Scheduler DEBOUNCE {} rearmed ({} calls coalesced)",
                key, slot.coalesced
            );
            return Admission::Wait(slot.outcome.clone());
        }

        let slot = self.arm(key, fire_at, task);
        let outcome = slot.outcome.clone();
        state.pending = Some(slot);
        debug!("Scheduler DEBOUNCE {} armed for {:?}", key, delay);
        Admission::Wait(outcome)
    }

    fn admit_throttled(&self, key: &str, interval: Duration, task: Task<O>) -> Admission<O> {
        let now = Instant::now();
        let mut state = self.states.entry(key.to_string()).or_default();
        state.window = interval;

        if let Some(slot) = state.pending.as_mut() {
            slot.task = task;
            slot.coalesced += 1;
            debug!(
                "Scheduler THROTTLE {} coalesced into queued call ({} calls)",
                key, slot.coalesced
            );
            return Admission::Wait(slot.outcome.clone());
        }

        let fire_at = match state.last_run_at {
            Some(last) if now.saturating_duration_since(last) < interval => last + interval,
            _ => {
                state.last_run_at = Some(now);
                return Admission::Run(task);
            }
        };

        let slot = self.arm(key, fire_at, task);
        let outcome = slot.outcome.clone();
        state.pending = Some(slot);
        debug!("Scheduler THROTTLE {} queued until {:?}", key, fire_at - now);
        Admission::Wait(outcome)
    }

    /// Create a pending slot and spawn the timer that fires it.
    fn arm(&self, key: &str, fire_at: Instant, task: Task<O>) -> PendingSlot<O> {
        let id = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let outcome = receiver
            .map(|received| received.unwrap_or(Err(Error::Aborted)))
            .boxed()
            .shared();

        let states = Arc::clone(&self.states);
        let owned_key = key.to_string();
        tokio::spawn(async move {
            let mut deadline = fire_at;
            loop {
                tokio::time::sleep_until(deadline).await;
                match Self::timer_step(&states, &owned_key, id) {
                    TimerStep::Sleep(next) => deadline = next,
                    TimerStep::Fire(slot) => {
                        let output = (slot.task)();
                        slot.sender.send(Ok(output)).ok();
                        return;
                    }
                    TimerStep::Gone => return,
                }
            }
        });

        PendingSlot {
            id,
            fire_at,
            task,
            sender,
            outcome,
            coalesced: 1,
        }
    }

    fn timer_step(
        states: &DashMap<String, ScheduleState<O>>,
        key: &str,
        id: u64,
    ) -> TimerStep<O> {
        let Some(mut state) = states.get_mut(key) else {
            return TimerStep::Gone;
        };
        let due = match state.pending.as_ref() {
            Some(slot) if slot.id == id => slot.fire_at,
            _ => return TimerStep::Gone,
        };
        let now = Instant::now();
        if due > now {
            return TimerStep::Sleep(due);
        }
        state.last_run_at = Some(now);
        match state.pending.take() {
            Some(slot) => {
                debug!("Scheduler FIRE {} ({} calls coalesced)", key, slot.coalesced);
                TimerStep::Fire(slot)
            }
            None => TimerStep::Gone,
        }
    }

    /// Drop the pending slot for `key`; its callers receive `Error::Aborted`.
    pub fn cancel(&self, key: &str) -> bool {
        let dropped = self
            .states
            .get_mut(key)
            .and_then(|mut state| state.pending.take())
            .is_some();
        if dropped {
            debug!("Scheduler CANCEL {}", key);
        }
        dropped
    }

    /// Time of the last run for `key`.
    pub fn last_run_at(&self, key: &str) -> Option<Instant> {
        self.states.get(key).and_then(|state| state.last_run_at())
    }

    /// Number of keys with a queued call.
    pub fn pending(&self) -> usize {
        self.states.iter().filter(|state| state.has_pending()).count()
    }

    /// Number of keys with scheduling state.
    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    /// Drop the state of every key that is idle at `now`. Returns the number
    /// of keys dropped.
    pub fn prune_idle(&self, now: Instant) -> usize {
        let before = self.states.len();
        self.states.retain(|_, state| !state.is_idle_at(now));
        let pruned = before.saturating_sub(self.states.len());
        if pruned > 0 {
            debug!("Scheduler PRUNE {} idle keys", pruned);
        }
        pruned
    }

    /// Drop all state, cancelling every queued call.
    pub fn clear(&self) {
        self.states.clear();
    }
}
