//! Result slots shared between a worker and the submitter of a unit.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::core::aggregate::Completion;
use crate::core::error::{TaskError, TaskResult, UsageError};
use crate::core::task::TaskId;

use super::{PoolCounters, UnitPhase};

/// Type-erased control surface a worker uses on a queued unit.
pub(crate) trait UnitControl: Send + Sync {
    /// Move the unit from queued to running. `false` if it was cancelled.
    fn begin(&self) -> bool;

    /// Cancel the unit if it is still queued.
    fn cancel_queued(&self) -> bool;
}

/// A queued unit as it travels to a worker.
///
/// A job dropped without being executed (pool dropped or shut down without
/// waiting) cancels its unit, so waiters never hang.
pub(crate) struct Job {
    id: TaskId,
    control: Arc<dyn UnitControl>,
    run: Option<Box<dyn FnOnce() + Send>>,
}

impl Job {
    pub fn new(id: TaskId, control: Arc<dyn UnitControl>, run: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            id,
            control,
            run: Some(run),
        }
    }

    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Run the unit unless it was cancelled while queued. Returns whether it ran.
    pub fn execute(mut self) -> bool {
        let Some(run) = self.run.take() else {
            return false;
        };
        if !self.control.begin() {
            return false;
        }
        run();
        true
    }

    /// Forget the unit without touching its slot. Used when the job never
    /// made it into the queue.
    pub fn disarm(mut self) {
        self.run = None;
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if self.run.take().is_some() {
            self.control.cancel_queued();
        }
    }
}

struct SlotState<R> {
    phase: UnitPhase,
    outcome: Option<TaskResult<R>>,
    taken: bool,
    completion_index: Option<u64>,
    subscribers: Vec<(usize, Sender<usize>)>,
}

/// Outcome storage for one unit, with Condvar-based notification.
pub(crate) struct UnitSlot<R> {
    id: TaskId,
    state: Mutex<SlotState<R>>,
    ready: Condvar,
    counters: Arc<PoolCounters>,
}

impl<R> UnitSlot<R> {
    pub fn new(id: TaskId, counters: Arc<PoolCounters>) -> Self {
        Self {
            id,
            state: Mutex::new(SlotState {
                phase: UnitPhase::Queued,
                outcome: None,
                taken: false,
                completion_index: None,
                subscribers: Vec::new(),
            }),
            ready: Condvar::new(),
            counters,
        }
    }

    /// Store the outcome of a unit that ran.
    pub fn complete(&self, outcome: TaskResult<R>) {
        self.counters.active_units.fetch_sub(1, Ordering::Relaxed);
        let counter = if outcome.is_ok() {
            &self.counters.completed_units
        } else {
            &self.counters.failed_units
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        self.settle(&mut state, UnitPhase::Finished, outcome);
    }

    fn settle(&self, state: &mut SlotState<R>, phase: UnitPhase, outcome: TaskResult<R>) {
        state.phase = phase;
        state.outcome = Some(outcome);
        state.completion_index = Some(self.counters.next_completion());
        for (position, notify) in state.subscribers.drain(..) {
            let _ = notify.send(position);
        }
        trace!(unit = %self.id, ?phase, "Unit settled");
        self.ready.notify_all();
    }

    fn take(&self, state: &mut SlotState<R>) -> TaskResult<R> {
        match state.outcome.take() {
            Some(outcome) => {
                state.taken = true;
                outcome
            }
            None if state.taken => Err(UsageError::ResultTaken(self.id).into()),
            None => Err(UsageError::NotFinished(self.id).into()),
        }
    }
}

impl<R: Send> UnitControl for UnitSlot<R> {
    fn begin(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase != UnitPhase::Queued {
            return false;
        }
        state.phase = UnitPhase::Running;
        self.counters.queued_units.fetch_sub(1, Ordering::Relaxed);
        self.counters.active_units.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn cancel_queued(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase != UnitPhase::Queued {
            return false;
        }
        self.counters.queued_units.fetch_sub(1, Ordering::Relaxed);
        self.counters.cancelled_units.fetch_add(1, Ordering::Relaxed);
        self.settle(&mut state, UnitPhase::Cancelled, Err(TaskError::NotStarted(self.id)));
        true
    }
}

/// Handle to a unit submitted to a [`WorkerPool`](super::WorkerPool).
pub struct ResultHandle<R> {
    slot: Arc<UnitSlot<R>>,
}

impl<R: Send + 'static> ResultHandle<R> {
    pub(crate) const fn new(slot: Arc<UnitSlot<R>>) -> Self {
        Self { slot }
    }

    /// Identifier of the unit.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.slot.id
    }

    /// Current phase of the unit.
    #[must_use]
    pub fn phase(&self) -> UnitPhase {
        self.slot.state.lock().phase
    }

    /// Whether the unit has an outcome.
    #[must_use]
    pub fn done(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Whether the unit was cancelled before it ran.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.phase() == UnitPhase::Cancelled
    }

    /// Cancel the unit if no worker picked it up yet. A running unit cannot be
    /// cancelled. Returns whether the cancellation took effect.
    pub fn cancel(&self) -> bool {
        self.slot.cancel_queued()
    }

    /// Block until the unit finishes and take its outcome.
    ///
    /// # Errors
    ///
    /// - `TaskError::Failed` if the unit returned an error or panicked
    /// - `TaskError::NotStarted` if it was cancelled while queued
    /// - `UsageError::ResultTaken` if the outcome was already taken with
    ///   [`wait_timeout`](Self::wait_timeout)
    pub fn wait(self) -> TaskResult<R> {
        let mut state = self.slot.state.lock();
        while !state.phase.is_terminal() {
            self.slot.ready.wait(&mut state);
        }
        self.slot.take(&mut state)
    }

    /// Block for at most `timeout` and take the outcome if the unit finished.
    ///
    /// # Errors
    ///
    /// `TaskError::TimedOut` if the unit is still queued or running, otherwise
    /// as [`wait`](Self::wait).
    pub fn wait_timeout(&self, timeout: Duration) -> TaskResult<R> {
        let mut state = self.slot.state.lock();
        // A timeout past the end of `Instant` is no bound at all.
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            while !state.phase.is_terminal() {
                self.slot.ready.wait(&mut state);
            }
            return self.slot.take(&mut state);
        };
        while !state.phase.is_terminal() {
            if self.slot.ready.wait_until(&mut state, deadline).timed_out() {
                if state.phase.is_terminal() {
                    break;
                }
                return Err(TaskError::TimedOut(timeout));
            }
        }
        self.slot.take(&mut state)
    }

    /// Await the outcome from async code without blocking the runtime.
    ///
    /// The Condvar wait runs on tokio's blocking thread pool.
    ///
    /// # Errors
    ///
    /// As [`wait`](Self::wait).
    #[cfg(feature = "tokio-runtime")]
    pub async fn wait_async(self) -> TaskResult<R> {
        let id = self.id();
        tokio::task::spawn_blocking(move || self.wait())
            .await
            .map_err(|e| TaskError::Failed {
                task: id,
                cause: crate::core::error::Failure::msg(format!("waiter task failed: {e}")),
            })?
    }
}

impl<R: Send + 'static> Completion for ResultHandle<R> {
    type Output = R;

    fn id(&self) -> TaskId {
        self.slot.id
    }

    fn completion_index(&self) -> Option<u64> {
        self.slot.state.lock().completion_index
    }

    fn subscribe(&self, position: usize, notify: &Sender<usize>) {
        let mut state = self.slot.state.lock();
        if state.phase.is_terminal() {
            let _ = notify.send(position);
        } else {
            state.subscribers.push((position, notify.clone()));
        }
    }

    fn resolve(self) -> TaskResult<R> {
        self.wait()
    }
}

impl<R> fmt::Debug for ResultHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.slot.state.lock();
        f.debug_struct("ResultHandle")
            .field("id", &self.slot.id)
            .field("phase", &state.phase)
            .finish()
    }
}
