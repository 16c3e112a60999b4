//! Single-threaded cooperative scheduler.
//!
//! Tasks are submitted as closures taking a [`TaskContext`]. The scheduler
//! resumes one task at a time in FIFO order; a task runs until it suspends
//! (yield, sleep, input, join) or finishes. Timers fire in deadline order, ties
//! broken by submission order. With the default virtual clock a sleep costs no
//! real time: when nothing is runnable the clock jumps to the next deadline.
//!
//! Gathers are pseudo-tasks that resolve to the ordered values of their
//! children, or to the first failure among them.
//!
//! ```rust,ignore
//! let mut sched = Scheduler::<String>::new();
//! let main = sched.submit(|ctx| {
//!     let api = ctx.spawn(|ctx| {
//!         ctx.sleep(Duration::from_secs(3))?;
//!         Ok("Data from API_A".to_string())
//!     })?;
//!     let db = ctx.spawn(|ctx| {
//!         ctx.sleep(Duration::from_secs(1))?;
//!         Ok("Data from Database".to_string())
//!     })?;
//!     Ok(ctx.gather(&[api, db])?.join(", "))
//! });
//! sched.run_until_complete([main])?;
//! assert_eq!(sched.now(), Duration::from_secs(3));
//! ```

mod context;
mod timer;

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::mem;
use std::time::Duration;

use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::core::aggregate::{self, AsCompleted, ResultRecord};
use crate::core::error::{AppResult, TaskError, TaskResult, UsageError};
use crate::core::task::{Step, Task, TaskId, TaskState};
use crate::util::clock::Clock;

pub use context::TaskContext;

use context::{Body, Delivery, Park, Request};
use timer::{Timer, TimerKind, TimerQueue};

/// Handle to a task submitted to a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(TaskId);

impl TaskHandle {
    /// Identifier of the task.
    #[must_use]
    pub const fn id(self) -> TaskId {
        self.0
    }
}

/// Handle to a gather created with [`Scheduler::gather`] or
/// [`TaskContext::gather_handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GatherHandle(TaskId);

impl GatherHandle {
    /// Identifier of the gather pseudo-task.
    #[must_use]
    pub const fn id(self) -> TaskId {
        self.0
    }
}

impl From<TaskHandle> for TaskId {
    fn from(handle: TaskHandle) -> Self {
        handle.0
    }
}

impl From<&TaskHandle> for TaskId {
    fn from(handle: &TaskHandle) -> Self {
        handle.0
    }
}

impl From<GatherHandle> for TaskId {
    fn from(handle: GatherHandle) -> Self {
        handle.0
    }
}

/// Summary of one `run_until_complete` or `run` call.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Number of task resumptions.
    pub steps: u64,
    /// Scheduler clock time that passed during the call.
    pub elapsed: Duration,
    /// Failures that finished during the call without being awaited by
    /// anyone. Each failure is reported once.
    pub unhandled: Vec<UnhandledFailure>,
}

impl RunReport {
    /// True if no unawaited failure was reported.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.unhandled.is_empty()
    }
}

/// A failure that nobody observed.
#[derive(Debug, Clone)]
pub struct UnhandledFailure {
    /// Task (or gather) that failed.
    pub task: TaskId,
    /// Its failure.
    pub error: TaskError,
}

type SchedTask<V> = Task<Delivery<V>, Request<V>, V>;

enum Kind<V> {
    /// `None` once the body finished or while it is being resumed.
    Coroutine(Option<SchedTask<V>>),
    Gather(Vec<TaskId>),
}

enum Resume<V> {
    Start,
    Deliver(Delivery<V>),
    Throw(TaskError),
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Idle,
    Timer,
    Input,
    Join(TaskId),
}

enum Outcome<V> {
    Value(V),
    Values(Vec<V>),
    Failed(TaskError),
    Cancelled,
}

impl<V> Outcome<V> {
    const fn state(&self) -> TaskState {
        match self {
            Self::Value(_) | Self::Values(_) => TaskState::Completed,
            Self::Failed(_) => TaskState::Failed,
            Self::Cancelled => TaskState::Cancelled,
        }
    }
}

/// How a resumption ended, once inline requests were served.
enum Settled<V> {
    Park(Park<V>),
    Done(Outcome<V>),
    Violation(UsageError),
}

struct Entry<V> {
    kind: Kind<V>,
    state: TaskState,
    wait: Wait,
    resume: Option<Resume<V>>,
    queued: bool,
    /// Bumped on every suspension and wake-up; timers armed for an older
    /// generation are stale.
    generation: u64,
    awaiters: Vec<TaskId>,
    outcome: Option<Outcome<V>>,
    completion_index: Option<u64>,
    observed: bool,
    reported: bool,
    last_value: Option<V>,
}

impl<V> Entry<V> {
    const fn new(kind: Kind<V>, state: TaskState, resume: Option<Resume<V>>) -> Self {
        Self {
            kind,
            state,
            wait: Wait::Idle,
            resume,
            queued: false,
            generation: 0,
            awaiters: Vec::new(),
            outcome: None,
            completion_index: None,
            observed: false,
            reported: false,
            last_value: None,
        }
    }

    const fn is_done(&self) -> bool {
        self.outcome.is_some()
    }
}

fn idx(id: TaskId) -> usize {
    usize::try_from(id.get()).unwrap_or(usize::MAX)
}

fn timer_is_live<V>(entries: &[Entry<V>], timer: &Timer) -> bool {
    entries
        .get(idx(timer.task))
        .is_some_and(|e| !e.is_done() && e.generation == timer.generation)
}

/// Cooperative scheduler over tasks producing values of type `V`.
pub struct Scheduler<V> {
    name: String,
    clock: Clock,
    entries: Vec<Entry<V>>,
    ready: VecDeque<TaskId>,
    timers: TimerQueue,
    completed: u64,
}

impl<V: Clone + 'static> Default for Scheduler<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + 'static> Scheduler<V> {
    /// Scheduler with a virtual clock and a generated name.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Scheduler built from configuration.
    #[must_use]
    pub fn with_config(config: SchedulerConfig) -> Self {
        let name = config
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("scheduler-{}", Uuid::new_v4()));
        debug!(scheduler = %name, clock = ?config.clock, "Scheduler created");
        Self {
            name,
            clock: Clock::new(config.clock),
            entries: Vec::new(),
            ready: VecDeque::new(),
            timers: TimerQueue::default(),
            completed: 0,
        }
    }

    /// Name used in log events.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current scheduler time, measured from creation.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Number of tasks and gathers ever created.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing was submitted yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Submit a task. It does not run until the scheduler is driven.
    pub fn submit<F>(&mut self, body: F) -> TaskHandle
    where
        F: FnOnce(&TaskContext<'_, V>) -> AppResult<V> + 'static,
    {
        let handle = TaskHandle(self.spawn_entry(Box::new(body)));
        debug!(scheduler = %self.name, task = %handle.0, "Task submitted");
        handle
    }

    /// Create a gather over `tasks`. An empty gather resolves immediately to
    /// an empty list.
    ///
    /// # Errors
    ///
    /// `UsageError::UnknownTask` if a handle belongs to another scheduler.
    pub fn gather(&mut self, tasks: &[TaskHandle]) -> Result<GatherHandle, UsageError> {
        let children = tasks.iter().map(|t| t.0).collect();
        self.create_gather(children).map(GatherHandle)
    }

    /// Deliver `value` to a task waiting in [`TaskContext::recv`].
    ///
    /// # Errors
    ///
    /// - `UsageError::InputBeforeStart` if the task never ran
    /// - `UsageError::Finished` if it is terminal
    /// - `UsageError::NotAwaitingInput` if it is suspended on something else
    pub fn send(&mut self, task: TaskHandle, value: V) -> Result<(), UsageError> {
        let id = task.0;
        let entry = self.entry(id)?;
        if entry.is_done() {
            return Err(UsageError::Finished {
                task: id,
                state: entry.state,
            });
        }
        if entry.state == TaskState::Created {
            return Err(UsageError::InputBeforeStart(id));
        }
        if entry.wait != Wait::Input {
            return Err(UsageError::NotAwaitingInput(id));
        }
        trace!(scheduler = %self.name, task = %id, "Input delivered");
        self.wake(id, Resume::Deliver(Delivery::Value(value)));
        Ok(())
    }

    /// Request cancellation.
    ///
    /// A task that never ran is cancelled at once. A suspended task is
    /// resumed with a cancellation at its suspension point on its next turn.
    /// Cancelling a gather cancels its children. Returns `false` if the target
    /// had already finished.
    ///
    /// # Errors
    ///
    /// `UsageError::UnknownTask` for a foreign handle.
    pub fn cancel<H: Into<TaskId>>(&mut self, handle: H) -> Result<bool, UsageError> {
        let id = handle.into();
        let entry = self.entry(id)?;
        if entry.is_done() {
            return Ok(false);
        }
        match &entry.kind {
            Kind::Gather(children) => {
                let children = children.clone();
                self.finish(id, Outcome::Cancelled);
                for child in children {
                    self.cancel(child)?;
                }
            }
            Kind::Coroutine(_) if entry.state == TaskState::Created => {
                self.finish(id, Outcome::Cancelled);
            }
            Kind::Coroutine(_) => {
                self.detach(id);
                self.wake(id, Resume::Cancel);
            }
        }
        info!(scheduler = %self.name, task = %id, "Cancellation requested");
        Ok(true)
    }

    /// Current state of a task or gather.
    #[must_use]
    pub fn state<H: Into<TaskId>>(&self, handle: H) -> Option<TaskState> {
        self.entry(handle.into()).ok().map(|e| e.state)
    }

    /// Latest value published with [`TaskContext::yield_value`].
    #[must_use]
    pub fn last_value(&self, task: TaskHandle) -> Option<&V> {
        self.entry(task.0).ok().and_then(|e| e.last_value.as_ref())
    }

    /// Drive the scheduler until every listed task or gather is terminal.
    ///
    /// Values are read afterwards with [`result`](Self::result),
    /// [`gather_result`](Self::gather_result) or the collectors;
    /// [`run_to_result`](Self::run_to_result) and
    /// [`run_gather`](Self::run_gather) do both steps for a single target.
    ///
    /// # Errors
    ///
    /// - `UsageError::UnknownTask` for a foreign handle
    /// - `UsageError::Stalled` if nothing can make progress while targets are
    ///   still open
    /// - `UsageError::SuspendedAfterCancel` if a task ignored its
    ///   cancellation; the task ends cancelled and the call stops
    pub fn run_until_complete<I>(&mut self, handles: I) -> Result<RunReport, UsageError>
    where
        I: IntoIterator,
        I::Item: Into<TaskId>,
    {
        let targets: Vec<TaskId> = handles.into_iter().map(Into::into).collect();
        for target in &targets {
            self.entry(*target)?;
        }
        self.drive(&targets)
    }

    /// Drive the scheduler until every task ever submitted is terminal,
    /// including tasks spawned along the way.
    ///
    /// # Errors
    ///
    /// As [`run_until_complete`](Self::run_until_complete).
    pub fn run(&mut self) -> Result<RunReport, UsageError> {
        let mut report = RunReport::default();
        // Tasks spawned during a pass are picked up by the next one.
        loop {
            let known = self.entries.len();
            let targets: Vec<TaskId> = (0..known as u64).map(TaskId::new).collect();
            let pass = self.drive(&targets)?;
            report.steps += pass.steps;
            report.elapsed = report.elapsed.saturating_add(pass.elapsed);
            report.unhandled.extend(pass.unhandled);
            if self.entries.len() == known {
                return Ok(report);
            }
        }
    }

    /// Drive until `task` finishes and return its value.
    ///
    /// # Errors
    ///
    /// The task's failure or cancellation, or the driver's `UsageError`
    /// wrapped in `TaskError::Usage`.
    pub fn run_to_result(&mut self, task: TaskHandle) -> TaskResult<V> {
        self.run_until_complete([task])?;
        self.result(task)
    }

    /// Drive until `gather` resolves and return its ordered values.
    ///
    /// # Errors
    ///
    /// As [`run_to_result`](Self::run_to_result).
    pub fn run_gather(&mut self, gather: GatherHandle) -> TaskResult<Vec<V>> {
        self.run_until_complete([gather])?;
        self.gather_result(gather)
    }

    /// Value of a finished task.
    ///
    /// # Errors
    ///
    /// The task's failure or cancellation, or `UsageError::NotFinished`.
    pub fn result(&self, task: TaskHandle) -> TaskResult<V> {
        self.settled(task.0, |outcome| match outcome {
            Outcome::Value(value) => Some(value.clone()),
            _ => None,
        })
    }

    /// Ordered values of a resolved gather.
    ///
    /// # Errors
    ///
    /// The gather's first failure, or `UsageError::NotFinished`.
    pub fn gather_result(&self, gather: GatherHandle) -> TaskResult<Vec<V>> {
        self.settled(gather.0, |outcome| match outcome {
            Outcome::Values(values) => Some(values.clone()),
            _ => None,
        })
    }

    /// Snapshot of a finished task's outcome with its completion position.
    ///
    /// # Errors
    ///
    /// `UsageError::NotFinished` or `UsageError::UnknownTask`.
    pub fn record(&self, task: TaskHandle) -> Result<ResultRecord<V>, UsageError> {
        let entry = self.entry(task.0)?;
        let completion_index = entry
            .completion_index
            .ok_or(UsageError::NotFinished(task.0))?;
        Ok(ResultRecord::new(task.0, self.result(task), completion_index))
    }

    /// Values of finished tasks in the order of `tasks`.
    ///
    /// # Errors
    ///
    /// The failure of the earliest listed task that failed.
    pub fn collect_ordered(&self, tasks: &[TaskHandle]) -> TaskResult<Vec<V>> {
        let records = self.records(tasks)?;
        aggregate::collect_ordered(records)
    }

    /// Outcomes of finished tasks in the order they finished.
    ///
    /// # Errors
    ///
    /// `UsageError::NotFinished` if any task is still open.
    pub fn as_completed(
        &self,
        tasks: &[TaskHandle],
    ) -> Result<AsCompleted<ResultRecord<V>>, UsageError> {
        let records = self.records(tasks)?;
        Ok(aggregate::as_completed(records))
    }

    fn records(&self, tasks: &[TaskHandle]) -> Result<Vec<ResultRecord<V>>, UsageError> {
        tasks.iter().map(|t| self.record(*t)).collect()
    }

    fn settled<T>(
        &self,
        id: TaskId,
        value: impl FnOnce(&Outcome<V>) -> Option<T>,
    ) -> TaskResult<T> {
        let entry = self.entry(id)?;
        let outcome = entry.outcome.as_ref().ok_or(UsageError::NotFinished(id))?;
        match outcome {
            Outcome::Failed(err) => Err(err.clone()),
            Outcome::Cancelled => Err(TaskError::Cancelled(id)),
            other => value(other).ok_or_else(|| UsageError::UnknownTask(id).into()),
        }
    }

    fn entry(&self, id: TaskId) -> Result<&Entry<V>, UsageError> {
        self.entries.get(idx(id)).ok_or(UsageError::UnknownTask(id))
    }

    fn next_id(&self) -> TaskId {
        TaskId::new(self.entries.len() as u64)
    }

    fn spawn_entry(&mut self, body: Body<V>) -> TaskId {
        let id = self.next_id();
        let task: SchedTask<V> = Task::with_id(id, move |s| body(&TaskContext::new(s)))
            .with_inline_yields(Request::is_inline);
        self.entries.push(Entry::new(
            Kind::Coroutine(Some(task)),
            TaskState::Created,
            Some(Resume::Start),
        ));
        self.enqueue(id);
        id
    }

    fn create_gather(&mut self, children: Vec<TaskId>) -> Result<TaskId, UsageError> {
        for child in &children {
            self.entry(*child)?;
        }
        let id = self.next_id();
        for child in &children {
            let entry = &mut self.entries[idx(*child)];
            if !entry.is_done() {
                entry.awaiters.push(id);
            }
        }
        trace!(scheduler = %self.name, gather = %id, children = children.len(), "Gather created");
        self.entries
            .push(Entry::new(Kind::Gather(children), TaskState::Suspended, None));
        self.settle_gather(id);
        Ok(id)
    }

    fn enqueue(&mut self, id: TaskId) {
        let entry = &mut self.entries[idx(id)];
        if !entry.queued {
            entry.queued = true;
            self.ready.push_back(id);
        }
    }

    fn wake(&mut self, id: TaskId, resume: Resume<V>) {
        let entry = &mut self.entries[idx(id)];
        entry.wait = Wait::Idle;
        entry.generation += 1;
        entry.resume = Some(resume);
        self.enqueue(id);
    }

    fn suspend_on(&mut self, id: TaskId, wait: Wait) -> u64 {
        let entry = &mut self.entries[idx(id)];
        entry.wait = wait;
        entry.generation += 1;
        entry.generation
    }

    /// Leave the awaiter list of the task this one is joined on.
    fn detach(&mut self, id: TaskId) {
        if let Wait::Join(target) = self.entries[idx(id)].wait {
            self.entries[idx(target)].awaiters.retain(|a| *a != id);
        }
    }

    fn drive(&mut self, targets: &[TaskId]) -> Result<RunReport, UsageError> {
        let started = self.clock.now();
        let mut steps = 0;
        debug!(scheduler = %self.name, targets = targets.len(), "Driving scheduler");

        while !targets.iter().all(|t| self.entries[idx(*t)].is_done()) {
            self.fire_due_timers();
            if let Some(id) = self.ready.pop_front() {
                if self.step(id)? {
                    steps += 1;
                }
                continue;
            }
            let entries = &self.entries;
            if let Some(deadline) = self
                .timers
                .next_live_deadline(|t| timer_is_live(entries, t))
            {
                trace!(scheduler = %self.name, ?deadline, "Advancing clock");
                self.clock.advance_to(deadline);
                continue;
            }
            let waiting: Vec<TaskId> = targets
                .iter()
                .copied()
                .filter(|t| !self.entries[idx(*t)].is_done())
                .collect();
            warn!(scheduler = %self.name, waiting = waiting.len(), "Scheduler stalled");
            return Err(UsageError::Stalled(waiting));
        }

        let report = RunReport {
            steps,
            elapsed: self.clock.now().saturating_sub(started),
            unhandled: self.take_unhandled(),
        };
        for failure in &report.unhandled {
            warn!(
                scheduler = %self.name,
                task = %failure.task,
                error = %failure.error,
                "Task failure was never awaited"
            );
        }
        debug!(scheduler = %self.name, steps, elapsed = ?report.elapsed, "Scheduler run finished");
        Ok(report)
    }

    fn fire_due_timers(&mut self) {
        let now = self.clock.now();
        while let Some(timer) = self.timers.pop_due(now) {
            if !timer_is_live(&self.entries, &timer) {
                continue;
            }
            let resume = match timer.kind {
                TimerKind::Wake => Resume::Deliver(Delivery::Resumed),
                TimerKind::Timeout(limit) => {
                    debug!(scheduler = %self.name, task = %timer.task, ?limit, "Wait timed out");
                    self.detach(timer.task);
                    Resume::Throw(TaskError::TimedOut(limit))
                }
            };
            self.wake(timer.task, resume);
        }
    }

    /// Resume one task. Returns whether a body actually ran.
    fn step(&mut self, id: TaskId) -> Result<bool, UsageError> {
        let entry = &mut self.entries[idx(id)];
        entry.queued = false;
        if entry.is_done() {
            return Ok(false);
        }
        let Kind::Coroutine(slot) = &mut entry.kind else {
            return Ok(false);
        };
        let Some(mut task) = slot.take() else {
            return Ok(false);
        };
        let mut resume = entry
            .resume
            .take()
            .unwrap_or(Resume::Deliver(Delivery::Resumed));
        entry.state = TaskState::Running;
        trace!(scheduler = %self.name, task = %id, "Resuming task");

        let settled = loop {
            let step = match resume {
                Resume::Start => task.resume(None),
                Resume::Deliver(delivery) => task.resume(Some(delivery)),
                Resume::Throw(error) => task.throw(error),
                Resume::Cancel => task.cancel(),
            };
            resume = match step {
                Ok(Step::Suspended(Request::Spawn(body))) => {
                    let child = self.spawn_entry(body);
                    debug!(scheduler = %self.name, task = %child, parent = %id, "Task spawned");
                    Resume::Deliver(Delivery::Spawned(child))
                }
                Ok(Step::Suspended(Request::Gather(children))) => {
                    match self.create_gather(children) {
                        Ok(gather) => Resume::Deliver(Delivery::Spawned(gather)),
                        Err(err) => Resume::Throw(err.into()),
                    }
                }
                Ok(Step::Suspended(Request::Park(park))) => break Settled::Park(park),
                Ok(Step::Completed(value)) => break Settled::Done(Outcome::Value(value)),
                Ok(Step::Failed(error)) => break Settled::Done(Outcome::Failed(error)),
                Ok(Step::Cancelled) => break Settled::Done(Outcome::Cancelled),
                Err(usage) => break Settled::Violation(usage),
            };
        };

        match settled {
            Settled::Park(park) => {
                let entry = &mut self.entries[idx(id)];
                entry.kind = Kind::Coroutine(Some(task));
                entry.state = TaskState::Suspended;
                self.park(id, park);
                Ok(true)
            }
            Settled::Done(outcome) => {
                self.finish(id, outcome);
                Ok(true)
            }
            Settled::Violation(err) => {
                warn!(scheduler = %self.name, task = %id, error = %err, "Task misused the scheduler");
                let outcome = if task.state() == TaskState::Cancelled {
                    Outcome::Cancelled
                } else {
                    Outcome::Failed(err.clone().into())
                };
                self.finish(id, outcome);
                Err(err)
            }
        }
    }

    fn park(&mut self, id: TaskId, park: Park<V>) {
        let now = self.clock.now();
        match park {
            Park::Yield(value) => {
                if let Some(value) = value {
                    self.entries[idx(id)].last_value = Some(value);
                }
                self.wake(id, Resume::Deliver(Delivery::Resumed));
            }
            Park::Sleep(duration) => {
                let generation = self.suspend_on(id, Wait::Timer);
                self.timers.push(Timer {
                    deadline: now.saturating_add(duration),
                    task: id,
                    generation,
                    kind: TimerKind::Wake,
                });
            }
            Park::Input { timeout } => {
                let generation = self.suspend_on(id, Wait::Input);
                self.arm_timeout(id, generation, timeout);
            }
            Park::Join { target, timeout } => self.park_join(id, target, timeout),
        }
    }

    fn arm_timeout(&mut self, id: TaskId, generation: u64, timeout: Option<Duration>) {
        if let Some(limit) = timeout {
            self.timers.push(Timer {
                deadline: self.clock.now().saturating_add(limit),
                task: id,
                generation,
                kind: TimerKind::Timeout(limit),
            });
        }
    }

    fn park_join(&mut self, id: TaskId, target: TaskId, timeout: Option<Duration>) {
        if self.entry(target).is_err() {
            self.wake(id, Resume::Throw(UsageError::UnknownTask(target).into()));
            return;
        }
        if self.entries[idx(target)].is_done() {
            let resume = self.observe(target);
            self.wake(id, resume);
            return;
        }
        if let Some(path) = self.wait_path(target, id) {
            let mut cycle = Vec::with_capacity(path.len() + 1);
            cycle.push(id);
            cycle.extend(path);
            warn!(scheduler = %self.name, task = %id, target = %target, "Join would deadlock");
            self.wake(id, Resume::Throw(UsageError::WaitCycle(cycle).into()));
            return;
        }
        let generation = self.suspend_on(id, Wait::Join(target));
        self.entries[idx(target)].awaiters.push(id);
        self.arm_timeout(id, generation, timeout);
    }

    /// Path of wait edges from `from` to `to`, both included.
    fn wait_path(&self, from: TaskId, to: TaskId) -> Option<Vec<TaskId>> {
        let mut seen = HashSet::new();
        let mut stack = vec![vec![from]];
        while let Some(path) = stack.pop() {
            let node = *path.last()?;
            if node == to {
                return Some(path);
            }
            if !seen.insert(node) {
                continue;
            }
            for next in self.wait_edges(node) {
                let mut extended = path.clone();
                extended.push(next);
                stack.push(extended);
            }
        }
        None
    }

    fn wait_edges(&self, id: TaskId) -> Vec<TaskId> {
        let entry = &self.entries[idx(id)];
        if entry.is_done() {
            return Vec::new();
        }
        match (&entry.kind, entry.wait) {
            (Kind::Gather(children), _) => children
                .iter()
                .copied()
                .filter(|c| !self.entries[idx(*c)].is_done())
                .collect(),
            (Kind::Coroutine(_), Wait::Join(target)) => vec![target],
            (Kind::Coroutine(_), _) => Vec::new(),
        }
    }

    /// Resumption that hands a finished target's outcome to a joiner.
    fn observe(&mut self, target: TaskId) -> Resume<V> {
        if let Some(error) = self.failure_of(target) {
            return Resume::Throw(error);
        }
        match &self.entries[idx(target)].outcome {
            Some(Outcome::Value(value)) => Resume::Deliver(Delivery::Value(value.clone())),
            Some(Outcome::Values(values)) => Resume::Deliver(Delivery::Values(values.clone())),
            _ => Resume::Throw(UsageError::NotFinished(target).into()),
        }
    }

    /// Failure or cancellation of `id`, marking it observed.
    fn failure_of(&mut self, id: TaskId) -> Option<TaskError> {
        let entry = &mut self.entries[idx(id)];
        let error = match &entry.outcome {
            Some(Outcome::Failed(error)) => error.clone(),
            Some(Outcome::Cancelled) => TaskError::Cancelled(id),
            _ => return None,
        };
        entry.observed = true;
        Some(error)
    }

    fn finish(&mut self, id: TaskId, outcome: Outcome<V>) {
        let completion_index = self.completed;
        self.completed += 1;

        let entry = &mut self.entries[idx(id)];
        entry.state = outcome.state();
        match &outcome {
            Outcome::Failed(error) => {
                debug!(scheduler = %self.name, task = %id, %error, "Task failed");
            }
            _ => debug!(scheduler = %self.name, task = %id, state = %entry.state, "Task finished"),
        }
        if let Kind::Coroutine(slot) = &mut entry.kind {
            *slot = None;
        }
        entry.outcome = Some(outcome);
        entry.wait = Wait::Idle;
        entry.generation += 1;
        entry.resume = None;
        entry.completion_index = Some(completion_index);
        let awaiters = mem::take(&mut entry.awaiters);

        for awaiter in awaiters {
            self.notify(awaiter, id);
        }
    }

    fn notify(&mut self, awaiter: TaskId, target: TaskId) {
        let entry = &self.entries[idx(awaiter)];
        if entry.is_done() {
            return;
        }
        match entry.kind {
            Kind::Gather(_) => self.settle_gather(awaiter),
            Kind::Coroutine(_) if entry.wait == Wait::Join(target) => {
                let resume = self.observe(target);
                self.wake(awaiter, resume);
            }
            Kind::Coroutine(_) => {}
        }
    }

    /// Resolve a gather if it has a failed child or all children completed.
    fn settle_gather(&mut self, gather: TaskId) {
        let entry = &self.entries[idx(gather)];
        if entry.is_done() {
            return;
        }
        let Kind::Gather(children) = &entry.kind else {
            return;
        };
        let children = children.clone();

        if let Some(error) = children.iter().find_map(|c| self.failure_of(*c)) {
            self.finish(gather, Outcome::Failed(error));
            return;
        }
        let values: Option<Vec<V>> = children
            .iter()
            .map(|c| match &self.entries[idx(*c)].outcome {
                Some(Outcome::Value(value)) => Some(value.clone()),
                _ => None,
            })
            .collect();
        if let Some(values) = values {
            self.finish(gather, Outcome::Values(values));
        }
    }

    fn take_unhandled(&mut self) -> Vec<UnhandledFailure> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(index, entry)| match &entry.outcome {
                Some(Outcome::Failed(error)) if !entry.observed && !entry.reported => {
                    entry.reported = true;
                    Some(UnhandledFailure {
                        task: TaskId::new(index as u64),
                        error: error.clone(),
                    })
                }
                _ => None,
            })
            .collect()
    }
}

impl<V> fmt::Debug for Scheduler<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("tasks", &self.entries.len())
            .field("ready", &self.ready.len())
            .field("timers", &self.timers.len())
            .field("now", &self.clock.now())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_fifo_interleaving() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut sched = Scheduler::<()>::new();
        for name in ["a", "b"] {
            let log = Rc::clone(&log);
            sched.submit(move |ctx| {
                log.borrow_mut().push(format!("{name}1"));
                ctx.yield_now()?;
                log.borrow_mut().push(format!("{name}2"));
                Ok(())
            });
        }
        let report = sched.run().unwrap();
        assert_eq!(*log.borrow(), vec!["a1", "b1", "a2", "b2"]);
        assert_eq!(report.steps, 4);
        assert_eq!(report.elapsed, Duration::ZERO);
    }

    #[test]
    fn test_timers_fire_by_deadline_then_submission() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut sched = Scheduler::<()>::new();
        for (name, delay) in [("t0", 3), ("t1", 2), ("t2", 1), ("t3", 2)] {
            let log = Rc::clone(&log);
            sched.submit(move |ctx| {
                ctx.sleep(secs(delay))?;
                log.borrow_mut().push(name);
                Ok(())
            });
        }
        sched.run().unwrap();
        assert_eq!(*log.borrow(), vec!["t2", "t1", "t3", "t0"]);
        assert_eq!(sched.now(), secs(3));
    }

    #[test]
    fn test_gather_first_failure_wins() {
        let mut sched = Scheduler::<u32>::new();
        let slow = sched.submit(|ctx| ctx.recv().map_err(Into::into));
        let idle = sched.submit(|ctx| ctx.recv().map_err(Into::into));
        let broken = sched.submit(|_| anyhow::bail!("connection refused"));
        let gather = sched.gather(&[slow, idle, broken]).unwrap();

        let report = sched.run_until_complete([gather]).unwrap();
        match sched.gather_result(gather) {
            Err(TaskError::Failed { task, .. }) => assert_eq!(task, broken.id()),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(sched.state(slow), Some(TaskState::Suspended));
        assert_eq!(sched.state(idle), Some(TaskState::Suspended));
        // The child failure was observed by the gather; the gather itself was not awaited.
        assert_eq!(report.unhandled.len(), 1);
        assert_eq!(report.unhandled[0].task, gather.id());
    }

    #[test]
    fn test_empty_gather_resolves_immediately() {
        let mut sched = Scheduler::<u32>::new();
        let gather = sched.gather(&[]).unwrap();
        assert_eq!(sched.state(gather), Some(TaskState::Completed));
        assert_eq!(sched.gather_result(gather).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_join_cycle_is_reported() {
        let mut sched = Scheduler::<u32>::new();
        let first = Rc::new(Cell::new(None::<TaskHandle>));
        let slot = Rc::clone(&first);
        let a = sched.submit(move |ctx| {
            let b = ctx.spawn(move |ctx| {
                let a = slot.get().ok_or_else(|| anyhow::anyhow!("missing handle"))?;
                match ctx.join(a) {
                    Err(TaskError::Usage(UsageError::WaitCycle(_))) => Ok(7),
                    other => anyhow::bail!("expected a cycle, got {other:?}"),
                }
            })?;
            Ok(ctx.join(b)? + 1)
        });
        first.set(Some(a));
        sched.run_until_complete([a]).unwrap();
        assert_eq!(sched.result(a).unwrap(), 8);
    }

    #[test]
    fn test_stall_then_send() {
        let mut sched = Scheduler::<String>::new();
        let echo = sched.submit(|ctx| Ok(ctx.recv()?.to_uppercase()));

        let err = sched.run_until_complete([echo]).unwrap_err();
        assert_eq!(err, UsageError::Stalled(vec![echo.id()]));

        sched.send(echo, "ping".to_string()).unwrap();
        sched.run_until_complete([echo]).unwrap();
        assert_eq!(sched.result(echo).unwrap(), "PING");
    }

    #[test]
    fn test_send_misuse() {
        let mut sched = Scheduler::<u8>::new();
        let sleeper = sched.submit(|ctx| {
            ctx.sleep(secs(1))?;
            Ok(1)
        });
        assert_eq!(
            sched.send(sleeper, 0),
            Err(UsageError::InputBeforeStart(sleeper.id()))
        );
        let warmup = sched.submit(|_| Ok(0));
        sched.run_until_complete([warmup]).unwrap();
        assert_eq!(
            sched.send(sleeper, 0),
            Err(UsageError::NotAwaitingInput(sleeper.id()))
        );
        sched.run().unwrap();
        assert!(matches!(
            sched.send(sleeper, 0),
            Err(UsageError::Finished { .. })
        ));
    }

    #[test]
    fn test_join_timeout_leaves_target_running() {
        let mut sched = Scheduler::<&'static str>::new();
        let slow = sched.submit(|ctx| {
            ctx.sleep(secs(10))?;
            Ok("slow")
        });
        let impatient = sched.submit(move |ctx| match ctx.join_timeout(slow, secs(1)) {
            Err(err) if err.is_timed_out() => Ok("gave up"),
            other => anyhow::bail!("expected timeout, got {other:?}"),
        });
        sched.run_until_complete([impatient]).unwrap();
        assert_eq!(sched.result(impatient).unwrap(), "gave up");
        assert_eq!(sched.now(), secs(1));
        assert_eq!(sched.state(slow), Some(TaskState::Suspended));

        sched.run().unwrap();
        assert_eq!(sched.result(slow).unwrap(), "slow");
        assert_eq!(sched.now(), secs(10));
    }

    #[test]
    fn test_cancel_suspended_task_runs_cleanup() {
        let ticks = Rc::new(Cell::new(0));
        let cleaned = Rc::new(Cell::new(false));
        let mut sched = Scheduler::<()>::new();
        let (t, c) = (Rc::clone(&ticks), Rc::clone(&cleaned));
        let ticker = sched.submit(move |ctx| {
            let outcome = loop {
                if let Err(err) = ctx.sleep(secs(1)) {
                    break err;
                }
                t.set(t.get() + 1);
            };
            c.set(true);
            Err(outcome.into())
        });
        let timer = sched.submit(|ctx| ctx.sleep(Duration::from_millis(2500)).map_err(Into::into));
        sched.run_until_complete([timer]).unwrap();
        assert_eq!(ticks.get(), 2);

        assert!(sched.cancel(ticker).unwrap());
        let report = sched.run_until_complete([ticker]).unwrap();
        assert!(cleaned.get());
        assert_eq!(sched.state(ticker), Some(TaskState::Cancelled));
        assert!(matches!(sched.result(ticker), Err(TaskError::Cancelled(_))));
        assert!(report.is_clean());
        assert!(!sched.cancel(ticker).unwrap());
    }

    #[test]
    fn test_cancel_before_start() {
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        let mut sched = Scheduler::<()>::new();
        let task = sched.submit(move |_| {
            flag.set(true);
            Ok(())
        });
        assert!(sched.cancel(task).unwrap());
        sched.run().unwrap();
        assert!(!ran.get());
        assert_eq!(sched.state(task), Some(TaskState::Cancelled));
    }

    #[test]
    fn test_ignoring_cancellation_is_usage_error() {
        let mut sched = Scheduler::<()>::new();
        let stubborn = sched.submit(|ctx| loop {
            let _ = ctx.sleep(secs(1));
        });
        let warmup = sched.submit(|_| Ok(()));
        sched.run_until_complete([warmup]).unwrap();
        sched.cancel(stubborn).unwrap();
        let err = sched.run_until_complete([stubborn]).unwrap_err();
        assert_eq!(err, UsageError::SuspendedAfterCancel(stubborn.id()));
        assert_eq!(sched.state(stubborn), Some(TaskState::Cancelled));
    }

    #[test]
    fn test_awaited_failure_is_not_reported() {
        let mut sched = Scheduler::<u32>::new();
        let parent = sched.submit(|ctx| {
            let child = ctx.spawn(|_| anyhow::bail!("bad input"))?;
            match ctx.join(child) {
                Err(TaskError::Failed { .. }) => Ok(0),
                other => anyhow::bail!("expected failure, got {other:?}"),
            }
        });
        let orphan = sched.submit(|_| anyhow::bail!("nobody listens"));
        let report = sched.run().unwrap();
        assert_eq!(sched.result(parent).unwrap(), 0);
        let tasks: Vec<TaskId> = report.unhandled.iter().map(|u| u.task).collect();
        assert_eq!(tasks, vec![orphan.id()]);

        // Reported once only.
        assert!(sched.run().unwrap().is_clean());
    }

    #[test]
    fn test_last_value_tracks_yields() {
        let mut sched = Scheduler::<u32>::new();
        let counter = sched.submit(|ctx| {
            for n in 1..=3 {
                ctx.yield_value(n * 10)?;
            }
            Ok(0)
        });
        sched.run().unwrap();
        assert_eq!(sched.last_value(counter), Some(&30));
    }

    #[test]
    fn test_as_completed_follows_finish_order() {
        let mut sched = Scheduler::<u64>::new();
        let handles: Vec<TaskHandle> = [3, 1, 2]
            .into_iter()
            .map(|delay| {
                sched.submit(move |ctx| {
                    ctx.sleep(secs(delay))?;
                    Ok(delay)
                })
            })
            .collect();
        sched.run().unwrap();
        let values: Vec<u64> = sched
            .as_completed(&handles)
            .unwrap()
            .map(|record| record.into_result().unwrap())
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(sched.collect_ordered(&handles).unwrap(), vec![3, 1, 2]);
    }

    #[test]
    fn test_records_require_finished_tasks() {
        let mut sched = Scheduler::<u8>::new();
        let task = sched.submit(|_| Ok(1));
        assert_eq!(
            sched.record(task).unwrap_err(),
            UsageError::NotFinished(task.id())
        );
        assert!(matches!(
            sched.result(task),
            Err(TaskError::Usage(UsageError::NotFinished(_)))
        ));
    }
}
