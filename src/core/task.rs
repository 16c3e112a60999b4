//! Suspendable tasks backed by stackful coroutines.
//!
//! A [`Task`] wraps a body that can pause at explicit suspension points and be
//! resumed later with an injected value, an injected failure, or a
//! cancellation signal. The body runs on its own stack (`corosensei`), so a
//! suspension point is an ordinary function call on the [`Suspender`] handed to
//! the body: no generator syntax or async lowering is involved.
//!
//! ```rust,ignore
//! use coop_runtime::core::{Step, Task};
//!
//! // A consumer coroutine: prime it, then push values in.
//! let mut grep = Task::new(|s: &Suspender<String, ()>| {
//!     let mut hits = 0;
//!     loop {
//!         match s.suspend(())? {
//!             Some(line) if line.contains("coroutine") => hits += 1,
//!             _ => {}
//!         }
//!         if hits == 2 {
//!             return Ok(hits);
//!         }
//!     }
//! });
//! grep.resume(None)?; // prime
//! grep.resume(Some("I love coding".into()))?;
//! ```

use std::fmt;
use std::iter::FusedIterator;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use corosensei::{Coroutine, CoroutineResult, Yielder};
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

use crate::core::error::{AppResult, Failure, TaskError, TaskResult, UsageError};

/// Unique identifier of a task or unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

impl TaskId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Allocate a process-wide unique identifier for a free-standing task.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, body not entered yet.
    Created,
    /// Body is executing. Never observed between scheduler steps.
    Running,
    /// Paused at a suspension point.
    Suspended,
    /// Body returned a value.
    Completed,
    /// Body returned an error or panicked.
    Failed,
    /// Cancelled before or at a suspension point.
    Cancelled,
}

impl TaskState {
    /// Terminal states admit no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal edge of the state machine.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created | Self::Suspended, Self::Running | Self::Cancelled)
                | (Self::Created, Self::Failed)
                | (
                    Self::Running,
                    Self::Suspended | Self::Completed | Self::Failed | Self::Cancelled
                )
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Result of driving a task for one step.
#[derive(Debug)]
pub enum Step<Y, R> {
    /// The body reached a suspension point and produced a value.
    Suspended(Y),
    /// The body returned normally.
    Completed(R),
    /// The body failed.
    Failed(TaskError),
    /// The body observed a cancellation and finished.
    Cancelled,
}

/// What the coroutine receives when control transfers into it.
enum Signal<I> {
    Start,
    Send(Option<I>),
    Throw(TaskError),
    Cancel,
}

/// Handle given to a task body for suspending itself.
pub struct Suspender<'s, I, Y> {
    inner: &'s Yielder<Signal<I>, Y>,
    task: TaskId,
}

impl<I, Y> Suspender<'_, I, Y> {
    /// Identifier of the task this suspender belongs to.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.task
    }

    /// Pause the body, handing `value` to whoever resumed it.
    ///
    /// Returns the injected input (`None` for a plain resume), or the failure
    /// or cancellation injected at this point.
    ///
    /// # Errors
    ///
    /// - `TaskError::Cancelled` when the task is being cancelled
    /// - any error passed to [`Task::throw`]
    pub fn suspend(&self, value: Y) -> TaskResult<Option<I>> {
        match self.inner.suspend(value) {
            Signal::Send(input) => Ok(input),
            Signal::Throw(error) => Err(error),
            Signal::Cancel => Err(TaskError::Cancelled(self.task)),
            Signal::Start => Err(UsageError::UnexpectedResume(self.task).into()),
        }
    }
}

impl<I, Y> fmt::Debug for Suspender<'_, I, Y> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspender").field("task", &self.task).finish()
    }
}

/// A suspendable unit of work.
///
/// `I` is the type injected on resume, `Y` the type produced at each
/// suspension point and `R` the return type of the body.
pub struct Task<I, Y, R> {
    id: TaskId,
    state: TaskState,
    co: Option<Coroutine<Signal<I>, Y, AppResult<R>>>,
    cancelling: bool,
    inline: Option<fn(&Y) -> bool>,
}

impl<I, Y, R> Task<I, Y, R>
where
    I: 'static,
    Y: 'static,
    R: 'static,
{
    /// Create a task with a fresh identifier. The body does not run yet.
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(&Suspender<'_, I, Y>) -> AppResult<R> + 'static,
    {
        Self::with_id(TaskId::next(), body)
    }

    /// Create a task with an explicit identifier. The body does not run yet.
    pub fn with_id<F>(id: TaskId, body: F) -> Self
    where
        F: FnOnce(&Suspender<'_, I, Y>) -> AppResult<R> + 'static,
    {
        let co = Coroutine::new(move |yielder: &Yielder<Signal<I>, Y>, _start: Signal<I>| {
            let suspender = Suspender {
                inner: yielder,
                task: id,
            };
            body(&suspender)
        });
        Self {
            id,
            state: TaskState::Created,
            co: Some(co),
            cancelling: false,
            inline: None,
        }
    }

    /// Treat yields matching `is_inline` as requests the driver answers on
    /// the spot rather than as suspensions. They remain legal while the body
    /// runs cancellation cleanup.
    #[must_use]
    pub fn with_inline_yields(mut self, is_inline: fn(&Y) -> bool) -> Self {
        self.inline = Some(is_inline);
        self
    }

    /// Identifier of this task.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> TaskState {
        self.state
    }

    /// Whether the task reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Transfer control into the body, injecting `input` at the pending
    /// suspension point. The first resume starts the body and must carry no
    /// input.
    ///
    /// # Errors
    ///
    /// - `UsageError::InputBeforeStart` for input on a task that never ran
    /// - `UsageError::Finished` if the task is terminal
    pub fn resume(&mut self, input: Option<I>) -> Result<Step<Y, R>, UsageError> {
        match self.state {
            TaskState::Created if input.is_some() => Err(UsageError::InputBeforeStart(self.id)),
            TaskState::Created => self.drive(Signal::Start),
            TaskState::Suspended => self.drive(Signal::Send(input)),
            TaskState::Running => Err(UsageError::AlreadyRunning(self.id)),
            state => Err(UsageError::Finished {
                task: self.id,
                state,
            }),
        }
    }

    /// Raise `error` inside the body at its pending suspension point.
    ///
    /// A task that never ran fails immediately with `error`, without entering
    /// its body.
    ///
    /// # Errors
    ///
    /// `UsageError::Finished` if the task is terminal.
    pub fn throw(&mut self, error: TaskError) -> Result<Step<Y, R>, UsageError> {
        match self.state {
            TaskState::Created => {
                self.co = None;
                self.transition(TaskState::Failed);
                Ok(Step::Failed(error))
            }
            TaskState::Suspended => self.drive(Signal::Throw(error)),
            TaskState::Running => Err(UsageError::AlreadyRunning(self.id)),
            state => Err(UsageError::Finished {
                task: self.id,
                state,
            }),
        }
    }

    /// Inject a cancellation at the pending suspension point.
    ///
    /// The body sees `TaskError::Cancelled` from its suspension call and may
    /// run cleanup, but must not suspend again apart from inline yields (see
    /// [`with_inline_yields`](Self::with_inline_yields)). A task that never ran is
    /// cancelled without entering its body.
    ///
    /// # Errors
    ///
    /// - `UsageError::SuspendedAfterCancel` if the body suspends again; its
    ///   stack is unwound and the task still ends cancelled
    /// - `UsageError::Finished` if the task is terminal
    pub fn cancel(&mut self) -> Result<Step<Y, R>, UsageError> {
        match self.state {
            TaskState::Created => {
                self.co = None;
                self.transition(TaskState::Cancelled);
                Ok(Step::Cancelled)
            }
            TaskState::Suspended => {
                self.cancelling = true;
                self.drive(Signal::Cancel)
            }
            TaskState::Running => Err(UsageError::AlreadyRunning(self.id)),
            state => Err(UsageError::Finished {
                task: self.id,
                state,
            }),
        }
    }

    fn drive(&mut self, signal: Signal<I>) -> Result<Step<Y, R>, UsageError> {
        let Some(mut co) = self.co.take() else {
            return Err(UsageError::Finished {
                task: self.id,
                state: self.state,
            });
        };
        self.transition(TaskState::Running);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| co.resume(signal)));

        match outcome {
            Ok(CoroutineResult::Yield(value)) if self.cancelling && !self.is_inline(&value) => {
                // Dropping a suspended coroutine unwinds its stack, running the body's destructors.
                drop(co);
                self.transition(TaskState::Cancelled);
                Err(UsageError::SuspendedAfterCancel(self.id))
            }
            Ok(CoroutineResult::Yield(value)) => {
                self.co = Some(co);
                self.transition(TaskState::Suspended);
                Ok(Step::Suspended(value))
            }
            Ok(CoroutineResult::Return(result)) => Ok(self.finish(result)),
            Err(payload) => {
                let cause = Failure::from_panic(payload.as_ref());
                error!(task = %self.id, %cause, "Task body panicked");
                self.transition(TaskState::Failed);
                Ok(Step::Failed(TaskError::Failed {
                    task: self.id,
                    cause,
                }))
            }
        }
    }

    fn is_inline(&self, value: &Y) -> bool {
        self.inline.is_some_and(|is_inline| is_inline(value))
    }

    fn finish(&mut self, result: AppResult<R>) -> Step<Y, R> {
        match result {
            Ok(_) if self.cancelling => {
                self.transition(TaskState::Cancelled);
                Step::Cancelled
            }
            Ok(value) => {
                self.transition(TaskState::Completed);
                Step::Completed(value)
            }
            Err(err) if self.cancelling && self.is_own_cancellation(&err) => {
                self.transition(TaskState::Cancelled);
                Step::Cancelled
            }
            Err(err) => {
                self.transition(TaskState::Failed);
                Step::Failed(TaskError::Failed {
                    task: self.id,
                    cause: Failure::new(err),
                })
            }
        }
    }

    fn is_own_cancellation(&self, err: &anyhow::Error) -> bool {
        err.chain()
            .filter_map(|e| e.downcast_ref::<TaskError>())
            .any(|e| matches!(e, TaskError::Cancelled(task) if *task == self.id))
    }

    fn transition(&mut self, next: TaskState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "{} unexpected {} -> {}",
            self.id,
            self.state,
            next
        );
        trace!(task = %self.id, from = %self.state, to = %next, "Task state changed");
        self.state = next;
    }
}

impl<I, Y, R> fmt::Debug for Task<I, Y, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// A task consumed through the iterator protocol.
///
/// Each suspension produces one item. After the body returns (or fails, which
/// yields a single `Err`) the generator is exhausted and keeps returning
/// `None`.
pub struct Generator<Y> {
    task: Task<(), Y, ()>,
    exhausted: bool,
}

impl<Y: 'static> Generator<Y> {
    /// Build a generator from a body that emits values through its suspender.
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(&Suspender<'_, (), Y>) -> AppResult<()> + 'static,
    {
        Self {
            task: Task::new(body),
            exhausted: false,
        }
    }

    /// Whether iteration already ended.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Close the generator, running the body's cleanup if it is paused.
    ///
    /// # Errors
    ///
    /// `UsageError::SuspendedAfterCancel` if the body tries to produce another
    /// value while closing.
    pub fn close(&mut self) -> Result<(), UsageError> {
        self.exhausted = true;
        if self.task.state() == TaskState::Suspended {
            self.task.cancel()?;
        }
        Ok(())
    }
}

impl<Y: 'static> Iterator for Generator<Y> {
    type Item = TaskResult<Y>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        match self.task.resume(None) {
            Ok(Step::Suspended(value)) => Some(Ok(value)),
            Ok(Step::Completed(()) | Step::Cancelled) => {
                self.exhausted = true;
                None
            }
            Ok(Step::Failed(err)) => {
                self.exhausted = true;
                Some(Err(err))
            }
            Err(usage) => {
                self.exhausted = true;
                Some(Err(usage.into()))
            }
        }
    }
}

impl<Y: 'static> FusedIterator for Generator<Y> {}

impl<Y> fmt::Debug for Generator<Y> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator")
            .field("task", &self.task)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}
