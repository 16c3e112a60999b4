//! Error types for task, scheduler and pool operations.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::core::task::{TaskId, TaskState};

/// Misuse of the task or scheduler API. Always fatal to the call that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    /// A task that never ran was resumed with a value; there is no suspension
    /// point to receive it.
    #[error("{0} has not started; the first resume must not carry input")]
    InputBeforeStart(TaskId),
    /// The task already reached a terminal state.
    #[error("{task} is already {state}")]
    Finished {
        /// Offending task.
        task: TaskId,
        /// Its terminal state.
        state: TaskState,
    },
    /// The task is executing and cannot be re-entered.
    #[error("{0} is already running")]
    AlreadyRunning(TaskId),
    /// The body suspended again after a cancellation was injected.
    #[error("{0} suspended again after cancellation")]
    SuspendedAfterCancel(TaskId),
    /// A value was sent to a task that is not waiting for input.
    #[error("{0} is not waiting for input")]
    NotAwaitingInput(TaskId),
    /// The identifier does not belong to this scheduler.
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
    /// A result was requested before the task reached a terminal state.
    #[error("{0} has not finished")]
    NotFinished(TaskId),
    /// The result of a unit was already taken by an earlier retrieval.
    #[error("result of {0} was already taken")]
    ResultTaken(TaskId),
    /// A join would close a cycle of tasks waiting on each other.
    #[error("cyclic wait between {}", join_ids(.0))]
    WaitCycle(Vec<TaskId>),
    /// Nothing is runnable and no timer is pending, yet requested tasks are open.
    #[error("no runnable task and no pending timer; still waiting: {}", join_ids(.0))]
    Stalled(Vec<TaskId>),
    /// The task was resumed with a value of the wrong kind.
    #[error("{0} was resumed with an unexpected value")]
    UnexpectedResume(TaskId),
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Outcome of a task or unit of work that did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// API misuse surfaced at a suspension point or on retrieval.
    #[error(transparent)]
    Usage(#[from] UsageError),
    /// The body returned an error or panicked.
    #[error("{task} failed: {cause}")]
    Failed {
        /// Task or unit that raised the failure.
        task: TaskId,
        /// Cause chain, as raised by the body.
        #[source]
        cause: Failure,
    },
    /// A bounded wait expired before its condition was met.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    /// The task was cancelled while suspended (or before it started).
    #[error("{0} was cancelled")]
    Cancelled(TaskId),
    /// A queued pool unit was cancelled before any worker picked it up.
    #[error("{0} was cancelled before it started")]
    NotStarted(TaskId),
}

impl TaskError {
    /// Task that originated this error, if it carries one.
    #[must_use]
    pub const fn task(&self) -> Option<TaskId> {
        match self {
            Self::Failed { task, .. } | Self::Cancelled(task) | Self::NotStarted(task) => {
                Some(*task)
            }
            Self::Usage(_) | Self::TimedOut(_) => None,
        }
    }

    /// True for cancellation outcomes, as opposed to failures.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::NotStarted(_))
    }

    /// True if this error, or any failure in its cause chain, is a timeout.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        match self {
            Self::TimedOut(_) => true,
            Self::Failed { cause, .. } => cause
                .downcast_ref::<Self>()
                .is_some_and(Self::is_timed_out),
            _ => false,
        }
    }
}

/// Result alias for task-level outcomes.
pub type TaskResult<T> = Result<T, TaskError>;

/// Application-facing result using anyhow, returned by task bodies and pool units.
pub type AppResult<T> = Result<T, anyhow::Error>;

/// Cloneable failure cause.
///
/// A stored failure is re-raised at every boundary that observes it (joins,
/// gathers, retrievals), so it has to be shareable. The full `anyhow` chain is
/// kept behind an `Arc`.
#[derive(Clone)]
pub struct Failure(Arc<anyhow::Error>);

impl Failure {
    /// Wrap an application error.
    #[must_use]
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    /// Failure carrying only a message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::new(anyhow::Error::msg(message))
    }

    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::msg(format!("panicked: {message}"))
    }

    /// Find the first error of type `E` in the cause chain.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.0.chain().find_map(|e| e.downcast_ref::<E>())
    }

    /// Iterate over the cause chain, outermost first.
    #[must_use]
    pub fn chain(&self) -> anyhow::Chain<'_> {
        self.0.chain()
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl StdError for Failure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        (**self.0).source()
    }
}

impl From<anyhow::Error> for Failure {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}
