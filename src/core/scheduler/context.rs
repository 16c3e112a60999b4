//! Task-side surface of the cooperative scheduler.

use std::time::Duration;

use crate::core::error::{AppResult, TaskError, TaskResult, UsageError};
use crate::core::task::{Suspender, TaskId};

use super::{GatherHandle, TaskHandle};

/// Boxed task body as stored by the scheduler.
pub(crate) type Body<V> = Box<dyn FnOnce(&TaskContext<'_, V>) -> AppResult<V>>;

/// What a task asks of the scheduler when it suspends.
pub(crate) enum Request<V> {
    /// Create a sibling task; answered immediately without yielding.
    Spawn(Body<V>),
    /// Create a gather pseudo-task; answered immediately without yielding.
    Gather(Vec<TaskId>),
    /// Give up control until the wait condition is met.
    Park(Park<V>),
}

impl<V> Request<V> {
    /// Requests served without giving up control.
    pub(crate) const fn is_inline(&self) -> bool {
        matches!(self, Self::Spawn(_) | Self::Gather(_))
    }
}

/// Wait conditions.
pub(crate) enum Park<V> {
    Yield(Option<V>),
    Sleep(Duration),
    Input { timeout: Option<Duration> },
    Join { target: TaskId, timeout: Option<Duration> },
}

/// Values delivered back into a suspended task.
pub(crate) enum Delivery<V> {
    Resumed,
    Value(V),
    Values(Vec<V>),
    Spawned(TaskId),
}

/// Handle passed to every task body submitted to a [`Scheduler`](super::Scheduler).
///
/// Every method is a suspension point except where noted. Each returns the
/// failure injected at that point: a cancellation, a timeout, or the failure
/// of an awaited task. Propagating it with `?` is the usual response.
pub struct TaskContext<'a, V> {
    suspender: &'a Suspender<'a, Delivery<V>, Request<V>>,
}

impl<'a, V: 'static> TaskContext<'a, V> {
    pub(crate) const fn new(suspender: &'a Suspender<'a, Delivery<V>, Request<V>>) -> Self {
        Self { suspender }
    }

    /// Handle of the running task.
    #[must_use]
    pub const fn handle(&self) -> TaskHandle {
        TaskHandle(self.suspender.id())
    }

    fn request(&self, request: Request<V>) -> TaskResult<Delivery<V>> {
        self.suspender
            .suspend(request)?
            .ok_or_else(|| self.unexpected())
    }

    fn park(&self, park: Park<V>) -> TaskResult<Delivery<V>> {
        self.request(Request::Park(park))
    }

    fn unexpected(&self) -> TaskError {
        UsageError::UnexpectedResume(self.suspender.id()).into()
    }

    fn resumed(&self, delivery: Delivery<V>) -> TaskResult<()> {
        match delivery {
            Delivery::Resumed => Ok(()),
            _ => Err(self.unexpected()),
        }
    }

    fn value(&self, delivery: Delivery<V>) -> TaskResult<V> {
        match delivery {
            Delivery::Value(value) => Ok(value),
            _ => Err(self.unexpected()),
        }
    }

    fn values(&self, delivery: Delivery<V>) -> TaskResult<Vec<V>> {
        match delivery {
            Delivery::Values(values) => Ok(values),
            _ => Err(self.unexpected()),
        }
    }

    /// Give other runnable tasks a turn.
    ///
    /// # Errors
    ///
    /// Injected cancellation.
    pub fn yield_now(&self) -> TaskResult<()> {
        let delivery = self.park(Park::Yield(None))?;
        self.resumed(delivery)
    }

    /// Publish `value` as this task's latest output and give other tasks a turn.
    ///
    /// # Errors
    ///
    /// Injected cancellation.
    pub fn yield_value(&self, value: V) -> TaskResult<()> {
        let delivery = self.park(Park::Yield(Some(value)))?;
        self.resumed(delivery)
    }

    /// Suspend until the scheduler clock has advanced by `duration`.
    ///
    /// # Errors
    ///
    /// Injected cancellation.
    pub fn sleep(&self, duration: Duration) -> TaskResult<()> {
        let delivery = self.park(Park::Sleep(duration))?;
        self.resumed(delivery)
    }

    /// Suspend until the caller sends a value with
    /// [`Scheduler::send`](super::Scheduler::send).
    ///
    /// # Errors
    ///
    /// Injected cancellation.
    pub fn recv(&self) -> TaskResult<V> {
        let delivery = self.park(Park::Input { timeout: None })?;
        self.value(delivery)
    }

    /// Like [`recv`](Self::recv), giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// `TaskError::TimedOut` on expiry, or injected cancellation.
    pub fn recv_timeout(&self, timeout: Duration) -> TaskResult<V> {
        let delivery = self.park(Park::Input {
            timeout: Some(timeout),
        })?;
        self.value(delivery)
    }

    /// Suspend until `task` finishes and return its value.
    ///
    /// # Errors
    ///
    /// The awaited task's failure or cancellation, `UsageError::WaitCycle` if
    /// the join would deadlock, or injected cancellation.
    pub fn join(&self, task: TaskHandle) -> TaskResult<V> {
        let delivery = self.park(Park::Join {
            target: task.id(),
            timeout: None,
        })?;
        self.value(delivery)
    }

    /// Like [`join`](Self::join), giving up after `timeout`. The awaited task
    /// keeps running.
    ///
    /// # Errors
    ///
    /// As [`join`](Self::join), plus `TaskError::TimedOut`.
    pub fn join_timeout(&self, task: TaskHandle, timeout: Duration) -> TaskResult<V> {
        let delivery = self.park(Park::Join {
            target: task.id(),
            timeout: Some(timeout),
        })?;
        self.value(delivery)
    }

    /// Submit a new task. Does not give up control; the new task is queued
    /// behind the tasks that are already runnable.
    ///
    /// # Errors
    ///
    /// Injected cancellation.
    pub fn spawn<F>(&self, body: F) -> TaskResult<TaskHandle>
    where
        F: FnOnce(&TaskContext<'_, V>) -> AppResult<V> + 'static,
    {
        match self.request(Request::Spawn(Box::new(body)))? {
            Delivery::Spawned(id) => Ok(TaskHandle(id)),
            _ => Err(self.unexpected()),
        }
    }

    /// Create a gather over `tasks` without waiting on it. Does not give up
    /// control.
    ///
    /// # Errors
    ///
    /// `UsageError::UnknownTask` for a foreign handle, or injected cancellation.
    pub fn gather_handle(&self, tasks: &[TaskHandle]) -> TaskResult<GatherHandle> {
        let children = tasks.iter().map(|t| t.id()).collect();
        match self.request(Request::Gather(children))? {
            Delivery::Spawned(id) => Ok(GatherHandle(id)),
            _ => Err(self.unexpected()),
        }
    }

    /// Wait for all of `tasks` and return their values in the given order.
    ///
    /// # Errors
    ///
    /// The first failure observed among the tasks, without waiting for the
    /// rest.
    pub fn gather(&self, tasks: &[TaskHandle]) -> TaskResult<Vec<V>> {
        let gather = self.gather_handle(tasks)?;
        self.join_all(gather)
    }

    /// Suspend until `gather` resolves.
    ///
    /// # Errors
    ///
    /// As [`gather`](Self::gather).
    pub fn join_all(&self, gather: GatherHandle) -> TaskResult<Vec<V>> {
        let delivery = self.park(Park::Join {
            target: gather.id(),
            timeout: None,
        })?;
        self.values(delivery)
    }

    /// Like [`join_all`](Self::join_all), giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// As [`gather`](Self::gather), plus `TaskError::TimedOut`.
    pub fn join_all_timeout(&self, gather: GatherHandle, timeout: Duration) -> TaskResult<Vec<V>> {
        let delivery = self.park(Park::Join {
            target: gather.id(),
            timeout: Some(timeout),
        })?;
        self.values(delivery)
    }
}

impl<V> std::fmt::Debug for TaskContext<'_, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.suspender.id())
            .finish()
    }
}
