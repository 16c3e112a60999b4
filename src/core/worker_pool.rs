//! Bounded pool of worker threads for blocking or CPU-bound units of work.
//!
//! A unit is any `FnOnce() -> AppResult<R> + Send` closure. Submitting one
//! returns a [`ResultHandle`] immediately; the unit runs on one of a fixed
//! number of dedicated OS threads, so at most `worker_count` units execute at
//! the same time and the rest wait in FIFO order.
//!
//! - **No polling**: workers block on the queue, waiters block on a Condvar
//! - **Failure isolation**: an error or panic inside a unit becomes that
//!   unit's outcome and never takes down a worker
//! - **Clean shutdown**: dropping the queue sender lets idle workers exit
//!
//! # Example
//!
//! ```rust,ignore
//! use coop_runtime::config::WorkerPoolConfig;
//! use coop_runtime::core::{aggregate, WorkerPool};
//!
//! let pool = WorkerPool::new(WorkerPoolConfig::new().with_worker_count(4))?;
//!
//! // Results in input order, whatever order the units finish in.
//! let pages: Vec<usize> = pool
//!     .map(|url: &str| Ok(fetch(url)?.len()), urls)?
//!     .collect::<Result<_, _>>()?;
//!
//! // Or react to whichever finishes first.
//! let handles = urls.iter().map(|u| pool.submit(move || fetch(u))).collect::<Result<Vec<_>, _>>()?;
//! for handle in aggregate::as_completed(handles) {
//!     println!("{} -> {:?}", handle.id(), handle.wait());
//! }
//! pool.shutdown(true);
//! ```

mod handle;
mod native;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::task::TaskId;

pub use handle::ResultHandle;
pub use native::WorkerPool;

/// Errors that can occur when using a `WorkerPool`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The queue reached its configured depth; the unit was not accepted.
    QueueFull,

    /// The pool has been shut down.
    PoolShutdown,

    /// Configuration validation failed.
    InvalidConfig(String),

    /// Internal error (worker thread could not be spawned, etc.).
    Internal(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "work queue is full"),
            Self::PoolShutdown => write!(f, "pool has been shut down"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Lifecycle of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitPhase {
    /// Accepted, waiting for a free worker.
    Queued,
    /// Executing on a worker.
    Running,
    /// Finished with a value or a failure.
    Finished,
    /// Cancelled while still queued; never ran.
    Cancelled,
}

impl UnitPhase {
    /// Whether the unit has an outcome.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }
}

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Number of worker threads.
    pub worker_count: usize,

    /// Units currently executing.
    pub active_units: u64,

    /// Units waiting in the queue.
    pub queued_units: u64,

    /// Total units accepted.
    pub submitted_units: u64,

    /// Total units that finished with a value.
    pub completed_units: u64,

    /// Total units that finished with an error or a panic.
    pub failed_units: u64,

    /// Total units cancelled before they ran.
    pub cancelled_units: u64,
}

/// What one worker thread is doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSlot {
    /// Index of the worker.
    pub worker_id: usize,

    /// OS thread name.
    pub thread_name: String,

    /// Unit being executed, if any.
    pub current: Option<TaskId>,

    /// Units this worker ran to completion.
    pub units_run: u64,
}

impl WorkerSlot {
    /// Whether the worker is executing a unit.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.current.is_some()
    }
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub active_units: AtomicU64,
    pub queued_units: AtomicU64,
    pub submitted_units: AtomicU64,
    pub completed_units: AtomicU64,
    pub failed_units: AtomicU64,
    pub cancelled_units: AtomicU64,
    completion_seq: AtomicU64,
}

impl PoolCounters {
    /// Get a snapshot of current statistics.
    pub fn snapshot(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            active_units: self.active_units.load(Ordering::Relaxed),
            queued_units: self.queued_units.load(Ordering::Relaxed),
            submitted_units: self.submitted_units.load(Ordering::Relaxed),
            completed_units: self.completed_units.load(Ordering::Relaxed),
            failed_units: self.failed_units.load(Ordering::Relaxed),
            cancelled_units: self.cancelled_units.load(Ordering::Relaxed),
        }
    }

    /// Next position in the pool-wide completion sequence.
    pub fn next_completion(&self) -> u64 {
        self.completion_seq.fetch_add(1, Ordering::AcqRel)
    }
}
