//! Suspendable tasks, the cooperative scheduler, the worker pool and result
//! aggregation.

pub mod aggregate;
pub mod error;
pub mod scheduler;
pub mod task;
pub mod worker_pool;

pub use aggregate::{AsCompleted, Completion, CompletedValues, Ordered, ResultRecord};
pub use error::{AppResult, Failure, TaskError, TaskResult, UsageError};
pub use scheduler::{GatherHandle, RunReport, Scheduler, TaskContext, TaskHandle, UnhandledFailure};
pub use task::{Generator, Step, Suspender, Task, TaskId, TaskState};
pub use worker_pool::{PoolError, PoolStats, ResultHandle, UnitPhase, WorkerPool, WorkerSlot};
