//! Configuration models for the scheduler and the worker pool.

pub mod pool;
pub mod scheduler;

pub use pool::{default_worker_count, WorkerPoolConfig};
pub use scheduler::{RuntimeConfig, SchedulerConfig};
