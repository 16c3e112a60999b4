//! # coop_runtime
//!
//! Three ways of running work concurrently, with explicit suspend/resume
//! semantics instead of async lowering.
//!
//! ## Suspendable tasks
//!
//! A [`Task`](crate::core::Task) runs a closure on its own stack and pauses it at
//! explicit suspension points. The caller drives it step by step: resume with
//! an input, inject a failure, or cancel it. [`Generator`](crate::core::Generator)
//! adapts a task to the iterator protocol: one item per suspension, exhausted
//! for good once the body returns.
//!
//! ```rust,ignore
//! use coop_runtime::core::Generator;
//!
//! let squares = Generator::new(|s| {
//!     for n in 1..11_u32 {
//!         s.suspend(n * n)?;
//!     }
//!     Ok(())
//! });
//! let all: Vec<u32> = squares.map(Result::unwrap).collect();
//! ```
//!
//! ## Cooperative scheduler
//!
//! [`Scheduler`](crate::core::Scheduler) multiplexes many tasks on the calling
//! thread. Tasks sleep, wait for input, join each other and gather results;
//! each suspension hands control back to the scheduler, which resumes the next
//! runnable task in FIFO order. Sleeps use a virtual clock by default, so three
//! concurrent requests of 3s, 2s and 1s finish at t = 3s without waiting.
//!
//! ```rust,ignore
//! use coop_runtime::core::Scheduler;
//! use std::time::Duration;
//!
//! let mut sched = Scheduler::<String>::new();
//! let fetch = |name: &'static str, secs: u64| {
//!     move |ctx: &coop_runtime::core::TaskContext<'_, String>| {
//!         ctx.sleep(Duration::from_secs(secs))?;
//!         Ok(format!("Data from {name}"))
//!     }
//! };
//! let tasks = [
//!     sched.submit(fetch("API_A", 3)),
//!     sched.submit(fetch("API_B", 2)),
//!     sched.submit(fetch("Database", 1)),
//! ];
//! let all = sched.gather(&tasks)?;
//! sched.run_until_complete([all])?;
//! assert_eq!(sched.now(), Duration::from_secs(3));
//! ```
//!
//! ## Bounded worker pool
//!
//! [`WorkerPool`](crate::core::WorkerPool) runs blocking closures on a fixed set of
//! OS threads. Results come back through [`ResultHandle`](crate::core::ResultHandle)s
//! and can be collected in input order or in completion order with
//! [`aggregate`](crate::core::aggregate).
//!
//! ## Ambient stack
//!
//! - logging via `tracing`; [`util::init_tracing`] installs a subscriber
//! - errors via `thiserror` ([`crate::core::TaskError`], [`crate::core::UsageError`]) and
//!   `anyhow` for task bodies
//! - configuration via `serde` models in [`config`], loadable from JSON or
//!   `COOP_*` environment variables

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Suspendable tasks, scheduler, worker pool and aggregation.
pub mod core;
/// Configuration models for the scheduler and the worker pool.
pub mod config;
/// Shared utilities.
pub mod util;

pub use crate::config::{RuntimeConfig, SchedulerConfig, WorkerPoolConfig};
pub use crate::core::{
    Generator, PoolError, ResultHandle, Scheduler, Task, TaskContext, TaskError, TaskHandle,
    TaskId, TaskState, UsageError, WorkerPool,
};
