//! Worker pool configuration.

use serde::{Deserialize, Serialize};

/// Upper bound of the default worker count.
pub const MAX_DEFAULT_WORKERS: usize = 32;

/// `min(32, cpus + 4)`: enough threads to overlap I/O-bound units without
/// oversubscribing large machines.
#[must_use]
pub fn default_worker_count() -> usize {
    MAX_DEFAULT_WORKERS.min(num_cpus::get() + 4)
}

fn default_thread_name_prefix() -> String {
    "coop-worker".into()
}

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of worker threads; the concurrency bound.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Maximum queued units before `submit` rejects with `QueueFull`.
    /// `None` queues without limit.
    #[serde(default)]
    pub max_queue_depth: Option<usize>,
    /// Stack size of worker threads in bytes. `None` keeps the platform default.
    #[serde(default)]
    pub thread_stack_size: Option<usize>,
    /// Worker threads are named `{prefix}-{index}`.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_queue_depth: None,
            thread_stack_size: None,
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

impl WorkerPoolConfig {
    /// Configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Bound the queue.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = Some(depth);
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = Some(bytes);
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Name of the worker thread at `worker_id`.
    #[must_use]
    pub fn thread_name(&self, worker_id: usize) -> String {
        format!("{}-{worker_id}", self.thread_name_prefix)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// A description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.max_queue_depth == Some(0) {
            return Err("max_queue_depth must be greater than 0 when set".into());
        }
        if self.thread_stack_size == Some(0) {
            return Err("thread_stack_size must be greater than 0 when set".into());
        }
        if self.thread_name_prefix.trim().is_empty() {
            return Err("thread_name_prefix must not be empty".into());
        }
        Ok(())
    }
}
