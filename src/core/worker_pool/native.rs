//! `WorkerPool` on dedicated OS threads.
//!
//! Workers block on a crossbeam channel; the submitter holds the only
//! sender. Shutting down drops the sender so idle workers see a closed
//! channel and exit once the queue is drained.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::WorkerPoolConfig;
use crate::core::aggregate::{self, AsCompleted, Ordered};
use crate::core::error::{AppResult, Failure, TaskError};
use crate::core::task::TaskId;

use super::handle::{Job, ResultHandle, UnitControl, UnitSlot};
use super::{PoolCounters, PoolError, PoolStats, WorkerSlot};

/// Worker pool with a fixed number of OS threads.
///
/// At most `worker_count` units run at the same time; further units queue in
/// submission order. The pool is `Sync`, so it can be shared by reference
/// or behind an `Arc` across submitting threads.
pub struct WorkerPool {
    /// Pool configuration.
    config: WorkerPoolConfig,

    /// Job sender. `None` once the pool stopped accepting work.
    job_tx: Mutex<Option<Sender<Job>>>,

    /// Kept to drain queued jobs on a non-waiting shutdown.
    job_rx: Receiver<Job>,

    /// Pool statistics counters.
    counters: Arc<PoolCounters>,

    /// Per-worker activity.
    slots: Arc<Mutex<Vec<WorkerSlot>>>,

    /// Shutdown flag.
    shutdown: AtomicBool,

    /// Worker thread handles.
    workers: Mutex<Vec<JoinHandle<()>>>,

    /// Unit ID counter.
    next_id: AtomicU64,
}

impl WorkerPool {
    /// Create a pool and start its worker threads.
    ///
    /// # Errors
    ///
    /// - `PoolError::InvalidConfig` if the configuration is invalid
    /// - `PoolError::Internal` if a worker thread could not be spawned
    pub fn new(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let (job_tx, job_rx) = match config.max_queue_depth {
            Some(depth) => bounded::<Job>(depth),
            None => unbounded::<Job>(),
        };
        let slots = Arc::new(Mutex::new(
            (0..config.worker_count)
                .map(|worker_id| WorkerSlot {
                    worker_id,
                    thread_name: config.thread_name(worker_id),
                    current: None,
                    units_run: 0,
                })
                .collect(),
        ));

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            match spawn_worker(worker_id, &config, job_rx.clone(), Arc::clone(&slots)) {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    // Closing the channel lets the workers that did start exit.
                    drop(job_tx);
                    return Err(err);
                }
            }
        }

        info!(
            worker_count = config.worker_count,
            max_queue_depth = ?config.max_queue_depth,
            "WorkerPool initialized"
        );

        Ok(Self {
            config,
            job_tx: Mutex::new(Some(job_tx)),
            job_rx,
            counters: Arc::new(PoolCounters::default()),
            slots,
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(workers),
            next_id: AtomicU64::new(0),
        })
    }

    /// Pool with `min(32, cpus + 4)` workers and an unbounded queue.
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new).
    pub fn with_defaults() -> Result<Self, PoolError> {
        Self::new(WorkerPoolConfig::default())
    }

    /// Number of worker threads.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.config.worker_count
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Submit a unit of work.
    ///
    /// Enqueueing never blocks. An error or panic inside `unit` becomes the
    /// unit's outcome.
    ///
    /// # Errors
    ///
    /// - `PoolError::QueueFull` if the configured queue depth is reached
    /// - `PoolError::PoolShutdown` if the pool has been shut down
    pub fn submit<F, R>(&self, unit: F) -> Result<ResultHandle<R>, PoolError>
    where
        F: FnOnce() -> AppResult<R> + Send + 'static,
        R: Send + 'static,
    {
        if self.is_shutdown() {
            return Err(PoolError::PoolShutdown);
        }

        let id = TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(UnitSlot::new(id, Arc::clone(&self.counters)));
        let runner = Arc::clone(&slot);
        let run = Box::new(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(unit)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => {
                    debug!(unit = %id, error = %err, "Unit failed");
                    Err(TaskError::Failed {
                        task: id,
                        cause: Failure::new(err),
                    })
                }
                Err(payload) => {
                    let cause = Failure::from_panic(payload.as_ref());
                    error!(unit = %id, %cause, "Unit panicked");
                    Err(TaskError::Failed { task: id, cause })
                }
            };
            runner.complete(outcome);
        });
        let control: Arc<dyn UnitControl> = Arc::clone(&slot) as Arc<dyn UnitControl>;
        let job = Job::new(id, control, run);

        let job_tx_guard = self.job_tx.lock();
        let Some(job_tx) = job_tx_guard.as_ref() else {
            job.disarm();
            return Err(PoolError::PoolShutdown);
        };

        // Counted before the send so a fast worker never sees a zero queue.
        self.counters.queued_units.fetch_add(1, Ordering::Relaxed);
        match job_tx.try_send(job) {
            Ok(()) => {
                self.counters.submitted_units.fetch_add(1, Ordering::Relaxed);
                debug!(unit = %id, "Unit submitted to worker pool");
                Ok(ResultHandle::new(slot))
            }
            Err(TrySendError::Full(job)) => {
                self.counters.queued_units.fetch_sub(1, Ordering::Relaxed);
                job.disarm();
                warn!(unit = %id, "Worker pool queue is full");
                Err(PoolError::QueueFull)
            }
            Err(TrySendError::Disconnected(job)) => {
                self.counters.queued_units.fetch_sub(1, Ordering::Relaxed);
                job.disarm();
                Err(PoolError::PoolShutdown)
            }
        }
    }

    /// Apply `f` to every input on the pool.
    ///
    /// The returned iterator yields outcomes in input order, waiting for each
    /// in turn. If any input cannot be submitted, the units already accepted
    /// for this call are cancelled where still queued and the error is
    /// returned.
    ///
    /// # Errors
    ///
    /// As [`submit`](Self::submit).
    pub fn map<F, T, R, I>(&self, f: F, inputs: I) -> Result<Ordered<ResultHandle<R>>, PoolError>
    where
        F: Fn(T) -> AppResult<R> + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
        T: Send + 'static,
        R: Send + 'static,
    {
        let f = Arc::new(f);
        let mut handles = Vec::new();
        for input in inputs {
            let f = Arc::clone(&f);
            match self.submit(move || f(input)) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    let cancelled = handles.iter().filter(|h| h.cancel()).count();
                    warn!(error = %err, cancelled, "map aborted; queued units cancelled");
                    return Err(err);
                }
            }
        }
        Ok(aggregate::ordered(handles))
    }

    /// Yield `handles` in the order their units finish.
    pub fn as_completed<R, I>(&self, handles: I) -> AsCompleted<ResultHandle<R>>
    where
        I: IntoIterator<Item = ResultHandle<R>>,
        R: Send + 'static,
    {
        aggregate::as_completed(handles)
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.config.worker_count)
    }

    /// Snapshot of what each worker is doing.
    #[must_use]
    pub fn slots(&self) -> Vec<WorkerSlot> {
        self.slots.lock().clone()
    }

    /// Stop accepting work.
    ///
    /// With `wait`, queued units still run and this call returns once every
    /// worker has exited. Without it, queued units are cancelled, running
    /// units finish in the background and the call returns immediately.
    /// Calling it again only adds the join when `wait` is set; concurrent
    /// waiting callers all return after the last worker exited.
    pub fn shutdown(&self, wait: bool) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            info!(wait, "Shutting down worker pool");
            self.job_tx.lock().take();
        }

        if !wait {
            let mut cancelled = 0_usize;
            while let Ok(job) = self.job_rx.try_recv() {
                // Dropping an unexecuted job cancels its unit.
                drop(job);
                cancelled += 1;
            }
            if cancelled > 0 {
                info!(cancelled, "Queued units cancelled");
            }
            return;
        }

        // Held across the joins so a concurrent waiting caller blocks until
        // the workers are gone instead of finding an empty list.
        let mut workers = self.workers.lock();
        let worker_count = workers.len();
        for (worker_id, worker) in workers.drain(..).enumerate() {
            if worker.join().is_err() {
                warn!(worker_id, "Worker panicked");
            } else {
                debug!(worker_id, "Worker joined");
            }
        }
        if worker_count > 0 {
            info!(worker_count, "Worker pool shut down complete");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Signal shutdown but don't join; explicit shutdown(true) does that.
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.job_tx.lock().take();
            debug!("WorkerPool dropped without explicit shutdown - workers will be detached");
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

/// Spawn a worker thread.
fn spawn_worker(
    worker_id: usize,
    config: &WorkerPoolConfig,
    job_rx: Receiver<Job>,
    slots: Arc<Mutex<Vec<WorkerSlot>>>,
) -> Result<JoinHandle<()>, PoolError> {
    let mut builder = thread::Builder::new().name(config.thread_name(worker_id));
    if let Some(stack_size) = config.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }
    builder
        .spawn(move || {
            debug!(worker_id, "Worker thread started");

            // recv() fails once the sender is dropped and the queue is empty.
            while let Ok(job) = job_rx.recv() {
                let unit = job.id();
                set_current(&slots, worker_id, Some(unit));
                let ran = job.execute();
                let mut slots = slots.lock();
                if let Some(slot) = slots.get_mut(worker_id) {
                    slot.current = None;
                    if ran {
                        slot.units_run += 1;
                    }
                }
            }

            debug!(worker_id, "Worker channel closed, exiting");
        })
        .map_err(|e| PoolError::Internal(format!("failed to spawn worker {worker_id}: {e}")))
}

fn set_current(slots: &Mutex<Vec<WorkerSlot>>, worker_id: usize, unit: Option<TaskId>) {
    if let Some(slot) = slots.lock().get_mut(worker_id) {
        slot.current = unit;
    }
}
