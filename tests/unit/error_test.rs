//! Tests for error types

use coop_runtime::core::{Failure, PoolError, TaskError, TaskId, TaskState, UsageError};
use std::time::Duration;

#[test]
fn test_input_before_start_error() {
    let err = UsageError::InputBeforeStart(TaskId::new(3));
    assert_eq!(
        format!("{}", err),
        "task#3 has not started; the first resume must not carry input"
    );
}

#[test]
fn test_finished_error() {
    let err = UsageError::Finished {
        task: TaskId::new(1),
        state: TaskState::Completed,
    };
    assert_eq!(format!("{}", err), "task#1 is already completed");
}

#[test]
fn test_wait_cycle_error() {
    let err = UsageError::WaitCycle(vec![TaskId::new(0), TaskId::new(1), TaskId::new(0)]);
    assert_eq!(
        format!("{}", err),
        "cyclic wait between task#0 -> task#1 -> task#0"
    );
}

#[test]
fn test_stalled_error() {
    let err = UsageError::Stalled(vec![TaskId::new(4)]);
    assert_eq!(
        format!("{}", err),
        "no runnable task and no pending timer; still waiting: task#4"
    );
}

#[test]
fn test_usage_error_is_transparent_in_task_error() {
    let err: TaskError = UsageError::NotFinished(TaskId::new(2)).into();
    assert_eq!(format!("{}", err), "task#2 has not finished");
    assert_eq!(err.task(), None);
}

#[test]
fn test_failed_error_keeps_cause() {
    let cause = Failure::new(anyhow::anyhow!("disk full").context("writing report"));
    let err = TaskError::Failed {
        task: TaskId::new(5),
        cause,
    };
    assert_eq!(format!("{}", err), "task#5 failed: writing report");
    assert_eq!(err.task(), Some(TaskId::new(5)));

    let TaskError::Failed { cause, .. } = &err else {
        unreachable!();
    };
    let chain: Vec<String> = cause.chain().map(ToString::to_string).collect();
    assert_eq!(chain, vec!["writing report", "disk full"]);
}

#[test]
fn test_timeout_detected_through_failure_chain() {
    let direct = TaskError::TimedOut(Duration::from_millis(250));
    assert_eq!(format!("{}", direct), "timed out after 250ms");
    assert!(direct.is_timed_out());

    let wrapped = TaskError::Failed {
        task: TaskId::new(9),
        cause: Failure::new(anyhow::Error::new(direct).context("fetching page")),
    };
    assert!(wrapped.is_timed_out());
    assert!(!TaskError::Cancelled(TaskId::new(9)).is_timed_out());
}

#[test]
fn test_cancellation_kinds() {
    assert!(TaskError::Cancelled(TaskId::new(1)).is_cancellation());
    assert!(TaskError::NotStarted(TaskId::new(1)).is_cancellation());
    assert!(!TaskError::TimedOut(Duration::ZERO).is_cancellation());
    assert_eq!(
        format!("{}", TaskError::NotStarted(TaskId::new(6))),
        "task#6 was cancelled before it started"
    );
}

#[test]
fn test_failure_downcast() {
    let failure = Failure::new(anyhow::Error::new(UsageError::ResultTaken(TaskId::new(8))));
    assert_eq!(
        failure.downcast_ref::<UsageError>(),
        Some(&UsageError::ResultTaken(TaskId::new(8)))
    );
    assert!(failure.downcast_ref::<std::io::Error>().is_none());
}

#[test]
fn test_pool_errors() {
    assert_eq!(format!("{}", PoolError::QueueFull), "work queue is full");
    assert_eq!(
        format!("{}", PoolError::Internal("spawn failed".to_string())),
        "internal error: spawn failed"
    );
}
