//! Collecting the outcomes of many units of work.
//!
//! Two views over the same set of handles:
//!
//! - **ordered**: outcomes in the order the handles were given, waiting for
//!   each in turn;
//! - **as completed**: handles in the order their units finished, each yielded
//!   as soon as it is done.
//!
//! Both work over anything implementing [`Completion`]: pool
//! [`ResultHandle`](crate::core::ResultHandle)s and scheduler
//! [`ResultRecord`]s.

use std::collections::VecDeque;
use std::iter::FusedIterator;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};

use crate::core::error::{TaskError, TaskResult};
use crate::core::task::TaskId;

/// A unit of work whose outcome can be waited for.
pub trait Completion {
    /// Value produced on success.
    type Output;

    /// Identifier of the unit.
    fn id(&self) -> TaskId;

    /// Position of the unit in its runtime's completion sequence, once it
    /// reached a terminal state.
    fn completion_index(&self) -> Option<u64>;

    /// Arrange for `position` to be sent on `notify` when the unit finishes.
    /// Sends immediately if it already has.
    fn subscribe(&self, position: usize, notify: &crossbeam_channel::Sender<usize>);

    /// Wait for the unit and take its outcome.
    ///
    /// # Errors
    ///
    /// The unit's failure or cancellation.
    fn resolve(self) -> TaskResult<Self::Output>;
}

/// Outcome of a finished scheduler task, detached from the scheduler.
#[derive(Debug, Clone)]
pub struct ResultRecord<T> {
    id: TaskId,
    outcome: TaskResult<T>,
    completion_index: u64,
}

impl<T> ResultRecord<T> {
    pub(crate) const fn new(id: TaskId, outcome: TaskResult<T>, completion_index: u64) -> Self {
        Self {
            id,
            outcome,
            completion_index,
        }
    }

    /// Identifier of the task.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// The recorded outcome.
    #[must_use]
    pub const fn outcome(&self) -> &TaskResult<T> {
        &self.outcome
    }

    /// Whether the task completed with a value.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Take the recorded outcome.
    ///
    /// # Errors
    ///
    /// The task's failure or cancellation.
    pub fn into_result(self) -> TaskResult<T> {
        self.outcome
    }
}

impl<T> Completion for ResultRecord<T> {
    type Output = T;

    fn id(&self) -> TaskId {
        self.id
    }

    fn completion_index(&self) -> Option<u64> {
        Some(self.completion_index)
    }

    fn subscribe(&self, position: usize, notify: &crossbeam_channel::Sender<usize>) {
        let _ = notify.send(position);
    }

    fn resolve(self) -> TaskResult<T> {
        self.outcome
    }
}

/// Wait for every handle and return the values in input order.
///
/// All units are waited for even when one fails; the error returned is that
/// of the earliest handle in input order that did not succeed.
///
/// # Errors
///
/// The first failure or cancellation in input order.
pub fn collect_ordered<I>(handles: I) -> TaskResult<Vec<<I::Item as Completion>::Output>>
where
    I: IntoIterator,
    I::Item: Completion,
{
    let outcomes: Vec<_> = handles.into_iter().map(Completion::resolve).collect();
    outcomes.into_iter().collect()
}

/// Lazily resolve handles in input order.
pub fn ordered<I>(handles: I) -> Ordered<I::Item>
where
    I: IntoIterator,
    I::Item: Completion,
{
    Ordered {
        handles: handles.into_iter().collect::<Vec<_>>().into_iter(),
    }
}

/// Iterator over outcomes in input order. See [`ordered`].
#[derive(Debug)]
pub struct Ordered<H> {
    handles: std::vec::IntoIter<H>,
}

impl<H> Ordered<H> {
    /// Handles not resolved yet.
    #[must_use]
    pub fn remaining(&self) -> &[H] {
        self.handles.as_slice()
    }
}

impl<H: Completion> Iterator for Ordered<H> {
    type Item = TaskResult<H::Output>;

    fn next(&mut self) -> Option<Self::Item> {
        self.handles.next().map(Completion::resolve)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.handles.size_hint()
    }
}

impl<H: Completion> ExactSizeIterator for Ordered<H> {}
impl<H: Completion> FusedIterator for Ordered<H> {}

/// Yield handles in the order their units finish.
///
/// Handles that already finished come first, ordered by completion index;
/// the rest follow as their completion notifications arrive. Each handle is
/// yielded exactly once.
pub fn as_completed<I>(handles: I) -> AsCompleted<I::Item>
where
    I: IntoIterator,
    I::Item: Completion,
{
    let (tx, rx) = unbounded();
    let mut finished = Vec::new();
    let mut pending = Vec::new();
    for handle in handles {
        match handle.completion_index() {
            Some(index) => finished.push((index, handle)),
            None => pending.push(Some(handle)),
        }
    }
    finished.sort_by_key(|(index, _)| *index);
    for (position, handle) in pending.iter().enumerate() {
        if let Some(handle) = handle {
            handle.subscribe(position, &tx);
        }
    }
    let remaining = pending.len();
    AsCompleted {
        ready: finished.into_iter().map(|(_, h)| h).collect(),
        pending,
        remaining,
        rx,
    }
}

/// Like [`as_completed`], yielding outcomes instead of handles.
pub fn collect_as_completed<I>(handles: I) -> CompletedValues<I::Item>
where
    I: IntoIterator,
    I::Item: Completion,
{
    CompletedValues {
        inner: as_completed(handles),
    }
}

/// Iterator over handles in completion order. See [`as_completed`].
#[derive(Debug)]
pub struct AsCompleted<H> {
    ready: VecDeque<H>,
    pending: Vec<Option<H>>,
    remaining: usize,
    rx: Receiver<usize>,
}

impl<H: Completion> AsCompleted<H> {
    /// Handles not yielded yet.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ready.len() + self.remaining
    }

    /// True once every handle was yielded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next finished handle, waiting at most `timeout` for one.
    ///
    /// # Errors
    ///
    /// `TaskError::TimedOut` if no unit finished in time. The iterator stays
    /// usable.
    pub fn next_timeout(&mut self, timeout: Duration) -> TaskResult<Option<H>> {
        if let Some(handle) = self.ready.pop_front() {
            return Ok(Some(handle));
        }
        while self.remaining > 0 {
            match self.rx.recv_timeout(timeout) {
                Ok(position) => {
                    if let Some(handle) = self.take(position) {
                        return Ok(Some(handle));
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Err(TaskError::TimedOut(timeout)),
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
        Ok(None)
    }

    fn take(&mut self, position: usize) -> Option<H> {
        let handle = self.pending.get_mut(position).and_then(Option::take)?;
        self.remaining -= 1;
        Some(handle)
    }
}

impl<H: Completion> Iterator for AsCompleted<H> {
    type Item = H;

    fn next(&mut self) -> Option<H> {
        if let Some(handle) = self.ready.pop_front() {
            return Some(handle);
        }
        while self.remaining > 0 {
            // Disconnected means every unit dropped its subscription without
            // finishing; nothing more can arrive.
            let position = self.rx.recv().ok()?;
            if let Some(handle) = self.take(position) {
                return Some(handle);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.len()))
    }
}

impl<H: Completion> FusedIterator for AsCompleted<H> {}

/// Iterator over outcomes in completion order. See [`collect_as_completed`].
#[derive(Debug)]
pub struct CompletedValues<H> {
    inner: AsCompleted<H>,
}

impl<H: Completion> Iterator for CompletedValues<H> {
    type Item = TaskResult<H::Output>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(Completion::resolve)
    }
}

impl<H: Completion> FusedIterator for CompletedValues<H> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, outcome: TaskResult<u32>, index: u64) -> ResultRecord<u32> {
        ResultRecord::new(TaskId::new(id), outcome, index)
    }

    #[test]
    fn test_ordered_reports_earliest_failure() {
        let records = vec![
            record(0, Ok(1), 2),
            record(1, Err(TaskError::Cancelled(TaskId::new(1))), 0),
            record(2, Err(TaskError::TimedOut(Duration::from_secs(1))), 1),
        ];
        let err = collect_ordered(records).unwrap_err();
        assert!(matches!(err, TaskError::Cancelled(id) if id == TaskId::new(1)));
    }

    #[test]
    fn test_as_completed_sorts_finished_records() {
        let records = vec![record(0, Ok(30), 2), record(1, Ok(10), 0), record(2, Ok(20), 1)];
        let ids: Vec<u64> = as_completed(records).map(|r| r.id().get()).collect();
        assert_eq!(ids, vec![1, 2, 0]);
    }

    #[test]
    fn test_completed_values_and_exhaustion() {
        let records = vec![record(0, Ok(5), 1), record(1, Ok(6), 0)];
        let mut values = collect_as_completed(records);
        assert_eq!(values.next().map(Result::unwrap), Some(6));
        assert_eq!(values.next().map(Result::unwrap), Some(5));
        assert!(values.next().is_none());
        assert!(values.next().is_none());
    }

    #[test]
    fn test_ordered_is_lazy() {
        let mut outcomes = ordered(vec![record(0, Ok(1), 0), record(1, Ok(2), 1)]);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes.next().map(Result::unwrap), Some(1));
        assert_eq!(outcomes.remaining().len(), 1);
    }
}
