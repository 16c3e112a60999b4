//! Deadline-ordered timer queue.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use crate::core::task::TaskId;

/// What happens when a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum TimerKind {
    /// End of a sleep.
    Wake,
    /// Expiry of a bounded wait of the given length.
    Timeout(Duration),
}

/// A pending deadline.
///
/// Field order is the firing order: deadline first, then task id, which is
/// submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Timer {
    pub deadline: Duration,
    pub task: TaskId,
    /// Wait generation the timer was armed for. A task that was woken by
    /// other means has moved on to a later generation.
    pub generation: u64,
    pub kind: TimerKind,
}

#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<Timer>>,
}

impl TimerQueue {
    pub fn push(&mut self, timer: Timer) {
        self.heap.push(Reverse(timer));
    }

    /// Pop the earliest timer if it is due at `now`.
    pub fn pop_due(&mut self, now: Duration) -> Option<Timer> {
        match self.heap.peek() {
            Some(Reverse(timer)) if timer.deadline <= now => self.heap.pop().map(|Reverse(t)| t),
            _ => None,
        }
    }

    /// Earliest deadline among live timers, discarding stale ones on the way.
    pub fn next_live_deadline(&mut self, is_live: impl Fn(&Timer) -> bool) -> Option<Duration> {
        while let Some(Reverse(timer)) = self.heap.peek() {
            if is_live(timer) {
                return Some(timer.deadline);
            }
            self.heap.pop();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(ms: u64, task: u64) -> Timer {
        Timer {
            deadline: Duration::from_millis(ms),
            task: TaskId::new(task),
            generation: 0,
            kind: TimerKind::Wake,
        }
    }

    #[test]
    fn test_deadline_then_submission_order() {
        let mut queue = TimerQueue::default();
        queue.push(timer(20, 3));
        queue.push(timer(10, 5));
        queue.push(timer(20, 1));

        let now = Duration::from_millis(20);
        let order: Vec<u64> = std::iter::from_fn(|| queue.pop_due(now))
            .map(|t| t.task.get())
            .collect();
        assert_eq!(order, vec![5, 1, 3]);
    }

    #[test]
    fn test_not_due_yet() {
        let mut queue = TimerQueue::default();
        queue.push(timer(50, 0));
        assert!(queue.pop_due(Duration::from_millis(49)).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_stale_timers_skipped() {
        let mut queue = TimerQueue::default();
        queue.push(timer(5, 0));
        queue.push(timer(9, 1));
        let next = queue.next_live_deadline(|t| t.task.get() != 0);
        assert_eq!(next, Some(Duration::from_millis(9)));
        assert_eq!(queue.len(), 1);
    }
}
