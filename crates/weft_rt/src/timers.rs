// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::task::{Task, TaskId};

/// Min-heap of timer-parked tasks, ordered by absolute expiry on the
/// monotonic clock.
///
/// Entries carry a sequence number so that two timers expiring at the same
/// instant wake in the order they were filed.
#[derive(Debug, Default)]
pub(crate) struct TimerHeap {
    entries: BinaryHeap<Reverse<TimerEntry>>,
    next_seq: u64,
}

impl TimerHeap {
    pub(crate) fn push(&mut self, expiry: Instant, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.entries.push(Reverse(TimerEntry { expiry, seq, task }));
    }

    /// Pops the earliest entry if it has expired. Callers drain all due
    /// wakeups by looping until this returns `None`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<Task> {
        if self
            .entries
            .peek()
            .is_some_and(|Reverse(entry)| entry.expiry <= now)
        {
            self.entries.pop().map(|Reverse(entry)| entry.task)
        } else {
            None
        }
    }

    /// The earliest expiry currently filed, used to bound the idle poll.
    pub(crate) fn next_expiry(&self) -> Option<Instant> {
        self.entries.peek().map(|Reverse(entry)| entry.expiry)
    }

    /// Extracts the entry parked for the given task, if any. This is the
    /// kill path; it rebuilds the heap and is O(n), which is fine because
    /// kills are rare next to timer pushes and pops.
    pub(crate) fn remove(&mut self, id: TaskId) -> Option<Task> {
        if !self.entries.iter().any(|Reverse(entry)| entry.task.id == id) {
            return None;
        }

        let mut removed = None;
        let mut kept = Vec::with_capacity(self.entries.len().saturating_sub(1));

        for Reverse(entry) in std::mem::take(&mut self.entries) {
            if removed.is_none() && entry.task.id == id {
                removed = Some(entry.task);
            } else {
                kept.push(Reverse(entry));
            }
        }

        self.entries = BinaryHeap::from(kept);
        removed
    }

    #[cfg(debug_assertions)]
    pub(crate) fn task_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.entries.iter().map(|Reverse(entry)| entry.task.id)
    }
}

#[derive(Debug)]
struct TimerEntry {
    expiry: Instant,
    seq: u64,
    task: Task,
}

// Ordering ignores the task - only (expiry, seq) participate, and seq is
// unique within a heap, making the order total.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.expiry == other.expiry && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expiry
            .cmp(&other.expiry)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;

    fn test_task(counter: &Arc<AtomicU64>) -> Task {
        Task::new(TaskId::allocate(counter), None, async {}.boxed_local())
    }

    #[test]
    fn pops_in_expiry_order_regardless_of_push_order() {
        let counter = Arc::new(AtomicU64::new(1));
        let mut heap = TimerHeap::default();
        let base = Instant::now();

        let late = test_task(&counter);
        let late_id = late.id;
        let early = test_task(&counter);
        let early_id = early.id;

        heap.push(base + Duration::from_secs(2), late);
        heap.push(base + Duration::from_secs(1), early);

        let far_future = base + Duration::from_secs(10);
        assert_eq!(heap.pop_due(far_future).map(|t| t.id), Some(early_id));
        assert_eq!(heap.pop_due(far_future).map(|t| t.id), Some(late_id));
        assert!(heap.pop_due(far_future).is_none());
    }

    #[test]
    fn equal_expiries_wake_in_push_order() {
        let counter = Arc::new(AtomicU64::new(1));
        let mut heap = TimerHeap::default();
        let expiry = Instant::now() + Duration::from_secs(1);

        let ids: Vec<TaskId> = (0..4)
            .map(|_| {
                let task = test_task(&counter);
                let id = task.id;
                heap.push(expiry, task);
                id
            })
            .collect();

        let popped: Vec<TaskId> = std::iter::from_fn(|| {
            heap.pop_due(expiry + Duration::from_secs(1)).map(|t| t.id)
        })
        .collect();

        assert_eq!(popped, ids);
    }

    #[test]
    fn nothing_due_before_expiry() {
        let counter = Arc::new(AtomicU64::new(1));
        let mut heap = TimerHeap::default();
        let base = Instant::now();
        let expiry = base + Duration::from_secs(5);

        heap.push(expiry, test_task(&counter));

        assert!(heap.pop_due(base).is_none());
        assert_eq!(heap.next_expiry(), Some(expiry));
    }

    #[test]
    fn remove_extracts_only_the_target() {
        let counter = Arc::new(AtomicU64::new(1));
        let mut heap = TimerHeap::default();
        let base = Instant::now();

        let keep_a = test_task(&counter);
        let keep_a_id = keep_a.id;
        let victim = test_task(&counter);
        let victim_id = victim.id;
        let keep_b = test_task(&counter);
        let keep_b_id = keep_b.id;

        heap.push(base + Duration::from_secs(1), keep_a);
        heap.push(base + Duration::from_secs(2), victim);
        heap.push(base + Duration::from_secs(3), keep_b);

        assert_eq!(heap.remove(victim_id).map(|t| t.id), Some(victim_id));
        assert!(heap.remove(victim_id).is_none());

        let far_future = base + Duration::from_secs(10);
        assert_eq!(heap.pop_due(far_future).map(|t| t.id), Some(keep_a_id));
        assert_eq!(heap.pop_due(far_future).map(|t| t.id), Some(keep_b_id));
        assert!(heap.pop_due(far_future).is_none());
    }
}
