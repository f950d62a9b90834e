//! Timer Queue
//!
//! Pending wake-ups for tasks blocked on a delay.
//!
//! Design:
//! - Entries live in a slab; a min-heap orders their keys by deadline
//! - Equal deadlines resolve in insertion order (sequence number)
//! - A per-task key index makes `cancel(task)` touch only that task's entries
//! - Cancellation frees the slab slot; the heap key is skipped when popped,
//!   and the heap is rebuilt once stale keys outnumber live ones
//! - Deadlines are monotonic `Instant`s supplied by the caller's clock

use super::task::TaskId;
use slab::Slab;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Heaps smaller than this are never compacted
pub(crate) const COMPACT_MIN_HEAP: usize = 64;

/// Handle to one pending timer entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    slot: usize,
    seq: u64,
}

/// A pending resumption request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEntry {
    /// When the task should be resumed
    pub deadline: Instant,
    /// Task to wake
    pub task: TaskId,
    seq: u64,
}

/// Timer queue - deadline-ordered wake requests
#[derive(Debug, Default)]
pub struct TimerQueue {
    /// Min-heap of (deadline, sequence, slot)
    heap: BinaryHeap<Reverse<(Instant, u64, usize)>>,
    /// Live entries
    entries: Slab<TimerEntry>,
    /// Live keys per task
    by_task: HashMap<TaskId, Vec<TimerKey>>,
    /// Next sequence number
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wake for `task` at `now + delay`
    pub fn schedule_wake(&mut self, task: TaskId, delay: Duration, now: Instant) -> TimerKey {
        let deadline = now + delay;
        let seq = self.next_seq;
        self.next_seq += 1;

        let slot = self.entries.insert(TimerEntry {
            deadline,
            task,
            seq,
        });
        self.heap.push(Reverse((deadline, seq, slot)));

        let key = TimerKey { slot, seq };
        self.by_task.entry(task).or_default().push(key);
        key
    }

    /// Remove every pending entry for `task`.
    ///
    /// Returns the number of entries removed; zero is not an error.
    pub fn cancel(&mut self, task: TaskId) -> usize {
        let Some(keys) = self.by_task.remove(&task) else {
            return 0;
        };
        let mut removed = 0;
        for key in keys {
            if self.contains(key) {
                self.entries.remove(key.slot);
                removed += 1;
            }
        }
        self.maybe_compact();
        removed
    }

    /// Remove one entry by key. Returns false if it already fired or was cancelled.
    pub fn cancel_key(&mut self, key: TimerKey) -> bool {
        if !self.contains(key) {
            return false;
        }
        let entry = self.entries.remove(key.slot);
        self.unindex(entry.task, key);
        self.maybe_compact();
        true
    }

    /// Whether the entry behind `key` is still pending
    pub fn contains(&self, key: TimerKey) -> bool {
        self.entries
            .get(key.slot)
            .is_some_and(|entry| entry.seq == key.seq)
    }

    /// Soonest pending deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Time until the next entry is due (zero if already due)
    pub fn time_until_next(&mut self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Lazily remove and yield every entry due at `now`, earliest first
    pub fn due_entries(&mut self, now: Instant) -> DueEntries<'_> {
        DueEntries { queue: self, now }
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Heap keys held, live and stale
    #[cfg(test)]
    pub(crate) fn heap_len(&self) -> usize {
        self.heap.len()
    }

    fn unindex(&mut self, task: TaskId, key: TimerKey) {
        if let Some(keys) = self.by_task.get_mut(&task) {
            keys.retain(|k| *k != key);
            if keys.is_empty() {
                self.by_task.remove(&task);
            }
        }
    }

    /// Rebuild the heap from live entries once stale keys outnumber them
    fn maybe_compact(&mut self) {
        let heap_len = self.heap.len();
        if heap_len < COMPACT_MIN_HEAP || heap_len <= 2 * self.entries.len() {
            return;
        }
        self.heap = self
            .entries
            .iter()
            .map(|(slot, entry)| Reverse((entry.deadline, entry.seq, slot)))
            .collect();
    }

    /// Pop heap keys whose entry was cancelled (or whose slot was reused)
    fn discard_stale(&mut self) {
        while let Some(Reverse((_, seq, slot))) = self.heap.peek() {
            let live = self
                .entries
                .get(*slot)
                .is_some_and(|entry| entry.seq == *seq);
            if live {
                break;
            }
            self.heap.pop();
        }
    }

    fn pop_due(&mut self, now: Instant) -> Option<TimerEntry> {
        self.discard_stale();
        let Reverse((deadline, seq, slot)) = *self.heap.peek()?;
        if deadline > now {
            return None;
        }
        self.heap.pop();
        let entry = self.entries.remove(slot);
        self.unindex(entry.task, TimerKey { slot, seq });
        Some(entry)
    }
}

/// Iterator returned by [`TimerQueue::due_entries`]
///
/// Each call to `next` removes one due entry from the queue. Entries not
/// consumed stay queued.
pub struct DueEntries<'a> {
    queue: &'a mut TimerQueue,
    now: Instant,
}

impl Iterator for DueEntries<'_> {
    type Item = TimerEntry;

    fn next(&mut self) -> Option<TimerEntry> {
        self.queue.pop_due(self.now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn due(queue: &mut TimerQueue, now: Instant) -> Vec<TaskId> {
        queue.due_entries(now).map(|e| e.task).collect()
    }

    #[test]
    fn test_oneshot_timer() {
        let mut queue = TimerQueue::new();
        let t0 = Instant::now();

        let key = queue.schedule_wake(TaskId(1), ms(100), t0);
        assert!(queue.contains(key));
        assert_eq!(queue.len(), 1);

        // Not expired yet
        assert!(due(&mut queue, t0 + ms(50)).is_empty());
        assert!(queue.contains(key));

        // Now expired
        assert_eq!(due(&mut queue, t0 + ms(100)), vec![TaskId(1)]);
        assert!(!queue.contains(key));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_multiple_timers_fire_in_deadline_order() {
        let mut queue = TimerQueue::new();
        let t0 = Instant::now();

        queue.schedule_wake(TaskId(1), ms(100), t0);
        queue.schedule_wake(TaskId(2), ms(50), t0);
        queue.schedule_wake(TaskId(3), ms(150), t0);

        assert_eq!(due(&mut queue, t0 + ms(50)), vec![TaskId(2)]);
        assert_eq!(due(&mut queue, t0 + ms(100)), vec![TaskId(1)]);
        assert_eq!(due(&mut queue, t0 + ms(150)), vec![TaskId(3)]);
    }

    #[test]
    fn test_equal_deadlines_are_fifo() {
        let mut queue = TimerQueue::new();
        let t0 = Instant::now();

        queue.schedule_wake(TaskId(3), ms(50), t0);
        queue.schedule_wake(TaskId(1), ms(50), t0);
        queue.schedule_wake(TaskId(2), ms(50), t0);

        assert_eq!(
            due(&mut queue, t0 + ms(50)),
            vec![TaskId(3), TaskId(1), TaskId(2)]
        );
    }

    #[test]
    fn test_cancel_by_task() {
        let mut queue = TimerQueue::new();
        let t0 = Instant::now();

        queue.schedule_wake(TaskId(1), ms(100), t0);
        queue.schedule_wake(TaskId(1), ms(200), t0);
        queue.schedule_wake(TaskId(2), ms(100), t0);

        assert_eq!(queue.cancel(TaskId(1)), 2);
        assert_eq!(queue.cancel(TaskId(1)), 0); // no-op
        assert_eq!(due(&mut queue, t0 + ms(500)), vec![TaskId(2)]);
    }

    #[test]
    fn test_cancel_key() {
        let mut queue = TimerQueue::new();
        let t0 = Instant::now();

        let key = queue.schedule_wake(TaskId(1), ms(100), t0);
        assert!(queue.cancel_key(key));
        assert!(!queue.cancel_key(key));

        assert!(due(&mut queue, t0 + ms(100)).is_empty());
    }

    #[test]
    fn test_stale_key_after_slot_reuse() {
        let mut queue = TimerQueue::new();
        let t0 = Instant::now();

        let old = queue.schedule_wake(TaskId(1), ms(10), t0);
        queue.cancel_key(old);
        // Likely reuses the freed slot
        let new = queue.schedule_wake(TaskId(2), ms(100), t0);

        assert!(!queue.contains(old));
        assert!(queue.contains(new));
        assert!(!queue.cancel_key(old));
        assert_eq!(queue.next_deadline(), Some(t0 + ms(100)));
        assert!(due(&mut queue, t0 + ms(10)).is_empty());
        assert_eq!(due(&mut queue, t0 + ms(100)), vec![TaskId(2)]);
    }

    #[test]
    fn test_time_until_next() {
        let mut queue = TimerQueue::new();
        let t0 = Instant::now();

        assert!(queue.time_until_next(t0).is_none());

        queue.schedule_wake(TaskId(1), ms(100), t0);
        assert_eq!(queue.time_until_next(t0), Some(ms(100)));
        assert_eq!(queue.time_until_next(t0 + ms(50)), Some(ms(50)));
        assert_eq!(queue.time_until_next(t0 + ms(150)), Some(Duration::ZERO));
    }

    #[test]
    fn test_due_entries_is_lazy() {
        let mut queue = TimerQueue::new();
        let t0 = Instant::now();

        queue.schedule_wake(TaskId(1), ms(10), t0);
        queue.schedule_wake(TaskId(2), ms(20), t0);

        let first = queue.due_entries(t0 + ms(30)).next().map(|e| e.task);
        assert_eq!(first, Some(TaskId(1)));
        // Unconsumed entry stays queued
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_key_lookup() {
        let mut queue = TimerQueue::new();
        let t0 = Instant::now();

        let key = queue.schedule_wake(TaskId(1), ms(25), t0);
        assert!(queue.contains(key));
        queue.cancel(TaskId(1));
        assert!(!queue.contains(key));
    }

    #[test]
    fn test_cancel_by_task_keeps_other_tasks_indexed() {
        let mut queue = TimerQueue::new();
        let t0 = Instant::now();

        let a = queue.schedule_wake(TaskId(1), ms(10), t0);
        let b = queue.schedule_wake(TaskId(2), ms(20), t0);
        assert!(queue.cancel_key(a));
        // Task 1 has nothing left; task 2 is untouched
        assert_eq!(queue.cancel(TaskId(1)), 0);
        assert!(queue.contains(b));

        assert_eq!(due(&mut queue, t0 + ms(20)), vec![TaskId(2)]);
        // Fired entries leave the index too
        assert_eq!(queue.cancel(TaskId(2)), 0);
    }

    #[test]
    fn test_heap_compacts_after_many_cancellations() {
        let mut queue = TimerQueue::new();
        let t0 = Instant::now();

        let keep = queue.schedule_wake(TaskId(0), ms(5), t0);
        for i in 0..10_000 {
            let key = queue.schedule_wake(TaskId(1), Duration::from_secs(3600 + i), t0);
            assert!(queue.cancel_key(key));
            assert!(queue.heap_len() <= COMPACT_MIN_HEAP + 1);
        }

        assert_eq!(queue.len(), 1);
        assert!(queue.contains(keep));
        assert_eq!(due(&mut queue, t0 + ms(5)), vec![TaskId(0)]);
    }

    #[test]
    fn test_cancel_by_task_compacts() {
        let mut queue = TimerQueue::new();
        let t0 = Instant::now();

        for i in 0..200 {
            queue.schedule_wake(TaskId(1), ms(i), t0);
        }
        queue.schedule_wake(TaskId(2), ms(1000), t0);
        assert_eq!(queue.cancel(TaskId(1)), 200);

        assert_eq!(queue.heap_len(), 1);
        assert_eq!(queue.next_deadline(), Some(t0 + ms(1000)));
    }
}
