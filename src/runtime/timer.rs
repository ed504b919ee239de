//! Timer heap keyed by virtual time.
//!
//! A min-heap of armed deadlines, each carrying the waker of the task that
//! armed it. Cancellation is lazy: cancelled keys are skipped when they
//! surface at the top of the heap, which keeps `cancel` O(1) for the common
//! case of a wait that completes before its deadline.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::task::Waker;

use crate::time::Time;

/// Opaque handle to an armed timer, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

struct TimerEntry {
    at: Time,
    key: u64,
    waker: Waker,
}

// Ordered by (deadline, arm order); the waker does not participate.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.key == other.key
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
        (self.at, self.key).cmp(&(other.at, other.key))
    }
}

#[derive(Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    cancelled: HashSet<u64>,
    next_key: u64,
}

impl TimerHeap {
    pub(crate) fn arm(&mut self, at: Time, waker: Waker) -> TimerKey {
        let key = self.next_key;
        self.next_key += 1;
        self.heap.push(Reverse(TimerEntry { at, key, waker }));
        TimerKey(key)
    }

    pub(crate) fn cancel(&mut self, key: TimerKey) {
        self.cancelled.insert(key.0);
    }

    /// Earliest live deadline, discarding cancelled entries on the way.
    pub(crate) fn next_deadline(&mut self) -> Option<Time> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.cancelled.remove(&entry.key) {
                self.heap.pop();
                continue;
            }
            return Some(entry.at);
        }
        None
    }

    /// Removes every live entry due at or before `now` and returns their
    /// wakers in deadline order.
    pub(crate) fn take_due(&mut self, now: Time) -> Vec<Waker> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.at > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            if !self.cancelled.remove(&entry.key) {
                due.push(entry.waker);
            }
        }
        due
    }
}
