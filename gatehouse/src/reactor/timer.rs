use crate::connection::ConnId;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// An idle check scheduled for one connection.
struct TimerEntry {
    deadline: Instant,
    conn: ConnId,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline.eq(&other.deadline)
    }
}

impl Ord for TimerEntry {
    /// Reversed so that `BinaryHeap` pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Idle deadlines, checked lazily.
///
/// Activity does not touch the heap. When an entry expires the caller
/// compares the connection's last activity with the timeout and either
/// reaps it or schedules it again.
pub(crate) struct IdleTimers {
    timeout: Option<Duration>,
    heap: BinaryHeap<TimerEntry>,
}

impl IdleTimers {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            heap: BinaryHeap::new(),
        }
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Schedules a check one timeout after `last_active`.
    pub(crate) fn schedule(&mut self, conn: ConnId, last_active: Instant) {
        if let Some(timeout) = self.timeout {
            self.heap.push(TimerEntry {
                deadline: last_active + timeout,
                conn,
            });
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Pops every entry due at `now`.
    pub(crate) fn expired(&mut self, now: Instant) -> Vec<ConnId> {
        let mut due = Vec::new();

        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                due.push(entry.conn);
            }
        }

        due
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }
}
