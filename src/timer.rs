//! Per-operation deadline tracking.
//!
//! A min-heap of (deadline, sequence) entries. Cancellation is lazy: the
//! owner of an armed timer remembers the sequence number, and a popped entry
//! whose sequence no longer matches the owner's record is stale and ignored.
//! Extension re-arms with a fresh sequence; it never resets op progress.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// What an armed timer fires against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerTarget {
    /// Current read op of the socket at this slot.
    Read(u32),
    /// Current write op of the socket at this slot.
    Write(u32),
    /// Shared deadline of the connect race at this slot.
    Connect(u32),
}

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    deadline: Instant,
    seq: u64,
    target: TimerTarget,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct Timers {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Timers {
            heap: BinaryHeap::new(),
            // 0 is reserved as "no timer armed" in owner records.
            next_seq: 1,
        }
    }

    /// Arm a timer. Returns the sequence number the owner must remember.
    pub(crate) fn arm(&mut self, deadline: Instant, target: TimerTarget) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry {
            deadline,
            seq,
            target,
        }));
        seq
    }

    /// How long the poll may block before the earliest deadline.
    pub(crate) fn poll_timeout(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|Reverse(e)| e.deadline.saturating_duration_since(now))
    }

    /// Pop the next entry whose deadline has passed, if any. The caller is
    /// responsible for the staleness check against the owner's sequence.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<(u64, TimerTarget)> {
        match self.heap.peek() {
            Some(Reverse(e)) if e.deadline <= now => {
                let Reverse(e) = self.heap.pop().expect("peeked entry");
                Some((e.seq, e.target))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut timers = Timers::new();
        let now = Instant::now();
        let late = timers.arm(now + Duration::from_secs(2), TimerTarget::Write(1));
        let early = timers.arm(now + Duration::from_secs(1), TimerTarget::Read(1));

        let at = now + Duration::from_secs(3);
        assert_eq!(
            timers.pop_expired(at),
            Some((early, TimerTarget::Read(1)))
        );
        assert_eq!(
            timers.pop_expired(at),
            Some((late, TimerTarget::Write(1)))
        );
        assert_eq!(timers.pop_expired(at), None);
    }

    #[test]
    fn not_expired_before_deadline() {
        let mut timers = Timers::new();
        let now = Instant::now();
        timers.arm(now + Duration::from_secs(5), TimerTarget::Connect(0));
        assert_eq!(timers.pop_expired(now), None);
        assert!(timers.poll_timeout(now).unwrap() <= Duration::from_secs(5));
    }

    #[test]
    fn sequences_are_unique_and_nonzero() {
        let mut timers = Timers::new();
        let now = Instant::now();
        let a = timers.arm(now, TimerTarget::Read(0));
        let b = timers.arm(now, TimerTarget::Read(0));
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }
}
