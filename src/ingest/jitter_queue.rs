//! Bounded FIFO absorbing arrival-time jitter on the ingest path. Holds
//! back release until a minimum holding time is met on first fill, then
//! releases in arrival order; on overflow past the maximum holding time
//! it drops from the head (leaky-downstream), since under a persistent
//! surge the oldest data is stalest and least useful.
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct JitterQueue {
    entries: VecDeque<(Instant, Bytes)>,
    min_hold: Duration,
    max_hold: Duration,
    released: bool,
    dropped: u64,
}

impl JitterQueue {
    pub fn new(min_hold: Duration, max_hold: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            min_hold,
            max_hold,
            released: false,
            dropped: 0,
        }
    }

    /// Push one arrival. Enforces the max-hold bound immediately so the
    /// queue never exceeds it even between pops.
    pub fn push(&mut self, data: Bytes) {
        self.entries.push_back((Instant::now(), data));
        self.enforce_max_hold();
    }

    fn enforce_max_hold(&mut self) {
        while let Some((ts, _)) = self.entries.front() {
            if ts.elapsed() > self.max_hold {
                self.entries.pop_front();
                self.dropped += 1;
            } else {
                break;
            }
        }
    }

    /// Release the oldest entry, if the minimum holding time has been met
    /// (once met, it stays met for the lifetime of this queue) and there
    /// is anything to release.
    pub fn try_pop(&mut self) -> Option<Bytes> {
        self.enforce_max_hold();

        if !self.released {
            let ready = matches!(self.entries.front(), Some((ts, _)) if ts.elapsed() >= self.min_hold);
            if !ready {
                return None;
            }
            self.released = true;
        }

        self.entries.pop_front().map(|(_, data)| data)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_min_hold_nothing_releases() {
        let mut q = JitterQueue::new(Duration::from_millis(200), Duration::from_secs(5));
        q.push(Bytes::from_static(b"a"));
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn at_min_hold_release_starts() {
        let mut q = JitterQueue::new(Duration::from_millis(20), Duration::from_secs(5));
        q.push(Bytes::from_static(b"a"));
        std::thread::sleep(Duration::from_millis(30));
        let popped = q.try_pop();
        assert_eq!(popped, Some(Bytes::from_static(b"a")));
    }

    #[test]
    fn after_release_begins_subsequent_pops_dont_wait_again() {
        let mut q = JitterQueue::new(Duration::from_millis(20), Duration::from_secs(5));
        q.push(Bytes::from_static(b"a"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(q.try_pop().is_some());
        q.push(Bytes::from_static(b"b"));
        // No further wait needed: min-hold was already satisfied once.
        assert_eq!(q.try_pop(), Some(Bytes::from_static(b"b")));
    }

    #[test]
    fn above_max_hold_head_drops() {
        let mut q = JitterQueue::new(Duration::from_millis(0), Duration::from_millis(20));
        q.push(Bytes::from_static(b"stale"));
        std::thread::sleep(Duration::from_millis(30));
        q.push(Bytes::from_static(b"fresh"));
        // The stale entry should have been dropped by max-hold enforcement.
        assert_eq!(q.len(), 1);
        assert_eq!(q.dropped_count(), 1);
        assert_eq!(q.try_pop(), Some(Bytes::from_static(b"fresh")));
    }

    #[test]
    fn empty_queue_pops_none() {
        let mut q = JitterQueue::new(Duration::from_millis(0), Duration::from_secs(5));
        assert!(q.try_pop().is_none());
        assert!(q.is_empty());
    }
}
