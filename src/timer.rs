//! Monotonic one-shot timer queue keyed by opaque user words.
//!
//! The driver arms one timer per timeout operation, computes its port-wait
//! bound from [`TimerQueue::next_delay`], and pops due entries with
//! [`TimerQueue::expire`] after every dequeue. Disarming a word that has
//! already fired (or was never armed) reports not-found, which the backend
//! treats as "let the timer run, then ignore".
//!
//! Removal is lazy: disarmed entries stay in the heap until they surface and
//! are skipped via a generation check, which keeps disarm O(1) instead of
//! O(n) heap surgery.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct TimerEntry {
    deadline: Instant,
    word: u64,
    seq: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed for a min-heap on deadline, sequence as tiebreak.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// One-shot monotonic timer queue.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    armed: HashMap<u64, u64>,
    next_seq: u64,
}

impl TimerQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a one-shot timer for `word` to fire `delay` after `now`.
    ///
    /// Re-arming an armed word replaces its deadline.
    pub fn arm(&mut self, word: u64, delay: Duration, now: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.armed.insert(word, seq);
        self.heap.push(TimerEntry {
            deadline: now + delay,
            word,
            seq,
        });
    }

    /// Disarms `word`.
    ///
    /// Returns false when the word is not armed — either it never was, or
    /// the timer already fired (the disarm race of the cancellation path).
    pub fn disarm(&mut self, word: u64) -> bool {
        self.armed.remove(&word).is_some()
    }

    /// Delay until the next live timer fires, `None` when empty.
    ///
    /// Stale heap heads left behind by disarms are dropped here.
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        loop {
            let head = self.heap.peek()?;
            if self.armed.get(&head.word) != Some(&head.seq) {
                self.heap.pop();
                continue;
            }
            return Some(head.deadline.saturating_duration_since(now));
        }
    }

    /// Pops every timer due at `now`, invoking `on_timeout` per fired word.
    ///
    /// Returns the number of timers fired.
    pub fn expire<F>(&mut self, now: Instant, mut on_timeout: F) -> usize
    where
        F: FnMut(u64),
    {
        let mut fired = 0;
        while let Some(head) = self.heap.peek() {
            if self.armed.get(&head.word) != Some(&head.seq) {
                self.heap.pop();
                continue;
            }
            if head.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry");
            self.armed.remove(&entry.word);
            fired += 1;
            on_timeout(entry.word);
        }
        fired
    }

    /// Number of armed timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    /// Returns true if no timer is armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.arm(1, Duration::from_millis(30), now);
        queue.arm(2, Duration::from_millis(10), now);
        queue.arm(3, Duration::from_millis(20), now);

        let mut fired = Vec::new();
        let count = queue.expire(now + Duration::from_millis(50), |w| fired.push(w));
        assert_eq!(count, 3);
        assert_eq!(fired, vec![2, 3, 1]);
        assert!(queue.is_empty());
    }

    #[test]
    fn expire_leaves_future_timers_armed() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.arm(1, Duration::from_millis(5), now);
        queue.arm(2, Duration::from_secs(60), now);

        let mut fired = Vec::new();
        queue.expire(now + Duration::from_millis(10), |w| fired.push(w));
        assert_eq!(fired, vec![1]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn disarm_prevents_fire() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.arm(7, Duration::from_millis(1), now);

        assert!(queue.disarm(7));
        let count = queue.expire(now + Duration::from_secs(1), |_| panic!("disarmed"));
        assert_eq!(count, 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn disarm_after_fire_reports_not_found() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.arm(7, Duration::from_millis(1), now);
        queue.expire(now + Duration::from_secs(1), |_| {});

        assert!(!queue.disarm(7));
        assert!(!queue.disarm(99));
    }

    #[test]
    fn next_delay_tracks_earliest_live_timer() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        assert_eq!(queue.next_delay(now), None);

        queue.arm(1, Duration::from_millis(100), now);
        queue.arm(2, Duration::from_millis(10), now);
        let delay = queue.next_delay(now).expect("armed");
        assert!(delay <= Duration::from_millis(10));

        // Disarming the earliest exposes the later one.
        assert!(queue.disarm(2));
        let delay = queue.next_delay(now).expect("still armed");
        assert!(delay > Duration::from_millis(10));
        assert!(delay <= Duration::from_millis(100));
    }

    #[test]
    fn rearm_replaces_deadline() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.arm(1, Duration::from_secs(60), now);
        queue.arm(1, Duration::from_millis(1), now);
        assert_eq!(queue.len(), 1);

        let mut fired = 0;
        queue.expire(now + Duration::from_millis(10), |_| fired += 1);
        assert_eq!(fired, 1);
        assert!(queue.is_empty());
    }
}
