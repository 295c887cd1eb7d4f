//! One-shot timers and the per-loop broker holding them.
//!
//! The broker is deliberately simple: a min-heap of deadlines. It reports the earliest deadline
//! so the loop can bound its poll wait, expires due timers each loop iteration, and expires
//! everything unconditionally when the loop shuts down. Repeating behavior is obtained by
//! re-submitting the timer from its own callback through the owning loop's `launch`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::promise::Promise;

type TimerFn = Box<dyn FnMut(&Arc<Timer>) + Send>;

/// A one-shot deferred invocation with a fixed delay.
///
/// The callback receives the timer itself so it can re-submit it to the owning loop for
/// periodic behavior.
pub struct Timer {
    delay: Duration,
    callback: Mutex<TimerFn>,
}

impl Timer {
    pub fn new<F>(delay: Duration, callback: F) -> Arc<Timer>
    where
        F: FnMut(&Arc<Timer>) + Send + 'static,
    {
        Arc::new(Timer {
            delay,
            callback: Mutex::new(Box::new(callback)),
        })
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub(crate) fn fire(self: Arc<Timer>) {
        let mut cb = self
            .callback
            .lock()
            .expect("failed to lock timer callback: poisoned");
        (cb)(&self);
    }
}

/// The completion promise attached to a timer launch, fulfilled when the timer fires or is
/// rejected.
pub type TimerPromise = Arc<Promise<Result<()>>>;

struct Entry {
    deadline: Instant,
    seq: u64,
    timer: Arc<Timer>,
    completion: Option<TimerPromise>,
}

// Min-heap on deadline, seq as the tiebreaker so equal deadlines fire in submission order.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Holds pending deferred callbacks for one event loop.
pub struct TimerBroker {
    heap: BinaryHeap<Entry>,
    seq: u64,
}

impl TimerBroker {
    pub fn new() -> TimerBroker {
        TimerBroker {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub fn register(&mut self, timer: Arc<Timer>, completion: Option<TimerPromise>) {
        let deadline = Instant::now() + timer.delay();
        self.seq += 1;
        self.heap.push(Entry {
            deadline,
            seq: self.seq,
            timer,
            completion,
        });
    }

    /// The earliest pending deadline, if any.
    pub fn earliest(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pop every timer due at `now`. The caller invokes them outside the broker lock.
    pub fn expire(&mut self, now: Instant) -> Vec<(Arc<Timer>, Option<TimerPromise>)> {
        let mut due = Vec::new();
        while let Some(e) = self.heap.peek() {
            if e.deadline > now {
                break;
            }
            let e = self.heap.pop().unwrap();
            due.push((e.timer, e.completion));
        }
        due
    }

    /// Pop every pending timer regardless of deadline; used on loop shutdown.
    pub fn expire_all(&mut self) -> Vec<(Arc<Timer>, Option<TimerPromise>)> {
        let mut all = Vec::with_capacity(self.heap.len());
        while let Some(e) = self.heap.pop() {
            all.push((e.timer, e.completion));
        }
        all
    }
}

impl Default for TimerBroker {
    fn default() -> Self {
        TimerBroker::new()
    }
}

/// Fulfil a rejected launch without touching the broker.
pub(crate) fn reject(completion: Option<TimerPromise>) {
    if let Some(p) = completion {
        p.set(Err(Error::TimerRejected));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_tracks_heap_head() {
        let mut tb = TimerBroker::new();
        assert!(tb.earliest().is_none());

        tb.register(Timer::new(Duration::from_millis(50), |_| {}), None);
        tb.register(Timer::new(Duration::from_millis(10), |_| {}), None);

        let earliest = tb.earliest().unwrap();
        assert!(earliest <= Instant::now() + Duration::from_millis(10));
        assert_eq!(tb.len(), 2);
    }

    #[test]
    fn expire_pops_only_due_entries() {
        let mut tb = TimerBroker::new();
        tb.register(Timer::new(Duration::from_millis(0), |_| {}), None);
        tb.register(Timer::new(Duration::from_secs(60), |_| {}), None);

        let due = tb.expire(Instant::now() + Duration::from_millis(1));
        assert_eq!(due.len(), 1);
        assert_eq!(tb.len(), 1);
    }

    #[test]
    fn expire_all_drains_everything() {
        let mut tb = TimerBroker::new();
        for _ in 0..4 {
            tb.register(Timer::new(Duration::from_secs(60), |_| {}), None);
        }
        assert_eq!(tb.expire_all().len(), 4);
        assert!(tb.is_empty());
    }
}
