//! Purpose: Best-effort broadcast of epoch shifts to threads holding epoch-keyed caches.
//! Exports: `EpochNotifier`, `WaitOutcome`.
//! Role: Optimization hook for `notify_threads`; correctness never depends on delivery.
//! Invariants: Posting never blocks writers; waiters observe a monotonically increasing sequence.
//! Invariants: Poisoned state degrades to "timed out" rather than panicking.
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::core::epoch::Epoch;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    Signaled { seq: u64, epoch: Epoch },
    TimedOut,
}

#[derive(Debug)]
struct Posted {
    seq: u64,
    epoch: Epoch,
}

#[derive(Debug)]
pub struct EpochNotifier {
    posted: Mutex<Posted>,
    cond: Condvar,
}

impl Default for EpochNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochNotifier {
    pub fn new() -> Self {
        Self {
            posted: Mutex::new(Posted {
                seq: 0,
                epoch: Epoch::ZERO,
            }),
            cond: Condvar::new(),
        }
    }

    /// Publishes `epoch` and wakes every waiter. Returns the new sequence.
    pub fn post(&self, epoch: Epoch) -> u64 {
        let seq = match self.posted.lock() {
            Ok(mut posted) => {
                posted.seq += 1;
                posted.epoch = epoch;
                posted.seq
            }
            Err(_) => return 0,
        };
        self.cond.notify_all();
        seq
    }

    pub fn seq(&self) -> u64 {
        self.posted.lock().map(|posted| posted.seq).unwrap_or(0)
    }

    /// Waits for a post newer than `seen`.
    pub fn wait_after(&self, seen: u64, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let Ok(mut posted) = self.posted.lock() else {
            return WaitOutcome::TimedOut;
        };
        loop {
            if posted.seq > seen {
                return WaitOutcome::Signaled {
                    seq: posted.seq,
                    epoch: posted.epoch,
                };
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            posted = match self.cond.wait_timeout(posted, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return WaitOutcome::TimedOut,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{EpochNotifier, WaitOutcome};
    use crate::core::epoch::Epoch;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_times_out_without_post() {
        let notifier = EpochNotifier::new();
        assert_eq!(
            notifier.wait_after(0, Duration::from_millis(10)),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn post_wakes_waiters() {
        let notifier = Arc::new(EpochNotifier::new());
        let seen = notifier.seq();
        let waiter = {
            let notifier = Arc::clone(&notifier);
            thread::spawn(move || notifier.wait_after(seen, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(10));
        notifier.post(Epoch::ONE);
        assert_eq!(
            waiter.join().expect("join"),
            WaitOutcome::Signaled {
                seq: 1,
                epoch: Epoch::ONE
            }
        );
    }

    #[test]
    fn earlier_posts_are_observed_immediately() {
        let notifier = EpochNotifier::new();
        notifier.post(Epoch::ONE);
        notifier.post(Epoch::ZERO);
        match notifier.wait_after(1, Duration::from_millis(1)) {
            WaitOutcome::Signaled { seq, epoch } => {
                assert_eq!(seq, 2);
                assert_eq!(epoch, Epoch::ZERO);
            }
            WaitOutcome::TimedOut => panic!("expected signal"),
        }
    }
}
