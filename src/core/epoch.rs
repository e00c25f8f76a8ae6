//! Purpose: Track the global two-generation epoch and the writers active in each generation.
//! Exports: `Epoch`, `EpochController`, `EpochPin`, `Quiescence`.
//! Role: Safepoint substitute; a drain pass quiesces the retiring generation before flipping.
//! Invariants: The epoch flips only while a `Quiescence` barrier is held.
//! Invariants: A pin is granted only for the generation that is current when it is granted.
//! Invariants: At most two generations are live; pins on the retiring one reach zero before drain.
use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::thread;

use serde::Serialize;

const NO_DRAIN: u8 = u8::MAX;
const SPIN_LIMIT: u32 = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(transparent)]
pub struct Epoch(u8);

impl Epoch {
    pub const ZERO: Epoch = Epoch(0);
    pub const ONE: Epoch = Epoch(1);

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn other(self) -> Epoch {
        Epoch(self.0 ^ 1)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
pub struct EpochController {
    current: AtomicU8,
    writers: [AtomicUsize; 2],
    barrier: AtomicBool,
    draining: AtomicU8,
    shifts: AtomicU64,
}

impl Default for EpochController {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochController {
    pub fn new() -> Self {
        Self {
            current: AtomicU8::new(0),
            writers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            barrier: AtomicBool::new(false),
            draining: AtomicU8::new(NO_DRAIN),
            shifts: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> Epoch {
        Epoch(self.current.load(Ordering::SeqCst))
    }

    pub fn previous(&self) -> Epoch {
        self.current().other()
    }

    /// Generation being retired by an in-progress drain pass.
    pub fn draining(&self) -> Option<Epoch> {
        match self.draining.load(Ordering::SeqCst) {
            NO_DRAIN => None,
            value => Some(Epoch(value)),
        }
    }

    pub fn active_writers(&self, epoch: Epoch) -> usize {
        self.writers[epoch.index()].load(Ordering::SeqCst)
    }

    pub fn shifts(&self) -> u64 {
        self.shifts.load(Ordering::SeqCst)
    }

    /// Registers the caller as a writer in the current generation.
    ///
    /// Waits while a drain pass holds the barrier. The returned pin keeps the
    /// generation from flipping until it is dropped.
    pub fn pin(&self) -> EpochPin<'_> {
        let mut spins = 0;
        loop {
            while self.barrier.load(Ordering::SeqCst) {
                backoff(&mut spins);
            }
            let epoch = self.current();
            self.writers[epoch.index()].fetch_add(1, Ordering::SeqCst);
            if !self.barrier.load(Ordering::SeqCst) && self.current() == epoch {
                return EpochPin {
                    controller: self,
                    epoch,
                };
            }
            self.writers[epoch.index()].fetch_sub(1, Ordering::SeqCst);
            backoff(&mut spins);
        }
    }

    /// Blocks new pins and waits until no writer is active in the current generation.
    ///
    /// Must not be called by a thread that holds a pin.
    pub fn quiesce(&self) -> Quiescence<'_> {
        let mut spins = 0;
        while self
            .barrier
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            backoff(&mut spins);
        }
        let retiring = self.current();
        spins = 0;
        while self.active_writers(retiring) != 0 {
            backoff(&mut spins);
        }
        self.draining.store(retiring.value(), Ordering::SeqCst);
        Quiescence {
            controller: self,
            retiring,
            flipped: false,
        }
    }
}

fn backoff(spins: &mut u32) {
    if *spins < SPIN_LIMIT {
        *spins += 1;
        hint::spin_loop();
    } else {
        thread::yield_now();
    }
}

#[must_use]
#[derive(Debug)]
pub struct EpochPin<'a> {
    controller: &'a EpochController,
    epoch: Epoch,
}

impl EpochPin<'_> {
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }
}

impl Drop for EpochPin<'_> {
    fn drop(&mut self) {
        self.controller.writers[self.epoch.index()].fetch_sub(1, Ordering::SeqCst);
    }
}

#[must_use]
#[derive(Debug)]
pub struct Quiescence<'a> {
    controller: &'a EpochController,
    retiring: Epoch,
    flipped: bool,
}

impl Quiescence<'_> {
    pub fn retiring(&self) -> Epoch {
        self.retiring
    }

    pub fn flipped(&self) -> bool {
        self.flipped
    }

    /// Flips the global epoch. Only the first call has an effect.
    pub fn flip(&mut self) -> Epoch {
        if !self.flipped {
            let next = self.retiring.other();
            self.controller.draining.store(NO_DRAIN, Ordering::SeqCst);
            self.controller.current.store(next.value(), Ordering::SeqCst);
            self.controller.shifts.fetch_add(1, Ordering::SeqCst);
            self.flipped = true;
        }
        self.controller.current()
    }
}

impl Drop for Quiescence<'_> {
    fn drop(&mut self) {
        self.controller.draining.store(NO_DRAIN, Ordering::SeqCst);
        self.controller.barrier.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::{Epoch, EpochController};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn flip_alternates_generations() {
        let controller = EpochController::new();
        assert_eq!(controller.current(), Epoch::ZERO);
        {
            let mut barrier = controller.quiesce();
            assert_eq!(controller.draining(), Some(Epoch::ZERO));
            assert_eq!(barrier.flip(), Epoch::ONE);
            assert_eq!(barrier.flip(), Epoch::ONE);
            assert_eq!(controller.draining(), None);
        }
        assert_eq!(controller.current(), Epoch::ONE);
        assert_eq!(controller.previous(), Epoch::ZERO);
        assert_eq!(controller.shifts(), 1);
    }

    #[test]
    fn pins_are_counted_per_generation() {
        let controller = EpochController::new();
        let first = controller.pin();
        let second = controller.pin();
        assert_eq!(first.epoch(), Epoch::ZERO);
        assert_eq!(controller.active_writers(Epoch::ZERO), 2);
        drop(first);
        drop(second);
        assert_eq!(controller.active_writers(Epoch::ZERO), 0);
        assert_eq!(controller.active_writers(Epoch::ONE), 0);
    }

    #[test]
    fn quiesce_waits_for_active_writers() {
        let controller = Arc::new(EpochController::new());
        let released = Arc::new(AtomicBool::new(false));

        let pin = controller.pin();
        let waiter = {
            let controller = Arc::clone(&controller);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                let mut barrier = controller.quiesce();
                assert!(released.load(Ordering::SeqCst));
                barrier.flip()
            })
        };

        thread::sleep(Duration::from_millis(20));
        released.store(true, Ordering::SeqCst);
        drop(pin);

        assert_eq!(waiter.join().expect("join"), Epoch::ONE);
        assert_eq!(controller.pin().epoch(), Epoch::ONE);
    }

    #[test]
    fn pins_never_observe_a_retired_generation() {
        let controller = Arc::new(EpochController::new());
        let stop = Arc::new(AtomicBool::new(false));
        let mut writers = Vec::new();
        for _ in 0..4 {
            let controller = Arc::clone(&controller);
            let stop = Arc::clone(&stop);
            writers.push(thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let pin = controller.pin();
                    assert_eq!(pin.epoch(), controller.current());
                }
            }));
        }
        for _ in 0..50 {
            let mut barrier = controller.quiesce();
            assert_eq!(controller.active_writers(barrier.retiring()), 0);
            barrier.flip();
        }
        stop.store(true, Ordering::SeqCst);
        for writer in writers {
            writer.join().expect("join");
        }
        assert_eq!(controller.shifts(), 50);
    }
}
