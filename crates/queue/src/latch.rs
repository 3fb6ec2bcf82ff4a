//! Countdown latch used to wait for consumer loops to exit.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Counts down from the number of consumer loops. Each loop counts down
/// once on exit; the supervisor waits, bounded, for zero.
#[derive(Debug)]
pub struct ShutdownLatch {
    remaining: Mutex<usize>,
    zero: Condvar,
}

impl ShutdownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.remaining.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn count_down(&self) {
        let mut remaining = self.lock();
        if *remaining > 0 {
            *remaining -= 1;
            if *remaining == 0 {
                self.zero.notify_all();
            }
        }
    }

    pub fn count(&self) -> usize {
        *self.lock()
    }

    /// Wait up to `timeout` for the count to reach zero.
    ///
    /// Returns `true` if it did, `false` if the wait timed out. A timeout too
    /// large to represent as a deadline waits without bound.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut remaining = self.lock();
        while *remaining > 0 {
            remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.zero
                        .wait_timeout(remaining, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .zero
                    .wait(remaining)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
        true
    }

    /// A guard that counts down exactly once when dropped, including during
    /// a panic unwind.
    pub fn guard(self: &Arc<Self>) -> LatchGuard {
        LatchGuard {
            latch: Arc::clone(self),
        }
    }
}

pub struct LatchGuard {
    latch: Arc<ShutdownLatch>,
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.latch.count_down();
    }
}
