//! One-shot completion flag shared between a setter and a single consumer.

use std::sync::atomic::{AtomicBool, Ordering};

/// A flag raised by one party (the interval broadcaster, or the loop itself
/// when it detects a batch timeout) and consumed by the owning loop.
#[derive(Debug, Default)]
pub struct CompletionTrigger {
    fired: AtomicBool,
}

impl CompletionTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.fired.store(true, Ordering::Release);
    }

    /// Test-and-clear. Returns `true` at most once per [`fire`](Self::fire).
    pub fn consume(&self) -> bool {
        self.fired
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
