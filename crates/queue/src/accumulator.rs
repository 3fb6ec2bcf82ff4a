//! Per-loop batch state.
//!
//! Tracks how many messages the current batch holds, when its first message
//! arrived and the exchange they have been folded into. Owned by exactly one
//! consumer loop, so no synchronisation is needed.

use std::time::{Duration, Instant};

use crate::aggregation::AggregationStrategy;
use crate::exchange::{Exchange, BATCH_SIZE};

/// Accumulates exchanges into the current batch.
///
/// Invariant: `aggregated` is `Some` iff `message_count > 0`.
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    message_count: usize,
    elapsed: Duration,
    started: Option<Instant>,
    aggregated: Option<Exchange>,
}

impl BatchAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one received exchange into the batch.
    ///
    /// When `track_start` is set the batch clock starts on the first fold.
    /// The aggregated exchange is stamped with the running count under
    /// [`BATCH_SIZE`]. Returns the new message count.
    pub fn fold(
        &mut self,
        exchange: Exchange,
        strategy: &dyn AggregationStrategy,
        track_start: bool,
    ) -> usize {
        self.message_count += 1;
        if track_start && self.started.is_none() {
            self.started = Some(Instant::now());
        }
        let mut aggregated = strategy.aggregate(self.aggregated.take(), exchange);
        aggregated.set_property(BATCH_SIZE, self.message_count);
        self.aggregated = Some(aggregated);
        self.message_count
    }

    /// Recompute the time since the batch started.
    ///
    /// Returns `None` when the batch clock is not running.
    pub fn refresh_elapsed(&mut self) -> Option<Duration> {
        let started = self.started?;
        self.elapsed = started.elapsed();
        Some(self.elapsed)
    }

    /// Elapsed time as of the last [`refresh_elapsed`](Self::refresh_elapsed).
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn message_count(&self) -> usize {
        self.message_count
    }

    pub fn is_empty(&self) -> bool {
        self.message_count == 0
    }

    /// Take the accumulated exchange, resetting the batch.
    pub fn take(&mut self) -> Option<Exchange> {
        let batch = self.aggregated.take();
        self.reset();
        batch
    }

    pub fn reset(&mut self) {
        self.message_count = 0;
        self.elapsed = Duration::ZERO;
        self.started = None;
        self.aggregated = None;
    }
}
