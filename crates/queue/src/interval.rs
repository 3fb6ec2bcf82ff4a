//! Fixed-rate completion across all consumer loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::BatchError;
use crate::trigger::CompletionTrigger;

const SCHEDULER_THREAD_NAME: &str = "qbatch-completion-interval";

// ── Scheduler ───────────────────────────────────────────────────────

/// Where the broadcaster's timer runs.
///
/// Either a handle to a runtime someone else owns, or a dedicated
/// single-worker runtime created for this consumer. Only a dedicated
/// runtime is shut down when the scheduler is dropped.
pub struct Scheduler {
    handle: Handle,
    owned: Option<Runtime>,
}

impl Scheduler {
    pub fn external(handle: Handle) -> Self {
        Self {
            handle,
            owned: None,
        }
    }

    pub fn dedicated() -> Result<Self, BatchError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(SCHEDULER_THREAD_NAME)
            .enable_time()
            .build()
            .map_err(|e| BatchError::Runtime(format!("failed to build interval scheduler: {e}")))?;
        Ok(Self {
            handle: runtime.handle().clone(),
            owned: Some(runtime),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_owned(&self) -> bool {
        self.owned.is_some()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.owned.take() {
            runtime.shutdown_background();
        }
    }
}

// ── IntervalBroadcaster ─────────────────────────────────────────────

/// Fires every loop's [`CompletionTrigger`] at a fixed rate so that all
/// loops flush together.
pub struct IntervalBroadcaster {
    interval: Duration,
    triggers: Vec<Arc<CompletionTrigger>>,
    started: Arc<AtomicBool>,
}

impl IntervalBroadcaster {
    /// `started` gates firing: ticks that arrive before the owning consumer
    /// has finished starting are dropped.
    pub fn new(
        interval: Duration,
        triggers: Vec<Arc<CompletionTrigger>>,
        started: Arc<AtomicBool>,
    ) -> Self {
        Self {
            interval,
            triggers,
            started,
        }
    }

    /// One tick. Returns whether the triggers were fired.
    pub fn fire(&self) -> bool {
        if !self.started.load(Ordering::Acquire) {
            trace!("completion interval tick skipped, consumer not started yet");
            return false;
        }
        for trigger in &self.triggers {
            trigger.fire();
        }
        true
    }

    /// Run on `scheduler` until the returned task is aborted. The first tick
    /// comes one interval after spawning.
    pub fn spawn(self, scheduler: &Scheduler) -> JoinHandle<()> {
        scheduler.handle().spawn(async move {
            let first = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(first, self.interval);
            loop {
                ticker.tick().await;
                self.fire();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triggers(n: usize) -> Vec<Arc<CompletionTrigger>> {
        (0..n).map(|_| Arc::new(CompletionTrigger::new())).collect()
    }

    #[test]
    fn fire_sets_every_trigger() {
        let triggers = triggers(3);
        let started = Arc::new(AtomicBool::new(true));
        let broadcaster =
            IntervalBroadcaster::new(Duration::from_millis(100), triggers.clone(), started);

        assert!(broadcaster.fire());
        assert!(triggers.iter().all(|t| t.consume()));
    }

    #[test]
    fn fire_is_noop_before_start() {
        let triggers = triggers(2);
        let started = Arc::new(AtomicBool::new(false));
        let broadcaster = IntervalBroadcaster::new(
            Duration::from_millis(100),
            triggers.clone(),
            Arc::clone(&started),
        );

        assert!(!broadcaster.fire());
        assert!(triggers.iter().all(|t| !t.is_fired()));

        started.store(true, Ordering::Release);
        assert!(broadcaster.fire());
    }

    #[test]
    fn dedicated_scheduler_ticks() {
        let scheduler = Scheduler::dedicated().unwrap();
        assert!(scheduler.is_owned());
        let triggers = triggers(1);
        let broadcaster = IntervalBroadcaster::new(
            Duration::from_millis(20),
            triggers.clone(),
            Arc::new(AtomicBool::new(true)),
        );

        let task = broadcaster.spawn(&scheduler);
        std::thread::sleep(Duration::from_millis(100));
        task.abort();

        assert!(triggers[0].consume());
        drop(scheduler);
    }

    #[tokio::test]
    async fn external_scheduler_is_not_owned() {
        let scheduler = Scheduler::external(Handle::current());
        assert!(!scheduler.is_owned());
        let triggers = triggers(2);
        let broadcaster = IntervalBroadcaster::new(
            Duration::from_millis(20),
            triggers.clone(),
            Arc::new(AtomicBool::new(true)),
        );

        let task = broadcaster.spawn(&scheduler);
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();
        drop(scheduler);

        assert!(triggers.iter().all(|t| t.consume()));
    }
}
