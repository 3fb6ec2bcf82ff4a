//! One consumer thread: a session, a receiver and the batching task.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::broker::{Connection, Receiver, Session};
use crate::config::BatchSettings;
use crate::error::BrokerError;
use crate::latch::ShutdownLatch;
use crate::task::{BatchConsumptionTask, BatchHandlers};
use crate::trigger::CompletionTrigger;

/// Runs one [`BatchConsumptionTask`] over its own transacted session.
///
/// Broker errors end this loop only. The receiver is closed before the
/// session on every exit path, panics included, so an uncommitted batch is
/// always released back to the broker. The shutdown latch is counted down
/// exactly once.
pub struct ConsumptionLoop {
    id: usize,
    destination: String,
    connection: Arc<dyn Connection>,
    latch: Arc<ShutdownLatch>,
    completion_trigger: Arc<CompletionTrigger>,
    task: BatchConsumptionTask,
}

impl ConsumptionLoop {
    pub fn new(
        id: usize,
        destination: impl Into<String>,
        connection: Arc<dyn Connection>,
        latch: Arc<ShutdownLatch>,
        settings: BatchSettings,
        handlers: BatchHandlers,
        running: Arc<AtomicBool>,
    ) -> Self {
        let completion_trigger = Arc::new(CompletionTrigger::new());
        let task = BatchConsumptionTask::new(
            settings,
            handlers,
            running,
            Arc::clone(&completion_trigger),
        );
        Self {
            id,
            destination: destination.into(),
            connection,
            latch,
            completion_trigger,
            task,
        }
    }

    /// The trigger an interval broadcaster fires to flush this loop.
    pub fn completion_trigger(&self) -> Arc<CompletionTrigger> {
        Arc::clone(&self.completion_trigger)
    }

    pub fn run(mut self) {
        let _shutdown = self.latch.guard();
        debug!(loop_id = self.id, destination = %self.destination, "consumer loop started");

        if let Err(e) = self.consume() {
            warn!(
                loop_id = self.id,
                destination = %self.destination,
                error = %e,
                "exception caught consuming from destination"
            );
        }

        debug!(loop_id = self.id, "consumer loop exited");
    }

    fn consume(&mut self) -> Result<(), BrokerError> {
        let mut session = SessionGuard {
            loop_id: self.id,
            session: self.connection.create_session()?,
        };
        // Declared after the session guard so it is dropped first.
        let mut receiver = ReceiverGuard {
            loop_id: self.id,
            receiver: session.session.create_receiver(&self.destination)?,
        };
        self.task
            .consume_batches_on_loop(&mut *session.session, &mut *receiver.receiver)
    }
}

// ── Close guards ────────────────────────────────────────────────────

/// Closes the session on drop. Closing rolls back anything uncommitted.
struct SessionGuard {
    loop_id: usize,
    session: Box<dyn Session>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.session.close() {
            warn!(loop_id = self.loop_id, error = %e, "exception caught closing session");
        }
    }
}

struct ReceiverGuard {
    loop_id: usize,
    receiver: Box<dyn Receiver>,
}

impl Drop for ReceiverGuard {
    fn drop(&mut self) {
        if let Err(e) = self.receiver.close() {
            warn!(loop_id = self.loop_id, error = %e, "exception caught closing receiver");
        }
    }
}
