//! The per-loop batching state machine.
//!
//! Each iteration either flushes (interval or timeout trigger, or size
//! reached) or waits a bounded time for one more message and folds it into
//! the [`BatchAccumulator`]. Timeout detection and the flush it causes are one
//! iteration apart: the loop raises its own timeout trigger after a receive
//! and consumes it at the top of the next pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::accumulator::BatchAccumulator;
use crate::aggregation::AggregationStrategy;
use crate::broker::{Receiver, Session};
use crate::config::BatchSettings;
use crate::error::BrokerError;
use crate::exchange::{Exchange, BATCH_COMPLETE};
use crate::processor::{ExceptionHandler, Processor};
use crate::stats;
use crate::trigger::CompletionTrigger;

/// Lower bound on a timeout-driven wait so a receive never degenerates into
/// an indefinite block once the batch deadline has passed.
const MIN_TIMEOUT_WAIT: Duration = Duration::from_millis(1);

/// The collaborators every loop of one consumer shares.
#[derive(Clone)]
pub struct BatchHandlers {
    pub aggregation: Arc<dyn AggregationStrategy>,
    pub processor: Arc<dyn Processor>,
    pub exception_handler: Arc<dyn ExceptionHandler>,
}

/// How a delivered batch's session was finalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Committed,
    RolledBack,
}

// ── SessionCompletion ───────────────────────────────────────────────

/// Finalises the session of exactly one batch.
///
/// Created immediately before the processor runs; consuming either branch
/// commits or rolls back. This is the only place a session is committed.
pub struct SessionCompletion<'s> {
    session: &'s mut dyn Session,
}

impl<'s> SessionCompletion<'s> {
    pub fn new(session: &'s mut dyn Session) -> Self {
        Self { session }
    }

    /// The processor succeeded: commit. A failed commit is rolled back.
    pub fn on_complete(self) -> BatchOutcome {
        match self.session.commit() {
            Ok(()) => BatchOutcome::Committed,
            Err(e) => {
                warn!(error = %e, "failed to commit batch session, rolling back");
                self.on_failure()
            }
        }
    }

    /// The processor failed: roll back so the messages are redelivered.
    pub fn on_failure(self) -> BatchOutcome {
        if let Err(e) = self.session.rollback() {
            warn!(error = %e, "failed to roll back batch session");
        }
        BatchOutcome::RolledBack
    }
}

/// How long the next receive may wait.
///
/// With a batch timeout in force and a batch already running, the wait is
/// the shorter of the poll duration and the time left in the batch, but
/// never less than [`MIN_TIMEOUT_WAIT`].
pub fn receive_wait_time(poll: Duration, timeout: Duration, elapsed: Duration) -> Duration {
    let remaining = timeout.saturating_sub(elapsed).max(MIN_TIMEOUT_WAIT);
    trace!(?remaining, "time remaining this batch");
    remaining.min(poll)
}

// ── BatchConsumptionTask ────────────────────────────────────────────

pub struct BatchConsumptionTask {
    settings: BatchSettings,
    handlers: BatchHandlers,
    running: Arc<AtomicBool>,
    interval_trigger: Arc<CompletionTrigger>,
    timeout_trigger: CompletionTrigger,
    accumulator: BatchAccumulator,
}

impl BatchConsumptionTask {
    pub fn new(
        settings: BatchSettings,
        handlers: BatchHandlers,
        running: Arc<AtomicBool>,
        interval_trigger: Arc<CompletionTrigger>,
    ) -> Self {
        Self {
            settings,
            handlers,
            running,
            interval_trigger,
            timeout_trigger: CompletionTrigger::new(),
            accumulator: BatchAccumulator::new(),
        }
    }

    /// Consume batches until the running flag is cleared.
    ///
    /// Broker errors from receive or rollback end the loop and are returned to
    /// the caller. A batch still open when the loop ends is rolled back.
    pub fn consume_batches_on_loop(
        &mut self,
        session: &mut dyn Session,
        receiver: &mut dyn Receiver,
    ) -> Result<(), BrokerError> {
        let using_timeout = self.settings.uses_timeout();
        trace!("batch consumption task start");

        while self.running.load(Ordering::Acquire) {
            if self.timeout_trigger.consume() || self.interval_trigger.consume() {
                trace!("completion batch due to timeout");
                self.completion_batch(session);
                continue;
            }

            if self.settings.completion_size > 0
                && self.accumulator.message_count() >= self.settings.completion_size
            {
                trace!("completion batch due to size");
                self.completion_batch(session);
                continue;
            }

            let elapsed = self.accumulator.elapsed();
            let wait = if using_timeout && !elapsed.is_zero() {
                receive_wait_time(
                    self.settings.poll_duration,
                    self.settings.completion_timeout,
                    elapsed,
                )
            } else {
                self.settings.poll_duration
            };
            let message = receiver.receive(wait)?;

            if !self.running.load(Ordering::Acquire) {
                info!(
                    pending = self.accumulator.message_count(),
                    "shutdown signal received, rolling back batch"
                );
                self.accumulator.reset();
                session.rollback()?;
                break;
            }

            match message {
                None => trace!("no message received"),
                Some(message) => {
                    let total = stats::record_received();
                    let count = self.accumulator.fold(
                        Exchange::from_message(message),
                        &*self.handlers.aggregation,
                        using_timeout,
                    );
                    debug!(count, total, "message received");
                }
            }

            if using_timeout {
                if let Some(elapsed) = self.accumulator.refresh_elapsed() {
                    if elapsed > self.settings.completion_timeout {
                        self.timeout_trigger.fire();
                    } else {
                        trace!(?elapsed, timeout = ?self.settings.completion_timeout, "batch has more time until the timeout");
                    }
                }
            }
        }

        if !self.accumulator.is_empty() {
            info!(
                pending = self.accumulator.message_count(),
                "consumer stopping with an open batch, rolling back"
            );
            self.accumulator.reset();
            session.rollback()?;
        }

        trace!("batch consumption task end");
        Ok(())
    }

    /// Flush whatever the accumulator holds and reset it.
    ///
    /// Returns `None` when no session-bound batch was delivered.
    fn completion_batch(&mut self, session: &mut dyn Session) -> Option<BatchOutcome> {
        match self.accumulator.take() {
            Some(exchange) => Some(self.process_batch(exchange, session)),
            None => {
                if self.settings.send_empty_message_when_idle {
                    self.process_empty_message();
                }
                None
            }
        }
    }

    /// Nothing was accumulated: send an empty exchange. The session is not
    /// involved, so a failure here has nothing to roll back.
    fn process_empty_message(&self) {
        let mut exchange = Exchange::empty();
        debug!("sending empty message as there were no messages from polling");
        if let Err(e) = self.handlers.processor.process(&mut exchange) {
            self.handlers
                .exception_handler
                .handle_exception("Error processing exchange", &exchange, &e);
        }
    }

    fn process_batch(&self, mut exchange: Exchange, session: &mut dyn Session) -> BatchOutcome {
        let id = stats::next_batch_id();
        let batch_size = exchange.batch_size().unwrap_or_else(|| exchange.len());
        debug!(batch_id = id, size = batch_size, "processing batch");

        exchange.set_property(BATCH_COMPLETE, true);
        let completion = SessionCompletion::new(session);
        match self.handlers.processor.process(&mut exchange) {
            Ok(()) => {
                let outcome = completion.on_complete();
                if outcome == BatchOutcome::Committed {
                    let total = stats::record_processed(batch_size);
                    debug!(batch_id = id, total, "completed processing");
                }
                outcome
            }
            Err(e) => {
                self.handlers
                    .exception_handler
                    .handle_exception("Error processing exchange", &exchange, &e);
                completion.on_failure()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    use crate::aggregation::GroupedMessagesStrategy;
    use crate::broker::{Connection, ConnectionFactory};
    use crate::config::BatchConfig;
    use crate::error::ProcessError;
    use crate::memory::InMemoryBroker;
    use crate::message::Message;

    const QUEUE: &str = "task-test";

    /// Records batches; optionally fails them and clears the running flag
    /// after a number of calls so the loop ends deterministically.
    struct ScriptedProcessor {
        batches: Mutex<Vec<Exchange>>,
        fail: bool,
        stop_after: usize,
        running: Arc<AtomicBool>,
    }

    impl Processor for ScriptedProcessor {
        fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessError> {
            let mut batches = self.batches.lock().unwrap();
            batches.push(exchange.clone());
            if batches.len() >= self.stop_after {
                self.running.store(false, Ordering::Release);
            }
            if self.fail {
                Err(ProcessError::failed("downstream rejected batch"))
            } else {
                Ok(())
            }
        }
    }

    /// One call to the exception handler.
    #[derive(Debug, Clone)]
    struct Failure {
        description: String,
        bodies: Vec<String>,
        error: String,
    }

    #[derive(Default)]
    struct RecordingExceptionHandler {
        failures: Mutex<Vec<Failure>>,
    }

    impl ExceptionHandler for RecordingExceptionHandler {
        fn handle_exception(&self, description: &str, exchange: &Exchange, error: &ProcessError) {
            self.failures.lock().unwrap().push(Failure {
                description: description.to_string(),
                bodies: exchange.bodies().into_iter().map(str::to_string).collect(),
                error: error.to_string(),
            });
        }
    }

    struct Harness {
        broker: InMemoryBroker,
        processor: Arc<ScriptedProcessor>,
        exceptions: Arc<RecordingExceptionHandler>,
        task: BatchConsumptionTask,
        trigger: Arc<CompletionTrigger>,
        running: Arc<AtomicBool>,
    }

    fn harness(config: BatchConfig, fail: bool, stop_after: usize) -> Harness {
        let running = Arc::new(AtomicBool::new(true));
        let processor = Arc::new(ScriptedProcessor {
            batches: Mutex::new(Vec::new()),
            fail,
            stop_after,
            running: Arc::clone(&running),
        });
        let exceptions = Arc::new(RecordingExceptionHandler::default());
        let handlers = BatchHandlers {
            aggregation: Arc::new(GroupedMessagesStrategy),
            processor: processor.clone(),
            exception_handler: exceptions.clone(),
        };
        let trigger = Arc::new(CompletionTrigger::new());
        let task = BatchConsumptionTask::new(
            config.settings().unwrap(),
            handlers,
            Arc::clone(&running),
            Arc::clone(&trigger),
        );
        Harness {
            broker: InMemoryBroker::new(),
            processor,
            exceptions,
            task,
            trigger,
            running,
        }
    }

    fn run(h: &mut Harness) -> Result<(), BrokerError> {
        let connection = h.broker.create_connection().unwrap();
        let mut session = connection.create_session().unwrap();
        let mut receiver = session.create_receiver(QUEUE).unwrap();
        let result = h.task.consume_batches_on_loop(&mut *session, &mut *receiver);
        session.close().unwrap();
        result
    }

    fn send(broker: &InMemoryBroker, bodies: &[&str]) {
        for body in bodies {
            broker.send(QUEUE, Message::new(*body));
        }
    }

    #[test]
    fn wait_time_uses_poll_when_plenty_of_time_left() {
        let wait = receive_wait_time(
            Duration::from_millis(100),
            Duration::from_millis(500),
            Duration::from_millis(50),
        );
        assert_eq!(wait, Duration::from_millis(100));
    }

    #[test]
    fn wait_time_shrinks_to_remaining() {
        let wait = receive_wait_time(
            Duration::from_millis(1000),
            Duration::from_millis(500),
            Duration::from_millis(420),
        );
        assert_eq!(wait, Duration::from_millis(80));
    }

    #[test]
    fn wait_time_floors_at_one_millisecond() {
        let wait = receive_wait_time(
            Duration::from_millis(1000),
            Duration::from_millis(500),
            Duration::from_millis(900),
        );
        assert_eq!(wait, Duration::from_millis(1));
    }

    #[test]
    fn wait_time_zero_poll_stays_non_blocking() {
        let wait = receive_wait_time(
            Duration::ZERO,
            Duration::from_millis(500),
            Duration::from_millis(10),
        );
        assert_eq!(wait, Duration::ZERO);
    }

    #[test]
    fn size_completion_commits_once() {
        let config = BatchConfig::new(QUEUE)
            .completion_size(3)
            .completion_timeout(Duration::ZERO)
            .poll_duration(Duration::from_millis(10));
        let mut h = harness(config, false, 1);
        send(&h.broker, &["a", "b", "c"]);

        run(&mut h).unwrap();

        let batches = h.processor.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].bodies(), vec!["a", "b", "c"]);
        assert_eq!(batches[0].batch_size(), Some(3));
        assert_eq!(batches[0].property(BATCH_COMPLETE), Some(&serde_json::Value::Bool(true)));
        assert_eq!(h.broker.commit_count(), 1);
        assert_eq!(h.broker.rollback_count(), 0);
        assert_eq!(h.broker.depth(QUEUE), 0);
    }

    #[test]
    fn batches_split_by_size_in_order() {
        let config = BatchConfig::new(QUEUE)
            .completion_size(2)
            .completion_timeout(Duration::ZERO)
            .poll_duration(Duration::from_millis(10));
        let mut h = harness(config, false, 3);
        send(&h.broker, &["1", "2", "3", "4", "5", "6"]);

        run(&mut h).unwrap();

        let batches = h.processor.batches.lock().unwrap();
        let bodies: Vec<Vec<&str>> = batches.iter().map(|b| b.bodies()).collect();
        assert_eq!(bodies, vec![vec!["1", "2"], vec!["3", "4"], vec!["5", "6"]]);
        assert_eq!(h.broker.commit_count(), 3);
    }

    #[test]
    fn processor_failure_rolls_back() {
        let config = BatchConfig::new(QUEUE)
            .completion_size(2)
            .completion_timeout(Duration::ZERO)
            .poll_duration(Duration::from_millis(10));
        let mut h = harness(config, true, 1);
        send(&h.broker, &["a", "b"]);

        run(&mut h).unwrap();

        assert_eq!(h.processor.batches.lock().unwrap().len(), 1);
        assert_eq!(h.broker.commit_count(), 0);
        assert_eq!(h.broker.rollback_count(), 1);
        assert_eq!(h.broker.depth(QUEUE), 2);

        let failures = h.exceptions.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].description, "Error processing exchange");
        assert_eq!(failures[0].bodies, vec!["a", "b"]);
        assert!(failures[0].error.contains("downstream rejected batch"));
    }

    #[test]
    fn successful_batch_never_reaches_exception_handler() {
        let config = BatchConfig::new(QUEUE)
            .completion_size(1)
            .completion_timeout(Duration::ZERO)
            .poll_duration(Duration::from_millis(10));
        let mut h = harness(config, false, 1);
        send(&h.broker, &["ok"]);

        run(&mut h).unwrap();

        assert_eq!(h.broker.commit_count(), 1);
        assert!(h.exceptions.failures.lock().unwrap().is_empty());
    }

    #[test]
    fn interval_trigger_flushes_partial_batch() {
        let config = BatchConfig::new(QUEUE)
            .completion_size(100)
            .completion_interval(Duration::from_millis(1000))
            .poll_duration(Duration::from_millis(10));
        let mut h = harness(config, false, 1);
        send(&h.broker, &["a"]);

        let trigger = Arc::clone(&h.trigger);
        let fire = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            trigger.fire();
        });
        run(&mut h).unwrap();
        fire.join().unwrap();

        let batches = h.processor.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].bodies(), vec!["a"]);
        assert_eq!(h.broker.commit_count(), 1);
    }

    #[test]
    fn timeout_flushes_after_deadline() {
        let timeout = Duration::from_millis(100);
        let config = BatchConfig::new(QUEUE)
            .completion_size(100)
            .completion_timeout(timeout)
            .poll_duration(Duration::from_millis(20));
        let mut h = harness(config, false, 1);
        send(&h.broker, &["only"]);

        let started = Instant::now();
        run(&mut h).unwrap();

        assert!(started.elapsed() >= timeout);
        let batches = h.processor.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].bodies(), vec!["only"]);
    }

    #[test]
    fn empty_interval_flush_sends_empty_exchange_without_session() {
        let config = BatchConfig::new(QUEUE)
            .completion_interval(Duration::from_millis(1000))
            .send_empty_message_when_idle(true)
            .poll_duration(Duration::from_millis(10));
        let mut h = harness(config, true, 1);
        h.trigger.fire();

        run(&mut h).unwrap();

        let batches = h.processor.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_empty());
        assert_eq!(h.broker.commit_count(), 0);
        assert_eq!(h.broker.rollback_count(), 0);

        // The scripted processor fails, so the empty exchange is reported.
        let failures = h.exceptions.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].description, "Error processing exchange");
        assert!(failures[0].bodies.is_empty());
        assert!(failures[0].error.contains("downstream rejected batch"));
    }

    #[test]
    fn empty_flush_without_send_empty_is_silent() {
        let config = BatchConfig::new(QUEUE)
            .completion_interval(Duration::from_millis(1000))
            .poll_duration(Duration::from_millis(10));
        let mut h = harness(config, false, 1);
        h.trigger.fire();

        let running = Arc::clone(&h.running);
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            running.store(false, Ordering::Release);
        });
        run(&mut h).unwrap();
        stopper.join().unwrap();

        assert!(h.processor.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn shutdown_mid_wait_rolls_back_partial_batch() {
        let config = BatchConfig::new(QUEUE)
            .completion_size(10)
            .completion_timeout(Duration::ZERO)
            .poll_duration(Duration::from_millis(20));
        let mut h = harness(config, false, 1);
        send(&h.broker, &["a", "b"]);

        let running = Arc::clone(&h.running);
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            running.store(false, Ordering::Release);
        });
        run(&mut h).unwrap();
        stopper.join().unwrap();

        assert!(h.processor.batches.lock().unwrap().is_empty());
        assert_eq!(h.broker.commit_count(), 0);
        assert_eq!(h.broker.rollback_count(), 1);
        assert_eq!(h.broker.depth(QUEUE), 2);
    }

    #[test]
    fn receive_error_ends_task() {
        let config = BatchConfig::new(QUEUE).poll_duration(Duration::from_millis(10));
        let mut h = harness(config, false, 1);
        h.broker.fail_receives();

        let result = run(&mut h);
        assert!(matches!(result, Err(BrokerError::Receive(_))));
    }
}
