//! The batch consumer supervisor.
//!
//! A [`BatchConsumer`] owns one broker connection, a fixed pool of consumer
//! loop threads and, when a completion interval is configured, the
//! broadcaster that flushes every loop at a fixed rate. It is built with
//! [`BatchConsumerBuilder`], which validates the configuration up front.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::aggregation::AggregationStrategy;
use crate::broker::{Connection, ConnectionFactory};
use crate::config::{BatchConfig, BatchSettings};
use crate::consumption::ConsumptionLoop;
use crate::error::BatchError;
use crate::interval::{IntervalBroadcaster, Scheduler};
use crate::latch::ShutdownLatch;
use crate::processor::{ExceptionHandler, LoggingExceptionHandler, Processor};
use crate::stats::{self, StatsSnapshot};
use crate::task::BatchHandlers;

/// How long [`BatchConsumer::stop`] waits for loops to exit by default.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

// ── Builder ─────────────────────────────────────────────────────────

/// Assembles a [`BatchConsumer`].
///
/// A connection factory and a processor are required. The aggregation
/// strategy defaults to the one named in the config and the exception
/// handler to [`LoggingExceptionHandler`].
pub struct BatchConsumerBuilder {
    config: BatchConfig,
    factory: Option<Arc<dyn ConnectionFactory>>,
    aggregation: Option<Arc<dyn AggregationStrategy>>,
    processor: Option<Arc<dyn Processor>>,
    exception_handler: Option<Arc<dyn ExceptionHandler>>,
    scheduler: Option<Handle>,
    shutdown_timeout: Duration,
}

impl BatchConsumerBuilder {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            factory: None,
            aggregation: None,
            processor: None,
            exception_handler: None,
            scheduler: None,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }

    pub fn connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn aggregation_strategy(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.aggregation = Some(strategy);
        self
    }

    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    /// Run the completion interval on an existing tokio runtime instead of a
    /// dedicated one.
    pub fn scheduler(mut self, handle: Handle) -> Self {
        self.scheduler = Some(handle);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<BatchConsumer, BatchError> {
        let settings = self.config.settings()?;
        let factory = self
            .factory
            .ok_or_else(|| BatchError::Config("a connection factory is required".into()))?;
        let processor = self
            .processor
            .ok_or_else(|| BatchError::Config("a processor is required".into()))?;
        let handlers = BatchHandlers {
            aggregation: self
                .aggregation
                .unwrap_or_else(|| self.config.aggregation.strategy()),
            processor,
            exception_handler: self
                .exception_handler
                .unwrap_or_else(|| Arc::new(LoggingExceptionHandler)),
        };

        Ok(BatchConsumer {
            destination: self.config.destination,
            settings,
            factory,
            handlers,
            external_scheduler: self.scheduler,
            shutdown_timeout: self.shutdown_timeout,
            running: Arc::new(AtomicBool::new(false)),
            started: Arc::new(AtomicBool::new(false)),
            active: None,
        })
    }
}

// ── BatchConsumer ───────────────────────────────────────────────────

/// Everything that exists only between `start` and `stop`.
struct ActiveConsumers {
    connection: Arc<dyn Connection>,
    latch: Arc<ShutdownLatch>,
    pool: rayon::ThreadPool,
    interval: Option<(Scheduler, JoinHandle<()>)>,
}

pub struct BatchConsumer {
    destination: String,
    settings: BatchSettings,
    factory: Arc<dyn ConnectionFactory>,
    handlers: BatchHandlers,
    external_scheduler: Option<Handle>,
    shutdown_timeout: Duration,
    /// Cleared to ask every loop to exit. Replaced on each start so loops
    /// left over from a timed-out stop stay stopped.
    running: Arc<AtomicBool>,
    /// Set once start has finished; gates interval ticks.
    started: Arc<AtomicBool>,
    active: Option<ActiveConsumers>,
}

impl BatchConsumer {
    pub fn builder(config: BatchConfig) -> BatchConsumerBuilder {
        BatchConsumerBuilder::new(config)
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Whether loops have been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.active.is_some() && self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StatsSnapshot {
        stats::snapshot()
    }

    /// Open the connection and start `consumer_count` loops.
    ///
    /// Fails with [`BatchError::AlreadyStarted`] if the consumer is running.
    /// On error nothing is left running.
    pub fn start(&mut self) -> Result<(), BatchError> {
        if self.active.is_some() {
            return Err(BatchError::AlreadyStarted);
        }
        let count = self.settings.consumer_count;
        info!(
            destination = %self.destination,
            consumers = count,
            "starting batch consumer"
        );

        let scheduler = if self.settings.uses_interval() {
            Some(match &self.external_scheduler {
                Some(handle) => Scheduler::external(handle.clone()),
                None => Scheduler::dedicated()?,
            })
        } else {
            None
        };

        let connection = self.factory.create_connection()?;
        if let Err(e) = connection.start() {
            if let Err(close_err) = connection.close() {
                warn!(error = %close_err, "failed to close connection after start failure");
            }
            return Err(e.into());
        }

        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(count)
            .thread_name(|i| format!("qbatch-consumer-{i}"))
            .panic_handler(|_| error!("consumer loop panicked"))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                if let Err(close_err) = connection.close() {
                    warn!(error = %close_err, "failed to close connection after pool failure");
                }
                return Err(BatchError::Runtime(format!(
                    "failed to build consumer thread pool: {e}"
                )));
            }
        };

        let latch = Arc::new(ShutdownLatch::new(count));
        self.running = Arc::new(AtomicBool::new(true));

        let mut triggers = Vec::with_capacity(count);
        for id in 0..count {
            let consumer_loop = ConsumptionLoop::new(
                id,
                self.destination.clone(),
                Arc::clone(&connection),
                Arc::clone(&latch),
                self.settings,
                self.handlers.clone(),
                Arc::clone(&self.running),
            );
            triggers.push(consumer_loop.completion_trigger());
            pool.spawn(move || consumer_loop.run());
        }

        let interval = scheduler.map(|scheduler| {
            debug!(
                interval_ms = self.settings.completion_interval.as_millis() as u64,
                owned = scheduler.is_owned(),
                "scheduling completion interval"
            );
            let broadcaster = IntervalBroadcaster::new(
                self.settings.completion_interval,
                triggers,
                Arc::clone(&self.started),
            );
            let task = broadcaster.spawn(&scheduler);
            (scheduler, task)
        });

        self.active = Some(ActiveConsumers {
            connection,
            latch,
            pool,
            interval,
        });
        self.started.store(true, Ordering::Release);
        info!(destination = %self.destination, "batch consumer started");
        Ok(())
    }

    /// Signal every loop to exit, wait up to the shutdown timeout for them,
    /// then close the connection and tear down the scheduler.
    ///
    /// Blocks the calling thread, so call it through `spawn_blocking` from
    /// async code. Dropping a running consumer on a runtime thread does not
    /// wait; see the [`Drop`] impl. Calling it again is a no-op.
    pub fn stop(&mut self) {
        self.shutdown(true);
    }

    fn shutdown(&mut self, wait: bool) {
        self.started.store(false, Ordering::Release);
        self.running.store(false, Ordering::Release);

        let Some(active) = self.active.take() else {
            info!("stop signalled while there are no consumers");
            return;
        };
        info!(destination = %self.destination, "stopping batch consumer");

        if !wait {
            debug!(remaining = active.latch.count(), "not waiting for consumer loops");
        } else if active.latch.wait_timeout(self.shutdown_timeout) {
            debug!("all consumer loops exited");
        } else {
            warn!(
                remaining = active.latch.count(),
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "timed out waiting for consumer loops to stop"
            );
        }

        if let Err(e) = active.connection.close() {
            warn!(error = %e, "exception caught closing connection");
        }
        drop(active.pool);

        if let Some((scheduler, task)) = active.interval {
            task.abort();
            drop(scheduler);
        }
        info!(destination = %self.destination, "batch consumer stopped");
    }
}

/// Stops a running consumer. On a tokio runtime thread the loops are
/// signalled and the connection closed, but their exit is not awaited.
impl Drop for BatchConsumer {
    fn drop(&mut self) {
        if self.active.is_none() {
            return;
        }
        if Handle::try_current().is_ok() {
            warn!(
                destination = %self.destination,
                "running consumer dropped on an async runtime, loops are not awaited"
            );
            self.shutdown(false);
        } else {
            self.shutdown(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessError;
    use crate::exchange::Exchange;
    use crate::memory::InMemoryBroker;

    fn noop_processor() -> Arc<dyn Processor> {
        Arc::new(|_: &mut Exchange| -> Result<(), ProcessError> { Ok(()) })
    }

    fn config() -> BatchConfig {
        BatchConfig::new("consumer-unit").poll_duration(Duration::from_millis(10))
    }

    #[test]
    fn build_requires_factory() {
        let result = BatchConsumer::builder(config())
            .processor(noop_processor())
            .build();
        assert!(matches!(result, Err(BatchError::Config(msg)) if msg.contains("factory")));
    }

    #[test]
    fn build_requires_processor() {
        let result = BatchConsumer::builder(config())
            .connection_factory(Arc::new(InMemoryBroker::new()))
            .build();
        assert!(matches!(result, Err(BatchError::Config(msg)) if msg.contains("processor")));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let bad = config()
            .completion_interval(Duration::from_millis(100))
            .completion_timeout(Duration::from_millis(100));
        let result = BatchConsumer::builder(bad)
            .connection_factory(Arc::new(InMemoryBroker::new()))
            .processor(noop_processor())
            .build();
        assert!(matches!(result, Err(BatchError::Config(_))));
    }

    #[test]
    fn stop_before_start_is_noop() {
        let mut consumer = BatchConsumer::builder(config())
            .connection_factory(Arc::new(InMemoryBroker::new()))
            .processor(noop_processor())
            .build()
            .unwrap();
        assert!(!consumer.is_running());
        consumer.stop();
        consumer.stop();
        assert!(!consumer.is_running());
    }

    #[test]
    fn start_twice_fails_then_restarts_after_stop() {
        let mut consumer = BatchConsumer::builder(config().consumer_count(2))
            .connection_factory(Arc::new(InMemoryBroker::new()))
            .processor(noop_processor())
            .shutdown_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        consumer.start().unwrap();
        assert!(consumer.is_running());
        assert!(matches!(consumer.start(), Err(BatchError::AlreadyStarted)));

        consumer.stop();
        assert!(!consumer.is_running());

        consumer.start().unwrap();
        assert!(consumer.is_running());
        consumer.stop();
    }

    #[test]
    fn restart_uses_a_fresh_running_flag() {
        let mut consumer = BatchConsumer::builder(config())
            .connection_factory(Arc::new(InMemoryBroker::new()))
            .processor(noop_processor())
            .build()
            .unwrap();

        consumer.start().unwrap();
        let first = Arc::clone(&consumer.running);
        consumer.stop();
        consumer.start().unwrap();

        assert!(!Arc::ptr_eq(&first, &consumer.running));
        assert!(!first.load(Ordering::Acquire));
        assert!(consumer.running.load(Ordering::Acquire));
        consumer.stop();
    }

    #[tokio::test]
    async fn drop_on_runtime_does_not_wait_for_loops() {
        let broker = InMemoryBroker::new();
        broker.send("consumer-unit", crate::message::Message::new("slow"));
        let entered = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&entered);
        let processor = move |_: &mut Exchange| -> Result<(), ProcessError> {
            seen.store(true, Ordering::Release);
            std::thread::sleep(Duration::from_secs(2));
            Ok(())
        };
        let mut consumer = BatchConsumer::builder(config().completion_size(1))
            .connection_factory(Arc::new(broker))
            .processor(Arc::new(processor))
            .build()
            .unwrap();
        consumer.start().unwrap();
        let running = Arc::clone(&consumer.running);
        while !entered.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let started = std::time::Instant::now();
        drop(consumer);

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!running.load(Ordering::Acquire));
    }

    #[test]
    fn drop_stops_running_consumer() {
        let broker = InMemoryBroker::new();
        let mut consumer = BatchConsumer::builder(config())
            .connection_factory(Arc::new(broker.clone()))
            .processor(noop_processor())
            .build()
            .unwrap();
        consumer.start().unwrap();
        let running = Arc::clone(&consumer.running);

        drop(consumer);
        assert!(!running.load(Ordering::Acquire));
    }
}
