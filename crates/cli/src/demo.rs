//! Producer and processor used by the demo binary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use qbatch::{Exchange, InMemoryBroker, Message, ProcessError, Processor};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Logs every batch and fails every `fail_every`-th non-empty one.
pub struct LoggingBatchProcessor {
    fail_every: u64,
    seen: AtomicU64,
}

impl LoggingBatchProcessor {
    pub fn new(fail_every: u64) -> Self {
        Self {
            fail_every,
            seen: AtomicU64::new(0),
        }
    }
}

impl Processor for LoggingBatchProcessor {
    fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessError> {
        if exchange.is_empty() {
            info!("idle tick, no messages");
            return Ok(());
        }

        let n = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        let redelivered = exchange.messages.iter().filter(|m| m.redelivered).count();
        info!(
            batch = n,
            size = exchange.batch_size().unwrap_or_else(|| exchange.len()),
            redelivered,
            first = exchange.messages.first().map(|m| m.body.as_str()),
            last = exchange.messages.last().map(|m| m.body.as_str()),
            "processing batch"
        );

        if self.fail_every > 0 && n % self.fail_every == 0 {
            return Err(ProcessError::failed(format!("batch {n} rejected")));
        }
        Ok(())
    }
}

/// Send `count` messages (0 = forever) to `destination`, one every `every`.
pub fn spawn_producer(
    broker: InMemoryBroker,
    destination: String,
    count: u64,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
        let mut sent = 0u64;
        while count == 0 || sent < count {
            ticker.tick().await;
            broker.send(&destination, Message::new(format!("message-{sent}")));
            sent += 1;
            if sent % 100 == 0 {
                debug!(sent, "producer progress");
            }
        }
        info!(sent, destination = %destination, "producer finished");
    })
}
