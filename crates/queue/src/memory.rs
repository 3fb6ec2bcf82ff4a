//! In-memory transactional broker.
//!
//! Implements the [`broker`](crate::broker) traits over named FIFO queues kept
//! behind a mutex and condition variable. Received messages stay pending in
//! their session until commit (acknowledged and gone) or rollback (pushed back
//! to the head of their queue in original order, marked redelivered).
//!
//! Used by the integration tests and the `qbatch` demo binary.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::broker::{Connection, ConnectionFactory, Receiver, Session};
use crate::error::BrokerError;
use crate::message::Message;

type Pending = Arc<Mutex<Vec<(String, Message)>>>;

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Message>>,
    fail_receives: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    available: Condvar,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put drained messages back at the head of their queues, oldest first.
    fn requeue(&self, drained: Vec<(String, Message)>) {
        if drained.is_empty() {
            return;
        }
        let mut state = self.lock();
        for (destination, mut message) in drained.into_iter().rev() {
            message.mark_redelivered();
            state
                .queues
                .entry(destination)
                .or_default()
                .push_front(message);
        }
        drop(state);
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        self.available.notify_all();
    }
}

/// A process-local broker. Cloning yields another handle to the same queues.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message at the tail of `destination`.
    pub fn send(&self, destination: &str, message: Message) {
        let mut state = self.shared.lock();
        state
            .queues
            .entry(destination.to_string())
            .or_default()
            .push_back(message);
        drop(state);
        self.shared.available.notify_all();
    }

    /// Messages currently waiting in `destination` (pending ones excluded).
    pub fn depth(&self, destination: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(destination)
            .map_or(0, VecDeque::len)
    }

    /// Commits that acknowledged at least one message.
    pub fn commit_count(&self) -> u64 {
        self.shared.commits.load(Ordering::Relaxed)
    }

    /// Rollbacks (explicit or on session close) that returned at least one
    /// message to its queue.
    pub fn rollback_count(&self) -> u64 {
        self.shared.rollbacks.load(Ordering::Relaxed)
    }

    /// Make every subsequent `receive` fail, simulating a lost broker.
    pub fn fail_receives(&self) {
        self.shared.lock().fail_receives = true;
        self.shared.available.notify_all();
    }
}

impl ConnectionFactory for InMemoryBroker {
    fn create_connection(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        Ok(Arc::new(InMemoryConnection {
            shared: Arc::clone(&self.shared),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct InMemoryConnection {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

impl Connection for InMemoryConnection {
    fn create_session(&self) -> Result<Box<dyn Session>, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed("connection"));
        }
        Ok(Box::new(InMemorySession {
            shared: Arc::clone(&self.shared),
            connection_closed: Arc::clone(&self.closed),
            pending: Arc::default(),
            closed: false,
        }))
    }

    fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("in-memory connection closed");
            // Receivers check the flag under the state lock, so notify under
            // it too or a receiver about to wait can miss the wakeup.
            let _state = self.shared.lock();
            self.shared.available.notify_all();
        }
        Ok(())
    }
}

struct InMemorySession {
    shared: Arc<Shared>,
    connection_closed: Arc<AtomicBool>,
    pending: Pending,
    closed: bool,
}

impl InMemorySession {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            Err(BrokerError::Closed("session"))
        } else {
            Ok(())
        }
    }

    fn drain_pending(&self) -> Vec<(String, Message)> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Session for InMemorySession {
    fn create_receiver(&mut self, destination: &str) -> Result<Box<dyn Receiver>, BrokerError> {
        self.ensure_open()?;
        if self.connection_closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed("connection"));
        }
        Ok(Box::new(InMemoryReceiver {
            shared: Arc::clone(&self.shared),
            connection_closed: Arc::clone(&self.connection_closed),
            pending: Arc::clone(&self.pending),
            destination: destination.to_string(),
            closed: false,
        }))
    }

    fn commit(&mut self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let acked = self.drain_pending();
        if !acked.is_empty() {
            trace!(count = acked.len(), "in-memory commit");
            self.shared.commits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let drained = self.drain_pending();
        trace!(count = drained.len(), "in-memory rollback");
        self.shared.requeue(drained);
        Ok(())
    }

    fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Ok(());
        }
        let drained = self.drain_pending();
        self.shared.requeue(drained);
        self.closed = true;
        Ok(())
    }
}

struct InMemoryReceiver {
    shared: Arc<Shared>,
    connection_closed: Arc<AtomicBool>,
    pending: Pending,
    destination: String,
    closed: bool,
}

impl Receiver for InMemoryReceiver {
    fn receive(&mut self, timeout: Duration) -> Result<Option<Message>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed("receiver"));
        }
        // An unrepresentable deadline waits until woken.
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.shared.lock();
        loop {
            if self.connection_closed.load(Ordering::Acquire) {
                return Err(BrokerError::Closed("connection"));
            }
            if state.fail_receives {
                return Err(BrokerError::Receive(format!(
                    "broker unavailable for '{}'",
                    self.destination
                )));
            }
            if let Some(message) = state
                .queues
                .get_mut(&self.destination)
                .and_then(VecDeque::pop_front)
            {
                drop(state);
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((self.destination.clone(), message.clone()));
                return Ok(Some(message));
            }

            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.shared
                        .available
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .shared
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn close(&mut self) -> Result<(), BrokerError> {
        self.closed = true;
        Ok(())
    }
}
