//! Broker abstraction: connections, transacted sessions and receivers.
//!
//! These traits are the seam between the batch consumer and a concrete
//! point-to-point messaging client. They are blocking by design: each
//! consumer loop runs on its own OS thread and waits inside
//! [`Receiver::receive`] for at most the timeout it passes in.

use std::sync::Arc;
use std::time::Duration;

use crate::error::BrokerError;
use crate::message::Message;

/// Opens connections to a broker.
pub trait ConnectionFactory: Send + Sync {
    fn create_connection(&self) -> Result<Arc<dyn Connection>, BrokerError>;
}

/// A connection shared by every consumer loop of one batch consumer.
pub trait Connection: Send + Sync {
    /// Begin delivery of messages. Called once before any session is used.
    fn start(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Open a new transacted session. Messages received through it stay
    /// unacknowledged until [`Session::commit`].
    fn create_session(&self) -> Result<Box<dyn Session>, BrokerError>;

    /// Close the connection. Receivers blocked on it return an error.
    fn close(&self) -> Result<(), BrokerError>;
}

/// A transacted session, owned by exactly one consumer loop.
pub trait Session: Send {
    /// Create a receiver on the named queue, bound to this session.
    fn create_receiver(&mut self, destination: &str) -> Result<Box<dyn Receiver>, BrokerError>;

    /// Acknowledge every message received since the last commit or rollback.
    fn commit(&mut self) -> Result<(), BrokerError>;

    /// Return every message received since the last commit or rollback to
    /// its queue for redelivery.
    fn rollback(&mut self) -> Result<(), BrokerError>;

    /// Close the session. Uncommitted work is rolled back.
    fn close(&mut self) -> Result<(), BrokerError>;
}

/// Receives messages from a single queue on behalf of a session.
pub trait Receiver: Send {
    /// Wait up to `timeout` for the next message.
    ///
    /// A zero timeout polls without blocking. Returns `Ok(None)` when the
    /// wait elapsed with nothing available.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Message>, BrokerError>;

    fn close(&mut self) -> Result<(), BrokerError>;
}

/// Blanket implementation so an `Arc` of a factory can be handed out directly.
impl<T: ConnectionFactory + ?Sized> ConnectionFactory for Arc<T> {
    fn create_connection(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        (**self).create_connection()
    }
}
