//! Transactional batch consumer for queue brokers.
//!
//! Concurrent loops each hold their own transacted session, fold received
//! messages into a batch, and hand the batch to a [`Processor`] once a size,
//! timeout or interval condition completes it. The session is committed when
//! the processor succeeds and rolled back when it fails.

pub mod accumulator;
pub mod aggregation;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod consumption;
pub mod error;
pub mod exchange;
pub mod interval;
pub mod latch;
pub mod memory;
pub mod message;
pub mod processor;
pub mod stats;
pub mod task;
pub mod trigger;

pub use aggregation::{AggregationKind, AggregationStrategy, GroupedMessagesStrategy, UseLatestStrategy};
pub use broker::{Connection, ConnectionFactory, Receiver, Session};
pub use config::{BatchConfig, BatchSettings};
pub use consumer::{BatchConsumer, BatchConsumerBuilder, SHUTDOWN_TIMEOUT};
pub use error::{BatchError, BrokerError, ProcessError};
pub use exchange::{Exchange, BATCH_COMPLETE, BATCH_SIZE};
pub use memory::InMemoryBroker;
pub use message::Message;
pub use processor::{ExceptionHandler, LoggingExceptionHandler, Processor};
pub use stats::StatsSnapshot;
pub use task::BatchOutcome;
