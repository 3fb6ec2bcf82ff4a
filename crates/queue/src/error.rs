//! Error types for the batch consumer and its broker collaborators.

use thiserror::Error;

/// Errors raised by a broker connection, session or receiver.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("receive error: {0}")]
    Receive(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("{0} is closed")]
    Closed(&'static str),
}

/// Failure reported by a downstream [`Processor`](crate::processor::Processor).
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("processing failed: {0}")]
    Failed(String),

    #[error("broker error during processing: {0}")]
    Broker(#[from] BrokerError),
}

impl ProcessError {
    /// Convenience constructor for ad-hoc failures.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Errors surfaced by configuration and the consumer lifecycle.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("consumer already started")]
    AlreadyStarted,
}
