//! Downstream processing of flushed batches.

use tracing::warn;

use crate::error::ProcessError;
use crate::exchange::Exchange;

/// Receives each flushed batch (or the empty idle exchange).
///
/// Returning `Ok` commits the batch's session; returning `Err` rolls it back
/// and reports the error to the [`ExceptionHandler`].
pub trait Processor: Send + Sync {
    fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessError>;
}

impl<F> Processor for F
where
    F: Fn(&mut Exchange) -> Result<(), ProcessError> + Send + Sync,
{
    fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessError> {
        self(exchange)
    }
}

/// Told about every processor failure. Never propagates into the loop.
pub trait ExceptionHandler: Send + Sync {
    fn handle_exception(&self, description: &str, exchange: &Exchange, error: &ProcessError);
}

/// Default handler: logs the failure and moves on.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingExceptionHandler;

impl ExceptionHandler for LoggingExceptionHandler {
    fn handle_exception(&self, description: &str, exchange: &Exchange, error: &ProcessError) {
        warn!(
            exchange_id = %exchange.id,
            messages = exchange.len(),
            error = %error,
            "{description}"
        );
    }
}
