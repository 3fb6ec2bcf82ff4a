use super::types::BatchConfig;
use crate::error::BatchError;

impl BatchConfig {
    /// Reject settings the consumer cannot honour. Runs before any thread starts.
    pub fn validate(&self) -> Result<(), BatchError> {
        self.validate_destination()?;
        self.validate_completion_triggers()?;
        self.validate_send_empty_message_when_idle()?;
        self.validate_poll_duration()?;
        self.validate_consumer_count()?;
        Ok(())
    }

    fn validate_destination(&self) -> Result<(), BatchError> {
        if self.destination.trim().is_empty() {
            return Err(BatchError::Config("destination must not be empty".into()));
        }
        Ok(())
    }

    /// Interval and timeout completion are mutually exclusive.
    fn validate_completion_triggers(&self) -> Result<(), BatchError> {
        if self.completion_interval_ms > 0 && self.resolved_completion_timeout_ms() > 0 {
            return Err(BatchError::Config(
                "only one of completion_interval_ms or completion_timeout_ms can be used, not both"
                    .into(),
            ));
        }
        Ok(())
    }

    fn validate_send_empty_message_when_idle(&self) -> Result<(), BatchError> {
        if self.send_empty_message_when_idle
            && self.completion_interval_ms == 0
            && self.resolved_completion_timeout_ms() == 0
        {
            return Err(BatchError::Config(
                "send_empty_message_when_idle requires completion_interval_ms or completion_timeout_ms to be set"
                    .into(),
            ));
        }
        Ok(())
    }

    fn validate_poll_duration(&self) -> Result<(), BatchError> {
        if self.poll_duration_ms < 0 {
            return Err(BatchError::Config(format!(
                "poll_duration_ms must be 0 or greater, got {}",
                self.poll_duration_ms
            )));
        }
        Ok(())
    }

    fn validate_consumer_count(&self) -> Result<(), BatchError> {
        if self.consumer_count == 0 {
            return Err(BatchError::Config(
                "consumer_count must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
