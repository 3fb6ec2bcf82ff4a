use std::path::Path;

use super::types::BatchConfig;
use crate::error::BatchError;

impl BatchConfig {
    /// Parse config from a TOML string, apply environment overrides, validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, BatchError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BatchError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `QBATCH_KEY` overrides `key`.
    /// Examples:
    /// - `QBATCH_DESTINATION` -> `destination`
    /// - `QBATCH_CONSUMER_COUNT` -> `consumer_count`
    /// - `QBATCH_COMPLETION_TIMEOUT_MS` -> `completion_timeout_ms`
    ///
    /// Values that fail to parse are ignored.
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("QBATCH_DESTINATION") {
            self.destination = v;
        }
        if let Some(n) = lookup("QBATCH_CONSUMER_COUNT").and_then(|v| v.parse().ok()) {
            self.consumer_count = n;
        }
        if let Some(n) = lookup("QBATCH_COMPLETION_SIZE").and_then(|v| v.parse().ok()) {
            self.completion_size = n;
        }
        if let Some(n) = lookup("QBATCH_COMPLETION_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.completion_interval_ms = n;
        }
        if let Some(n) = lookup("QBATCH_COMPLETION_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.completion_timeout_ms = Some(n);
        }
        if let Some(n) = lookup("QBATCH_POLL_DURATION_MS").and_then(|v| v.parse().ok()) {
            self.poll_duration_ms = n;
        }
        if let Some(b) = lookup("QBATCH_SEND_EMPTY_MESSAGE_WHEN_IDLE").and_then(|v| v.parse().ok()) {
            self.send_empty_message_when_idle = b;
        }
    }
}
