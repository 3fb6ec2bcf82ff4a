use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregation::AggregationKind;

/// Flush after this many messages unless configured otherwise.
pub const DEFAULT_COMPLETION_SIZE: u32 = 200;

/// Per-batch timeout used when neither a timeout nor an interval is set.
pub const DEFAULT_COMPLETION_TIMEOUT_MS: u64 = 500;

/// Upper bound on a single receive wait.
pub const DEFAULT_POLL_DURATION_MS: i64 = 1000;

// ── BatchConfig ─────────────────────────────────────────────────────

/// Configuration for one batch consumer.
///
/// Parsed from `qbatch.toml` with support for `QBATCH_*` environment
/// overrides, or built in code with [`BatchConfig::new`] and the fluent
/// setters. Always validated before a consumer is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Queue to consume from.
    pub destination: String,

    /// Number of concurrent consumer loops, each with its own session.
    #[serde(default = "default_consumer_count")]
    pub consumer_count: u32,

    /// Flush once a batch holds this many messages (0 = no size limit).
    #[serde(default = "default_completion_size")]
    pub completion_size: u32,

    /// Flush every loop at this fixed rate (0 = disabled).
    #[serde(default)]
    pub completion_interval_ms: u64,

    /// Flush a batch this long after its first message arrived (0 = disabled).
    ///
    /// When unset, defaults to [`DEFAULT_COMPLETION_TIMEOUT_MS`] unless an
    /// interval is configured, in which case it is disabled.
    #[serde(default)]
    pub completion_timeout_ms: Option<u64>,

    /// Maximum time a single receive waits for a message (0 = don't block).
    #[serde(default = "default_poll_duration_ms")]
    pub poll_duration_ms: i64,

    /// Deliver an empty exchange when an interval or timeout fires on an
    /// empty batch.
    #[serde(default)]
    pub send_empty_message_when_idle: bool,

    /// How received messages are folded into a batch.
    #[serde(default)]
    pub aggregation: AggregationKind,
}

fn default_consumer_count() -> u32 {
    1
}

fn default_completion_size() -> u32 {
    DEFAULT_COMPLETION_SIZE
}

fn default_poll_duration_ms() -> i64 {
    DEFAULT_POLL_DURATION_MS
}

impl BatchConfig {
    /// Defaults for the given destination.
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            consumer_count: default_consumer_count(),
            completion_size: default_completion_size(),
            completion_interval_ms: 0,
            completion_timeout_ms: None,
            poll_duration_ms: default_poll_duration_ms(),
            send_empty_message_when_idle: false,
            aggregation: AggregationKind::default(),
        }
    }

    pub fn consumer_count(mut self, count: u32) -> Self {
        self.consumer_count = count;
        self
    }

    pub fn completion_size(mut self, size: u32) -> Self {
        self.completion_size = size;
        self
    }

    pub fn completion_interval(mut self, interval: Duration) -> Self {
        self.completion_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn poll_duration(mut self, poll: Duration) -> Self {
        self.poll_duration_ms = poll.as_millis() as i64;
        self
    }

    pub fn send_empty_message_when_idle(mut self, enabled: bool) -> Self {
        self.send_empty_message_when_idle = enabled;
        self
    }

    pub fn aggregation(mut self, kind: AggregationKind) -> Self {
        self.aggregation = kind;
        self
    }

    /// The per-batch timeout after applying the default rule.
    pub fn resolved_completion_timeout_ms(&self) -> u64 {
        match self.completion_timeout_ms {
            Some(timeout) => timeout,
            None if self.completion_interval_ms > 0 => 0,
            None => DEFAULT_COMPLETION_TIMEOUT_MS,
        }
    }

    /// Validate and resolve into the settings used by consumer loops.
    pub fn settings(&self) -> Result<BatchSettings, crate::error::BatchError> {
        self.validate()?;
        Ok(BatchSettings {
            consumer_count: self.consumer_count as usize,
            completion_size: self.completion_size as usize,
            completion_interval: Duration::from_millis(self.completion_interval_ms),
            completion_timeout: Duration::from_millis(self.resolved_completion_timeout_ms()),
            poll_duration: Duration::from_millis(self.poll_duration_ms.max(0) as u64),
            send_empty_message_when_idle: self.send_empty_message_when_idle,
        })
    }
}

// ── BatchSettings ───────────────────────────────────────────────────

/// Validated, resolved view of a [`BatchConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub consumer_count: usize,
    pub completion_size: usize,
    pub completion_interval: Duration,
    pub completion_timeout: Duration,
    pub poll_duration: Duration,
    pub send_empty_message_when_idle: bool,
}

impl BatchSettings {
    pub fn uses_timeout(&self) -> bool {
        !self.completion_timeout.is_zero()
    }

    pub fn uses_interval(&self) -> bool {
        !self.completion_interval.is_zero()
    }
}
