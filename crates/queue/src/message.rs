//! Messages received from a point-to-point queue.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single message delivered by a broker [`Receiver`](crate::broker::Receiver).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier assigned by the producer or broker.
    pub id: String,
    /// Raw message body.
    pub body: String,
    /// Application headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// When the message was sent to the queue.
    pub timestamp: DateTime<Utc>,
    /// Whether this delivery follows a rollback of an earlier one.
    #[serde(default)]
    pub redelivered: bool,
    /// Number of times this message has been delivered, starting at 1.
    pub delivery_count: u32,
}

impl Message {
    /// Create a fresh, never-delivered message with a random id.
    pub fn new(body: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), body)
    }

    /// Create a message with an explicit id.
    pub fn with_id(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            headers: BTreeMap::new(),
            timestamp: Utc::now(),
            redelivered: false,
            delivery_count: 1,
        }
    }

    /// Attach a header, builder style.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Mark this message as handed back to the queue after a rollback.
    pub(crate) fn mark_redelivered(&mut self) {
        self.redelivered = true;
        self.delivery_count = self.delivery_count.saturating_add(1);
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message {{ id: {}, bytes: {}, deliveries: {} }}",
            self.id,
            self.body.len(),
            self.delivery_count
        )
    }
}
