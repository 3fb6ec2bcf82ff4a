//! The unit of work handed to a downstream processor.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::message::Message;

/// Number of messages folded into an exchange so far.
pub const BATCH_SIZE: &str = "batch_size";

/// Set on an exchange when it is flushed as a completed batch.
pub const BATCH_COMPLETE: &str = "batch_complete";

/// An aggregated unit of work.
///
/// A batch flush hands one exchange to the processor. An exchange built from
/// a single received message holds exactly that message; an aggregation
/// strategy decides how exchanges are merged. An exchange with no messages is
/// the idle signal sent when `send_empty_message_when_idle` is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub id: Uuid,
    pub created: DateTime<Utc>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl Exchange {
    /// An exchange carrying no messages.
    pub fn empty() -> Self {
        Self {
            id: Uuid::new_v4(),
            created: Utc::now(),
            messages: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Wrap a single received message.
    pub fn from_message(message: Message) -> Self {
        let mut exchange = Self::empty();
        exchange.messages.push(message);
        exchange
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// The `batch_size` property, if stamped.
    pub fn batch_size(&self) -> Option<usize> {
        self.property(BATCH_SIZE)
            .and_then(Value::as_u64)
            .map(|n| n as usize)
    }

    /// Message bodies in order, mostly useful to processors and tests.
    pub fn bodies(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.body.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_message_holds_one() {
        let exchange = Exchange::from_message(Message::with_id("a", "body-a"));
        assert_eq!(exchange.len(), 1);
        assert_eq!(exchange.bodies(), vec!["body-a"]);
        assert!(exchange.batch_size().is_none());
    }

    #[test]
    fn test_batch_size_property() {
        let mut exchange = Exchange::empty();
        assert!(exchange.is_empty());
        exchange.set_property(BATCH_SIZE, 7);
        assert_eq!(exchange.batch_size(), Some(7));
    }

    #[test]
    fn test_non_numeric_batch_size_is_ignored() {
        let mut exchange = Exchange::empty();
        exchange.set_property(BATCH_SIZE, "seven");
        assert_eq!(exchange.batch_size(), None);
    }
}
