//! Aggregation strategies: how received exchanges are folded into a batch.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::exchange::Exchange;

/// Folds an incoming exchange into the batch accumulated so far.
///
/// `previous` is `None` for the first message of a batch. The returned
/// exchange becomes the new accumulated unit.
pub trait AggregationStrategy: Send + Sync {
    fn aggregate(&self, previous: Option<Exchange>, incoming: Exchange) -> Exchange;
}

impl<F> AggregationStrategy for F
where
    F: Fn(Option<Exchange>, Exchange) -> Exchange + Send + Sync,
{
    fn aggregate(&self, previous: Option<Exchange>, incoming: Exchange) -> Exchange {
        self(previous, incoming)
    }
}

/// Appends every incoming message to the first exchange of the batch, in
/// arrival order.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupedMessagesStrategy;

impl AggregationStrategy for GroupedMessagesStrategy {
    fn aggregate(&self, previous: Option<Exchange>, incoming: Exchange) -> Exchange {
        match previous {
            None => incoming,
            Some(mut batch) => {
                batch.messages.extend(incoming.messages);
                batch
            }
        }
    }
}

/// Keeps only the newest exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseLatestStrategy;

impl AggregationStrategy for UseLatestStrategy {
    fn aggregate(&self, _previous: Option<Exchange>, incoming: Exchange) -> Exchange {
        incoming
    }
}

/// Strategy selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationKind {
    #[default]
    Grouped,
    Latest,
}

impl AggregationKind {
    pub fn strategy(self) -> Arc<dyn AggregationStrategy> {
        match self {
            Self::Grouped => Arc::new(GroupedMessagesStrategy),
            Self::Latest => Arc::new(UseLatestStrategy),
        }
    }
}
