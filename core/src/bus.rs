//! Event bus - synchronous, typed, in-process publish/subscribe
//!
//! `publish` runs every handler registered for the event's topic, in
//! registration order, on the caller's task before returning. There is no
//! queue: a slow handler delays every handler after it, so handlers that do
//! real work should hand the event off (see `CorrelationEngine::attach`).
//!
//! Nothing is retained. A subscriber added after a publish never sees it.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::correlation::MetricsSnapshot;
use crate::types::{CorrelationResult, Deposit, IndexerStatus, Transfer, Withdrawal};

/// Topic names as seen by gateway clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    DepositNew,
    WithdrawalNew,
    /// `<protocol>:transfer`
    Transfer(String),
    MatchFound,
    IndexerStatus,
    MetricsUpdated,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::DepositNew => write!(f, "deposit:new"),
            Topic::WithdrawalNew => write!(f, "withdrawal:new"),
            Topic::Transfer(protocol) => write!(f, "{}:transfer", protocol),
            Topic::MatchFound => write!(f, "match:found"),
            Topic::IndexerStatus => write!(f, "indexer:status"),
            Topic::MetricsUpdated => write!(f, "metrics:updated"),
        }
    }
}

/// One variant per topic. Serializes as the bare payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BusEvent {
    DepositNew(Deposit),
    WithdrawalNew(Withdrawal),
    Transfer(Transfer),
    MatchFound(CorrelationResult),
    IndexerStatus(IndexerStatus),
    MetricsUpdated(MetricsSnapshot),
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::DepositNew(_) => Topic::DepositNew,
            BusEvent::WithdrawalNew(_) => Topic::WithdrawalNew,
            BusEvent::Transfer(t) => Topic::Transfer(t.protocol.clone()),
            BusEvent::MatchFound(_) => Topic::MatchFound,
            BusEvent::IndexerStatus(_) => Topic::IndexerStatus,
            BusEvent::MetricsUpdated(_) => Topic::MetricsUpdated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

#[derive(Clone)]
enum Filter {
    Topic(Topic),
    All,
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    filter: Filter,
    handler: Handler,
}

impl Subscription {
    fn matches(&self, topic: &Topic) -> bool {
        match &self.filter {
            Filter::Topic(t) => t == topic,
            Filter::All => true,
        }
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

#[derive(Default)]
pub struct EventBus {
    registry: RwLock<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, filter: Filter, handler: Handler) -> SubscriptionId {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry.subscriptions.push(Subscription { id, filter, handler });
        id
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.register(Filter::Topic(topic), Arc::new(handler))
    }

    /// Receive every event regardless of topic (gateway fan-out).
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.register(Filter::All, Arc::new(handler))
    }

    /// Returns false if the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let before = registry.subscriptions.len();
        registry.subscriptions.retain(|s| s.id != id);
        registry.subscriptions.len() != before
    }

    /// Deliver `event` to its topic's current subscribers. Returns how many
    /// handlers ran.
    pub fn publish(&self, event: BusEvent) -> usize {
        let topic = event.topic();
        // Snapshot, then release the lock so handlers may (un)subscribe or publish
        let handlers: Vec<Handler> = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            registry
                .subscriptions
                .iter()
                .filter(|s| s.matches(&topic))
                .map(|s| s.handler.clone())
                .collect()
        };
        for handler in &handlers {
            handler(&event);
        }
        handlers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscriptions
            .len()
    }
}
