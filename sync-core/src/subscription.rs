//! Subscription descriptors and per-topic status.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sync_types::{ChangeEvent, EventFilter, Topic};

use crate::backoff::RetryPolicy;
use crate::state::SubscriptionState;

/// Priority tier of a subscription.
///
/// Mass reconnects reopen higher tiers first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Reopened first.
    High,
    /// Default tier.
    #[default]
    Normal,
    /// Reopened last.
    Low,
}

/// Comparison used by a [`Predicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredicateOp {
    /// Field equals the value.
    Eq,
    /// Field differs from the value (a missing field counts as different).
    Neq,
}

/// Row-level filter evaluated against an event's record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    /// Record field to compare.
    pub field: String,
    /// Comparison.
    pub op: PredicateOp,
    /// Value compared against.
    pub value: Value,
}

impl Predicate {
    /// `field == value`.
    pub fn eq(field: &str, value: Value) -> Self {
        Self {
            field: field.to_string(),
            op: PredicateOp::Eq,
            value,
        }
    }

    /// `field != value`.
    pub fn neq(field: &str, value: Value) -> Self {
        Self {
            field: field.to_string(),
            op: PredicateOp::Neq,
            value,
        }
    }

    /// Evaluate against a record.
    pub fn matches(&self, record: &Value) -> bool {
        let field = record.get(&self.field);
        match self.op {
            PredicateOp::Eq => field == Some(&self.value),
            PredicateOp::Neq => field != Some(&self.value),
        }
    }
}

/// Immutable descriptor of a topic subscription.
///
/// Created by the first subscriber of a topic and discarded with the last
/// one; later subscribers share the first descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Topic (table or collection) name.
    pub topic: Topic,
    /// Event kinds delivered.
    #[serde(default)]
    pub filter: EventFilter,
    /// Optional row-level predicate.
    #[serde(default)]
    pub predicate: Option<Predicate>,
    /// Priority tier.
    #[serde(default)]
    pub priority: Priority,
    /// Reconnect policy.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl SubscriptionConfig {
    /// Subscribe to every event on a topic with the default retry policy.
    pub fn new(topic: impl Into<Topic>) -> Self {
        Self {
            topic: topic.into(),
            filter: EventFilter::Any,
            predicate: None,
            priority: Priority::Normal,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the event kind filter.
    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Set a row-level predicate.
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Set the priority tier.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Check whether an event passes both the kind filter and the predicate.
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        if !self.filter.matches(event.kind) {
            return false;
        }
        match (&self.predicate, event.record()) {
            (None, _) => true,
            (Some(predicate), Some(record)) => predicate.matches(record),
            (Some(_), None) => false,
        }
    }
}

/// Mutable diagnostics for one active subscription.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionStatus {
    /// Topic name.
    pub topic: Topic,
    /// Current lifecycle state.
    pub state: SubscriptionState,
    /// Priority tier from the config.
    pub priority: Priority,
    /// Last time the channel reached `connected` (ms since epoch).
    pub last_connected_ms: Option<u64>,
    /// Last channel error.
    pub last_error: Option<String>,
    /// Consecutive failures since the last `connected`.
    pub retry_count: u32,
    /// Set once the retry budget is exhausted.
    pub permanently_failed: bool,
    /// Listeners sharing this subscription.
    pub listener_count: usize,
    /// Channel generation; bumped on every reopen.
    pub generation: u64,
}

impl SubscriptionStatus {
    /// Fresh status for a newly created subscription.
    pub fn new(config: &SubscriptionConfig) -> Self {
        Self {
            topic: config.topic.clone(),
            state: SubscriptionState::Connecting,
            priority: config.priority,
            last_connected_ms: None,
            last_error: None,
            retry_count: 0,
            permanently_failed: false,
            listener_count: 0,
            generation: 0,
        }
    }
}
