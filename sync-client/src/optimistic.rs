//! Speculative write requests and their outcomes.

use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use sync_types::{EntityId, EventKind, Topic, UpdateId};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::error::EngineError;

/// Rejection reported by a confirmation operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ConfirmError(pub String);

impl From<&str> for ConfirmError {
    fn from(reason: &str) -> Self {
        Self(reason.to_string())
    }
}

impl From<String> for ConfirmError {
    fn from(reason: String) -> Self {
        Self(reason)
    }
}

/// Asynchronous server write that confirms (with the authoritative value)
/// or rejects a speculative write.
pub type ConfirmFuture = Pin<Box<dyn Future<Output = Result<Value, ConfirmError>> + Send>>;

/// Box a future as a [`ConfirmFuture`].
pub fn confirm_with<F>(future: F) -> ConfirmFuture
where
    F: Future<Output = Result<Value, ConfirmError>> + Send + 'static,
{
    Box::pin(future)
}

/// A speculative mutation of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeculativeWrite {
    /// Collection the entity lives in.
    pub topic: Topic,
    /// Target entity.
    pub entity_id: EntityId,
    /// Operation.
    pub kind: EventKind,
    /// Proposed value; required for creates and updates.
    pub value: Option<Value>,
    /// Value to restore on failure; `None` removes the entity.
    pub rollback: Option<Value>,
}

impl SpeculativeWrite {
    /// Create a new entity. Rollback removes it.
    pub fn create(topic: impl Into<Topic>, entity_id: impl Into<EntityId>, value: Value) -> Self {
        Self {
            topic: topic.into(),
            entity_id: entity_id.into(),
            kind: EventKind::Create,
            value: Some(value),
            rollback: None,
        }
    }

    /// Replace an entity. Rollback restores `rollback`.
    pub fn update(
        topic: impl Into<Topic>,
        entity_id: impl Into<EntityId>,
        value: Value,
        rollback: Value,
    ) -> Self {
        Self {
            topic: topic.into(),
            entity_id: entity_id.into(),
            kind: EventKind::Update,
            value: Some(value),
            rollback: Some(rollback),
        }
    }

    /// Delete an entity. Rollback restores `rollback`.
    pub fn delete(topic: impl Into<Topic>, entity_id: impl Into<EntityId>, rollback: Value) -> Self {
        Self {
            topic: topic.into(),
            entity_id: entity_id.into(),
            kind: EventKind::Delete,
            value: None,
            rollback: Some(rollback),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        if self.topic.as_str().is_empty() {
            return Err(EngineError::InvalidRequest("empty topic".into()));
        }
        if self.entity_id.as_str().is_empty() {
            return Err(EngineError::InvalidRequest("empty entity id".into()));
        }
        if self.kind != EventKind::Delete && self.value.is_none() {
            return Err(EngineError::InvalidRequest(format!(
                "{} without a value",
                self.kind.as_str()
            )));
        }
        Ok(())
    }
}

/// How a speculative write resolved, when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Confirmed; `value` is the authoritative value now in the cache
    /// (`None` for a delete confirmed by a change event).
    Confirmed {
        /// Authoritative value.
        value: Option<Value>,
    },
    /// A later write on the same entity and operation took over.
    Superseded,
}

pub(crate) type OutcomeSender = oneshot::Sender<Result<UpdateOutcome, EngineError>>;

/// Handle to an in-flight speculative write.
///
/// The cache already holds the speculative value when this is returned.
/// Dropping the handle does not cancel the write.
#[derive(Debug)]
pub struct UpdateHandle {
    update_id: UpdateId,
    rx: oneshot::Receiver<Result<UpdateOutcome, EngineError>>,
}

impl UpdateHandle {
    pub(crate) fn new(update_id: UpdateId) -> (Self, OutcomeSender) {
        let (tx, rx) = oneshot::channel();
        (Self { update_id, rx }, tx)
    }

    /// Ledger id of the write.
    pub fn update_id(&self) -> UpdateId {
        self.update_id
    }

    /// Wait for the write to resolve.
    ///
    /// Rejections and timeouts arrive as errors after the cache was rolled back.
    pub async fn outcome(self) -> Result<UpdateOutcome, EngineError> {
        self.rx.await.unwrap_or(Err(EngineError::Shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructors_set_kind_and_rollback() {
        let create = SpeculativeWrite::create("orders", "1", json!({"total": 5}));
        assert_eq!(create.kind, EventKind::Create);
        assert!(create.rollback.is_none());

        let delete = SpeculativeWrite::delete("orders", "1", json!({"total": 5}));
        assert_eq!(delete.kind, EventKind::Delete);
        assert!(delete.value.is_none());
        assert!(delete.validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_value() {
        let mut write = SpeculativeWrite::update("orders", "1", json!({}), json!({}));
        write.value = None;
        assert!(matches!(write.validate(), Err(EngineError::InvalidRequest(_))));
    }

    #[test]
    fn validate_rejects_empty_ids() {
        let write = SpeculativeWrite::create("orders", "", json!({}));
        assert!(write.validate().is_err());
        let write = SpeculativeWrite::create("", "1", json!({}));
        assert!(write.validate().is_err());
    }

    #[tokio::test]
    async fn handle_resolves_from_sender() {
        let (handle, tx) = UpdateHandle::new(UpdateId::new());
        tx.send(Ok(UpdateOutcome::Superseded)).unwrap();
        assert_eq!(handle.outcome().await.unwrap(), UpdateOutcome::Superseded);
    }

    #[tokio::test]
    async fn dropped_sender_means_shutdown() {
        let (handle, tx) = UpdateHandle::new(UpdateId::new());
        drop(tx);
        assert!(matches!(handle.outcome().await, Err(EngineError::Shutdown)));
    }

    #[tokio::test]
    async fn confirm_with_boxes_future() {
        let future = confirm_with(async { Err(ConfirmError::from("rejected")) });
        assert_eq!(future.await, Err(ConfirmError("rejected".into())));
    }
}
