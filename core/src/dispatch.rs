//! Action dispatch collaborator.
//!
//! User actions (buy a ticket, join a group-buy, spray money, mark a notification
//! read) are sent to the REST API. When the session is offline they wait in the
//! offline queue and are replayed later; the idempotency key travels with every
//! attempt so the server can recognise a replay of something it already applied.

use crate::gateway::BoxFuture;
use crate::topic::{ActionId, IdempotencyKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One dispatch attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Local id of the queued action
    pub action_id: ActionId,
    /// Caller-supplied key, identical on every retry
    pub idempotency_key: IdempotencyKey,
    /// Action body forwarded to the API
    pub payload: serde_json::Value,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Successful dispatch result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReceipt {
    /// Response body returned by the API
    pub response: serde_json::Value,
}

/// Typed dispatch failure.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionDispatchError {
    /// The request did not reach the server or the acknowledgement was lost
    #[error("Transport error: {0}")]
    Transport(String),

    /// The request took longer than the dispatch timeout
    #[error("Dispatch timed out")]
    Timeout,

    /// The server refused the action; retrying cannot help
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl ActionDispatchError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// REST collaborator that executes actions.
pub trait ActionDispatcher: Send + Sync {
    /// Dispatch one action attempt.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionDispatchError`] describing why the attempt failed.
    fn dispatch(&self, request: ActionRequest) -> BoxFuture<'_, Result<ActionReceipt, ActionDispatchError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_is_terminal() {
        assert!(!ActionDispatchError::Rejected("sold out".into()).is_retryable());
        assert!(ActionDispatchError::Transport("reset".into()).is_retryable());
        assert!(ActionDispatchError::Timeout.is_retryable());
    }
}
