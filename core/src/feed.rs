//! Snapshot source: the `fetchCurrent` half of a change feed.
//!
//! Incremental changes arrive over the gateway; the authoritative current state
//! of a subscription is fetched from the REST collaborator. The fetch is used for
//! the initial load of a view and for the mandatory reconciliation after every
//! reconnect.

use crate::gateway::BoxFuture;
use crate::topic::SubscriptionKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from a snapshot fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchError {
    /// The entity does not exist (not a connection fault)
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request did not complete (network, 5xx, timeout)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The response could not be decoded into the topic's record type
    #[error("Decode error: {0}")]
    Decode(String),
}

impl FetchError {
    /// Whether this error says something about connectivity.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Source of authoritative snapshots.
///
/// The returned JSON is the row (or, for list topics, the array of rows) the
/// backing store currently holds for `key`.
pub trait SnapshotSource: Send + Sync {
    /// Fetch the current state for a subscription.
    ///
    /// # Errors
    ///
    /// - [`FetchError::NotFound`] when the entity is absent
    /// - [`FetchError::Transport`] when the collaborator could not be reached
    fn fetch_current(&self, key: &SubscriptionKey) -> BoxFuture<'_, Result<serde_json::Value, FetchError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_not_a_transport_signal() {
        assert!(!FetchError::NotFound("evt-9".into()).is_transport());
        assert!(FetchError::Transport("503".into()).is_transport());
    }
}
