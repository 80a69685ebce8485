//! Errors surfaced by the live client facade.
//!
//! Transport faults never appear here: they are absorbed by the connection
//! state machine and observed as [`ConnectionStatus`](crate::ConnectionStatus)
//! transitions. What remains are faults of the facade call itself.

use crate::config::ConfigError;
use thiserror::Error;
use tikit_realtime_core::topic::ActionId;
use tikit_realtime_runtime::StoreError;

/// Error returned by [`LiveClient`](crate::LiveClient) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LiveError {
    /// The configuration failed validation
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The builder was missing a required collaborator
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    /// The session store refused the call (usually because it is shutting down)
    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    /// The view was released before the call completed
    #[error("View released: {0}")]
    ViewReleased(String),

    /// The outbound event stream closed before the awaited event arrived
    #[error("Event stream closed")]
    EventsClosed,

    /// The action settled, but its outcome left both the event buffer and the
    /// queue's history before it was read
    #[error("Outcome of action {0} is no longer available")]
    OutcomeUnavailable(ActionId),
}

/// Convenience alias for facade results.
pub type Result<T> = std::result::Result<T, LiveError>;
