//! Outbound typed event stream.
//!
//! Every state transition of the session publishes exactly one [`LiveEvent`].
//! Events are published from inside the reducer, so subscribers observe them in
//! the order the transitions happened.

use crate::reconciler::TopicView;
use serde::Serialize;
use std::time::Duration;
use tikit_realtime_core::dispatch::ActionDispatchError;
use tikit_realtime_core::topic::{ActionId, ConnectionId, SubscriptionKey};
use tokio::sync::broadcast;

/// Final result of a queued action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// The API accepted the action
    Succeeded {
        /// Response body
        response: serde_json::Value,
    },
    /// The action was rejected or ran out of attempts
    Failed {
        /// Error of the last attempt
        error: ActionDispatchError,
        /// Attempts made
        attempts: u32,
    },
}

impl ActionOutcome {
    /// Whether the action succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Event emitted by the live session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LiveEvent {
    /// A handshake started
    Connecting,
    /// The channel is open and authenticated
    Connected {
        /// Id assigned by the gateway
        connection_id: ConnectionId,
    },
    /// The session was closed on request
    Disconnected,
    /// The channel was lost; another attempt is scheduled
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
        /// Delay before the attempt
        #[serde(with = "tikit_realtime_runtime::retry::duration_ms")]
        delay: Duration,
    },
    /// The reconnect budget is spent; the session is `Failed`
    MaxReconnectAttempts {
        /// Attempts made
        attempts: u32,
    },
    /// Connecting failed; the session is `Failed`
    Error {
        /// Diagnostic
        message: String,
    },
    /// A view changed
    Updated {
        /// Subscription the view belongs to
        key: SubscriptionKey,
        /// The view after the change
        view: TopicView,
    },
    /// A view's fetch failed
    ViewError {
        /// Subscription the view belongs to
        key: SubscriptionKey,
        /// Diagnostic
        error: String,
    },
    /// An action was accepted into the queue
    ActionQueued {
        /// Local action id
        id: ActionId,
    },
    /// A queued action reached its final state
    ActionSettled {
        /// Local action id
        id: ActionId,
        /// Final result
        outcome: ActionOutcome,
    },
}

impl LiveEvent {
    /// Short event name, as used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected { .. } => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::MaxReconnectAttempts { .. } => "max_reconnect_attempts",
            Self::Error { .. } => "error",
            Self::Updated { .. } => "updated",
            Self::ViewError { .. } => "view_error",
            Self::ActionQueued { .. } => "action_queued",
            Self::ActionSettled { .. } => "action_settled",
        }
    }

    /// Subscription the event concerns, for view events.
    #[must_use]
    pub const fn key(&self) -> Option<&SubscriptionKey> {
        match self {
            Self::Updated { key, .. } | Self::ViewError { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Publisher side of the event stream.
#[derive(Clone, Debug)]
pub struct EventSink {
    sender: broadcast::Sender<LiveEvent>,
}

impl EventSink {
    /// Create a sink buffering up to `capacity` events per slow subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: LiveEvent) {
        tracing::trace!(event = event.name(), "Publishing live event");
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let sink = EventSink::new(8);
        sink.publish(LiveEvent::Connecting);

        let mut rx = sink.subscribe();
        sink.publish(LiveEvent::Connecting);
        sink.publish(LiveEvent::Disconnected);

        assert_eq!(rx.recv().await.unwrap(), LiveEvent::Connecting);
        assert_eq!(rx.recv().await.unwrap(), LiveEvent::Disconnected);
        assert_eq!(sink.receiver_count(), 1);
    }

    #[test]
    fn reconnecting_serializes_delay_in_millis() {
        let event = LiveEvent::Reconnecting {
            attempt: 2,
            delay: Duration::from_secs(2),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"event": "reconnecting", "attempt": 2, "delay": 2000})
        );
    }
}
