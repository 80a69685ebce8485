//! Offline action queue.
//!
//! A FIFO of user actions. At most one action is in flight; actions start
//! their first attempt strictly in enqueue order. A failing action waits for
//! its backoff timer without holding back the actions behind it, and is
//! removed only when it succeeds or exhausts its attempt budget, in which case
//! it is kept in a bounded failure history.

use crate::event::ActionOutcome;
use crate::session::LiveAction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tikit_realtime_core::dispatch::{
    ActionDispatchError, ActionDispatcher, ActionReceipt, ActionRequest,
};
use tikit_realtime_core::effect::Effect;
use tikit_realtime_core::topic::{ActionId, IdempotencyKey};
use tikit_realtime_runtime::BackoffPolicy;
use tikit_realtime_runtime::metrics::QueueMetrics;

/// Lifecycle of a queued action.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Waiting for connectivity or for its retry timer
    Pending,
    /// A dispatch attempt is running
    InFlight,
    /// The API accepted it
    Succeeded,
    /// Rejected or out of attempts
    Failed,
}

/// One buffered action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueuedAction {
    /// Local id, stable across retries
    pub id: ActionId,
    /// Caller-supplied key, sent unchanged on every attempt
    pub idempotency_key: IdempotencyKey,
    /// Action body
    pub payload: serde_json::Value,
    /// When it was enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Attempts started so far
    pub attempts: u32,
    /// Current status
    pub status: ActionStatus,
    /// Error of the last failed attempt
    pub last_error: Option<ActionDispatchError>,
    #[serde(skip)]
    awaiting_retry: bool,
}

impl QueuedAction {
    /// A new pending action.
    #[must_use]
    pub const fn new(
        id: ActionId,
        idempotency_key: IdempotencyKey,
        payload: serde_json::Value,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            idempotency_key,
            payload,
            enqueued_at,
            attempts: 0,
            status: ActionStatus::Pending,
            last_error: None,
            awaiting_retry: false,
        }
    }

    fn request(&self) -> ActionRequest {
        ActionRequest {
            action_id: self.id,
            idempotency_key: self.idempotency_key.clone(),
            payload: self.payload.clone(),
            attempt: self.attempts,
        }
    }
}

/// Counts for status displays.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    /// Waiting actions
    pub pending: usize,
    /// Actions being dispatched (0 or 1)
    pub in_flight: usize,
    /// Actions in the failure history
    pub failed: usize,
}

impl QueueSummary {
    /// Actions not yet settled.
    #[must_use]
    pub const fn queued(&self) -> usize {
        self.pending + self.in_flight
    }
}

/// What a completed dispatch means for the action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// Removed from the queue with this outcome
    Settled(ActionOutcome),
    /// Attempt `attempt` failed; retry after `delay`
    Retry {
        /// Attempt that failed
        attempt: u32,
        /// Backoff before the next attempt
        delay: Duration,
    },
    /// The id is not in flight (already settled)
    Unknown,
}

/// FIFO of buffered actions.
#[derive(Clone, Debug)]
pub struct OfflineQueue {
    actions: VecDeque<QueuedAction>,
    failed: VecDeque<QueuedAction>,
    settled: VecDeque<(ActionId, ActionOutcome)>,
    history: usize,
}

impl OfflineQueue {
    /// Empty queue keeping at most `history` failed and settled entries.
    #[must_use]
    pub const fn new(history: usize) -> Self {
        Self {
            actions: VecDeque::new(),
            failed: VecDeque::new(),
            settled: VecDeque::new(),
            history,
        }
    }

    /// Append an action.
    pub fn push(&mut self, action: QueuedAction) {
        self.actions.push_back(action);
        QueueMetrics::record_depth(self.actions.len());
    }

    /// Unsettled actions, in enqueue order.
    pub fn actions(&self) -> impl Iterator<Item = &QueuedAction> {
        self.actions.iter()
    }

    /// Actions that failed permanently, oldest first.
    pub fn failed(&self) -> impl Iterator<Item = &QueuedAction> {
        self.failed.iter()
    }

    /// Number of unsettled actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether no action is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Pick the next action to dispatch and mark it in flight.
    ///
    /// Returns `None` while another action is in flight, or when every
    /// pending action is waiting for its retry timer.
    pub fn next_dispatch(&mut self) -> Option<ActionRequest> {
        if self
            .actions
            .iter()
            .any(|action| action.status == ActionStatus::InFlight)
        {
            return None;
        }
        let action = self
            .actions
            .iter_mut()
            .find(|action| action.status == ActionStatus::Pending && !action.awaiting_retry)?;
        action.status = ActionStatus::InFlight;
        action.attempts += 1;
        Some(action.request())
    }

    /// Record the result of the in-flight attempt of `id`.
    pub fn complete(
        &mut self,
        id: ActionId,
        result: Result<ActionReceipt, ActionDispatchError>,
        policy: &BackoffPolicy,
    ) -> Settlement {
        let Some(index) = self
            .actions
            .iter()
            .position(|action| action.id == id && action.status == ActionStatus::InFlight)
        else {
            return Settlement::Unknown;
        };

        let settlement = match result {
            Ok(receipt) => {
                self.actions.remove(index);
                QueueMetrics::record_settled("succeeded");
                Settlement::Settled(ActionOutcome::Succeeded {
                    response: receipt.response,
                })
            },
            Err(error) => {
                let action = &mut self.actions[index];
                let attempts = action.attempts;
                action.last_error = Some(error.clone());

                if error.is_retryable() && policy.should_retry(attempts) {
                    action.status = ActionStatus::Pending;
                    action.awaiting_retry = true;
                    return Settlement::Retry {
                        attempt: attempts,
                        delay: policy.delay_for_attempt(attempts - 1),
                    };
                }

                action.status = ActionStatus::Failed;
                if let Some(failed) = self.actions.remove(index) {
                    self.failed.push_back(failed);
                    if self.failed.len() > self.history {
                        self.failed.pop_front();
                    }
                }
                QueueMetrics::record_settled("failed");
                Settlement::Settled(ActionOutcome::Failed { error, attempts })
            },
        };

        if let Settlement::Settled(outcome) = &settlement {
            self.settled.push_back((id, outcome.clone()));
            if self.settled.len() > self.history {
                self.settled.pop_front();
            }
        }
        QueueMetrics::record_depth(self.actions.len());
        settlement
    }

    /// The retry timer of `id` fired. Returns false if the action is gone.
    pub fn retry_due(&mut self, id: ActionId) -> bool {
        self.actions
            .iter_mut()
            .find(|action| action.id == id)
            .map(|action| action.awaiting_retry = false)
            .is_some()
    }

    /// Status of `id`, including recently settled actions.
    #[must_use]
    pub fn status_of(&self, id: ActionId) -> Option<ActionStatus> {
        if let Some(action) = self.actions.iter().find(|action| action.id == id) {
            return Some(action.status);
        }
        self.outcome_of(id).map(|outcome| {
            if outcome.is_success() {
                ActionStatus::Succeeded
            } else {
                ActionStatus::Failed
            }
        })
    }

    /// Outcome of a recently settled action.
    #[must_use]
    pub fn outcome_of(&self, id: ActionId) -> Option<&ActionOutcome> {
        self.settled
            .iter()
            .rev()
            .find(|(settled, _)| *settled == id)
            .map(|(_, outcome)| outcome)
    }

    /// Counts for status displays.
    #[must_use]
    pub fn summary(&self) -> QueueSummary {
        let in_flight = self
            .actions
            .iter()
            .filter(|action| action.status == ActionStatus::InFlight)
            .count();
        QueueSummary {
            pending: self.actions.len() - in_flight,
            in_flight,
            failed: self.failed.len(),
        }
    }
}

/// Run one dispatch attempt, bounded by `timeout`.
pub fn dispatch(
    dispatcher: Arc<dyn ActionDispatcher>,
    request: ActionRequest,
    timeout: Duration,
) -> Effect<LiveAction> {
    let id = request.action_id;
    Effect::future(async move {
        let result = tokio::time::timeout(timeout, dispatcher.dispatch(request))
            .await
            .unwrap_or(Err(ActionDispatchError::Timeout));
        Some(LiveAction::DispatchCompleted { id, result })
    })
}
