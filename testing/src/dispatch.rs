//! Recording action dispatcher.

#![allow(clippy::unwrap_used)] // Test infrastructure: mutex poisoning is a test failure
#![allow(clippy::missing_panics_doc)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tikit_realtime_core::dispatch::{
    ActionDispatchError, ActionDispatcher, ActionReceipt, ActionRequest,
};
use tikit_realtime_core::gateway::BoxFuture;
use tikit_realtime_core::topic::IdempotencyKey;

type Outcome = Result<ActionReceipt, ActionDispatchError>;

#[derive(Debug, Default)]
struct DispatchInner {
    scripted: HashMap<IdempotencyKey, VecDeque<Outcome>>,
    rejected: HashMap<IdempotencyKey, String>,
    requests: Vec<ActionRequest>,
}

/// [`ActionDispatcher`] that records every request.
///
/// Unscripted requests succeed with `{"ok": true}`. Outcomes are scripted per
/// idempotency key, so a test can make one action of a batch fail.
#[derive(Debug, Clone, Default)]
pub struct RecordingDispatcher {
    inner: Arc<Mutex<DispatchInner>>,
}

impl RecordingDispatcher {
    /// Create a dispatcher that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for successive attempts of `key`.
    pub fn script(&self, key: impl Into<IdempotencyKey>, outcomes: Vec<Outcome>) {
        self.inner
            .lock()
            .unwrap()
            .scripted
            .entry(key.into())
            .or_default()
            .extend(outcomes);
    }

    /// Fail every attempt of `key` with a transport error.
    pub fn always_fail(&self, key: impl Into<IdempotencyKey>, attempts: usize) {
        let outcomes = (0..attempts)
            .map(|_| Err(ActionDispatchError::Transport("connection reset".to_string())))
            .collect();
        self.script(key, outcomes);
    }

    /// Reject every attempt of `key`.
    pub fn reject(&self, key: impl Into<IdempotencyKey>, reason: impl Into<String>) {
        self.inner
            .lock()
            .unwrap()
            .rejected
            .insert(key.into(), reason.into());
    }

    /// Every request received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<ActionRequest> {
        self.inner.lock().unwrap().requests.clone()
    }

    /// Idempotency keys in the order requests arrived.
    #[must_use]
    pub fn dispatch_order(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|request| request.idempotency_key.into_inner())
            .collect()
    }

    /// Requests received for `key`.
    #[must_use]
    pub fn attempts_for(&self, key: &str) -> Vec<ActionRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.idempotency_key.as_str() == key)
            .collect()
    }
}

impl ActionDispatcher for RecordingDispatcher {
    fn dispatch(&self, request: ActionRequest) -> BoxFuture<'_, Outcome> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            let key = request.idempotency_key.clone();
            inner.requests.push(request);

            if let Some(reason) = inner.rejected.get(&key) {
                return Err(ActionDispatchError::Rejected(reason.clone()));
            }
            inner
                .scripted
                .get_mut(&key)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| {
                    Ok(ActionReceipt {
                        response: serde_json::json!({"ok": true}),
                    })
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tikit_realtime_core::topic::ActionId;

    fn request(key: &str, attempt: u32) -> ActionRequest {
        ActionRequest {
            action_id: ActionId::new(),
            idempotency_key: IdempotencyKey::new(key),
            payload: serde_json::json!({"op": "buy"}),
            attempt,
        }
    }

    #[tokio::test]
    async fn scripted_outcomes_then_success() {
        let dispatcher = RecordingDispatcher::new();
        dispatcher.always_fail("k1", 1);
        dispatcher.reject("k2", "sold out");

        assert!(dispatcher.dispatch(request("k1", 1)).await.is_err());
        assert!(dispatcher.dispatch(request("k1", 2)).await.is_ok());
        assert_eq!(
            dispatcher.dispatch(request("k2", 1)).await,
            Err(ActionDispatchError::Rejected("sold out".into()))
        );
        assert_eq!(dispatcher.dispatch_order(), vec!["k1", "k1", "k2"]);
        assert_eq!(dispatcher.attempts_for("k1").len(), 2);
    }
}
