//! Observer-visible view of one subscription.

use super::{MergeOutcome, Reconcile, ReconcileError};
use crate::config::ViewConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tikit_realtime_core::change::ChangeEnvelope;

/// Locally reconciled state for one (topic, filter key).
///
/// `loading` is true only until the initial fetch resolves, successfully or
/// not. Later refreshes (after a reconnect) never re-enter `loading`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityView<T> {
    /// Current data, `None` until something authoritative arrived
    pub data: Option<T>,
    /// Waiting for the first fetch
    pub loading: bool,
    /// Last fetch error, cleared by the next successful merge
    pub error: Option<String>,
    /// At least one authoritative update or fetch has been applied
    pub is_live: bool,
}

impl<T> EntityView<T> {
    /// View waiting for its initial fetch.
    #[must_use]
    pub const fn loading() -> Self {
        Self {
            data: None,
            loading: true,
            error: None,
            is_live: false,
        }
    }

    /// View for a topic without an initial fetch.
    #[must_use]
    pub const fn idle() -> Self {
        Self {
            data: None,
            loading: false,
            error: None,
            is_live: false,
        }
    }

    /// Resolve the pending fetch with an error. Data is kept.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.loading = false;
        self.error = Some(error.into());
    }
}

impl<T: Reconcile> EntityView<T> {
    /// Merge one incremental change.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Decode`] when the row does not match the
    /// topic's record type; the view is left untouched.
    pub fn merge_change(
        &mut self,
        change: &ChangeEnvelope,
        limits: &ViewConfig,
    ) -> Result<MergeOutcome, ReconcileError> {
        let outcome = T::apply_change(&mut self.data, change, limits)?;
        if outcome.is_applied() {
            self.is_live = true;
        }
        Ok(outcome)
    }

    /// Merge an authoritative snapshot using the same rules as incremental changes.
    ///
    /// Resolves `loading` and clears a previous error even when every row in the
    /// snapshot turns out to be stale.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Decode`] when the snapshot cannot be decoded.
    pub fn merge_snapshot(
        &mut self,
        snapshot: &serde_json::Value,
        as_of: DateTime<Utc>,
        limits: &ViewConfig,
    ) -> Result<MergeOutcome, ReconcileError> {
        let outcome = T::apply_snapshot(&mut self.data, snapshot, as_of, limits)?;
        self.loading = false;
        self.error = None;
        self.is_live = true;
        Ok(outcome)
    }
}

impl<T: Default> EntityView<T> {
    /// Mark a snapshot-less view live, materializing empty data.
    pub fn go_live(&mut self) {
        self.loading = false;
        self.is_live = true;
        if self.data.is_none() {
            self.data = Some(T::default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_resolves_loading_and_keeps_data() {
        let mut view = EntityView {
            data: Some(3_u32),
            ..EntityView::loading()
        };
        view.fail("not found");

        assert!(!view.loading);
        assert_eq!(view.data, Some(3));
        assert_eq!(view.error.as_deref(), Some("not found"));
    }

    #[test]
    fn go_live_materializes_default_data() {
        let mut view = EntityView::<Vec<u32>>::idle();
        view.go_live();
        assert_eq!(view.data, Some(Vec::new()));
        assert!(view.is_live);
    }
}
