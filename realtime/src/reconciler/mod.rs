//! State reconciler.
//!
//! Owns one [`EntityView`] per subscription and merges incremental changes and
//! fetched snapshots into it. Each topic has its own merge policy (see the
//! submodules); a snapshot goes through the same policy as an incremental
//! change, so both paths converge on identical state for identical content.
//!
//! Stale or duplicate input is not an error: it yields
//! [`MergeOutcome::Discarded`] and leaves the view untouched.

use crate::config::ViewConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use thiserror::Error;
use tikit_realtime_core::change::ChangeEnvelope;
use tikit_realtime_core::topic::{SubscriptionKey, Topic};
use tikit_realtime_runtime::metrics::ReconcilerMetrics;

pub mod broadcast;
pub mod capacity;
pub mod group_buy;
pub mod leaderboard;
pub mod notifications;
pub mod view;

pub use broadcast::{BroadcastMessage, MessageLog};
pub use capacity::{CapacitySnapshot, CapacityStatus};
pub use group_buy::{GroupBuySnapshot, GroupBuyState};
pub use leaderboard::{LeaderboardEntry, LeaderboardSnapshot};
pub use notifications::{Notification, NotificationList};
pub use view::EntityView;

/// Result of merging one update.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The view changed (or became authoritative)
    Applied,
    /// Stale, duplicate or irrelevant input; the view is unchanged
    Discarded,
}

impl MergeOutcome {
    /// Whether the view changed.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }

    /// `Applied` if either outcome is.
    #[must_use]
    pub const fn or(self, other: Self) -> Self {
        if self.is_applied() || other.is_applied() {
            Self::Applied
        } else {
            Self::Discarded
        }
    }
}

/// Errors raised while merging.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// The row does not match the topic's record type
    #[error("Malformed row: {0}")]
    Decode(String),

    /// No view is registered for the subscription
    #[error("No view for {0}")]
    NoView(SubscriptionKey),
}

/// Merge policy of one topic's data type.
pub trait Reconcile: Sized {
    /// Merge one incremental change into `current`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Decode`] for rows that do not decode.
    fn apply_change(
        current: &mut Option<Self>,
        change: &ChangeEnvelope,
        limits: &ViewConfig,
    ) -> Result<MergeOutcome, ReconcileError>;

    /// Merge a fetched snapshot into `current` without discarding held state.
    ///
    /// Rows that carry no version of their own are versioned at `as_of`, the
    /// time the fetch was issued.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Decode`] for snapshots that do not decode.
    fn apply_snapshot(
        current: &mut Option<Self>,
        snapshot: &serde_json::Value,
        as_of: DateTime<Utc>,
        limits: &ViewConfig,
    ) -> Result<MergeOutcome, ReconcileError>;
}

/// Single-row data versioned by a timestamp.
pub(crate) trait Versioned {
    fn version(&self) -> DateTime<Utc>;
}

/// Last write wins; an incoming version ≤ the held one is discarded.
pub(crate) fn merge_latest<T: Versioned>(current: &mut Option<T>, incoming: T) -> MergeOutcome {
    match current {
        Some(held) if incoming.version() <= held.version() => MergeOutcome::Discarded,
        _ => {
            *current = Some(incoming);
            MergeOutcome::Applied
        },
    }
}

/// Clear `current` if the delete is at least as new as the held row.
pub(crate) fn remove_if_newer<T: Versioned>(
    current: &mut Option<T>,
    deleted_at: DateTime<Utc>,
) -> MergeOutcome {
    match current {
        Some(held) if deleted_at >= held.version() => {
            *current = None;
            MergeOutcome::Applied
        },
        _ => MergeOutcome::Discarded,
    }
}

pub(crate) fn decode<T: DeserializeOwned>(value: &serde_json::Value) -> Result<T, ReconcileError> {
    T::deserialize(value).map_err(|e| ReconcileError::Decode(e.to_string()))
}

/// Optional timestamp field accepting the formats of [`parse_timestamp`](tikit_realtime_core::change::parse_timestamp).
pub(crate) mod optional_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer};
    use tikit_realtime_core::change::parse_timestamp;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| parse_timestamp(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// The view of one subscription, tagged by topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "topic", content = "view", rename_all = "snake_case")]
pub enum TopicView {
    /// Event capacity counters
    Capacity(EntityView<CapacitySnapshot>),
    /// Group-buy progress
    GroupBuy(EntityView<GroupBuySnapshot>),
    /// Spray-money leaderboard
    Leaderboard(EntityView<LeaderboardSnapshot>),
    /// Notification inbox
    Notifications(EntityView<NotificationList>),
    /// Broadcast message log
    Broadcast(EntityView<MessageLog>),
}

macro_rules! each_view {
    ($value:expr, $view:ident => $body:expr) => {
        match $value {
            TopicView::Capacity($view) => $body,
            TopicView::GroupBuy($view) => $body,
            TopicView::Leaderboard($view) => $body,
            TopicView::Notifications($view) => $body,
            TopicView::Broadcast($view) => $body,
        }
    };
}

impl TopicView {
    /// Fresh view for `topic`. Topics with a snapshot start out loading.
    #[must_use]
    pub const fn for_topic(topic: Topic) -> Self {
        match topic {
            Topic::EventCapacity => Self::Capacity(EntityView::loading()),
            Topic::GroupBuyStatus => Self::GroupBuy(EntityView::loading()),
            Topic::Leaderboard => Self::Leaderboard(EntityView::loading()),
            Topic::UserNotifications => Self::Notifications(EntityView::loading()),
            Topic::Broadcast => Self::Broadcast(EntityView::idle()),
        }
    }

    /// Whether the initial fetch is still pending.
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        each_view!(self, view => view.loading)
    }

    /// Whether authoritative data has been applied.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        each_view!(self, view => view.is_live)
    }

    /// Last fetch error.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        each_view!(self, view => view.error.as_deref())
    }

    fn merge_change(
        &mut self,
        change: &ChangeEnvelope,
        limits: &ViewConfig,
    ) -> Result<MergeOutcome, ReconcileError> {
        each_view!(self, view => view.merge_change(change, limits))
    }

    fn merge_snapshot(
        &mut self,
        snapshot: &serde_json::Value,
        as_of: DateTime<Utc>,
        limits: &ViewConfig,
    ) -> Result<MergeOutcome, ReconcileError> {
        each_view!(self, view => view.merge_snapshot(snapshot, as_of, limits))
    }

    fn fail(&mut self, error: String) {
        each_view!(self, view => view.fail(error));
    }

    fn go_live(&mut self) {
        if let Self::Broadcast(view) = self {
            view.go_live();
        }
    }
}

/// Data type of one topic, linking it to its [`TopicView`] variant.
pub trait TopicData: Reconcile + Clone + Send + Sync + 'static {
    /// Topic carrying this data
    const TOPIC: Topic;

    /// Borrow the typed view out of a [`TopicView`] of the matching topic.
    fn view_of(view: &TopicView) -> Option<&EntityView<Self>>;
}

macro_rules! topic_data {
    ($data:ty, $topic:expr, $variant:ident) => {
        impl TopicData for $data {
            const TOPIC: Topic = $topic;

            fn view_of(view: &TopicView) -> Option<&EntityView<Self>> {
                match view {
                    TopicView::$variant(view) => Some(view),
                    _ => None,
                }
            }
        }
    };
}

topic_data!(CapacitySnapshot, Topic::EventCapacity, Capacity);
topic_data!(GroupBuySnapshot, Topic::GroupBuyStatus, GroupBuy);
topic_data!(LeaderboardSnapshot, Topic::Leaderboard, Leaderboard);
topic_data!(NotificationList, Topic::UserNotifications, Notifications);
topic_data!(MessageLog, Topic::Broadcast, Broadcast);

/// Views of every subscription, keyed by (topic, filter key).
#[derive(Clone, Debug)]
pub struct Reconciler {
    views: BTreeMap<SubscriptionKey, TopicView>,
    limits: ViewConfig,
}

impl Reconciler {
    /// Create an empty reconciler.
    #[must_use]
    pub const fn new(limits: ViewConfig) -> Self {
        Self {
            views: BTreeMap::new(),
            limits,
        }
    }

    /// Create the view for `key` if it does not exist. Returns whether it was created.
    pub fn ensure_view(&mut self, key: &SubscriptionKey) -> bool {
        if self.views.contains_key(key) {
            return false;
        }
        self.views
            .insert(key.clone(), TopicView::for_topic(key.topic));
        true
    }

    /// Drop the view for `key`.
    pub fn remove_view(&mut self, key: &SubscriptionKey) -> Option<TopicView> {
        self.views.remove(key)
    }

    /// Current view for `key`.
    #[must_use]
    pub fn view(&self, key: &SubscriptionKey) -> Option<&TopicView> {
        self.views.get(key)
    }

    /// Number of views.
    #[must_use]
    pub fn len(&self) -> usize {
        self.views.len()
    }

    /// Whether no view exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Merge an incremental change into the view it is addressed to.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::NoView`] if no view exists for the envelope's key
    /// - [`ReconcileError::Decode`] if the row does not decode
    pub fn apply_change(&mut self, change: &ChangeEnvelope) -> Result<MergeOutcome, ReconcileError> {
        let key = change.key();
        let view = self
            .views
            .get_mut(&key)
            .ok_or_else(|| ReconcileError::NoView(key.clone()))?;
        let outcome = view.merge_change(change, &self.limits);
        record(key.topic, outcome.as_ref().ok().copied());
        outcome
    }

    /// Merge a fetched snapshot into the view for `key`. `as_of` is when the
    /// fetch was issued.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::NoView`] if no view exists for `key`
    /// - [`ReconcileError::Decode`] if the snapshot does not decode
    pub fn apply_snapshot(
        &mut self,
        key: &SubscriptionKey,
        snapshot: &serde_json::Value,
        as_of: DateTime<Utc>,
    ) -> Result<MergeOutcome, ReconcileError> {
        let view = self
            .views
            .get_mut(key)
            .ok_or_else(|| ReconcileError::NoView(key.clone()))?;
        let outcome = view.merge_snapshot(snapshot, as_of, &self.limits);
        record(key.topic, outcome.as_ref().ok().copied());
        outcome
    }

    /// Resolve the view's fetch with an error. Returns false if no view exists.
    pub fn fail(&mut self, key: &SubscriptionKey, error: impl Into<String>) -> bool {
        self.views
            .get_mut(key)
            .map(|view| view.fail(error.into()))
            .is_some()
    }

    /// Mark a broadcast view live. Returns false if no view exists.
    pub fn go_live(&mut self, key: &SubscriptionKey) -> bool {
        self.views.get_mut(key).map(TopicView::go_live).is_some()
    }
}

fn record(topic: Topic, outcome: Option<MergeOutcome>) {
    match outcome {
        Some(MergeOutcome::Applied) => ReconcilerMetrics::record_applied(topic.as_str()),
        Some(MergeOutcome::Discarded) | None => ReconcilerMetrics::record_discarded(topic.as_str()),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;
    use tikit_realtime_core::change::{ChangeOperation, parse_timestamp};
    use tikit_realtime_core::topic::FilterKey;

    fn capacity_key() -> SubscriptionKey {
        SubscriptionKey::new(Topic::EventCapacity, FilterKey::new("evt-1"))
    }

    fn capacity_change(sold: u32, ts: &str) -> ChangeEnvelope {
        ChangeEnvelope {
            topic: Topic::EventCapacity,
            filter_key: FilterKey::new("evt-1"),
            operation: ChangeOperation::Update,
            row: json!({"capacity": 100, "sold_tickets": sold, "updated_at": ts}),
            server_timestamp: parse_timestamp(ts).unwrap(),
        }
    }

    fn sold(reconciler: &Reconciler) -> Option<u32> {
        reconciler
            .view(&capacity_key())
            .and_then(CapacitySnapshot::view_of)
            .and_then(|view| view.data.as_ref())
            .map(|data| data.sold_tickets)
    }

    #[test]
    fn change_without_view_is_rejected() {
        let mut reconciler = Reconciler::new(ViewConfig::default());
        assert_eq!(
            reconciler.apply_change(&capacity_change(1, "2025-01-01T00:00:01Z")),
            Err(ReconcileError::NoView(capacity_key()))
        );
    }

    #[test]
    fn older_change_arriving_later_is_dropped() {
        let mut reconciler = Reconciler::new(ViewConfig::default());
        reconciler.ensure_view(&capacity_key());

        reconciler
            .apply_change(&capacity_change(5, "2025-01-01T00:00:10Z"))
            .unwrap();
        let late = reconciler
            .apply_change(&capacity_change(3, "2025-01-01T00:00:05Z"))
            .unwrap();

        assert_eq!(late, MergeOutcome::Discarded);
        assert_eq!(sold(&reconciler), Some(5));
    }

    #[test]
    fn snapshot_resolves_loading_once() {
        let mut reconciler = Reconciler::new(ViewConfig::default());
        assert!(reconciler.ensure_view(&capacity_key()));
        assert!(!reconciler.ensure_view(&capacity_key()));
        assert!(reconciler.view(&capacity_key()).unwrap().is_loading());

        reconciler
            .apply_snapshot(
                &capacity_key(),
                &json!({"capacity": 100, "sold_tickets": 7, "updated_at": "2025-01-01T00:00:20Z"}),
                parse_timestamp("2025-01-01T00:00:30Z").unwrap(),
            )
            .unwrap();

        let view = reconciler.view(&capacity_key()).unwrap();
        assert!(!view.is_loading());
        assert!(view.is_live());
        assert_eq!(sold(&reconciler), Some(7));
    }

    #[test]
    fn fetch_error_is_kept_until_next_snapshot() {
        let mut reconciler = Reconciler::new(ViewConfig::default());
        reconciler.ensure_view(&capacity_key());

        assert!(reconciler.fail(&capacity_key(), "Not found: evt-1"));
        assert_eq!(
            reconciler.view(&capacity_key()).unwrap().error(),
            Some("Not found: evt-1")
        );

        reconciler
            .apply_snapshot(
                &capacity_key(),
                &json!({"capacity": 10}),
                parse_timestamp("2025-01-01T00:00:30Z").unwrap(),
            )
            .unwrap();
        assert_eq!(reconciler.view(&capacity_key()).unwrap().error(), None);
    }

    #[test]
    fn broadcast_view_starts_idle() {
        let mut reconciler = Reconciler::new(ViewConfig::default());
        let key = SubscriptionKey::new(Topic::Broadcast, FilterKey::new("all"));
        reconciler.ensure_view(&key);

        assert!(!reconciler.view(&key).unwrap().is_loading());
        assert!(reconciler.go_live(&key));

        let log = MessageLog::view_of(reconciler.view(&key).unwrap()).unwrap();
        assert_eq!(log.data, Some(MessageLog::default()));
    }
}
