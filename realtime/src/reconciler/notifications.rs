//! Per-user notification inbox.
//!
//! The list is kept newest first and bounded; the oldest entries are evicted.
//! `unread_count` is adjusted on every insert, replace and removal and always
//! equals the number of unread entries in the list.
//!
//! Each notification carries a version: the later of the row's `updated_at`
//! and `read_at`, or the envelope time (the fetch issue time for snapshots)
//! when the row has neither. A row for a held id replaces it only when its
//! version is newer, so a redelivered insert cannot undo a mark-read.

use super::{MergeOutcome, Reconcile, ReconcileError, decode, optional_timestamp};
use crate::config::ViewConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tikit_realtime_core::change::{ChangeEnvelope, ChangeOperation, flexible_timestamp};

/// One notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Server-assigned id
    pub id: String,
    /// Short headline
    pub title: String,
    /// Body text
    pub message: String,
    /// Category (`ticket_purchase`, `group_buy`, `spray_money`, ...)
    pub kind: String,
    /// `low`, `normal`, `high` or `urgent`
    pub priority: String,
    /// Whether the user has seen it
    pub read: bool,
    /// Deep link opened when the notification is tapped
    pub action_url: Option<String>,
    /// Free-form payload attached by the sender
    pub metadata: Option<serde_json::Value>,
    /// Creation time, orders the list
    #[serde(with = "flexible_timestamp")]
    pub created_at: DateTime<Utc>,
    /// Version of this row
    #[serde(with = "flexible_timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// Same content, ignoring the version.
    fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.title == other.title
            && self.message == other.message
            && self.kind == other.kind
            && self.priority == other.priority
            && self.read == other.read
            && self.action_url == other.action_url
            && self.metadata == other.metadata
            && self.created_at == other.created_at
    }
}

/// Bounded inbox, newest first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationList {
    items: Vec<Notification>,
    unread_count: usize,
}

fn default_priority() -> String {
    "normal".to_string()
}

#[derive(Deserialize)]
struct NotificationRow {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    message: String,
    #[serde(default, alias = "type")]
    kind: String,
    #[serde(default = "default_priority")]
    priority: String,
    #[serde(default)]
    read: bool,
    #[serde(default)]
    action_url: Option<String>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "optional_timestamp::deserialize")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "optional_timestamp::deserialize")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "optional_timestamp::deserialize")]
    read_at: Option<DateTime<Utc>>,
}

impl NotificationRow {
    fn into_notification(self, fallback: DateTime<Utc>) -> Notification {
        let version = self.updated_at.max(self.read_at).unwrap_or(fallback);
        Notification {
            id: self.id,
            title: self.title,
            message: self.message,
            kind: self.kind,
            priority: self.priority,
            read: self.read,
            action_url: self.action_url,
            metadata: self.metadata,
            created_at: self.created_at.unwrap_or(fallback),
            updated_at: version,
        }
    }
}

#[derive(Deserialize)]
struct NotificationRef {
    id: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NotificationPayload {
    Rows(Vec<NotificationRow>),
    Wrapped { notifications: Vec<NotificationRow> },
}

impl NotificationList {
    /// Notifications, newest first.
    #[must_use]
    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    /// Number of unread notifications.
    #[must_use]
    pub const fn unread_count(&self) -> usize {
        self.unread_count
    }

    /// Number of retained notifications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the inbox is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Look up a notification by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Notification> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Insert a notification, or replace the held one with the same id if
    /// the incoming version is newer.
    pub fn insert(&mut self, notification: Notification, max_retained: usize) -> MergeOutcome {
        if let Some(index) = self.index_of(&notification.id) {
            return self.replace_at(index, notification);
        }

        let id = notification.id.clone();
        let position = self.position_for(&notification);
        if !notification.read {
            self.unread_count += 1;
        }
        self.items.insert(position, notification);

        while self.items.len() > max_retained {
            if let Some(evicted) = self.items.pop() {
                if !evicted.read {
                    self.unread_count -= 1;
                }
            }
        }

        if self.index_of(&id).is_some() {
            MergeOutcome::Applied
        } else {
            MergeOutcome::Discarded
        }
    }

    /// Replace a notification (mark-read and similar) if the incoming version
    /// is newer. An unknown id is inserted.
    pub fn update(&mut self, notification: Notification, max_retained: usize) -> MergeOutcome {
        match self.index_of(&notification.id) {
            Some(index) => self.replace_at(index, notification),
            None => self.insert(notification, max_retained),
        }
    }

    /// Remove a notification. Removing an unknown id is a no-op.
    pub fn remove(&mut self, id: &str) -> MergeOutcome {
        let Some(index) = self.index_of(id) else {
            return MergeOutcome::Discarded;
        };
        let removed = self.items.remove(index);
        if !removed.read {
            self.unread_count -= 1;
        }
        MergeOutcome::Applied
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    /// Newest-first slot for `notification`; ties go in front.
    fn position_for(&self, notification: &Notification) -> usize {
        self.items
            .iter()
            .position(|held| held.created_at <= notification.created_at)
            .unwrap_or(self.items.len())
    }

    fn replace_at(&mut self, index: usize, notification: Notification) -> MergeOutcome {
        let held = &mut self.items[index];
        if notification.updated_at <= held.updated_at {
            return MergeOutcome::Discarded;
        }
        if held.same_content(&notification) {
            held.updated_at = notification.updated_at;
            return MergeOutcome::Discarded;
        }
        let held = self.items.remove(index);
        if !held.read {
            self.unread_count -= 1;
        }
        if !notification.read {
            self.unread_count += 1;
        }
        let position = self.position_for(&notification);
        self.items.insert(position, notification);
        MergeOutcome::Applied
    }
}

impl Reconcile for NotificationList {
    fn apply_change(
        current: &mut Option<Self>,
        change: &ChangeEnvelope,
        limits: &ViewConfig,
    ) -> Result<MergeOutcome, ReconcileError> {
        let max = limits.notification_max_retained;
        match change.operation {
            ChangeOperation::Delete => {
                let target: NotificationRef = decode(&change.row)?;
                Ok(current
                    .as_mut()
                    .map_or(MergeOutcome::Discarded, |list| list.remove(&target.id)))
            },
            ChangeOperation::Insert => {
                let row: NotificationRow = decode(&change.row)?;
                let list = current.get_or_insert_with(Self::default);
                Ok(list.insert(row.into_notification(change.server_timestamp), max))
            },
            ChangeOperation::Update => {
                let row: NotificationRow = decode(&change.row)?;
                let list = current.get_or_insert_with(Self::default);
                Ok(list.update(row.into_notification(change.server_timestamp), max))
            },
        }
    }

    fn apply_snapshot(
        current: &mut Option<Self>,
        snapshot: &serde_json::Value,
        as_of: DateTime<Utc>,
        limits: &ViewConfig,
    ) -> Result<MergeOutcome, ReconcileError> {
        let rows = match decode::<NotificationPayload>(snapshot)? {
            NotificationPayload::Rows(rows) | NotificationPayload::Wrapped { notifications: rows } => {
                rows
            },
        };

        let mut outcome = if current.is_none() {
            MergeOutcome::Applied
        } else {
            MergeOutcome::Discarded
        };
        let list = current.get_or_insert_with(Self::default);
        for row in rows {
            let merged = list.insert(row.into_notification(as_of), limits.notification_max_retained);
            outcome = outcome.or(merged);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::TimeDelta;
    use serde_json::json;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + TimeDelta::seconds(seconds)
    }

    fn note(id: &str, seconds: i64, read: bool) -> Notification {
        Notification {
            id: id.to_string(),
            title: format!("title {id}"),
            message: String::new(),
            kind: "ticket_purchase".to_string(),
            priority: default_priority(),
            read,
            action_url: None,
            metadata: None,
            created_at: at(seconds),
            updated_at: at(seconds),
        }
    }

    fn change(operation: ChangeOperation, row: serde_json::Value, seconds: i64) -> ChangeEnvelope {
        ChangeEnvelope {
            topic: tikit_realtime_core::topic::Topic::UserNotifications,
            filter_key: "user-1".into(),
            operation,
            row,
            server_timestamp: at(seconds),
        }
    }

    fn ids(list: &NotificationList) -> Vec<&str> {
        list.items().iter().map(|item| item.id.as_str()).collect()
    }

    #[test]
    fn newest_is_first_and_oldest_is_evicted() {
        let mut list = NotificationList::default();
        list.insert(note("n1", 1, false), 2);
        list.insert(note("n2", 2, true), 2);
        list.insert(note("n3", 3, false), 2);

        assert_eq!(ids(&list), vec!["n3", "n2"]);
        assert_eq!(list.unread_count(), 1);
    }

    #[test]
    fn notification_older_than_a_full_list_is_not_kept() {
        let mut list = NotificationList::default();
        list.insert(note("n2", 2, false), 1);

        assert_eq!(list.insert(note("n1", 1, false), 1), MergeOutcome::Discarded);
        assert_eq!(ids(&list), vec!["n2"]);
        assert_eq!(list.unread_count(), 1);
    }

    #[test]
    fn mark_read_adjusts_counter() {
        let mut list = NotificationList::default();
        list.insert(note("n1", 1, false), 10);
        list.insert(note("n2", 2, false), 10);

        let mut read = note("n1", 1, true);
        read.updated_at = at(5);
        assert_eq!(list.update(read.clone(), 10), MergeOutcome::Applied);
        assert_eq!(list.unread_count(), 1);
        assert_eq!(list.update(read, 10), MergeOutcome::Discarded);
        assert_eq!(list.remove("n2"), MergeOutcome::Applied);
        assert_eq!(list.unread_count(), 0);
        assert_eq!(list.remove("n2"), MergeOutcome::Discarded);
    }

    #[test]
    fn row_uses_type_alias_and_envelope_time() {
        let limits = ViewConfig::default();
        let mut current = None;
        let change = change(
            ChangeOperation::Insert,
            json!({"id": "n1", "title": "Ticket confirmed", "type": "ticket_purchase"}),
            42,
        );

        NotificationList::apply_change(&mut current, &change, &limits).unwrap();

        let list = current.unwrap();
        let item = list.get("n1").unwrap();
        assert_eq!(item.kind, "ticket_purchase");
        assert_eq!(item.priority, "normal");
        assert_eq!(item.created_at, change.server_timestamp);
        assert_eq!(item.updated_at, change.server_timestamp);
        assert_eq!(list.unread_count(), 1);
    }

    #[test]
    fn redelivered_insert_does_not_undo_mark_read() {
        let limits = ViewConfig::default();
        let mut current = None;
        let inserted = change(ChangeOperation::Insert, json!({"id": "n1", "title": "a"}), 10);
        let marked = change(
            ChangeOperation::Update,
            json!({"id": "n1", "title": "a", "read": true}),
            20,
        );

        NotificationList::apply_change(&mut current, &inserted, &limits).unwrap();
        NotificationList::apply_change(&mut current, &marked, &limits).unwrap();
        let replayed = NotificationList::apply_change(&mut current, &inserted, &limits).unwrap();

        let list = current.unwrap();
        assert_eq!(replayed, MergeOutcome::Discarded);
        assert!(list.get("n1").unwrap().read);
        assert_eq!(list.unread_count(), 0);
    }

    #[test]
    fn read_at_versions_the_row() {
        let limits = ViewConfig::default();
        let mut current = None;
        let inserted = change(ChangeOperation::Insert, json!({"id": "n1", "title": "a"}), 10);
        let marked = change(
            ChangeOperation::Update,
            json!({"id": "n1", "title": "a", "read": true, "read_at": "1970-01-01T00:00:30Z"}),
            15,
        );

        NotificationList::apply_change(&mut current, &inserted, &limits).unwrap();
        NotificationList::apply_change(&mut current, &marked, &limits).unwrap();

        let list = current.unwrap();
        assert_eq!(list.get("n1").unwrap().updated_at, at(30));
        assert_eq!(list.unread_count(), 0);
    }

    #[test]
    fn snapshot_fetched_before_mark_read_is_ignored() {
        let limits = ViewConfig::default();
        let mut current = None;
        let unread = json!([{"id": "n1", "title": "a", "created_at": "1970-01-01T00:00:01Z"}]);
        NotificationList::apply_snapshot(&mut current, &unread, at(10), &limits).unwrap();
        let marked = change(
            ChangeOperation::Update,
            json!({"id": "n1", "title": "a", "read": true, "created_at": "1970-01-01T00:00:01Z"}),
            20,
        );
        NotificationList::apply_change(&mut current, &marked, &limits).unwrap();

        let stale = NotificationList::apply_snapshot(&mut current, &unread, at(15), &limits).unwrap();
        assert_eq!(stale, MergeOutcome::Discarded);
        assert_eq!(current.as_ref().unwrap().unread_count(), 0);

        let fresh = NotificationList::apply_snapshot(&mut current, &unread, at(25), &limits).unwrap();
        assert_eq!(fresh, MergeOutcome::Applied);
        assert_eq!(current.as_ref().unwrap().unread_count(), 1);
    }

    #[test]
    fn refresh_with_identical_rows_only_advances_the_version() {
        let limits = ViewConfig::default();
        let mut current = None;
        let rows = json!([{"id": "n1", "title": "a", "created_at": "1970-01-01T00:00:01Z"}]);

        NotificationList::apply_snapshot(&mut current, &rows, at(10), &limits).unwrap();
        let again = NotificationList::apply_snapshot(&mut current, &rows, at(20), &limits).unwrap();

        assert_eq!(again, MergeOutcome::Discarded);
        assert_eq!(current.unwrap().get("n1").unwrap().updated_at, at(20));
    }

    #[test]
    fn snapshot_accepts_wrapped_list() {
        let limits = ViewConfig::default();
        let mut current = None;

        NotificationList::apply_snapshot(
            &mut current,
            &json!({"notifications": [
                {"id": "n1", "title": "a", "created_at": "2025-01-01T00:00:01Z"},
                {"id": "n2", "title": "b", "read": true, "created_at": "2025-01-01T00:00:02Z"}
            ]}),
            at(100),
            &limits,
        )
        .unwrap();

        let list = current.unwrap();
        assert_eq!(ids(&list), vec!["n2", "n1"]);
        assert_eq!(list.unread_count(), 1);
    }
}
