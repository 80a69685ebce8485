//! Admin broadcast messages.
//!
//! Broadcasts have no authoritative snapshot. The log is newest first,
//! deduplicated by message id and bounded.

use super::{MergeOutcome, Reconcile, ReconcileError, decode, optional_timestamp};
use crate::config::ViewConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tikit_realtime_core::change::{ChangeEnvelope, ChangeOperation, flexible_timestamp};

/// One broadcast message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    /// Broadcast id
    pub id: String,
    /// Headline
    pub title: String,
    /// Body text
    pub message: String,
    /// `low`, `normal`, `high` or `urgent`
    pub priority: String,
    /// Send time
    #[serde(with = "flexible_timestamp")]
    pub created_at: DateTime<Utc>,
}

/// Bounded message log, newest first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLog {
    messages: Vec<BroadcastMessage>,
}

#[derive(Deserialize)]
struct BroadcastRow {
    #[serde(alias = "broadcast_id")]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    message: String,
    #[serde(default = "default_priority")]
    priority: String,
    #[serde(default, deserialize_with = "optional_timestamp::deserialize")]
    created_at: Option<DateTime<Utc>>,
}

fn default_priority() -> String {
    "normal".to_string()
}

impl MessageLog {
    /// Messages, newest first.
    #[must_use]
    pub fn messages(&self) -> &[BroadcastMessage] {
        &self.messages
    }

    /// Most recent message.
    #[must_use]
    pub fn latest(&self) -> Option<&BroadcastMessage> {
        self.messages.first()
    }

    /// Number of retained messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Record a message unless its id was already seen.
    pub fn push(&mut self, message: BroadcastMessage, max_retained: usize) -> MergeOutcome {
        if self.messages.iter().any(|held| held.id == message.id) {
            return MergeOutcome::Discarded;
        }
        let position = self
            .messages
            .iter()
            .position(|held| held.created_at <= message.created_at)
            .unwrap_or(self.messages.len());
        if position >= max_retained {
            return MergeOutcome::Discarded;
        }
        self.messages.insert(position, message);
        self.messages.truncate(max_retained);
        MergeOutcome::Applied
    }
}

impl Reconcile for MessageLog {
    fn apply_change(
        current: &mut Option<Self>,
        change: &ChangeEnvelope,
        limits: &ViewConfig,
    ) -> Result<MergeOutcome, ReconcileError> {
        if change.operation == ChangeOperation::Delete {
            return Ok(MergeOutcome::Discarded);
        }
        let row: BroadcastRow = decode(&change.row)?;
        let message = BroadcastMessage {
            id: row.id,
            title: row.title,
            message: row.message,
            priority: row.priority,
            created_at: row.created_at.unwrap_or(change.server_timestamp),
        };
        Ok(current
            .get_or_insert_with(Self::default)
            .push(message, limits.broadcast_max_retained))
    }

    fn apply_snapshot(
        current: &mut Option<Self>,
        _snapshot: &serde_json::Value,
        _as_of: DateTime<Utc>,
        _limits: &ViewConfig,
    ) -> Result<MergeOutcome, ReconcileError> {
        if current.is_some() {
            return Ok(MergeOutcome::Discarded);
        }
        *current = Some(Self::default());
        Ok(MergeOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn message(id: &str, seconds: i64) -> BroadcastMessage {
        BroadcastMessage {
            id: id.to_string(),
            title: "Gate change".to_string(),
            message: String::new(),
            priority: default_priority(),
            created_at: DateTime::UNIX_EPOCH + TimeDelta::seconds(seconds),
        }
    }

    #[test]
    fn duplicates_are_dropped_and_log_is_bounded() {
        let mut log = MessageLog::default();
        assert_eq!(log.push(message("b1", 1), 2), MergeOutcome::Applied);
        assert_eq!(log.push(message("b1", 1), 2), MergeOutcome::Discarded);
        log.push(message("b2", 2), 2);
        log.push(message("b3", 3), 2);

        let ids: Vec<&str> = log.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["b3", "b2"]);
        assert_eq!(log.latest().map(|m| m.id.as_str()), Some("b3"));
        assert_eq!(log.push(message("b0", 0), 2), MergeOutcome::Discarded);
    }
}
