//! Group-buy progress.

use super::{
    MergeOutcome, Reconcile, ReconcileError, Versioned, decode, merge_latest, optional_timestamp,
    remove_if_newer,
};
use crate::config::ViewConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tikit_realtime_core::change::{ChangeEnvelope, ChangeOperation, flexible_timestamp};

/// Lifecycle of a group-buy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBuyState {
    /// Collecting members
    #[default]
    Open,
    /// Target size reached
    Completed,
    /// Deadline passed before the target was reached
    Expired,
    /// Cancelled by the organiser
    Cancelled,
    /// A state this client does not know yet
    #[serde(other)]
    Unknown,
}

/// Progress of one group-buy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBuySnapshot {
    /// Members joined so far
    pub current_size: u32,
    /// Members needed
    pub target_size: u32,
    /// Lifecycle state
    pub status: GroupBuyState,
    /// Version of this row
    #[serde(with = "flexible_timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl GroupBuySnapshot {
    /// Progress towards the target, 0..=100.
    #[must_use]
    pub fn progress_percent(&self) -> u8 {
        if self.target_size == 0 {
            return 100;
        }
        let percent = (u64::from(self.current_size) * 100 / u64::from(self.target_size)).min(100);
        u8::try_from(percent).unwrap_or(100)
    }

    /// Members still missing.
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.target_size.saturating_sub(self.current_size)
    }
}

impl Versioned for GroupBuySnapshot {
    fn version(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[derive(Deserialize)]
struct GroupBuyRow {
    #[serde(default)]
    current_size: u32,
    target_size: u32,
    #[serde(default)]
    status: GroupBuyState,
    #[serde(default, deserialize_with = "optional_timestamp::deserialize")]
    updated_at: Option<DateTime<Utc>>,
}

impl GroupBuyRow {
    fn into_snapshot(self, fallback: DateTime<Utc>) -> GroupBuySnapshot {
        GroupBuySnapshot {
            current_size: self.current_size,
            target_size: self.target_size,
            status: self.status,
            updated_at: self.updated_at.unwrap_or(fallback),
        }
    }
}

impl Reconcile for GroupBuySnapshot {
    fn apply_change(
        current: &mut Option<Self>,
        change: &ChangeEnvelope,
        _limits: &ViewConfig,
    ) -> Result<MergeOutcome, ReconcileError> {
        if change.operation == ChangeOperation::Delete {
            return Ok(remove_if_newer(current, change.server_timestamp));
        }
        let row: GroupBuyRow = decode(&change.row)?;
        Ok(merge_latest(current, row.into_snapshot(change.server_timestamp)))
    }

    fn apply_snapshot(
        current: &mut Option<Self>,
        snapshot: &serde_json::Value,
        as_of: DateTime<Utc>,
        _limits: &ViewConfig,
    ) -> Result<MergeOutcome, ReconcileError> {
        let row: GroupBuyRow = decode(snapshot)?;
        Ok(merge_latest(current, row.into_snapshot(as_of)))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn progress_is_capped() {
        let mut snapshot = GroupBuySnapshot {
            current_size: 3,
            target_size: 4,
            status: GroupBuyState::Open,
            updated_at: DateTime::UNIX_EPOCH,
        };
        assert_eq!(snapshot.progress_percent(), 75);
        assert_eq!(snapshot.remaining(), 1);

        snapshot.current_size = 6;
        assert_eq!(snapshot.progress_percent(), 100);
    }

    #[test]
    fn unknown_status_does_not_break_decoding() {
        let limits = ViewConfig::default();
        let mut current = None;

        GroupBuySnapshot::apply_snapshot(
            &mut current,
            &json!({"current_size": 2, "target_size": 5, "status": "paused"}),
            DateTime::UNIX_EPOCH,
            &limits,
        )
        .unwrap();

        let snapshot = current.unwrap();
        assert_eq!(snapshot.status, GroupBuyState::Unknown);
        assert_eq!(snapshot.updated_at, DateTime::UNIX_EPOCH);
    }
}
