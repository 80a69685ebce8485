//! Spray-money leaderboard.
//!
//! Rows are keyed by participant. An incoming row replaces the held one only if
//! it is newer, then the board is re-sorted by amount (descending) with ties
//! going to the earliest `updated_at`, and truncated to the configured rank
//! count. The sort is stable, so equal amounts and timestamps keep insertion
//! order.
//!
//! Amounts arrive as JSON numbers and may be fractional; they are rounded to
//! the nearest whole unit.

use super::{MergeOutcome, Reconcile, ReconcileError, decode, optional_timestamp};
use crate::config::ViewConfig;
use chrono::{DateTime, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use tikit_realtime_core::change::{ChangeEnvelope, ChangeOperation, flexible_timestamp};

/// One ranked participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// Participant (sprayer) id
    pub participant_id: String,
    /// Name shown on the board
    pub display_name: String,
    /// Total sprayed, rounded to whole currency units
    pub amount: u64,
    /// Version of this row
    #[serde(with = "flexible_timestamp")]
    pub updated_at: DateTime<Utc>,
}

/// Ranked entries, highest amount first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardSnapshot {
    entries: Vec<LeaderboardEntry>,
}

impl LeaderboardSnapshot {
    /// Entries in rank order.
    #[must_use]
    pub fn ranks(&self) -> &[LeaderboardEntry] {
        &self.entries
    }

    /// 1-based rank of a participant.
    #[must_use]
    pub fn rank_of(&self, participant_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.participant_id == participant_id)
            .map(|index| index + 1)
    }

    /// Sum of the displayed amounts.
    #[must_use]
    pub fn total_amount(&self) -> u64 {
        self.entries.iter().map(|entry| entry.amount).sum()
    }

    /// Number of displayed ranks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the board is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace `entry`, then re-rank.
    pub fn upsert(&mut self, entry: LeaderboardEntry, max_ranks: usize) -> MergeOutcome {
        let before = self.entries.clone();

        match self
            .entries
            .iter_mut()
            .find(|held| held.participant_id == entry.participant_id)
        {
            Some(held) if entry.updated_at <= held.updated_at => return MergeOutcome::Discarded,
            Some(held) => *held = entry,
            None => self.entries.push(entry),
        }

        self.entries.sort_by(|a, b| {
            b.amount
                .cmp(&a.amount)
                .then_with(|| a.updated_at.cmp(&b.updated_at))
        });
        self.entries.truncate(max_ranks);

        if self.entries == before {
            MergeOutcome::Discarded
        } else {
            MergeOutcome::Applied
        }
    }

    /// Remove a participant. Removing an absent participant is a no-op.
    pub fn remove(&mut self, participant_id: &str) -> MergeOutcome {
        let before = self.entries.len();
        self.entries
            .retain(|entry| entry.participant_id != participant_id);
        if self.entries.len() == before {
            MergeOutcome::Discarded
        } else {
            MergeOutcome::Applied
        }
    }
}

#[derive(Deserialize)]
struct LeaderboardRow {
    #[serde(alias = "sprayer_id")]
    participant_id: String,
    #[serde(default, alias = "sprayer_name")]
    display_name: String,
    #[serde(deserialize_with = "flexible_amount")]
    amount: u64,
    #[serde(default, deserialize_with = "optional_timestamp::deserialize")]
    updated_at: Option<DateTime<Utc>>,
}

impl LeaderboardRow {
    fn into_entry(self, fallback: DateTime<Utc>) -> LeaderboardEntry {
        LeaderboardEntry {
            participant_id: self.participant_id,
            display_name: self.display_name,
            amount: self.amount,
            updated_at: self.updated_at.unwrap_or(fallback),
        }
    }
}

/// Whole or fractional non-negative amount, rounded to the nearest unit.
fn flexible_amount<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct AmountVisitor;

    impl Visitor<'_> for AmountVisitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a non-negative amount")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<u64, E> {
            Ok(value)
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<u64, E> {
            u64::try_from(value).map_err(|_| E::custom(format!("negative amount {value}")))
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        fn visit_f64<E: de::Error>(self, value: f64) -> Result<u64, E> {
            let rounded = value.round();
            if rounded.is_finite() && rounded >= 0.0 && rounded < u64::MAX as f64 {
                Ok(rounded as u64)
            } else {
                Err(E::custom(format!("amount out of range: {value}")))
            }
        }
    }

    deserializer.deserialize_any(AmountVisitor)
}

#[derive(Deserialize)]
struct ParticipantRef {
    #[serde(alias = "sprayer_id")]
    participant_id: String,
}

/// A fetched board is either a bare row array or wrapped in an object.
#[derive(Deserialize)]
#[serde(untagged)]
enum LeaderboardPayload {
    Rows(Vec<LeaderboardRow>),
    Wrapped {
        #[serde(alias = "top_sprayers")]
        entries: Vec<LeaderboardRow>,
    },
}

impl Reconcile for LeaderboardSnapshot {
    fn apply_change(
        current: &mut Option<Self>,
        change: &ChangeEnvelope,
        limits: &ViewConfig,
    ) -> Result<MergeOutcome, ReconcileError> {
        if change.operation == ChangeOperation::Delete {
            let target: ParticipantRef = decode(&change.row)?;
            return Ok(current
                .as_mut()
                .map_or(MergeOutcome::Discarded, |board| {
                    board.remove(&target.participant_id)
                }));
        }

        let row: LeaderboardRow = decode(&change.row)?;
        let board = current.get_or_insert_with(Self::default);
        Ok(board.upsert(
            row.into_entry(change.server_timestamp),
            limits.leaderboard_max_ranks,
        ))
    }

    fn apply_snapshot(
        current: &mut Option<Self>,
        snapshot: &serde_json::Value,
        as_of: DateTime<Utc>,
        limits: &ViewConfig,
    ) -> Result<MergeOutcome, ReconcileError> {
        let rows = match decode::<LeaderboardPayload>(snapshot)? {
            LeaderboardPayload::Rows(rows) | LeaderboardPayload::Wrapped { entries: rows } => rows,
        };

        let was_empty = current.is_none();
        let board = current.get_or_insert_with(Self::default);
        let mut outcome = if was_empty {
            MergeOutcome::Applied
        } else {
            MergeOutcome::Discarded
        };
        for row in rows {
            let merged = board.upsert(row.into_entry(as_of), limits.leaderboard_max_ranks);
            outcome = outcome.or(merged);
        }
        Ok(outcome)
    }
}
