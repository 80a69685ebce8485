//! Ticket capacity counters.
//!
//! Last write wins on the row's own `updated_at`. A row without one is
//! versioned by the envelope's server timestamp; a fetched snapshot without one
//! is versioned by the time its fetch was issued.

use super::{
    MergeOutcome, Reconcile, ReconcileError, Versioned, decode, merge_latest, optional_timestamp,
    remove_if_newer,
};
use crate::config::ViewConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tikit_realtime_core::change::{ChangeEnvelope, ChangeOperation, flexible_timestamp};

/// Fraction of sold tickets (in tenths) from which an event counts as almost full.
const ALMOST_FULL_TENTHS: u64 = 9;

/// Sales state derived from a capacity snapshot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityStatus {
    /// Tickets are on sale
    Available,
    /// At least 90 % of the capacity is sold
    AlmostFull,
    /// Nothing left to sell
    SoldOut,
}

/// Tickets sold and remaining for one event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    /// Total tickets
    pub capacity: u32,
    /// Tickets sold so far
    pub sold_tickets: u32,
    /// Version of this row
    #[serde(with = "flexible_timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl CapacitySnapshot {
    /// Tickets still available.
    #[must_use]
    pub const fn available_tickets(&self) -> u32 {
        self.capacity.saturating_sub(self.sold_tickets)
    }

    /// Sales state for display.
    #[must_use]
    pub fn status(&self) -> CapacityStatus {
        if self.available_tickets() == 0 {
            CapacityStatus::SoldOut
        } else if u64::from(self.sold_tickets) * 10 >= u64::from(self.capacity) * ALMOST_FULL_TENTHS {
            CapacityStatus::AlmostFull
        } else {
            CapacityStatus::Available
        }
    }
}

impl Versioned for CapacitySnapshot {
    fn version(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[derive(Deserialize)]
struct CapacityRow {
    capacity: u32,
    #[serde(default)]
    sold_tickets: u32,
    #[serde(default, deserialize_with = "optional_timestamp::deserialize")]
    updated_at: Option<DateTime<Utc>>,
}

impl CapacityRow {
    fn into_snapshot(self, fallback: DateTime<Utc>) -> CapacitySnapshot {
        CapacitySnapshot {
            capacity: self.capacity,
            sold_tickets: self.sold_tickets,
            updated_at: self.updated_at.unwrap_or(fallback),
        }
    }
}

impl Reconcile for CapacitySnapshot {
    fn apply_change(
        current: &mut Option<Self>,
        change: &ChangeEnvelope,
        _limits: &ViewConfig,
    ) -> Result<MergeOutcome, ReconcileError> {
        if change.operation == ChangeOperation::Delete {
            return Ok(remove_if_newer(current, change.server_timestamp));
        }
        let row: CapacityRow = decode(&change.row)?;
        Ok(merge_latest(current, row.into_snapshot(change.server_timestamp)))
    }

    fn apply_snapshot(
        current: &mut Option<Self>,
        snapshot: &serde_json::Value,
        as_of: DateTime<Utc>,
        _limits: &ViewConfig,
    ) -> Result<MergeOutcome, ReconcileError> {
        let row: CapacityRow = decode(snapshot)?;
        Ok(merge_latest(current, row.into_snapshot(as_of)))
    }
}
