//! Change notifications delivered over the gateway channel.
//!
//! Every row change committed by the backing store reaches the client as a
//! [`ChangeEnvelope`]. The envelope is deliberately loose: the row is kept as a
//! JSON object and only decoded into a typed record by the reconciler that owns
//! the topic.
//!
//! ```json
//! {
//!   "topic": "event_capacity",
//!   "filterKey": "evt-42",
//!   "operation": "update",
//!   "row": { "capacity": 500, "sold_tickets": 120, "updated_at": "2025-01-01T12:00:00Z" },
//!   "serverTimestamp": "2025-01-01T12:00:00.120Z"
//! }
//! ```

use crate::topic::{FilterKey, SubscriptionKey, Topic};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of change applied to a row.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    /// A new row matching the filter
    Insert,
    /// An existing row changed
    Update,
    /// A row was removed
    Delete,
}

/// One change notification for a (topic, filter key) subscription.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEnvelope {
    /// Topic the row belongs to
    pub topic: Topic,
    /// Entity the change is scoped to
    pub filter_key: FilterKey,
    /// What happened to the row
    pub operation: ChangeOperation,
    /// The row after the change (before the change for deletes)
    pub row: serde_json::Value,
    /// Commit time assigned by the server
    #[serde(with = "flexible_timestamp")]
    pub server_timestamp: DateTime<Utc>,
}

impl ChangeEnvelope {
    /// Subscription this envelope must be routed to.
    #[must_use]
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.topic, self.filter_key.clone())
    }
}

/// Parse a server timestamp.
///
/// Accepts RFC 3339 (`2025-01-01T12:00:00Z`) and offset-less ISO 8601
/// (`2025-01-01T12:00:00.123456`), which the API emits for UTC times.
///
/// # Errors
///
/// Returns [`chrono::ParseError`] if neither format matches.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(value) {
        Ok(parsed) => Ok(parsed.with_timezone(&Utc)),
        Err(rfc_error) => NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|_| rfc_error),
    }
}

/// Serde adapter for [`parse_timestamp`]; serializes as RFC 3339.
pub mod flexible_timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as RFC 3339 with millisecond precision.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    /// Deserialize RFC 3339 or offset-less ISO 8601.
    ///
    /// # Errors
    ///
    /// Fails when the string is not a recognised timestamp.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}
