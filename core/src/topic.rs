//! Topic and identifier types.
//!
//! A subscription is identified by a [`SubscriptionKey`]: the logical [`Topic`]
//! plus the [`FilterKey`] narrowing it to one entity (an event id, a user id, a
//! group id). The gateway and the REST collaborators only ever see these as
//! strings; inside the crate they are strongly typed.
//!
//! # Examples
//!
//! ```
//! use tikit_realtime_core::topic::{FilterKey, SubscriptionKey, Topic};
//!
//! let key = SubscriptionKey::new(Topic::EventCapacity, FilterKey::new("evt-42"));
//! assert_eq!(key.to_string(), "event_capacity:evt-42");
//!
//! let parsed: Topic = "leaderboard".parse().unwrap();
//! assert_eq!(parsed, Topic::Leaderboard);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error returned when parsing identifiers from untrusted input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseIdError {
    /// The input was empty
    #[error("{0} cannot be empty")]
    Empty(&'static str),

    /// The topic name is not one of the known topics
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
}

/// Logical category of real-time data.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Tickets sold / remaining for one event
    EventCapacity,
    /// Progress of one group-buy
    GroupBuyStatus,
    /// Spray-money leaderboard for one event
    Leaderboard,
    /// Notification inbox of one user
    UserNotifications,
    /// Admin broadcast messages on one channel
    Broadcast,
}

impl Topic {
    /// All topics, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::EventCapacity,
        Self::GroupBuyStatus,
        Self::Leaderboard,
        Self::UserNotifications,
        Self::Broadcast,
    ];

    /// Wire name of the topic.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EventCapacity => "event_capacity",
            Self::GroupBuyStatus => "group_buy_status",
            Self::Leaderboard => "leaderboard",
            Self::UserNotifications => "user_notifications",
            Self::Broadcast => "broadcast",
        }
    }

    /// Whether the REST collaborator can serve an authoritative snapshot for this topic.
    ///
    /// Broadcast messages are fire-and-forget; there is nothing to fetch.
    #[must_use]
    pub const fn has_snapshot(self) -> bool {
        !matches!(self, Self::Broadcast)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| ParseIdError::UnknownTopic(s.to_string()))
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Create a new `", stringify!($name), "` from trusted input.")]
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[doc = concat!("Get the `", stringify!($name), "` as a string slice.")]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            #[doc = concat!("Convert the `", stringify!($name), "` into its inner `String`.")]
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.is_empty() {
                    return Err(ParseIdError::Empty($label));
                }
                Ok(Self(s.to_string()))
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// The entity instance a subscription narrows to (an event id, a user id, ...).
    FilterKey,
    "Filter key"
);

string_id!(
    /// Opaque connection identifier assigned by the gateway on a successful handshake.
    ConnectionId,
    "Connection ID"
);

string_id!(
    /// Caller-assigned key that lets the server deduplicate a replayed action.
    IdempotencyKey,
    "Idempotency key"
);

/// Opaque bearer token issued by the authentication collaborator.
///
/// Passed unmodified to the gateway handshake. `Debug` never prints the token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    /// Wrap a bearer token.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for the transport handshake only.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Locally generated identifier of a queued offline action.
///
/// Stable across retries of the same action.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(Uuid);

impl ActionId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One logical subscription: a topic narrowed by a filter key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    /// Logical topic
    pub topic: Topic,
    /// Entity the topic is narrowed to
    #[serde(rename = "filterKey")]
    pub filter_key: FilterKey,
}

impl SubscriptionKey {
    /// Create a subscription key.
    #[must_use]
    pub const fn new(topic: Topic, filter_key: FilterKey) -> Self {
        Self { topic, filter_key }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.filter_key)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn topic_round_trips_through_its_wire_name() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
            let json = serde_json::to_string(&topic).unwrap();
            assert_eq!(json, format!("\"{}\"", topic.as_str()));
        }
    }

    #[test]
    fn unknown_topic_is_rejected() {
        assert_eq!(
            "seat_map".parse::<Topic>(),
            Err(ParseIdError::UnknownTopic("seat_map".to_string()))
        );
    }

    #[test]
    fn empty_filter_key_is_rejected() {
        assert_eq!("".parse::<FilterKey>(), Err(ParseIdError::Empty("Filter key")));
        assert_eq!("evt-1".parse::<FilterKey>().unwrap().as_str(), "evt-1");
    }

    #[test]
    fn credential_debug_is_redacted() {
        let credential = Credential::bearer("secret-token");
        assert_eq!(format!("{credential:?}"), "Credential(<redacted>)");
        assert_eq!(credential.token(), "secret-token");
    }

    #[test]
    fn only_broadcast_lacks_a_snapshot() {
        let without: Vec<Topic> = Topic::ALL.into_iter().filter(|t| !t.has_snapshot()).collect();
        assert_eq!(without, vec![Topic::Broadcast]);
    }
}
