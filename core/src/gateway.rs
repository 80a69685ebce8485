//! Gateway channel abstraction.
//!
//! The real-time gateway is reached through exactly one long-lived, bidirectional
//! channel per session. This module defines the frames exchanged over it and the
//! [`Gateway`] trait a transport (WebSocket, managed pub/sub, in-memory test double)
//! implements.
//!
//! # Lifecycle
//!
//! ```text
//! open(credential) ──> Ok(connection_id)      inbound() ──> frames ... (end = channel lost)
//!        │                                      send(frame)
//!        └──> Err(ChannelError::Auth | Transport | Timeout)      close()
//! ```
//!
//! Only the connection manager calls these methods; every other component talks
//! to the channel through the manager.

use crate::change::ChangeEnvelope;
use crate::topic::{ConnectionId, Credential, FilterKey, SubscriptionKey, Topic};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by a gateway transport.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelError {
    /// Network or protocol failure (connect refused, socket reset, send failed)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The gateway rejected the credential
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// The handshake or a liveness probe did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The channel is not open
    #[error("Channel closed")]
    Closed,
}

impl ChannelError {
    /// Whether retrying with the same credential is pointless.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Frames sent by the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Liveness probe; the gateway answers with [`ServerFrame::Pong`]
    Ping {
        /// Correlates the pong with this probe
        #[serde(rename = "ref")]
        reference: u64,
    },

    /// Start receiving changes for a (topic, filter key)
    Subscribe {
        /// Topic to subscribe to
        topic: Topic,
        /// Entity to narrow the topic to
        #[serde(rename = "filterKey")]
        filter_key: FilterKey,
    },

    /// Stop receiving changes for a (topic, filter key)
    Unsubscribe {
        /// Topic to unsubscribe from
        topic: Topic,
        /// Entity the subscription was narrowed to
        #[serde(rename = "filterKey")]
        filter_key: FilterKey,
    },
}

impl ClientFrame {
    /// Subscribe frame for `key`.
    #[must_use]
    pub fn subscribe(key: &SubscriptionKey) -> Self {
        Self::Subscribe {
            topic: key.topic,
            filter_key: key.filter_key.clone(),
        }
    }

    /// Unsubscribe frame for `key`.
    #[must_use]
    pub fn unsubscribe(key: &SubscriptionKey) -> Self {
        Self::Unsubscribe {
            topic: key.topic,
            filter_key: key.filter_key.clone(),
        }
    }
}

/// Frames sent by the gateway.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Sent once after the channel is accepted
    ConnectionEstablished {
        /// Identifier assigned to this connection
        connection_id: ConnectionId,
    },

    /// Answer to [`ClientFrame::Ping`]
    Pong {
        /// Reference of the probe being answered
        #[serde(rename = "ref")]
        reference: u64,
    },

    /// Subscription acknowledged
    Subscribed {
        /// Topic subscribed to
        topic: Topic,
        /// Entity the topic is narrowed to
        #[serde(rename = "filterKey")]
        filter_key: FilterKey,
    },

    /// Unsubscription acknowledged
    Unsubscribed {
        /// Topic unsubscribed from
        topic: Topic,
        /// Entity the topic was narrowed to
        #[serde(rename = "filterKey")]
        filter_key: FilterKey,
    },

    /// A row change for a subscribed (topic, filter key)
    Change(ChangeEnvelope),

    /// Gateway-side error report (unknown frame, rejected subscription, ...)
    Error {
        /// Human readable diagnostic
        message: String,
    },
}

/// Inbound frames of the currently open channel.
///
/// The stream ends when the channel is lost; an `Err` item reports why.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<ServerFrame, ChannelError>> + Send>>;

/// Boxed future returned by collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A bidirectional channel to the real-time gateway.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the gateway can live behind `Arc<dyn Gateway>`
/// and be captured by effects.
pub trait Gateway: Send + Sync {
    /// Open the channel and perform the authentication handshake.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Auth`] if the credential is rejected
    /// - [`ChannelError::Transport`] / [`ChannelError::Timeout`] for network failures
    fn open(&self, credential: &Credential) -> BoxFuture<'_, Result<ConnectionId, ChannelError>>;

    /// Inbound frames of the channel opened by the most recent successful [`open`](Self::open).
    fn inbound(&self) -> FrameStream;

    /// Send one frame over the open channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] when no channel is open, or
    /// [`ChannelError::Transport`] if the write fails.
    fn send(&self, frame: ClientFrame) -> BoxFuture<'_, Result<(), ChannelError>>;

    /// Tear down the open channel, if any. Idempotent.
    fn close(&self) -> BoxFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_auth_errors_are_terminal() {
        assert!(ChannelError::Auth("expired".into()).is_auth());
        assert!(!ChannelError::Transport("reset".into()).is_auth());
        assert!(!ChannelError::Timeout("handshake".into()).is_auth());
        assert!(!ChannelError::Closed.is_auth());
    }

    #[test]
    fn subscribe_frame_carries_the_key() {
        let key = SubscriptionKey::new(Topic::Leaderboard, FilterKey::new("evt-1"));
        assert_eq!(
            ClientFrame::subscribe(&key),
            ClientFrame::Subscribe {
                topic: Topic::Leaderboard,
                filter_key: FilterKey::new("evt-1"),
            }
        );
    }
}
