//! Connection manager.
//!
//! Owns the lifecycle of the single gateway channel:
//!
//! ```text
//! Disconnected ──connect──> Connecting ──opened──> Connected
//!      ^                        │                      │ lost / heartbeat timeout
//!      │                        │ handshake failed     v
//!  disconnect                   └──────> Failed <── Reconnecting ──opened──> Connected
//!  (any state)                   (auth or budget spent)   │ ^
//!                                                         └─┘ retry after backoff
//! ```
//!
//! Every asynchronous result (handshake, inbound frame, timer) is tagged with
//! the generation it was issued under. The generation changes whenever the
//! channel it refers to becomes obsolete, so late results are recognised and
//! dropped instead of corrupting the current connection.

use crate::config::ConnectionConfig;
use crate::session::LiveAction;
use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tikit_realtime_core::effect::Effect;
use tikit_realtime_core::gateway::{ChannelError, ClientFrame, Gateway};
use tikit_realtime_core::topic::{ConnectionId, Credential};
use tikit_realtime_runtime::metrics::ConnectionMetrics;

/// Connection status.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No channel and no attempt in progress
    Disconnected,
    /// First handshake in progress
    Connecting,
    /// Channel open and authenticated
    Connected,
    /// Channel lost; retrying with backoff
    Reconnecting,
    /// Gave up; only an explicit `connect` leaves this state
    Failed,
}

impl ConnectionStatus {
    /// Lowercase name, used for logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable connection state.
///
/// `connection_id` is `Some` exactly when `status` is `Connected`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    /// Current status
    pub status: ConnectionStatus,
    /// Id assigned by the gateway for the open channel
    pub connection_id: Option<ConnectionId>,
    /// Reconnect attempts since the last successful connect
    pub reconnect_attempts: u32,
    /// Diagnostic of the last failure
    pub last_error: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            connection_id: None,
            reconnect_attempts: 0,
            last_error: None,
        }
    }
}

/// What to do after the channel was lost.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Recovery {
    /// Schedule attempt number `attempt` after `delay`
    Retry {
        /// 1-based attempt number
        attempt: u32,
        /// Backoff delay before the attempt
        delay: Duration,
        /// Generation the retry timer belongs to
        generation: u64,
    },
    /// The budget is spent; the connection is now `Failed`
    GiveUp {
        /// Attempts made
        attempts: u32,
    },
}

/// Liveness probe bookkeeping.
///
/// Only one tick chain is ever live: every chain link carries a sequence
/// number and only the current one may send a probe.
#[derive(Clone, Debug, Default)]
struct Heartbeat {
    tick_seq: u64,
    next_ref: u64,
    pending: Option<u64>,
}

impl Heartbeat {
    fn restart(&mut self) -> u64 {
        self.pending = None;
        self.tick_seq += 1;
        self.tick_seq
    }

    fn send_probe(&mut self) -> u64 {
        self.next_ref += 1;
        self.pending = Some(self.next_ref);
        self.next_ref
    }
}

/// The connection state machine.
#[derive(Clone, Debug)]
pub struct ConnectionManager {
    state: ConnectionState,
    generation: u64,
    credential: Option<Credential>,
    heartbeat: Heartbeat,
    config: ConnectionConfig,
}

impl ConnectionManager {
    /// Create a manager in `Disconnected`.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            state: ConnectionState::default(),
            generation: 0,
            credential: None,
            heartbeat: Heartbeat::default(),
            config,
        }
    }

    /// Observable state.
    #[must_use]
    pub const fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> ConnectionStatus {
        self.state.status
    }

    /// Whether the channel is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.status == ConnectionStatus::Connected
    }

    /// Current generation.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a result tagged with `generation` still applies.
    #[must_use]
    pub const fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Credential of the current session.
    #[must_use]
    pub const fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Connection settings.
    #[must_use]
    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Start a handshake. Only valid from `Disconnected` or `Failed`.
    ///
    /// Returns the generation of the handshake, or `None` if the current
    /// status does not allow connecting.
    pub fn begin_connect(&mut self, credential: Credential) -> Option<u64> {
        if !matches!(
            self.state.status,
            ConnectionStatus::Disconnected | ConnectionStatus::Failed
        ) {
            return None;
        }
        self.credential = Some(credential);
        self.state.last_error = None;
        self.advance();
        self.transition(ConnectionStatus::Connecting);
        Some(self.generation)
    }

    /// Handshake succeeded. Returns the sequence number of the first heartbeat tick.
    pub fn mark_connected(&mut self, connection_id: ConnectionId) -> u64 {
        self.state.connection_id = Some(connection_id);
        self.state.reconnect_attempts = 0;
        self.state.last_error = None;
        self.transition(ConnectionStatus::Connected);
        self.heartbeat.restart()
    }

    /// The channel was lost (or a reconnect handshake failed): schedule the
    /// next attempt or give up.
    pub fn on_channel_lost(&mut self, reason: impl Into<String>) -> Recovery {
        self.state.last_error = Some(reason.into());
        self.advance();

        let attempts = self.state.reconnect_attempts;
        if attempts >= self.config.reconnect.max_attempts() {
            self.transition(ConnectionStatus::Failed);
            return Recovery::GiveUp { attempts };
        }

        let attempt = attempts + 1;
        self.state.reconnect_attempts = attempt;
        self.transition(ConnectionStatus::Reconnecting);
        ConnectionMetrics::record_reconnect_attempt();
        Recovery::Retry {
            attempt,
            delay: self.config.reconnect.delay_for_attempt(attempt - 1),
            generation: self.generation,
        }
    }

    /// Terminal failure (rejected credential, failed first handshake).
    pub fn fail(&mut self, error: impl Into<String>) {
        self.state.last_error = Some(error.into());
        self.advance();
        self.transition(ConnectionStatus::Failed);
    }

    /// Close the session on request. Returns false if already `Disconnected`.
    pub fn disconnect(&mut self) -> bool {
        if self.state.status == ConnectionStatus::Disconnected {
            return false;
        }
        self.credential = None;
        self.advance();
        self.transition(ConnectionStatus::Disconnected);
        true
    }

    /// A heartbeat tick fired. Returns the probe reference to send, if this
    /// tick belongs to the live chain and no probe is outstanding.
    pub fn heartbeat_tick(&mut self, seq: u64) -> Option<u64> {
        if seq != self.heartbeat.tick_seq || self.heartbeat.pending.is_some() {
            return None;
        }
        Some(self.heartbeat.send_probe())
    }

    /// Send an out-of-band probe unless one is already outstanding.
    pub fn probe(&mut self) -> Option<u64> {
        if !self.is_connected() || self.heartbeat.pending.is_some() {
            return None;
        }
        Some(self.heartbeat.send_probe())
    }

    /// A pong arrived. Returns the sequence number of the next tick if it
    /// answers the outstanding probe.
    pub fn pong(&mut self, reference: u64) -> Option<u64> {
        if self.heartbeat.pending != Some(reference) {
            return None;
        }
        Some(self.heartbeat.restart())
    }

    /// Whether the probe `reference` is still unanswered.
    #[must_use]
    pub fn probe_outstanding(&self, reference: u64) -> bool {
        self.heartbeat.pending == Some(reference)
    }

    fn advance(&mut self) {
        self.generation += 1;
        self.state.connection_id = None;
        self.heartbeat.pending = None;
    }

    fn transition(&mut self, to: ConnectionStatus) {
        let from = self.state.status;
        self.state.status = to;
        if to != ConnectionStatus::Connected {
            self.state.connection_id = None;
        }
        ConnectionMetrics::record_transition(to.as_str());
        tracing::debug!(from = %from, to = %to, generation = self.generation, "Connection transition");
    }
}

/// Open the channel, bounded by the handshake timeout.
pub fn open_channel(
    gateway: Arc<dyn Gateway>,
    credential: Credential,
    generation: u64,
    timeout: Duration,
) -> Effect<LiveAction> {
    Effect::future(async move {
        let action = match tokio::time::timeout(timeout, gateway.open(&credential)).await {
            Ok(Ok(connection_id)) => LiveAction::Opened {
                generation,
                connection_id,
            },
            Ok(Err(error)) => LiveAction::HandshakeFailed { generation, error },
            Err(_) => LiveAction::HandshakeFailed {
                generation,
                error: ChannelError::Timeout(format!("handshake exceeded {timeout:?}")),
            },
        };
        Some(action)
    })
}

/// Feed the inbound frames of the channel just opened back into the session.
///
/// The stream always finishes with a `ChannelLost`; if the channel reported an
/// error first, the trailing one is dropped as stale.
pub fn inbound_frames(gateway: &dyn Gateway, generation: u64) -> Effect<LiveAction> {
    let frames = gateway
        .inbound()
        .map(move |item| match item {
            Ok(frame) => LiveAction::FrameReceived { generation, frame },
            Err(error) => LiveAction::ChannelLost {
                generation,
                reason: error.to_string(),
            },
        })
        .chain(stream::once(async move {
            LiveAction::ChannelLost {
                generation,
                reason: "channel closed".to_string(),
            }
        }));
    Effect::Stream(Box::pin(frames))
}

/// Send one frame; a failed write means the channel is gone.
pub fn send_frame(
    gateway: Arc<dyn Gateway>,
    generation: u64,
    frame: ClientFrame,
) -> Effect<LiveAction> {
    Effect::future(async move {
        match gateway.send(frame).await {
            Ok(()) => None,
            Err(error) => Some(LiveAction::ChannelLost {
                generation,
                reason: error.to_string(),
            }),
        }
    })
}

/// Tear the channel down.
pub fn close_channel(gateway: Arc<dyn Gateway>) -> Effect<LiveAction> {
    Effect::future(async move {
        gateway.close().await;
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tikit_realtime_runtime::BackoffPolicy;

    fn manager(max_attempts: u32) -> ConnectionManager {
        ConnectionManager::new(ConnectionConfig {
            reconnect: BackoffPolicy::builder()
                .max_attempts(max_attempts)
                .initial_delay(Duration::from_secs(1))
                .max_delay(Duration::from_secs(4))
                .build(),
            ..ConnectionConfig::default()
        })
    }

    fn connected(max_attempts: u32) -> ConnectionManager {
        let mut manager = manager(max_attempts);
        manager.begin_connect(Credential::bearer("t"));
        manager.mark_connected(ConnectionId::new("c-1"));
        manager
    }

    #[test]
    fn connect_only_from_disconnected_or_failed() {
        let mut manager = manager(3);
        let first = manager.begin_connect(Credential::bearer("t"));
        assert_eq!(first, Some(1));
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
        assert_eq!(manager.begin_connect(Credential::bearer("t")), None);

        manager.fail("rejected");
        assert_eq!(manager.status(), ConnectionStatus::Failed);
        assert!(manager.begin_connect(Credential::bearer("t")).is_some());
    }

    #[test]
    fn connection_id_only_while_connected() {
        let mut manager = connected(3);
        assert_eq!(
            manager.state().connection_id,
            Some(ConnectionId::new("c-1"))
        );

        manager.on_channel_lost("reset");
        assert_eq!(manager.state().connection_id, None);
        assert_eq!(manager.status(), ConnectionStatus::Reconnecting);
    }

    #[test]
    fn loss_backs_off_until_budget_is_spent() {
        let mut manager = connected(3);
        let mut delays = Vec::new();

        for expected in 1..=3 {
            match manager.on_channel_lost("reset") {
                Recovery::Retry { attempt, delay, .. } => {
                    assert_eq!(attempt, expected);
                    delays.push(delay);
                },
                Recovery::GiveUp { .. } => unreachable!("budget not spent yet"),
            }
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );

        assert_eq!(
            manager.on_channel_lost("reset"),
            Recovery::GiveUp { attempts: 3 }
        );
        assert_eq!(manager.status(), ConnectionStatus::Failed);
        assert_eq!(manager.state().reconnect_attempts, 3);
    }

    #[test]
    fn successful_connect_resets_attempts() {
        let mut manager = connected(3);
        manager.on_channel_lost("reset");
        manager.on_channel_lost("refused");
        assert_eq!(manager.state().reconnect_attempts, 2);

        manager.mark_connected(ConnectionId::new("c-2"));
        assert_eq!(manager.state().reconnect_attempts, 0);
        assert_eq!(manager.state().last_error, None);
    }

    #[test]
    fn every_transition_advances_generation() {
        let mut manager = manager(3);
        manager.begin_connect(Credential::bearer("t"));
        let connecting = manager.generation();
        manager.mark_connected(ConnectionId::new("c-1"));
        assert!(manager.is_current(connecting));

        manager.on_channel_lost("reset");
        assert!(!manager.is_current(connecting));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut manager = connected(3);
        assert!(manager.disconnect());
        assert!(!manager.disconnect());
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(manager.credential().is_none());
    }

    #[test]
    fn only_the_live_tick_chain_probes() {
        let mut manager = manager(3);
        manager.begin_connect(Credential::bearer("t"));
        let seq = manager.mark_connected(ConnectionId::new("c-1"));

        let reference = manager.heartbeat_tick(seq).unwrap_or_default();
        assert!(manager.probe_outstanding(reference));
        assert_eq!(manager.heartbeat_tick(seq), None);
        assert_eq!(manager.probe(), None);

        let next = manager.pong(reference);
        assert_eq!(next, Some(seq + 1));
        assert!(!manager.probe_outstanding(reference));
        assert_eq!(manager.heartbeat_tick(seq), None);
        assert!(manager.heartbeat_tick(seq + 1).is_some());
    }

    #[test]
    fn unknown_pong_is_ignored() {
        let mut manager = connected(3);
        assert_eq!(manager.pong(99), None);
    }
}
