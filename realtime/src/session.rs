//! The live session: state, actions, environment and reducer.
//!
//! All session state lives in one [`LiveState`]; the only code that mutates it
//! is [`LiveReducer`]. Commands from the facade and results of asynchronous
//! work (handshakes, inbound frames, timers, fetches, dispatches) are all
//! [`LiveAction`]s, so every change happens as one discrete, serialized step.

use crate::config::LiveConfig;
use crate::connection::{self, ConnectionManager, ConnectionState, ConnectionStatus, Recovery};
use crate::change_feed;
use crate::event::{EventSink, LiveEvent};
use crate::queue::{self, OfflineQueue, QueuedAction, Settlement};
use crate::reconciler::{MergeOutcome, Reconciler};
use crate::registry::{SubscribeOutcome, SubscriptionRegistry, UnsubscribeOutcome};
use std::sync::Arc;
use tikit_realtime_core::change::ChangeEnvelope;
use tikit_realtime_core::dispatch::{ActionDispatchError, ActionDispatcher, ActionReceipt};
use tikit_realtime_core::effect::Effect;
use tikit_realtime_core::environment::Clock;
use tikit_realtime_core::feed::{FetchError, SnapshotSource};
use tikit_realtime_core::gateway::{ChannelError, ClientFrame, Gateway, ServerFrame};
use tikit_realtime_core::reducer::Reducer;
use tikit_realtime_core::topic::{ActionId, ConnectionId, Credential, IdempotencyKey, SubscriptionKey};
use tikit_realtime_core::{SmallVec, smallvec};
use tikit_realtime_runtime::metrics::ReconcilerMetrics;

type Effects = SmallVec<[Effect<LiveAction>; 4]>;

/// Everything the session knows.
#[derive(Clone, Debug)]
pub struct LiveState {
    pub(crate) connection: ConnectionManager,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) reconciler: Reconciler,
    pub(crate) queue: OfflineQueue,
}

impl LiveState {
    /// Fresh, disconnected session.
    #[must_use]
    pub fn new(config: &LiveConfig) -> Self {
        Self {
            connection: ConnectionManager::new(config.connection.clone()),
            registry: SubscriptionRegistry::new(),
            reconciler: Reconciler::new(config.views.clone()),
            queue: OfflineQueue::new(config.queue.failed_history),
        }
    }

    /// Connection manager.
    #[must_use]
    pub const fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Observable connection state.
    #[must_use]
    pub const fn connection_state(&self) -> &ConnectionState {
        self.connection.state()
    }

    /// Subscription registry.
    #[must_use]
    pub const fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Views.
    #[must_use]
    pub const fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Offline queue.
    #[must_use]
    pub const fn queue(&self) -> &OfflineQueue {
        &self.queue
    }
}

/// Inputs of the session reducer.
#[derive(Clone, Debug)]
pub enum LiveAction {
    // Commands
    /// Open the channel with `credential`
    Connect {
        /// Bearer token for the handshake
        credential: Credential,
    },
    /// Close the channel
    Disconnect,
    /// Register interest in a subscription
    Subscribe {
        /// Subscription
        key: SubscriptionKey,
    },
    /// Release interest in a subscription
    Unsubscribe {
        /// Subscription
        key: SubscriptionKey,
    },
    /// Queue a user action
    Enqueue {
        /// Local id
        id: ActionId,
        /// Server-side deduplication key
        idempotency_key: IdempotencyKey,
        /// Action body
        payload: serde_json::Value,
    },

    // Connection feedback
    /// Handshake succeeded
    Opened {
        /// Generation of the handshake
        generation: u64,
        /// Id assigned by the gateway
        connection_id: ConnectionId,
    },
    /// Handshake failed or timed out
    HandshakeFailed {
        /// Generation of the handshake
        generation: u64,
        /// Why
        error: ChannelError,
    },
    /// Reconnect backoff elapsed
    RetryConnect {
        /// Generation the timer was scheduled under
        generation: u64,
    },
    /// Frame received on the channel
    FrameReceived {
        /// Generation of the channel
        generation: u64,
        /// The frame
        frame: ServerFrame,
    },
    /// The channel ended or a write failed
    ChannelLost {
        /// Generation of the channel
        generation: u64,
        /// Diagnostic
        reason: String,
    },
    /// Heartbeat interval elapsed
    HeartbeatTick {
        /// Generation of the channel
        generation: u64,
        /// Tick chain sequence number
        seq: u64,
    },
    /// A probe went unanswered for the heartbeat timeout
    HeartbeatTimedOut {
        /// Generation of the channel
        generation: u64,
        /// Probe reference
        reference: u64,
    },

    // Feed feedback
    /// Snapshot fetch finished
    SnapshotFetched {
        /// Subscription
        key: SubscriptionKey,
        /// Fetch sequence number
        seq: u64,
        /// Snapshot or error
        result: Result<serde_json::Value, FetchError>,
    },
    /// Fetch backoff elapsed
    RetryFetch {
        /// Subscription
        key: SubscriptionKey,
        /// Sequence number of the failed fetch
        seq: u64,
    },

    // Queue feedback
    /// Dispatch attempt finished
    DispatchCompleted {
        /// Local action id
        id: ActionId,
        /// Receipt or error
        result: Result<ActionReceipt, ActionDispatchError>,
    },
    /// Action retry backoff elapsed
    RetryAction {
        /// Local action id
        id: ActionId,
    },
}

/// Injected collaborators.
#[derive(Clone)]
pub struct LiveEnvironment {
    /// Time source for enqueue timestamps
    pub clock: Arc<dyn Clock>,
    /// Gateway channel
    pub gateway: Arc<dyn Gateway>,
    /// Snapshot fetches
    pub snapshots: Arc<dyn SnapshotSource>,
    /// Action dispatch
    pub dispatcher: Arc<dyn ActionDispatcher>,
    /// Outbound events
    pub events: EventSink,
}

impl std::fmt::Debug for LiveEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveEnvironment")
            .field("subscribers", &self.events.receiver_count())
            .finish_non_exhaustive()
    }
}

/// Session reducer.
#[derive(Clone, Debug)]
pub struct LiveReducer {
    config: Arc<LiveConfig>,
}

impl LiveReducer {
    /// Create a reducer with `config`.
    #[must_use]
    pub fn new(config: LiveConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &LiveConfig {
        &self.config
    }
}

impl Reducer for LiveReducer {
    type State = LiveState;
    type Action = LiveAction;
    type Environment = LiveEnvironment;

    fn reduce(&self, state: &mut LiveState, action: LiveAction, env: &LiveEnvironment) -> Effects {
        match action {
            LiveAction::Connect { credential } => self.connect(state, env, credential),
            LiveAction::Disconnect => Self::disconnect(state, env),
            LiveAction::Subscribe { key } => Self::subscribe(state, env, key),
            LiveAction::Unsubscribe { key } => Self::unsubscribe(state, env, &key),
            LiveAction::Enqueue {
                id,
                idempotency_key,
                payload,
            } => {
                state.queue.push(QueuedAction::new(
                    id,
                    idempotency_key,
                    payload,
                    env.clock.now(),
                ));
                tracing::debug!(action_id = %id, "Action queued");
                env.events.publish(LiveEvent::ActionQueued { id });
                self.drain_queue(state, env).into_iter().collect()
            },

            LiveAction::Opened {
                generation,
                connection_id,
            } => self.opened(state, env, generation, connection_id),
            LiveAction::HandshakeFailed { generation, error } => {
                Self::handshake_failed(state, env, generation, &error)
            },
            LiveAction::RetryConnect { generation } => {
                if !state.connection.is_current(generation)
                    || state.connection.status() != ConnectionStatus::Reconnecting
                {
                    return SmallVec::new();
                }
                let Some(credential) = state.connection.credential().cloned() else {
                    return SmallVec::new();
                };
                tracing::info!(
                    attempt = state.connection.state().reconnect_attempts,
                    "Reconnecting"
                );
                smallvec![connection::open_channel(
                    env.gateway.clone(),
                    credential,
                    generation,
                    self.config.connection.handshake_timeout,
                )]
            },
            LiveAction::FrameReceived { generation, frame } => {
                if !Self::is_live(state, generation) {
                    return SmallVec::new();
                }
                self.frame_received(state, env, generation, frame)
            },
            LiveAction::ChannelLost { generation, reason } => {
                if !Self::is_live(state, generation) {
                    return SmallVec::new();
                }
                Self::channel_lost(state, env, &reason)
            },
            LiveAction::HeartbeatTick { generation, seq } => {
                if !Self::is_live(state, generation) {
                    return SmallVec::new();
                }
                match state.connection.heartbeat_tick(seq) {
                    Some(reference) => self.probe_effects(env, generation, reference),
                    None => SmallVec::new(),
                }
            },
            LiveAction::HeartbeatTimedOut {
                generation,
                reference,
            } => {
                if !Self::is_live(state, generation)
                    || !state.connection.probe_outstanding(reference)
                {
                    return SmallVec::new();
                }
                tracing::warn!(reference, "Heartbeat unanswered");
                Self::channel_lost(state, env, "heartbeat timeout")
            },

            LiveAction::SnapshotFetched { key, seq, result } => {
                self.snapshot_fetched(state, env, key, seq, result)
            },
            LiveAction::RetryFetch { key, seq } => {
                if !state.connection.is_connected() {
                    return SmallVec::new();
                }
                let Some(feed) = state.registry.feed_mut(&key) else {
                    return SmallVec::new();
                };
                if !feed.accepts(seq) || !feed.is_active() {
                    return SmallVec::new();
                }
                let seq = feed.retry_fetch(env.clock.now());
                tracing::debug!(key = %key, attempt = feed.fetch_attempts(), "Retrying snapshot fetch");
                smallvec![change_feed::fetch_current(env.snapshots.clone(), key, seq)]
            },

            LiveAction::DispatchCompleted { id, result } => {
                self.dispatch_completed(state, env, id, result)
            },
            LiveAction::RetryAction { id } => {
                if !state.queue.retry_due(id) {
                    return SmallVec::new();
                }
                self.drain_queue(state, env).into_iter().collect()
            },
        }
    }
}

impl LiveReducer {
    /// Whether a channel-bound result still refers to the open channel.
    fn is_live(state: &LiveState, generation: u64) -> bool {
        state.connection.is_current(generation) && state.connection.is_connected()
    }

    fn connect(&self, state: &mut LiveState, env: &LiveEnvironment, credential: Credential) -> Effects {
        let Some(generation) = state.connection.begin_connect(credential.clone()) else {
            tracing::debug!(
                status = %state.connection.status(),
                "Connect ignored: session is not disconnected"
            );
            return SmallVec::new();
        };

        tracing::info!(generation, "Connecting");
        env.events.publish(LiveEvent::Connecting);
        smallvec![connection::open_channel(
            env.gateway.clone(),
            credential,
            generation,
            self.config.connection.handshake_timeout,
        )]
    }

    fn disconnect(state: &mut LiveState, env: &LiveEnvironment) -> Effects {
        if !state.connection.disconnect() {
            return SmallVec::new();
        }
        state.registry.deactivate_all();
        tracing::info!("Disconnected");
        env.events.publish(LiveEvent::Disconnected);
        smallvec![connection::close_channel(env.gateway.clone())]
    }

    fn opened(
        &self,
        state: &mut LiveState,
        env: &LiveEnvironment,
        generation: u64,
        connection_id: ConnectionId,
    ) -> Effects {
        let handshaking = matches!(
            state.connection.status(),
            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting
        );
        if !state.connection.is_current(generation) || !handshaking {
            tracing::debug!(generation, "Discarding stale handshake");
            if state.connection.status() == ConnectionStatus::Disconnected {
                return smallvec![connection::close_channel(env.gateway.clone())];
            }
            return SmallVec::new();
        }

        let seq = state.connection.mark_connected(connection_id.clone());
        tracing::info!(connection_id = %connection_id, generation, "Connected");
        env.events.publish(LiveEvent::Connected { connection_id });

        let mut effects: Effects = smallvec![
            connection::inbound_frames(env.gateway.as_ref(), generation),
            Effect::delay(
                self.config.connection.heartbeat_interval,
                LiveAction::HeartbeatTick { generation, seq },
            ),
        ];
        for key in state.registry.keys() {
            effects.push(Self::activate(state, env, key));
        }
        effects.extend(self.drain_queue(state, env));
        effects
    }

    fn handshake_failed(
        state: &mut LiveState,
        env: &LiveEnvironment,
        generation: u64,
        error: &ChannelError,
    ) -> Effects {
        let status = state.connection.status();
        let handshaking = matches!(
            status,
            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting
        );
        if !state.connection.is_current(generation) || !handshaking {
            return SmallVec::new();
        }

        let mut effects = Effects::new();
        if matches!(error, ChannelError::Timeout(_)) {
            effects.push(connection::close_channel(env.gateway.clone()));
        }

        if status == ConnectionStatus::Connecting || error.is_auth() {
            tracing::warn!(error = %error, "Connection failed");
            state.connection.fail(error.to_string());
            env.events.publish(LiveEvent::Error {
                message: error.to_string(),
            });
            return effects;
        }

        tracing::warn!(error = %error, "Reconnect attempt failed");
        effects.extend(Self::schedule_recovery(state, env, error.to_string()));
        effects
    }

    fn channel_lost(state: &mut LiveState, env: &LiveEnvironment, reason: &str) -> Effects {
        tracing::warn!(reason, "Channel lost");
        state.registry.deactivate_all();

        let mut effects: Effects = smallvec![connection::close_channel(env.gateway.clone())];
        effects.extend(Self::schedule_recovery(state, env, reason.to_string()));
        effects
    }

    fn schedule_recovery(
        state: &mut LiveState,
        env: &LiveEnvironment,
        reason: String,
    ) -> Option<Effect<LiveAction>> {
        match state.connection.on_channel_lost(reason) {
            Recovery::Retry {
                attempt,
                delay,
                generation,
            } => {
                tracing::warn!(attempt, delay_ms = delay.as_millis(), "Scheduling reconnect");
                env.events
                    .publish(LiveEvent::Reconnecting { attempt, delay });
                Some(Effect::delay(delay, LiveAction::RetryConnect { generation }))
            },
            Recovery::GiveUp { attempts } => {
                tracing::warn!(attempts, "Reconnect budget spent; giving up");
                env.events
                    .publish(LiveEvent::MaxReconnectAttempts { attempts });
                None
            },
        }
    }

    fn frame_received(
        &self,
        state: &mut LiveState,
        env: &LiveEnvironment,
        generation: u64,
        frame: ServerFrame,
    ) -> Effects {
        match frame {
            ServerFrame::ConnectionEstablished { connection_id } => {
                tracing::debug!(connection_id = %connection_id, "Gateway greeting");
                SmallVec::new()
            },
            ServerFrame::Pong { reference } => match state.connection.pong(reference) {
                Some(seq) => smallvec![Effect::delay(
                    self.config.connection.heartbeat_interval,
                    LiveAction::HeartbeatTick { generation, seq },
                )],
                None => SmallVec::new(),
            },
            ServerFrame::Subscribed { topic, filter_key } => {
                tracing::debug!(%topic, %filter_key, "Subscription acknowledged");
                SmallVec::new()
            },
            ServerFrame::Unsubscribed { topic, filter_key } => {
                tracing::debug!(%topic, %filter_key, "Unsubscription acknowledged");
                SmallVec::new()
            },
            ServerFrame::Error { message } => {
                tracing::warn!(error = %message, "Gateway reported an error");
                SmallVec::new()
            },
            ServerFrame::Change(envelope) => {
                Self::apply_change(state, env, &envelope);
                SmallVec::new()
            },
        }
    }

    fn apply_change(state: &mut LiveState, env: &LiveEnvironment, envelope: &ChangeEnvelope) {
        let key = envelope.key();
        let Some(feed) = state.registry.route(&key) else {
            tracing::debug!(key = %key, "Dropping change for inactive subscription");
            ReconcilerMetrics::record_discarded(key.topic.as_str());
            return;
        };

        match state.reconciler.apply_change(envelope) {
            Ok(MergeOutcome::Applied) => {
                feed.observe(envelope.server_timestamp);
                if let Some(view) = state.reconciler.view(&key) {
                    env.events.publish(LiveEvent::Updated {
                        key,
                        view: view.clone(),
                    });
                }
            },
            Ok(MergeOutcome::Discarded) => {
                tracing::trace!(key = %key, "Stale change discarded");
            },
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "Change could not be merged");
            },
        }
    }

    fn subscribe(state: &mut LiveState, env: &LiveEnvironment, key: SubscriptionKey) -> Effects {
        match state.registry.subscribe(key.clone()) {
            SubscribeOutcome::Shared { ref_count } => {
                tracing::debug!(key = %key, ref_count, "Subscription shared");
                SmallVec::new()
            },
            SubscribeOutcome::Created => {
                state.reconciler.ensure_view(&key);
                tracing::debug!(key = %key, "Subscription created");
                if !state.connection.is_connected() {
                    return SmallVec::new();
                }
                smallvec![Self::activate(state, env, key)]
            },
        }
    }

    fn unsubscribe(state: &mut LiveState, env: &LiveEnvironment, key: &SubscriptionKey) -> Effects {
        match state.registry.unsubscribe(key) {
            UnsubscribeOutcome::Released { remaining } => {
                tracing::debug!(key = %key, remaining, "Subscription released");
                SmallVec::new()
            },
            UnsubscribeOutcome::Removed { was_active } => {
                state.reconciler.remove_view(key);
                tracing::debug!(key = %key, "Subscription removed");
                if was_active && state.connection.is_connected() {
                    smallvec![connection::send_frame(
                        env.gateway.clone(),
                        state.connection.generation(),
                        ClientFrame::unsubscribe(key),
                    )]
                } else {
                    SmallVec::new()
                }
            },
            UnsubscribeOutcome::Unknown => {
                tracing::debug!(key = %key, "Unsubscribe for unknown subscription");
                SmallVec::new()
            },
        }
    }

    /// Subscribe `key` on the open channel and reconcile its view.
    fn activate(state: &mut LiveState, env: &LiveEnvironment, key: SubscriptionKey) -> Effect<LiveAction> {
        let generation = state.connection.generation();
        state.reconciler.ensure_view(&key);
        let Some(feed) = state.registry.activate(&key) else {
            return Effect::None;
        };
        let subscribe = connection::send_frame(env.gateway.clone(), generation, feed.subscribe_frame());

        if !key.topic.has_snapshot() {
            state.reconciler.go_live(&key);
            if let Some(view) = state.reconciler.view(&key) {
                env.events.publish(LiveEvent::Updated {
                    key,
                    view: view.clone(),
                });
            }
            return subscribe;
        }

        let seq = feed.begin_fetch(env.clock.now());
        Effect::Sequential(vec![
            subscribe,
            change_feed::fetch_current(env.snapshots.clone(), key, seq),
        ])
    }

    fn snapshot_fetched(
        &self,
        state: &mut LiveState,
        env: &LiveEnvironment,
        key: SubscriptionKey,
        seq: u64,
        result: Result<serde_json::Value, FetchError>,
    ) -> Effects {
        let Some(feed) = state.registry.feed_mut(&key) else {
            tracing::debug!(key = %key, "Discarding fetch for released subscription");
            return SmallVec::new();
        };
        if !feed.accepts(seq) {
            tracing::debug!(key = %key, seq, "Discarding superseded fetch");
            return SmallVec::new();
        }

        let error = match result {
            Ok(snapshot) => {
                feed.finish_fetch();
                let as_of = feed.fetch_requested_at();
                match state.reconciler.apply_snapshot(&key, &snapshot, as_of) {
                    Ok(_) => {
                        if let Some(view) = state.reconciler.view(&key) {
                            env.events.publish(LiveEvent::Updated {
                                key,
                                view: view.clone(),
                            });
                        }
                        return SmallVec::new();
                    },
                    Err(error) => FetchError::Decode(error.to_string()),
                }
            },
            Err(error) => error,
        };

        let mut effects = Effects::new();
        if error.is_transport() {
            effects.extend(self.transport_probe(state, env));

            let Some(feed) = state.registry.feed_mut(&key) else {
                return effects;
            };
            let attempts = feed.fetch_attempts();
            if self.config.views.fetch_retry.should_retry(attempts) {
                let delay = self.config.views.fetch_retry.delay_for_attempt(attempts - 1);
                tracing::warn!(key = %key, attempts, error = %error, "Snapshot fetch failed; retrying");
                effects.push(Effect::delay(delay, LiveAction::RetryFetch { key, seq }));
                return effects;
            }
            feed.finish_fetch();
        } else if let Some(feed) = state.registry.feed_mut(&key) {
            feed.finish_fetch();
        }

        tracing::warn!(key = %key, error = %error, "Snapshot fetch failed");
        state.reconciler.fail(&key, error.to_string());
        env.events.publish(LiveEvent::ViewError {
            key,
            error: error.to_string(),
        });
        effects
    }

    /// A fetch transport error hints at a dead channel: probe it now.
    fn transport_probe(&self, state: &mut LiveState, env: &LiveEnvironment) -> Effects {
        let generation = state.connection.generation();
        match state.connection.probe() {
            Some(reference) => self.probe_effects(env, generation, reference),
            None => SmallVec::new(),
        }
    }

    fn probe_effects(&self, env: &LiveEnvironment, generation: u64, reference: u64) -> Effects {
        smallvec![
            connection::send_frame(
                env.gateway.clone(),
                generation,
                ClientFrame::Ping { reference },
            ),
            Effect::delay(
                self.config.connection.heartbeat_timeout,
                LiveAction::HeartbeatTimedOut {
                    generation,
                    reference,
                },
            ),
        ]
    }

    fn dispatch_completed(
        &self,
        state: &mut LiveState,
        env: &LiveEnvironment,
        id: ActionId,
        result: Result<ActionReceipt, ActionDispatchError>,
    ) -> Effects {
        let mut effects = Effects::new();
        match state.queue.complete(id, result, &self.config.queue.retry) {
            Settlement::Unknown => return effects,
            Settlement::Retry { attempt, delay } => {
                tracing::warn!(action_id = %id, attempt, delay_ms = delay.as_millis(), "Action dispatch failed; retrying");
                effects.push(Effect::delay(delay, LiveAction::RetryAction { id }));
            },
            Settlement::Settled(outcome) => {
                if outcome.is_success() {
                    tracing::debug!(action_id = %id, "Action succeeded");
                } else {
                    tracing::warn!(action_id = %id, ?outcome, "Action failed");
                }
                env.events
                    .publish(LiveEvent::ActionSettled { id, outcome });
            },
        }
        effects.extend(self.drain_queue(state, env));
        effects
    }

    /// Start the next queued action while connected.
    fn drain_queue(&self, state: &mut LiveState, env: &LiveEnvironment) -> Option<Effect<LiveAction>> {
        if !state.connection.is_connected() {
            return None;
        }
        let request = state.queue.next_dispatch()?;
        tracing::debug!(
            action_id = %request.action_id,
            attempt = request.attempt,
            "Dispatching action"
        );
        Some(queue::dispatch(
            env.dispatcher.clone(),
            request,
            self.config.queue.dispatch_timeout,
        ))
    }
}
