//! Public facade of the live session.
//!
//! [`LiveClient`] owns the [`Store`] running the session reducer and exposes
//! the operations applications use: connect, watch a topic, enqueue an action,
//! observe status and health.

use crate::change_feed::SubscriptionInfo;
use crate::config::LiveConfig;
use crate::connection::{ConnectionState, ConnectionStatus};
use crate::error::{LiveError, Result};
use crate::event::{ActionOutcome, EventSink, LiveEvent};
use crate::queue::{ActionStatus, QueueSummary};
use crate::reconciler::{
    CapacitySnapshot, EntityView, GroupBuySnapshot, LeaderboardSnapshot, MessageLog,
    NotificationList, TopicData,
};
use crate::session::{LiveAction, LiveEnvironment, LiveReducer, LiveState};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tikit_realtime_core::dispatch::ActionDispatcher;
use tikit_realtime_core::environment::{Clock, SystemClock};
use tikit_realtime_core::feed::SnapshotSource;
use tikit_realtime_core::gateway::Gateway;
use tikit_realtime_core::topic::{ActionId, Credential, FilterKey, IdempotencyKey, SubscriptionKey};
use tikit_realtime_runtime::{HealthCheck, HealthReport, Store, StoreConfig, StoreError};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// Store running the live session.
pub type LiveStore = Store<LiveState, LiveAction, LiveEnvironment, LiveReducer>;

/// Handle to a live session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct LiveClient {
    store: LiveStore,
    events: EventSink,
    config: Arc<LiveConfig>,
}

impl fmt::Debug for LiveClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveClient")
            .field("pending_effects", &self.store.pending_effects())
            .finish_non_exhaustive()
    }
}

/// Builder for [`LiveClient`].
#[derive(Default)]
pub struct LiveClientBuilder {
    config: Option<LiveConfig>,
    store_config: Option<StoreConfig>,
    gateway: Option<Arc<dyn Gateway>>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    dispatcher: Option<Arc<dyn ActionDispatcher>>,
    clock: Option<Arc<dyn Clock>>,
}

impl LiveClientBuilder {
    /// Session configuration (defaults to [`LiveConfig::default`]).
    #[must_use]
    pub fn config(mut self, config: LiveConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Store tuning.
    #[must_use]
    pub fn store_config(mut self, config: StoreConfig) -> Self {
        self.store_config = Some(config);
        self
    }

    /// Gateway channel (required).
    #[must_use]
    pub fn gateway(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Snapshot source (required).
    #[must_use]
    pub fn snapshots(mut self, snapshots: Arc<dyn SnapshotSource>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Action dispatcher (required).
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Arc<dyn ActionDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Time source (defaults to [`SystemClock`]).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and start the session store.
    ///
    /// # Errors
    ///
    /// - [`LiveError::Config`] if the configuration is invalid
    /// - [`LiveError::MissingCollaborator`] if a required collaborator was not set
    pub fn build(self) -> Result<LiveClient> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let gateway = self.gateway.ok_or(LiveError::MissingCollaborator("gateway"))?;
        let snapshots = self
            .snapshots
            .ok_or(LiveError::MissingCollaborator("snapshot source"))?;
        let dispatcher = self
            .dispatcher
            .ok_or(LiveError::MissingCollaborator("action dispatcher"))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let events = EventSink::new(config.event_buffer);
        let environment = LiveEnvironment {
            clock,
            gateway,
            snapshots,
            dispatcher,
            events: events.clone(),
        };

        let state = LiveState::new(&config);
        let reducer = LiveReducer::new(config.clone());
        let store = Store::with_config(
            state,
            reducer,
            environment,
            self.store_config.unwrap_or_default(),
        );

        Ok(LiveClient {
            store,
            events,
            config: Arc::new(config),
        })
    }
}

impl LiveClient {
    /// Start building a client.
    #[must_use]
    pub fn builder() -> LiveClientBuilder {
        LiveClientBuilder::default()
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    /// Underlying store, for tests and advanced integrations.
    #[must_use]
    pub const fn store(&self) -> &LiveStore {
        &self.store
    }

    /// Open the gateway channel with `credential`.
    ///
    /// Returns once the handshake has started; progress is reported on
    /// [`LiveClient::events`]. Ignored unless the session is `Disconnected`
    /// or `Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Store`] if the client is shutting down.
    pub async fn connect(&self, credential: Credential) -> Result<()> {
        self.store.send(LiveAction::Connect { credential }).await?;
        Ok(())
    }

    /// Connect and wait until the channel is open.
    ///
    /// Returns `Ok(false)` if the handshake failed or did not complete within
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Store`] if the client is shutting down.
    pub async fn connect_and_wait(&self, credential: Credential, timeout: Duration) -> Result<bool> {
        if self.connection_state().await.status == ConnectionStatus::Connected {
            return Ok(true);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let handshake = self
            .store
            .send_and_wait_for(
                LiveAction::Connect { credential },
                |action| {
                    matches!(
                        action,
                        LiveAction::Opened { .. } | LiveAction::HandshakeFailed { .. }
                    )
                },
                timeout,
            )
            .await;
        match handshake {
            Ok(_) => {},
            // A handshake already in flight may have finished before the wait began.
            Err(StoreError::Timeout) => {
                return Ok(self.connection_state().await.status == ConnectionStatus::Connected);
            },
            Err(error) => return Err(error.into()),
        }

        // The handshake result is observed before the reducer has applied it.
        let applied = async {
            loop {
                match self.connection_state().await.status {
                    ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => {},
                    status => return status == ConnectionStatus::Connected,
                }
                tokio::task::yield_now().await;
            }
        };
        Ok(tokio::time::timeout_at(deadline, applied).await.unwrap_or(false))
    }

    /// Close the channel. Subscriptions and queued actions are kept.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Store`] if the client is shutting down.
    pub async fn disconnect(&self) -> Result<()> {
        self.store.send(LiveAction::Disconnect).await?;
        Ok(())
    }

    /// Current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        self.store
            .state(|state| state.connection_state().clone())
            .await
    }

    /// Subscribe to the outbound event stream.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<LiveEvent> {
        self.events.subscribe()
    }

    /// Watch `filter_key` on the topic carrying `T`.
    ///
    /// Watching the same entity twice shares one channel subscription.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Store`] if the client is shutting down.
    pub async fn watch<T: TopicData>(&self, filter_key: impl Into<FilterKey>) -> Result<LiveView<T>> {
        let key = SubscriptionKey::new(T::TOPIC, filter_key.into());
        let events = self.events.subscribe();
        self.store
            .send(LiveAction::Subscribe { key: key.clone() })
            .await?;

        Ok(LiveView {
            key,
            store: self.store.clone(),
            events,
            released: false,
            _data: PhantomData,
        })
    }

    /// Watch the ticket capacity of an event.
    ///
    /// # Errors
    ///
    /// See [`LiveClient::watch`].
    pub async fn watch_capacity(&self, event_id: impl Into<FilterKey>) -> Result<LiveView<CapacitySnapshot>> {
        self.watch(event_id).await
    }

    /// Watch the progress of a group buy.
    ///
    /// # Errors
    ///
    /// See [`LiveClient::watch`].
    pub async fn watch_group_buy(&self, group_buy_id: impl Into<FilterKey>) -> Result<LiveView<GroupBuySnapshot>> {
        self.watch(group_buy_id).await
    }

    /// Watch the spray-money leaderboard of an event.
    ///
    /// # Errors
    ///
    /// See [`LiveClient::watch`].
    pub async fn watch_leaderboard(&self, event_id: impl Into<FilterKey>) -> Result<LiveView<LeaderboardSnapshot>> {
        self.watch(event_id).await
    }

    /// Watch the notifications of a user.
    ///
    /// # Errors
    ///
    /// See [`LiveClient::watch`].
    pub async fn watch_notifications(&self, user_id: impl Into<FilterKey>) -> Result<LiveView<NotificationList>> {
        self.watch(user_id).await
    }

    /// Watch a broadcast channel.
    ///
    /// # Errors
    ///
    /// See [`LiveClient::watch`].
    pub async fn watch_broadcast(&self, channel: impl Into<FilterKey>) -> Result<LiveView<MessageLog>> {
        self.watch(channel).await
    }

    /// Queue a user action for dispatch.
    ///
    /// Actions are dispatched one at a time, in enqueue order, while the
    /// session is connected. The `idempotency_key` is sent with every attempt.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Store`] if the client is shutting down.
    pub async fn enqueue(
        &self,
        idempotency_key: impl Into<IdempotencyKey>,
        payload: serde_json::Value,
    ) -> Result<ActionHandle> {
        let id = ActionId::new();
        let events = self.events.subscribe();
        self.store
            .send(LiveAction::Enqueue {
                id,
                idempotency_key: idempotency_key.into(),
                payload,
            })
            .await?;

        Ok(ActionHandle {
            id,
            store: self.store.clone(),
            events,
        })
    }

    /// Counts of queued and failed actions.
    pub async fn queue_summary(&self) -> QueueSummary {
        self.store.state(|state| state.queue().summary()).await
    }

    /// Every registered subscription.
    pub async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.store.state(|state| state.registry().infos()).await
    }

    /// User-facing status line.
    pub async fn status(&self) -> LiveStatus {
        self.store
            .state(|state| {
                LiveStatus::from_state(state.connection_state(), state.queue().summary().queued())
            })
            .await
    }

    /// Health of the connection, the queue and the store.
    pub async fn health(&self) -> HealthReport {
        let (connection, queue) = self
            .store
            .state(|state| {
                (
                    connection_health(state.connection_state()),
                    queue_health(state.queue().summary()),
                )
            })
            .await;
        HealthReport::new(vec![connection, queue, self.store.health()])
    }

    /// Close the channel and stop the session.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Store`] if effects are still running after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if let Ok(mut handle) = self.store.send(LiveAction::Disconnect).await {
            let _ = handle.wait_with_timeout(timeout).await;
        }
        self.store.shutdown(timeout).await?;
        Ok(())
    }
}

fn connection_health(state: &ConnectionState) -> HealthCheck {
    let check = match state.status {
        ConnectionStatus::Connected => HealthCheck::healthy("connection"),
        ConnectionStatus::Connecting => HealthCheck::degraded("connection", "connecting"),
        ConnectionStatus::Reconnecting => HealthCheck::degraded(
            "connection",
            format!("reconnecting (attempt {})", state.reconnect_attempts),
        ),
        ConnectionStatus::Disconnected => HealthCheck::degraded("connection", "offline"),
        ConnectionStatus::Failed => HealthCheck::unhealthy(
            "connection",
            state.last_error.clone().unwrap_or_else(|| "failed".to_string()),
        ),
    };
    check.with_metadata("status", state.status.as_str())
}

fn queue_health(summary: QueueSummary) -> HealthCheck {
    let check = if summary.failed == 0 {
        HealthCheck::healthy("queue")
    } else {
        HealthCheck::degraded("queue", format!("{} actions failed", summary.failed))
    };
    check
        .with_metadata("pending", summary.pending.to_string())
        .with_metadata("in_flight", summary.in_flight.to_string())
        .with_metadata("failed", summary.failed.to_string())
}

/// User-facing connection status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LiveStatus {
    /// Connected; views are live
    Live,
    /// First handshake in progress
    Connecting,
    /// Waiting for reconnect attempt `attempt`
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
    },
    /// Not connected; `queued` actions wait for the connection
    Offline {
        /// Actions waiting for dispatch
        queued: usize,
    },
    /// Connecting failed or the reconnect budget is spent
    Failed,
}

impl LiveStatus {
    fn from_state(state: &ConnectionState, queued: usize) -> Self {
        match state.status {
            ConnectionStatus::Connected => Self::Live,
            ConnectionStatus::Connecting => Self::Connecting,
            ConnectionStatus::Reconnecting => Self::Reconnecting {
                attempt: state.reconnect_attempts,
            },
            ConnectionStatus::Disconnected => Self::Offline { queued },
            ConnectionStatus::Failed => Self::Failed,
        }
    }
}

impl fmt::Display for LiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => f.write_str("live"),
            Self::Connecting => f.write_str("connecting"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Offline { queued } => write!(f, "offline \u{2014} {queued} actions queued"),
            Self::Failed => f.write_str("connection failed, retry"),
        }
    }
}

/// Observer of one subscription.
///
/// Dropping the view releases the subscription; [`LiveView::release`] does the
/// same and waits for it.
pub struct LiveView<T: TopicData> {
    key: SubscriptionKey,
    store: LiveStore,
    events: broadcast::Receiver<LiveEvent>,
    released: bool,
    _data: PhantomData<fn() -> T>,
}

impl<T: TopicData> fmt::Debug for LiveView<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveView").field("key", &self.key).finish_non_exhaustive()
    }
}

impl<T: TopicData> LiveView<T> {
    /// Subscription key.
    #[must_use]
    pub const fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Current state of the view.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::ViewReleased`] if the subscription no longer exists.
    pub async fn current(&self) -> Result<EntityView<T>> {
        let key = self.key.clone();
        self.store
            .state(move |state| {
                state
                    .reconciler()
                    .view(&key)
                    .and_then(T::view_of)
                    .cloned()
            })
            .await
            .ok_or_else(|| LiveError::ViewReleased(self.key.to_string()))
    }

    /// Wait for the next change of this view and return it.
    ///
    /// # Errors
    ///
    /// - [`LiveError::EventsClosed`] if the session is gone
    /// - [`LiveError::ViewReleased`] if the subscription no longer exists
    pub async fn changed(&mut self) -> Result<EntityView<T>> {
        loop {
            match self.events.recv().await {
                Ok(LiveEvent::Updated { key, view }) if key == self.key => {
                    if let Some(view) = T::view_of(&view) {
                        return Ok(view.clone());
                    }
                },
                Ok(LiveEvent::ViewError { key, .. }) if key == self.key => {
                    return self.current().await;
                },
                Ok(_) => {},
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(key = %self.key, skipped, "View observer lagged");
                    return self.current().await;
                },
                Err(RecvError::Closed) => return Err(LiveError::EventsClosed),
            }
        }
    }

    /// Release the subscription now.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Store`] if the client is shutting down.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.store
            .send(LiveAction::Unsubscribe {
                key: self.key.clone(),
            })
            .await?;
        Ok(())
    }
}

impl<T: TopicData> Drop for LiveView<T> {
    fn drop(&mut self) {
        if self.released || self.store.is_shutting_down() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(key = %self.key, "No runtime to release dropped view");
            return;
        };
        let store = self.store.clone();
        let key = self.key.clone();
        runtime.spawn(async move {
            let _ = store.send(LiveAction::Unsubscribe { key }).await;
        });
    }
}

/// Handle to a queued action.
pub struct ActionHandle {
    id: ActionId,
    store: LiveStore,
    events: broadcast::Receiver<LiveEvent>,
}

impl fmt::Debug for ActionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

impl ActionHandle {
    /// Local id of the action.
    #[must_use]
    pub const fn id(&self) -> ActionId {
        self.id
    }

    /// Current status, or `None` once the action left the queue's history.
    pub async fn status(&self) -> Option<ActionStatus> {
        let id = self.id;
        self.store.state(move |state| state.queue().status_of(id)).await
    }

    /// Wait for the action to settle.
    ///
    /// # Errors
    ///
    /// - [`LiveError::EventsClosed`] if the session is gone first
    /// - [`LiveError::OutcomeUnavailable`] if the settle event was dropped from
    ///   a lagging receiver and the outcome already left the queue's history
    pub async fn outcome(mut self) -> Result<ActionOutcome> {
        if let Some(outcome) = self.settled().await {
            return Ok(outcome);
        }
        loop {
            match self.events.recv().await {
                Ok(LiveEvent::ActionSettled { id, outcome }) if id == self.id => return Ok(outcome),
                Ok(_) => {},
                Err(RecvError::Lagged(skipped)) => {
                    if let Some(outcome) = self.settled().await {
                        return Ok(outcome);
                    }
                    if self.status().await.is_none() {
                        tracing::debug!(id = %self.id, skipped, "Settle event lost to lag");
                        return self.buffered_outcome();
                    }
                },
                Err(RecvError::Closed) => return Err(LiveError::EventsClosed),
            }
        }
    }

    /// Search what is still buffered for the settle event.
    fn buffered_outcome(&mut self) -> Result<ActionOutcome> {
        loop {
            match self.events.try_recv() {
                Ok(LiveEvent::ActionSettled { id, outcome }) if id == self.id => return Ok(outcome),
                Ok(_) | Err(TryRecvError::Lagged(_)) => {},
                Err(TryRecvError::Empty) => return Err(LiveError::OutcomeUnavailable(self.id)),
                Err(TryRecvError::Closed) => return Err(LiveError::EventsClosed),
            }
        }
    }

    async fn settled(&self) -> Option<ActionOutcome> {
        let id = self.id;
        self.store
            .state(move |state| state.queue().outcome_of(id).cloned())
            .await
    }
}
