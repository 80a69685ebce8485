//! # Tikit Realtime
//!
//! Live data for Tikit clients over a single gateway channel.
//!
//! One [`LiveClient`] per user session:
//!
//! - opens and supervises the channel (handshake timeout, heartbeat probes,
//!   bounded exponential-backoff reconnects)
//! - multiplexes any number of topic subscriptions over it, sharing duplicate
//!   subscriptions and re-subscribing after every reconnect
//! - reconciles fetched snapshots and incremental changes into per-entity
//!   views, discarding stale and duplicate updates
//! - buffers user actions while offline and replays them in order, one at a
//!   time, with per-action retry and outcome
//!
//! Session logic is one reducer ([`session::LiveReducer`]) run by the runtime
//! [`Store`](tikit_realtime_runtime::Store); transports are injected through the
//! [`Gateway`](tikit_realtime_core::gateway::Gateway),
//! [`SnapshotSource`](tikit_realtime_core::feed::SnapshotSource) and
//! [`ActionDispatcher`](tikit_realtime_core::dispatch::ActionDispatcher) traits.
//!
//! ## Example
//!
//! ```ignore
//! use tikit_realtime::{LiveClient, LiveConfig};
//! use tikit_realtime_core::topic::Credential;
//!
//! let client = LiveClient::builder()
//!     .config(LiveConfig::from_env())
//!     .gateway(gateway)
//!     .snapshots(snapshots)
//!     .dispatcher(dispatcher)
//!     .build()?;
//!
//! client.connect(Credential::bearer(token)).await?;
//!
//! let mut capacity = client.watch_capacity("evt-42").await?;
//! while let Ok(view) = capacity.changed().await {
//!     if let Some(snapshot) = view.data {
//!         println!("{} tickets left", snapshot.available_tickets());
//!     }
//! }
//! ```

pub mod change_feed;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod queue;
pub mod reconciler;
pub mod registry;
pub mod session;

pub use client::{ActionHandle, LiveClient, LiveClientBuilder, LiveStatus, LiveStore, LiveView};
pub use config::{ConfigError, ConnectionConfig, LiveConfig, QueueConfig, ViewConfig};
pub use connection::{ConnectionState, ConnectionStatus};
pub use error::{LiveError, Result};
pub use event::{ActionOutcome, LiveEvent};
pub use queue::{ActionStatus, QueueSummary};
pub use reconciler::{
    CapacitySnapshot, CapacityStatus, EntityView, GroupBuySnapshot, GroupBuyState,
    LeaderboardEntry, LeaderboardSnapshot, MessageLog, Notification, NotificationList, TopicView,
};
