//! Live session demo.
//!
//! Runs a complete session against the in-memory gateway:
//!
//! 1. queues a ticket purchase while offline
//! 2. connects, which replays the queued purchase
//! 3. watches an event's capacity and its spray-money leaderboard
//! 4. pushes server changes, drops the channel and watches the session recover
//!
//! # Running the Example
//!
//! ```bash
//! RUST_LOG=info,tikit_realtime=debug cargo run -p live-session
//! ```
//!
//! Every `TIKIT_LIVE_*` variable (see `LiveConfig::from_env`) is honoured, and
//! a `.env` file in the working directory is loaded first.

#![allow(missing_docs)]

use anyhow::Context;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tikit_realtime::{LiveClient, LiveConfig, LiveEvent};
use tikit_realtime_core::change::{ChangeEnvelope, ChangeOperation};
use tikit_realtime_core::topic::{Credential, FilterKey, SubscriptionKey, Topic};
use tikit_realtime_core::{DateTime, Utc};
use tikit_realtime_runtime::metrics::MetricsServer;
use tikit_realtime_testing::{InMemorySnapshotSource, RecordingDispatcher, ScriptedGateway};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const EVENT_ID: &str = "evt-lagos-2025";

fn change(topic: Topic, operation: ChangeOperation, row: serde_json::Value) -> ChangeEnvelope {
    ChangeEnvelope {
        topic,
        filter_key: FilterKey::new(EVENT_ID),
        operation,
        row,
        server_timestamp: Utc::now(),
    }
}

fn seed(snapshots: &InMemorySnapshotSource, opened_at: DateTime<Utc>) {
    snapshots.put(
        SubscriptionKey::new(Topic::EventCapacity, FilterKey::new(EVENT_ID)),
        json!({"capacity": 500, "sold_tickets": 440, "updated_at": opened_at.to_rfc3339()}),
    );
    snapshots.put(
        SubscriptionKey::new(Topic::Leaderboard, FilterKey::new(EVENT_ID)),
        json!({"top_sprayers": [
            {"sprayer_id": "u-1", "sprayer_name": "Ada", "amount": 50_000, "updated_at": opened_at.to_rfc3339()},
            {"sprayer_id": "u-2", "sprayer_name": "Tunde", "amount": 20_000, "updated_at": opened_at.to_rfc3339()}
        ]}),
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut metrics = MetricsServer::new("0.0.0.0:9090".parse()?);
    metrics.start()?;

    let gateway = ScriptedGateway::new().with_auto_pong();
    let snapshots = InMemorySnapshotSource::new();
    let dispatcher = RecordingDispatcher::new();
    seed(&snapshots, Utc::now());

    let client = LiveClient::builder()
        .config(LiveConfig::from_env())
        .gateway(Arc::new(gateway.clone()))
        .snapshots(Arc::new(snapshots.clone()))
        .dispatcher(Arc::new(dispatcher.clone()))
        .build()
        .context("building live client")?;

    let mut events = client.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                LiveEvent::Updated { key, .. } => tracing::info!(%key, "view updated"),
                other => tracing::info!(event = other.name(), "session event"),
            }
        }
    });

    let purchase = client
        .enqueue("purchase-0001", json!({"event_id": EVENT_ID, "tickets": 2}))
        .await?;
    tracing::info!(status = %client.status().await, "Queued a purchase while offline");

    let connected = client
        .connect_and_wait(Credential::bearer("demo-token"), Duration::from_secs(5))
        .await?;
    anyhow::ensure!(connected, "gateway handshake did not complete");

    let outcome = purchase.outcome().await?;
    tracing::info!(?outcome, "Queued purchase settled");

    let mut capacity = client.watch_capacity(EVENT_ID).await?;
    let mut board = client.watch_leaderboard(EVENT_ID).await?;
    let view = capacity.changed().await?;
    if let Some(snapshot) = &view.data {
        tracing::info!(
            available = snapshot.available_tickets(),
            status = ?snapshot.status(),
            "Capacity loaded"
        );
    }
    board.changed().await?;

    gateway.push_change(change(
        Topic::EventCapacity,
        ChangeOperation::Update,
        json!({"capacity": 500, "sold_tickets": 452, "updated_at": Utc::now().to_rfc3339()}),
    ));
    gateway.push_change(change(
        Topic::Leaderboard,
        ChangeOperation::Insert,
        json!({"sprayer_id": "u-3", "sprayer_name": "Chioma", "amount": 75_000}),
    ));
    let view = board.changed().await?;
    if let Some(leaderboard) = &view.data {
        for (rank, entry) in leaderboard.ranks().iter().enumerate() {
            tracing::info!(rank = rank + 1, name = %entry.display_name, amount = entry.amount, "Leaderboard");
        }
    }

    gateway.drop_channel();
    tokio::time::sleep(Duration::from_millis(100)).await;
    tracing::info!(status = %client.status().await, "Channel dropped");

    let recovered = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if client.status().await == tikit_realtime::LiveStatus::Live {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .is_ok();
    tracing::info!(recovered, status = %client.status().await, "Reconnect finished");

    let health = client.health().await;
    for check in &health.checks {
        tracing::info!(component = %check.component, status = %check.status, message = ?check.message, "Health");
    }
    tracing::info!(
        dispatched = ?dispatcher.dispatch_order(),
        fetches = snapshots.total_calls(),
        "Collaborator traffic"
    );
    if let Some(rendered) = metrics.render() {
        println!("{rendered}");
    }

    capacity.release().await?;
    board.release().await?;
    client.shutdown(Duration::from_secs(5)).await?;
    Ok(())
}
