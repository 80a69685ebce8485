//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for every real-time component:
//! - Connection lifecycle and reconnect attempts
//! - Active subscriptions
//! - Applied and discarded updates per topic
//! - Offline queue depth and per-action outcomes
//! - Reducer execution and effect handling
//!
//! Library code only records through the `metrics` facade; the binary decides
//! whether a recorder is installed.
//!
//! # Example
//!
//! ```rust,no_run
//! use tikit_realtime_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Installs the Prometheus recorder and keeps the handle used to render the
/// scrape body.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address the scrape endpoint is published on
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., by another test), this logs a
    /// warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Address the scrape endpoint is published on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Connection
    describe_counter!(
        "live_connection_transitions_total",
        "Connection state transitions, labelled by target state"
    );
    describe_counter!(
        "live_reconnect_attempts_total",
        "Automatic reconnect attempts scheduled"
    );

    // Subscriptions
    describe_gauge!(
        "live_subscriptions_active",
        "Registry entries with at least one observer"
    );

    // Reconciler
    describe_counter!(
        "live_updates_applied_total",
        "Changes and snapshots merged into a view, labelled by topic"
    );
    describe_counter!(
        "live_updates_discarded_total",
        "Stale or unroutable changes dropped, labelled by topic"
    );

    // Offline queue
    describe_gauge!("live_actions_queued", "Actions waiting in the offline queue");
    describe_counter!(
        "live_actions_settled_total",
        "Queued actions settled, labelled by outcome"
    );

    // Store
    describe_histogram!(
        "store_reducer_duration_seconds",
        "Time spent inside one reducer call"
    );
    describe_counter!(
        "store_effects_executed_total",
        "Effects started by the store, labelled by effect type"
    );
}

/// Connection metrics recorder.
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    /// Record a transition into `to`.
    pub fn record_transition(to: &'static str) {
        counter!("live_connection_transitions_total", "to" => to).increment(1);
    }

    /// Record a scheduled reconnect attempt.
    pub fn record_reconnect_attempt() {
        counter!("live_reconnect_attempts_total").increment(1);
    }
}

/// Subscription registry metrics recorder.
pub struct SubscriptionMetrics;

impl SubscriptionMetrics {
    /// Record the number of live registry entries.
    #[allow(clippy::cast_precision_loss)] // entry counts stay far below 2^52
    pub fn record_active(count: usize) {
        gauge!("live_subscriptions_active").set(count as f64);
    }
}

/// Reconciler metrics recorder.
pub struct ReconcilerMetrics;

impl ReconcilerMetrics {
    /// Record a merge that changed (or refreshed) a view.
    pub fn record_applied(topic: &'static str) {
        counter!("live_updates_applied_total", "topic" => topic).increment(1);
    }

    /// Record a dropped change.
    pub fn record_discarded(topic: &'static str) {
        counter!("live_updates_discarded_total", "topic" => topic).increment(1);
    }
}

/// Offline queue metrics recorder.
pub struct QueueMetrics;

impl QueueMetrics {
    /// Record the current queue depth.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_depth(depth: usize) {
        gauge!("live_actions_queued").set(depth as f64);
    }

    /// Record a settled action (`succeeded` or `failed`).
    pub fn record_settled(outcome: &'static str) {
        counter!("live_actions_settled_total", "outcome" => outcome).increment(1);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn test_live_metrics_render() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();

        ConnectionMetrics::record_transition("connected");
        ConnectionMetrics::record_reconnect_attempt();
        SubscriptionMetrics::record_active(2);
        ReconcilerMetrics::record_applied("event_capacity");
        ReconcilerMetrics::record_discarded("event_capacity");
        QueueMetrics::record_depth(3);
        QueueMetrics::record_settled("succeeded");

        // Another test may have installed the recorder first
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("live_connection_transitions_total"));
            assert!(rendered.contains("live_updates_applied_total"));
            assert!(rendered.contains("live_actions_queued"));
        }
    }
}
