//! # Tikit Realtime Testing
//!
//! Testing utilities and helpers for the Tikit real-time layer.
//!
//! This crate provides:
//! - Deterministic implementations of the environment traits
//!   ([`FixedClock`], [`ScriptedGateway`], [`InMemorySnapshotSource`],
//!   [`RecordingDispatcher`])
//! - [`ReducerTest`], a Given-When-Then harness for reducers
//! - Helpers for waiting on store state in async tests
//!
//! ## Example
//!
//! ```ignore
//! use tikit_realtime_testing::{ScriptedGateway, InMemorySnapshotSource, RecordingDispatcher};
//!
//! #[tokio::test]
//! async fn capacity_goes_live() {
//!     let gateway = ScriptedGateway::new();
//!     let snapshots = InMemorySnapshotSource::new();
//!     let client = LiveClient::builder()
//!         .gateway(Arc::new(gateway.clone()))
//!         .snapshots(Arc::new(snapshots.clone()))
//!         .dispatcher(Arc::new(RecordingDispatcher::new()))
//!         .build()?;
//!     client.connect(Credential::bearer("token")).await?;
//! }
//! ```

use chrono::{DateTime, Utc};
use tikit_realtime_core::environment::Clock;

mod dispatch;
mod feed;
mod gateway;
mod reducer_test;

pub use dispatch::RecordingDispatcher;
pub use feed::InMemorySnapshotSource;
pub use gateway::{OpenScript, ScriptedGateway};
pub use reducer_test::{ReducerTest, assertions};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use tikit_realtime_testing::mocks::FixedClock;
    /// use tikit_realtime_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers and utilities
pub mod helpers {
    use std::time::Duration;
    use tikit_realtime_core::reducer::Reducer;
    use tikit_realtime_runtime::Store;

    /// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
    ///
    /// Later calls are no-ops, so every test may call it.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }

    /// Poll the store until `predicate` holds or `timeout` elapses.
    ///
    /// Returns whether the predicate was observed to hold.
    pub async fn wait_for_state<S, A, E, R, F>(
        store: &Store<S, A, E, R>,
        predicate: F,
        timeout: Duration,
    ) -> bool
    where
        R: Reducer<State = S, Action = A, Environment = E> + Clone + Send + Sync + 'static,
        A: Send + Clone + 'static,
        S: Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        F: Fn(&S) -> bool,
    {
        let poll = async {
            loop {
                if store.state(&predicate).await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }
}
