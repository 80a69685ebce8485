//! In-memory snapshot source.

#![allow(clippy::unwrap_used)] // Test infrastructure: mutex poisoning is a test failure
#![allow(clippy::missing_panics_doc)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tikit_realtime_core::feed::{FetchError, SnapshotSource};
use tikit_realtime_core::gateway::BoxFuture;
use tikit_realtime_core::topic::SubscriptionKey;

#[derive(Debug, Default)]
struct FeedInner {
    rows: HashMap<SubscriptionKey, serde_json::Value>,
    failures: HashMap<SubscriptionKey, VecDeque<FetchError>>,
    calls: HashMap<SubscriptionKey, usize>,
    latency: Option<Duration>,
}

/// [`SnapshotSource`] backed by a map of JSON rows.
///
/// Keys without a row answer [`FetchError::NotFound`]. Every call is counted
/// per key, so tests can assert "exactly one fetch after reconnect".
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotSource {
    inner: Arc<Mutex<FeedInner>>,
}

impl InMemorySnapshotSource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the authoritative row (or row array) for `key`.
    pub fn put(&self, key: SubscriptionKey, row: serde_json::Value) {
        self.inner.lock().unwrap().rows.insert(key, row);
    }

    /// Remove the row for `key`; later fetches answer `NotFound`.
    pub fn remove(&self, key: &SubscriptionKey) {
        self.inner.lock().unwrap().rows.remove(key);
    }

    /// Make the next fetch of `key` fail with `error` (queued, one per call).
    pub fn fail_next(&self, key: SubscriptionKey, error: FetchError) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .entry(key)
            .or_default()
            .push_back(error);
    }

    /// Delay every fetch by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().unwrap().latency = Some(latency);
    }

    /// Number of fetches issued for `key`.
    #[must_use]
    pub fn calls(&self, key: &SubscriptionKey) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Number of fetches issued across all keys.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.inner.lock().unwrap().calls.values().sum()
    }

    /// Reset all call counters.
    pub fn reset_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }
}

impl SnapshotSource for InMemorySnapshotSource {
    fn fetch_current(&self, key: &SubscriptionKey) -> BoxFuture<'_, Result<serde_json::Value, FetchError>> {
        let key = key.clone();
        Box::pin(async move {
            let latency = {
                let mut inner = self.inner.lock().unwrap();
                *inner.calls.entry(key.clone()).or_insert(0) += 1;
                inner.latency
            };

            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }

            let mut inner = self.inner.lock().unwrap();
            if let Some(error) = inner.failures.get_mut(&key).and_then(VecDeque::pop_front) {
                return Err(error);
            }
            inner
                .rows
                .get(&key)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(key.to_string()))
        })
    }
}
