//! Change feed client: one logical subscription to a (topic, filter key).
//!
//! A feed tracks how many observers share it, whether the gateway currently
//! delivers its changes, the newest change applied, and the snapshot fetch in
//! progress. Fetch results are tagged with a sequence number; only the result
//! of the latest fetch is accepted.

use crate::session::LiveAction;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tikit_realtime_core::effect::Effect;
use tikit_realtime_core::feed::SnapshotSource;
use tikit_realtime_core::gateway::ClientFrame;
use tikit_realtime_core::topic::{FilterKey, SubscriptionKey, Topic};

/// Public description of one registry entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    /// Topic
    pub topic: Topic,
    /// Filter key
    pub filter_key: FilterKey,
    /// Observers sharing the subscription
    pub ref_count: usize,
    /// Whether the gateway currently delivers its changes
    pub active: bool,
    /// Server timestamp of the newest applied change
    pub last_seen_version: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default)]
struct FetchState {
    seq: u64,
    attempts: u32,
    in_flight: bool,
    requested_at: DateTime<Utc>,
}

/// One (topic, filter key) subscription.
#[derive(Clone, Debug)]
pub struct ChangeFeed {
    key: SubscriptionKey,
    ref_count: usize,
    active: bool,
    last_seen_version: Option<DateTime<Utc>>,
    fetch: FetchState,
}

impl ChangeFeed {
    /// New feed with one observer, not yet active.
    #[must_use]
    pub fn new(key: SubscriptionKey) -> Self {
        Self {
            key,
            ref_count: 1,
            active: false,
            last_seen_version: None,
            fetch: FetchState::default(),
        }
    }

    /// Subscription key.
    #[must_use]
    pub const fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Observers sharing this feed.
    #[must_use]
    pub const fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Whether the gateway delivers changes for this feed.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Server timestamp of the newest applied change.
    #[must_use]
    pub const fn last_seen_version(&self) -> Option<DateTime<Utc>> {
        self.last_seen_version
    }

    /// Attempts made by the current fetch cycle.
    #[must_use]
    pub const fn fetch_attempts(&self) -> u32 {
        self.fetch.attempts
    }

    pub(crate) fn acquire(&mut self) -> usize {
        self.ref_count += 1;
        self.ref_count
    }

    pub(crate) fn release(&mut self) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Record an applied change.
    pub fn observe(&mut self, version: DateTime<Utc>) {
        if self.last_seen_version.is_none_or(|seen| version > seen) {
            self.last_seen_version = Some(version);
        }
    }

    /// When the current fetch attempt was issued. Snapshot rows without a
    /// version of their own are versioned at this time.
    #[must_use]
    pub const fn fetch_requested_at(&self) -> DateTime<Utc> {
        self.fetch.requested_at
    }

    /// Start a new fetch cycle at `now`, superseding any fetch in flight.
    pub fn begin_fetch(&mut self, now: DateTime<Utc>) -> u64 {
        self.fetch.seq += 1;
        self.fetch.attempts = 1;
        self.fetch.in_flight = true;
        self.fetch.requested_at = now;
        self.fetch.seq
    }

    /// Start the next attempt of the current cycle at `now`.
    pub fn retry_fetch(&mut self, now: DateTime<Utc>) -> u64 {
        self.fetch.seq += 1;
        self.fetch.attempts += 1;
        self.fetch.in_flight = true;
        self.fetch.requested_at = now;
        self.fetch.seq
    }

    /// Whether a result or retry timer tagged `seq` belongs to the current fetch.
    #[must_use]
    pub const fn accepts(&self, seq: u64) -> bool {
        self.fetch.in_flight && self.fetch.seq == seq
    }

    /// The current fetch cycle is over.
    pub fn finish_fetch(&mut self) {
        self.fetch.in_flight = false;
    }

    /// Channel-level subscribe frame.
    #[must_use]
    pub fn subscribe_frame(&self) -> ClientFrame {
        ClientFrame::subscribe(&self.key)
    }

    /// Channel-level unsubscribe frame.
    #[must_use]
    pub fn unsubscribe_frame(&self) -> ClientFrame {
        ClientFrame::unsubscribe(&self.key)
    }

    /// Public description.
    #[must_use]
    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            topic: self.key.topic,
            filter_key: self.key.filter_key.clone(),
            ref_count: self.ref_count,
            active: self.active,
            last_seen_version: self.last_seen_version,
        }
    }
}

/// Fetch the authoritative state of `key`; the result is tagged with `seq`.
pub fn fetch_current(
    snapshots: Arc<dyn SnapshotSource>,
    key: SubscriptionKey,
    seq: u64,
) -> Effect<LiveAction> {
    Effect::future(async move {
        let result = snapshots.fetch_current(&key).await;
        Some(LiveAction::SnapshotFetched { key, seq, result })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + TimeDelta::seconds(seconds)
    }

    fn feed() -> ChangeFeed {
        ChangeFeed::new(SubscriptionKey::new(
            Topic::EventCapacity,
            FilterKey::new("evt-1"),
        ))
    }

    #[test]
    fn newer_fetch_supersedes_older_one() {
        let mut feed = feed();
        let first = feed.begin_fetch(at(1));
        let second = feed.begin_fetch(at(2));

        assert!(!feed.accepts(first));
        assert!(feed.accepts(second));

        feed.finish_fetch();
        assert!(!feed.accepts(second));
        assert_eq!(feed.fetch_requested_at(), at(2));
    }

    #[test]
    fn retries_count_attempts_within_a_cycle() {
        let mut feed = feed();
        feed.begin_fetch(at(1));
        feed.retry_fetch(at(5));
        assert_eq!(feed.fetch_attempts(), 2);
        assert_eq!(feed.fetch_requested_at(), at(5));

        feed.begin_fetch(at(9));
        assert_eq!(feed.fetch_attempts(), 1);
    }

    #[test]
    fn last_seen_version_only_moves_forward() {
        let mut feed = feed();

        feed.observe(at(10));
        feed.observe(at(5));
        assert_eq!(feed.last_seen_version(), Some(at(10)));
    }
}
