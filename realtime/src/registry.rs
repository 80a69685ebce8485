//! Subscription registry.
//!
//! Multiplexes logical subscriptions over the single channel. Registering the
//! same (topic, filter key) twice shares one [`ChangeFeed`] and bumps its
//! reference count; the channel-level unsubscribe is only issued when the last
//! observer releases it. Entries survive disconnects as *desired* subscriptions
//! and are re-activated on every transition into `Connected`.

use crate::change_feed::{ChangeFeed, SubscriptionInfo};
use std::collections::BTreeMap;
use tikit_realtime_core::topic::SubscriptionKey;
use tikit_realtime_runtime::metrics::SubscriptionMetrics;

/// Result of [`SubscriptionRegistry::subscribe`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// First observer; a channel-level subscribe is needed once connected
    Created,
    /// Already registered; no channel traffic
    Shared {
        /// Observers after this one was added
        ref_count: usize,
    },
}

/// Result of [`SubscriptionRegistry::unsubscribe`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// Other observers remain
    Released {
        /// Observers left
        remaining: usize,
    },
    /// Last observer gone; the entry was removed
    Removed {
        /// Whether a channel-level unsubscribe is due
        was_active: bool,
    },
    /// Nothing registered under the key
    Unknown,
}

/// Registry of desired subscriptions.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionRegistry {
    feeds: BTreeMap<SubscriptionKey, ChangeFeed>,
}

impl SubscriptionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `key`.
    pub fn subscribe(&mut self, key: SubscriptionKey) -> SubscribeOutcome {
        if let Some(feed) = self.feeds.get_mut(&key) {
            return SubscribeOutcome::Shared {
                ref_count: feed.acquire(),
            };
        }
        self.feeds.insert(key.clone(), ChangeFeed::new(key));
        SubscribeOutcome::Created
    }

    /// Release one observer of `key`.
    pub fn unsubscribe(&mut self, key: &SubscriptionKey) -> UnsubscribeOutcome {
        let Some(feed) = self.feeds.get_mut(key) else {
            return UnsubscribeOutcome::Unknown;
        };
        let remaining = feed.release();
        if remaining > 0 {
            return UnsubscribeOutcome::Released { remaining };
        }

        let was_active = self
            .feeds
            .remove(key)
            .is_some_and(|feed| feed.is_active());
        self.record();
        UnsubscribeOutcome::Removed { was_active }
    }

    /// Entry for `key`.
    #[must_use]
    pub fn feed(&self, key: &SubscriptionKey) -> Option<&ChangeFeed> {
        self.feeds.get(key)
    }

    /// Mutable entry for `key`.
    pub fn feed_mut(&mut self, key: &SubscriptionKey) -> Option<&mut ChangeFeed> {
        self.feeds.get_mut(key)
    }

    /// Active entry an inbound change for `key` should be routed to.
    pub fn route(&mut self, key: &SubscriptionKey) -> Option<&mut ChangeFeed> {
        self.feeds.get_mut(key).filter(|feed| feed.is_active())
    }

    /// Mark `key` as delivered by the current channel.
    pub fn activate(&mut self, key: &SubscriptionKey) -> Option<&mut ChangeFeed> {
        let feed = self.feeds.get_mut(key)?;
        feed.set_active(true);
        let active = self.active_count();
        SubscriptionMetrics::record_active(active);
        self.feeds.get_mut(key)
    }

    /// The channel is gone; every entry becomes desired-only.
    pub fn deactivate_all(&mut self) {
        for feed in self.feeds.values_mut() {
            feed.set_active(false);
        }
        self.record();
    }

    /// All registered keys, in key order.
    #[must_use]
    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.feeds.keys().cloned().collect()
    }

    /// Entries currently delivered by the channel.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.feeds.values().filter(|feed| feed.is_active()).count()
    }

    /// Number of registered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    /// Public description of every entry.
    #[must_use]
    pub fn infos(&self) -> Vec<SubscriptionInfo> {
        self.feeds.values().map(ChangeFeed::info).collect()
    }

    fn record(&self) {
        SubscriptionMetrics::record_active(self.active_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tikit_realtime_core::topic::{FilterKey, Topic};

    fn key(filter: &str) -> SubscriptionKey {
        SubscriptionKey::new(Topic::Leaderboard, FilterKey::new(filter))
    }

    #[test]
    fn duplicate_subscribe_is_reference_counted() {
        let mut registry = SubscriptionRegistry::new();

        assert_eq!(registry.subscribe(key("evt-1")), SubscribeOutcome::Created);
        assert_eq!(
            registry.subscribe(key("evt-1")),
            SubscribeOutcome::Shared { ref_count: 2 }
        );
        assert_eq!(registry.len(), 1);

        assert_eq!(
            registry.unsubscribe(&key("evt-1")),
            UnsubscribeOutcome::Released { remaining: 1 }
        );
        assert_eq!(
            registry.unsubscribe(&key("evt-1")),
            UnsubscribeOutcome::Removed { was_active: false }
        );
        assert_eq!(
            registry.unsubscribe(&key("evt-1")),
            UnsubscribeOutcome::Unknown
        );
    }

    #[test]
    fn only_active_entries_receive_changes() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(key("evt-1"));
        assert!(registry.route(&key("evt-1")).is_none());

        registry.activate(&key("evt-1"));
        assert!(registry.route(&key("evt-1")).is_some());
        assert_eq!(registry.active_count(), 1);

        registry.deactivate_all();
        assert!(registry.route(&key("evt-1")).is_none());
        assert_eq!(registry.keys(), vec![key("evt-1")]);
    }

    #[test]
    fn removing_an_active_entry_requests_channel_unsubscribe() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(key("evt-1"));
        registry.activate(&key("evt-1"));

        assert_eq!(
            registry.unsubscribe(&key("evt-1")),
            UnsubscribeOutcome::Removed { was_active: true }
        );
        assert!(registry.infos().is_empty());
    }
}
