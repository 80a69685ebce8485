//! Property tests for the reconciler merge policies.

#![allow(clippy::unwrap_used)] // Test code

use chrono::{DateTime, TimeDelta, Utc};
use proptest::prelude::*;
use serde_json::json;
use tikit_realtime::reconciler::{Reconciler, TopicData};
use tikit_realtime::{CapacitySnapshot, LeaderboardSnapshot, NotificationList, ViewConfig};
use tikit_realtime_core::change::{ChangeEnvelope, ChangeOperation};
use tikit_realtime_core::topic::{FilterKey, SubscriptionKey, Topic};

fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::UNIX_EPOCH + TimeDelta::seconds(seconds)
}

fn envelope(topic: Topic, operation: ChangeOperation, row: serde_json::Value, ts: i64) -> ChangeEnvelope {
    ChangeEnvelope {
        topic,
        filter_key: FilterKey::new("k"),
        operation,
        row,
        server_timestamp: at(ts),
    }
}

fn reconciler_for(topic: Topic, limits: ViewConfig) -> (Reconciler, SubscriptionKey) {
    let key = SubscriptionKey::new(topic, FilterKey::new("k"));
    let mut reconciler = Reconciler::new(limits);
    reconciler.ensure_view(&key);
    (reconciler, key)
}

fn data<T: TopicData>(reconciler: &Reconciler, key: &SubscriptionKey) -> Option<T> {
    T::view_of(reconciler.view(key)?)?.data.clone()
}

#[derive(Clone, Debug)]
enum InboxOp {
    Insert { id: u8, read: bool, ts: i64 },
    Update { id: u8, read: bool, ts: i64 },
    Delete { id: u8 },
}

fn inbox_op() -> impl Strategy<Value = InboxOp> {
    prop_oneof![
        (0u8..12, any::<bool>(), 0i64..100).prop_map(|(id, read, ts)| InboxOp::Insert { id, read, ts }),
        (0u8..12, any::<bool>(), 0i64..100).prop_map(|(id, read, ts)| InboxOp::Update { id, read, ts }),
        (0u8..12).prop_map(|id| InboxOp::Delete { id }),
    ]
}

fn inbox_change(op: &InboxOp) -> ChangeEnvelope {
    let topic = Topic::UserNotifications;
    match *op {
        InboxOp::Insert { id, read, ts } => envelope(
            topic,
            ChangeOperation::Insert,
            json!({"id": format!("n{id}"), "read": read, "created_at": at(ts).to_rfc3339()}),
            ts,
        ),
        InboxOp::Update { id, read, ts } => envelope(
            topic,
            ChangeOperation::Update,
            json!({"id": format!("n{id}"), "read": read, "created_at": at(ts).to_rfc3339()}),
            ts,
        ),
        InboxOp::Delete { id } => envelope(topic, ChangeOperation::Delete, json!({"id": format!("n{id}")}), 0),
    }
}

proptest! {
    #[test]
    fn unread_count_matches_unread_items(ops in prop::collection::vec(inbox_op(), 1..60)) {
        let limits = ViewConfig {
            notification_max_retained: 5,
            ..ViewConfig::default()
        };
        let (mut reconciler, key) = reconciler_for(Topic::UserNotifications, limits);

        for op in &ops {
            reconciler.apply_change(&inbox_change(op)).unwrap();
            let list: NotificationList = data(&reconciler, &key).unwrap_or_default();

            let unread = list.items().iter().filter(|item| !item.read).count();
            prop_assert_eq!(list.unread_count(), unread);
            prop_assert!(list.len() <= 5);
            prop_assert!(list.items().windows(2).all(|pair| pair[0].created_at >= pair[1].created_at));
        }
    }

    #[test]
    fn newest_row_decides_read_state(
        ops in prop::collection::vec((0u8..6, any::<bool>(), any::<bool>(), 0i64..100), 1..60),
    ) {
        let (mut reconciler, key) = reconciler_for(Topic::UserNotifications, ViewConfig::default());
        for (id, read, insert, ts) in &ops {
            let operation = if *insert { ChangeOperation::Insert } else { ChangeOperation::Update };
            let row = json!({"id": format!("n{id}"), "read": read, "created_at": at(i64::from(*id)).to_rfc3339()});
            reconciler
                .apply_change(&envelope(Topic::UserNotifications, operation, row, *ts))
                .unwrap();
        }

        let list: NotificationList = data(&reconciler, &key).unwrap();
        for item in list.items() {
            let id = item.id.trim_start_matches('n').parse::<u8>().unwrap();
            let newest = ops.iter().filter(|op| op.0 == id).map(|op| op.3).max().unwrap();
            let expected = ops.iter().find(|op| op.0 == id && op.3 == newest).unwrap().1;
            prop_assert_eq!(item.read, expected);
        }
        let unread = list.items().iter().filter(|item| !item.read).count();
        prop_assert_eq!(list.unread_count(), unread);
    }

    #[test]
    fn capacity_converges_to_the_newest_row(updates in prop::collection::vec((0u32..500, 0i64..1000), 1..40)) {
        let (mut reconciler, key) = reconciler_for(Topic::EventCapacity, ViewConfig::default());
        for (sold, ts) in &updates {
            let row = json!({"capacity": 500, "sold_tickets": sold, "updated_at": at(*ts).to_rfc3339()});
            reconciler.apply_change(&envelope(Topic::EventCapacity, ChangeOperation::Update, row, *ts)).unwrap();
        }

        let newest = updates.iter().map(|(_, ts)| *ts).max().unwrap();
        let first_newest = updates.iter().find(|(_, ts)| *ts == newest).unwrap().0;
        let snapshot: CapacitySnapshot = data(&reconciler, &key).unwrap();
        prop_assert_eq!(snapshot.updated_at, at(newest));
        prop_assert_eq!(snapshot.sold_tickets, first_newest);
    }

    #[test]
    fn replaying_changes_is_idempotent(rows in prop::collection::vec((0u8..10, 0u64..10_000, 0i64..100), 1..40)) {
        let (mut reconciler, key) = reconciler_for(Topic::Leaderboard, ViewConfig::default());
        let changes: Vec<ChangeEnvelope> = rows
            .iter()
            .map(|(id, amount, ts)| {
                envelope(
                    Topic::Leaderboard,
                    ChangeOperation::Update,
                    json!({"participant_id": format!("p{id}"), "amount": amount, "updated_at": at(*ts).to_rfc3339()}),
                    *ts,
                )
            })
            .collect();

        for change in &changes {
            reconciler.apply_change(change).unwrap();
        }
        let once: LeaderboardSnapshot = data(&reconciler, &key).unwrap();

        for change in &changes {
            reconciler.apply_change(change).unwrap();
        }
        let twice: LeaderboardSnapshot = data(&reconciler, &key).unwrap();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn snapshot_and_incremental_paths_agree(amounts in prop::collection::btree_map(0u8..30, 0u64..10_000, 1..25)) {
        let rows: Vec<serde_json::Value> = amounts
            .iter()
            .map(|(id, amount)| json!({"participant_id": format!("p{id}"), "amount": amount, "updated_at": at(i64::from(*id)).to_rfc3339()}))
            .collect();

        let (mut incremental, key) = reconciler_for(Topic::Leaderboard, ViewConfig::default());
        for (index, row) in rows.iter().enumerate() {
            let ts = i64::try_from(index).unwrap();
            incremental
                .apply_change(&envelope(Topic::Leaderboard, ChangeOperation::Insert, row.clone(), ts))
                .unwrap();
        }

        let (mut fetched, _) = reconciler_for(Topic::Leaderboard, ViewConfig::default());
        fetched.apply_snapshot(&key, &serde_json::Value::Array(rows), at(1_000)).unwrap();

        let left: LeaderboardSnapshot = data(&incremental, &key).unwrap();
        let right: LeaderboardSnapshot = data(&fetched, &key).unwrap();
        prop_assert_eq!(left, right);
    }
}
