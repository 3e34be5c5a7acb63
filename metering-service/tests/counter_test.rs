//! Quota counter window tests.

mod common;

use chrono::Duration;
use common::{harness, start_time};
use metering_service::models::window::{self, Granularity};
use metering_service::services::CounterStore;
use uuid::Uuid;

#[tokio::test]
async fn windows_are_isolated_between_organizations() {
    let h = harness();
    let org_a = Uuid::new_v4();
    let org_b = Uuid::new_v4();
    let now = start_time();

    let key_a = window::minute_key(org_a, "chat", now);
    let key_b = window::minute_key(org_b, "chat", now);

    for _ in 0..5 {
        h.counters.increment(&key_a, 1, 60).await.unwrap();
    }

    assert_eq!(h.counters.peek(&key_a).await.unwrap(), 5);
    assert_eq!(h.counters.peek(&key_b).await.unwrap(), 0);
}

#[tokio::test]
async fn minute_increments_do_not_touch_day_or_month_windows() {
    let h = harness();
    let org = Uuid::new_v4();
    let now = start_time();

    h.counters
        .increment(&window::minute_key(org, "chat", now), 1, 60)
        .await
        .unwrap();

    assert_eq!(
        h.counters.peek(&window::day_key(org, now)).await.unwrap(),
        0
    );
    assert_eq!(
        h.counters.peek(&window::month_key(org, now)).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn counts_increase_monotonically_within_a_window() {
    let h = harness();
    let org = Uuid::new_v4();
    let key = window::day_key(org, start_time());
    let ttl = window::window_ttl_secs(Granularity::Day, start_time());

    let mut last = 0;
    for _ in 0..20 {
        let count = h.counters.increment(&key, 1, ttl).await.unwrap();
        assert!(count > last, "counts must strictly increase: {count} after {last}");
        last = count;

        let peeked = h.counters.peek(&key).await.unwrap();
        assert!(peeked >= last, "peek ({peeked}) fell below last increment ({last})");
    }
}

#[tokio::test]
async fn counter_resets_once_its_window_has_passed() {
    let h = harness();
    let org = Uuid::new_v4();
    let key = window::minute_key(org, "chat", start_time());

    h.counters.increment(&key, 3, 60).await.unwrap();
    assert_eq!(h.counters.peek(&key).await.unwrap(), 3);

    h.clock.advance(Duration::seconds(61));
    assert_eq!(h.counters.peek(&key).await.unwrap(), 0);
}

#[tokio::test]
async fn ttl_is_anchored_to_the_first_increment() {
    let h = harness();
    let org = Uuid::new_v4();
    let key = window::minute_key(org, "chat", start_time());

    h.counters.increment(&key, 1, 60).await.unwrap();
    h.clock.advance(Duration::seconds(50));
    // A later increment must not extend the original expiry.
    h.counters.increment(&key, 1, 60).await.unwrap();

    h.clock.advance(Duration::seconds(11));
    assert_eq!(h.counters.peek(&key).await.unwrap(), 0);
}

#[tokio::test]
async fn increment_after_expiry_starts_a_fresh_count() {
    let h = harness();
    let org = Uuid::new_v4();
    let key = window::minute_key(org, "chat", start_time());

    h.counters.increment(&key, 5, 60).await.unwrap();
    h.clock.advance(Duration::seconds(61));

    let count = h.counters.increment(&key, 1, 60).await.unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn purge_drops_expired_entries() {
    let h = harness();
    let org = Uuid::new_v4();
    let minute = window::minute_key(org, "chat", start_time());
    let day = window::day_key(org, start_time());

    h.counters.increment(&minute, 1, 60).await.unwrap();
    h.counters.increment(&day, 1, 86_400).await.unwrap();

    h.clock.advance(Duration::seconds(120));
    h.counters.purge_expired();

    assert_eq!(h.counters.peek(&minute).await.unwrap(), 0);
    assert_eq!(h.counters.peek(&day).await.unwrap(), 1);
}
