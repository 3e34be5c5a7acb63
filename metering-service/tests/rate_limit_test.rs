//! Rate limiter enforcement tests.

mod common;

use chrono::Duration;
use common::{harness, start_time};
use metering_core::error::AppError;
use metering_service::models::window;
use metering_service::models::{BillingCycle, Organization, Tier};
use metering_service::services::{
    Clock, CounterStore, Decision, FailureMode, InMemoryUsageLedger, LimitWindow, ManualClock,
    QuotaPolicy, RateLimiter, TierCatalog, UsageLedger,
};
use std::sync::Arc;
use uuid::Uuid;

fn denied_window(decision: &Decision) -> LimitWindow {
    match decision {
        Decision::Denied { window, .. } => *window,
        Decision::Allowed => panic!("expected Denied, got Allowed"),
    }
}

#[tokio::test]
async fn eleventh_check_in_a_minute_is_denied_at_free_cap() {
    let h = harness();
    let org = h.org_with_tier("free", BillingCycle::Monthly).await;
    let token = h.issue_key(org.org_id).await;

    // Free tier allows 10 requests per minute.
    for i in 0..10 {
        let r = h.metering.check_and_reserve(&token, "chat").await.unwrap();
        assert!(r.is_allowed(), "request {i} should be allowed");
    }

    let r = h.metering.check_and_reserve(&token, "chat").await.unwrap();
    assert_eq!(denied_window(&r.decision), LimitWindow::Minute);

    let retry = r.decision.retry_after_secs(h.clock.now()).unwrap();
    assert!(retry <= 60, "minute window retry-after was {retry}");
}

#[tokio::test]
async fn minute_window_resets_after_the_minute_passes() {
    let h = harness();
    let org = h.org_with_tier("free", BillingCycle::Monthly).await;
    let token = h.issue_key(org.org_id).await;

    for _ in 0..10 {
        h.metering.check_and_reserve(&token, "chat").await.unwrap();
    }
    let r = h.metering.check_and_reserve(&token, "chat").await.unwrap();
    assert!(!r.is_allowed());

    h.clock.advance(Duration::seconds(60));
    let r = h.metering.check_and_reserve(&token, "chat").await.unwrap();
    assert!(r.is_allowed(), "new minute window should admit requests");
}

#[tokio::test]
async fn tightest_window_is_reported_when_several_are_over_cap() {
    let h = harness();
    let org = h.org_with_tier("free", BillingCycle::Monthly).await;
    let token = h.issue_key(org.org_id).await;
    let now = h.clock.now();

    // Put both the minute and month windows at cap; the minute violation
    // must win because it resets soonest.
    h.counters
        .increment(&window::minute_key(org.org_id, "chat", now), 10, 60)
        .await
        .unwrap();
    h.counters
        .increment(&window::month_key(org.org_id, now), 1_000, 86_400)
        .await
        .unwrap();

    let r = h.metering.check_and_reserve(&token, "chat").await.unwrap();
    assert_eq!(denied_window(&r.decision), LimitWindow::Minute);
}

#[tokio::test]
async fn day_cap_denies_with_day_window() {
    let h = harness();
    let org = h.org_with_tier("free", BillingCycle::Monthly).await;
    let token = h.issue_key(org.org_id).await;
    let now = h.clock.now();

    h.counters
        .increment(&window::day_key(org.org_id, now), 100, 86_400)
        .await
        .unwrap();

    let r = h.metering.check_and_reserve(&token, "chat").await.unwrap();
    assert_eq!(denied_window(&r.decision), LimitWindow::Day);
}

#[tokio::test]
async fn upgrade_takes_effect_on_the_very_next_check() {
    let h = harness();
    let org = h.org_with_tier("free", BillingCycle::Monthly).await;
    let token = h.issue_key(org.org_id).await;
    let now = h.clock.now();

    // Exactly at the free daily cap.
    h.counters
        .increment(&window::day_key(org.org_id, now), 100, 86_400)
        .await
        .unwrap();
    let r = h.metering.check_and_reserve(&token, "chat").await.unwrap();
    assert_eq!(denied_window(&r.decision), LimitWindow::Day);

    h.metering
        .upgrade_tier(org.org_id, "developer", BillingCycle::Monthly)
        .await
        .unwrap();

    // No grace period: developer's higher daily cap applies immediately and
    // the existing count of 100 is far below 2 000.
    let r = h.metering.check_and_reserve(&token, "chat").await.unwrap();
    assert!(r.is_allowed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overshoot_under_concurrency_is_bounded_by_in_flight_requests() {
    let h = harness();
    let org = h.org_with_tier("developer", BillingCycle::Monthly).await;
    let token = h.issue_key(org.org_id).await;
    let now = h.clock.now();

    // Developer allows 60/minute; start one below the cap.
    let minute_key = window::minute_key(org.org_id, "chat", now);
    h.counters.increment(&minute_key, 59, 60).await.unwrap();

    const IN_FLIGHT: usize = 8;
    let mut tasks = Vec::new();
    for _ in 0..IN_FLIGHT {
        let metering = h.metering.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            metering.check_and_reserve(&token, "chat").await.unwrap()
        }));
    }
    let mut allowed = 0;
    for task in tasks {
        if task.await.unwrap().is_allowed() {
            allowed += 1;
        }
    }

    let final_count = h.counters.peek(&minute_key).await.unwrap();
    assert!(allowed >= 1, "at least one racer crosses the cap");
    assert!(
        final_count <= 60 + IN_FLIGHT as i64,
        "overshoot must be bounded by in-flight requests, got {final_count}"
    );
}

#[tokio::test]
async fn video_generations_have_their_own_monthly_cap() {
    let h = harness();
    let org = h.org_with_tier("free", BillingCycle::Monthly).await;
    let token = h.issue_key(org.org_id).await;

    // Free tier includes 2 video generations per month.
    h.successful_call(&token, "video/generate").await;
    h.successful_call(&token, "video/generate").await;

    let r = h
        .metering
        .check_and_reserve(&token, "video/generate")
        .await
        .unwrap();
    assert_eq!(denied_window(&r.decision), LimitWindow::VideoMonth);

    // Non-video endpoints are unaffected by the video cap.
    let r = h.metering.check_and_reserve(&token, "chat").await.unwrap();
    assert!(r.is_allowed());
}

#[tokio::test]
async fn failed_requests_consume_rate_limit_but_are_not_billed() {
    let h = harness();
    let org = h.org_with_tier("developer", BillingCycle::Monthly).await;
    let token = h.issue_key(org.org_id).await;
    let now = h.clock.now();

    let r = h.metering.check_and_reserve(&token, "chat").await.unwrap();
    assert!(r.is_allowed());
    h.metering
        .commit(r.org_id, Some(r.api_key_id), "chat", 1, false, 500, Some(40))
        .await
        .unwrap();

    // The pre-handler reservation counted against the minute window...
    let minute = h
        .counters
        .peek(&window::minute_key(org.org_id, "chat", now))
        .await
        .unwrap();
    assert_eq!(minute, 1);

    // ...but the billing windows never advanced.
    let day = h
        .counters
        .peek(&window::day_key(org.org_id, now))
        .await
        .unwrap();
    assert_eq!(day, 0);

    let agg = h
        .ledger
        .aggregate(org.org_id, now - Duration::hours(1), now + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(agg.billable_calls, 0);
    assert_eq!(agg.total_calls, 1);
}

#[tokio::test]
async fn successful_commits_advance_day_and_month_windows() {
    let h = harness();
    let org = h.org_with_tier("developer", BillingCycle::Monthly).await;
    let token = h.issue_key(org.org_id).await;
    let now = h.clock.now();

    for _ in 0..3 {
        h.successful_call(&token, "chat").await;
    }

    assert_eq!(
        h.counters
            .peek(&window::day_key(org.org_id, now))
            .await
            .unwrap(),
        3
    );
    assert_eq!(
        h.counters
            .peek(&window::month_key(org.org_id, now))
            .await
            .unwrap(),
        3
    );

    let refreshed = h.metering.organization(org.org_id).await.unwrap();
    assert_eq!(refreshed.period_calls, 3);
    assert_eq!(refreshed.total_calls, 3);
}

// A counter store that is always down, for failure-policy tests.
struct FailingCounterStore;

#[async_trait::async_trait]
impl CounterStore for FailingCounterStore {
    async fn increment(&self, _key: &str, _amount: i64, _ttl: i64) -> Result<i64, AppError> {
        Err(AppError::StoreUnavailable(anyhow::anyhow!(
            "connection refused"
        )))
    }

    async fn peek(&self, _key: &str) -> Result<i64, AppError> {
        Err(AppError::StoreUnavailable(anyhow::anyhow!(
            "connection refused"
        )))
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Err(AppError::StoreUnavailable(anyhow::anyhow!(
            "connection refused"
        )))
    }
}

fn org_on(tier: Tier) -> Organization {
    let now = start_time();
    Organization {
        org_id: Uuid::new_v4(),
        name: "Acme Studios".to_string(),
        country: "US".to_string(),
        tier,
        billing_cycle: BillingCycle::Monthly,
        subscription_start: now,
        subscription_expires: None,
        total_calls: 0,
        total_video_generations: 0,
        period_calls: 0,
        period_video_generations: 0,
        is_active: true,
        created_utc: now,
        updated_utc: now,
    }
}

fn limiter_with_failing_store(mode: FailureMode, clock: Arc<ManualClock>) -> RateLimiter {
    RateLimiter::new(
        TierCatalog::new(),
        Arc::new(FailingCounterStore),
        Arc::new(InMemoryUsageLedger::new()),
        clock,
        QuotaPolicy {
            failure_mode: mode,
            fail_open_grace_secs: 30,
            video_endpoints: vec!["video/generate".to_string()],
        },
    )
}

#[tokio::test]
async fn fail_closed_surfaces_store_outage() {
    let clock = Arc::new(ManualClock::new(start_time()));
    let limiter = limiter_with_failing_store(FailureMode::FailClosed, clock);
    let org = org_on(Tier::Developer);

    let err = limiter.check(&org, "chat").await.unwrap_err();
    assert!(matches!(err, AppError::StoreUnavailable(_)));
}

#[tokio::test]
async fn fail_open_allows_within_grace_then_denies() {
    let clock = Arc::new(ManualClock::new(start_time()));
    let limiter = limiter_with_failing_store(FailureMode::FailOpen, clock.clone());
    let org = org_on(Tier::Developer);

    // Inside the grace window the outage is tolerated.
    let decision = limiter.check(&org, "chat").await.unwrap();
    assert!(decision.is_allowed());

    // Once the grace window is exhausted the outage surfaces.
    clock.advance(Duration::seconds(31));
    let err = limiter.check(&org, "chat").await.unwrap_err();
    assert!(matches!(err, AppError::StoreUnavailable(_)));
}
