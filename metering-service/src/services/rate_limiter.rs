//! Multi-window rate limiter.
//!
//! Composes the counter store across the minute/day/month windows and the
//! tier catalog to answer "is this call allowed" and to record usage.
//!
//! `check` followed by `reserve`/`commit` is deliberately not one atomic
//! transaction: under concurrency, requests in flight at the moment a limit
//! is crossed can each pass `check` before any of them increments, so the
//! final count may overshoot the cap by at most the number of in-flight
//! requests. Exact enforcement would serialize every request for a tenant;
//! approximate fairness does not.

use crate::models::window::{self, Granularity};
use crate::models::{Organization, UsageEvent};
use crate::services::clock::Clock;
use crate::services::counter::CounterStore;
use crate::services::ledger::UsageLedger;
use crate::services::metrics;
use crate::services::TierCatalog;
use chrono::{DateTime, Duration, Utc};
use metering_core::error::AppError;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use tracing::{instrument, warn};
use uuid::Uuid;

/// The specific limit a denial names, tightest window first so clients get
/// the soonest-to-reset feedback for backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitWindow {
    Minute,
    Day,
    Month,
    VideoMonth,
}

impl LimitWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitWindow::Minute => "minute",
            LimitWindow::Day => "day",
            LimitWindow::Month => "month",
            LimitWindow::VideoMonth => "video_month",
        }
    }

    fn granularity(&self) -> Granularity {
        match self {
            LimitWindow::Minute => Granularity::Minute,
            LimitWindow::Day => Granularity::Day,
            LimitWindow::Month | LimitWindow::VideoMonth => Granularity::Month,
        }
    }
}

/// Outcome of a quota check. Denied is a normal result, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allowed,
    Denied {
        window: LimitWindow,
        limit: i64,
        current: i64,
        reset_at: DateTime<Utc>,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    /// Seconds until the violated window resets, for Retry-After.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        match self {
            Decision::Allowed => None,
            Decision::Denied { reset_at, .. } => {
                Some((*reset_at - now).num_seconds().max(0) as u64)
            }
        }
    }
}

/// Behavior when the counter store is unreachable. Fail-closed protects
/// against abuse at the cost of availability; fail-open tolerates a grace
/// window of store downtime before denying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    FailClosed,
    FailOpen,
}

/// Operator policy for the limiter.
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    pub failure_mode: FailureMode,
    pub fail_open_grace_secs: i64,
    /// Endpoint prefixes counted against the video-generation quota.
    pub video_endpoints: Vec<String>,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::FailClosed,
            fail_open_grace_secs: 30,
            video_endpoints: vec!["video/generate".to_string()],
        }
    }
}

pub struct RateLimiter {
    catalog: TierCatalog,
    counters: Arc<dyn CounterStore>,
    ledger: Arc<dyn UsageLedger>,
    clock: Arc<dyn Clock>,
    policy: QuotaPolicy,
    first_store_failure: Mutex<Option<DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(
        catalog: TierCatalog,
        counters: Arc<dyn CounterStore>,
        ledger: Arc<dyn UsageLedger>,
        clock: Arc<dyn Clock>,
        policy: QuotaPolicy,
    ) -> Self {
        Self {
            catalog,
            counters,
            ledger,
            clock,
            policy,
            first_store_failure: Mutex::new(None),
        }
    }

    pub fn is_video_endpoint(&self, endpoint: &str) -> bool {
        self.policy
            .video_endpoints
            .iter()
            .any(|prefix| endpoint.starts_with(prefix.as_str()))
    }

    /// Read the minute/day/month counters for `org` and compare them
    /// against the tier's limits. When several windows are over cap at
    /// once, the tightest one is reported.
    #[instrument(skip(self, org), fields(tenant_id = %org.org_id, tier = %org.tier))]
    pub async fn check(&self, org: &Organization, endpoint: &str) -> Result<Decision, AppError> {
        let limits = self.catalog.limits_for(org.tier);
        let now = self.clock.now();

        let minute = self
            .read_counter(&window::minute_key(org.org_id, endpoint, now))
            .await?;
        if minute >= limits.rate_limit_per_minute {
            return Ok(self.denied(LimitWindow::Minute, limits.rate_limit_per_minute, minute, now));
        }

        let day = self.read_counter(&window::day_key(org.org_id, now)).await?;
        if day >= limits.daily_api_calls {
            return Ok(self.denied(LimitWindow::Day, limits.daily_api_calls, day, now));
        }

        let month = self
            .read_counter(&window::month_key(org.org_id, now))
            .await?;
        if month >= limits.monthly_api_calls {
            return Ok(self.denied(LimitWindow::Month, limits.monthly_api_calls, month, now));
        }

        if self.is_video_endpoint(endpoint) {
            let videos = self
                .read_counter(&window::video_month_key(org.org_id, now))
                .await?;
            if videos >= limits.video_generations_monthly {
                return Ok(self.denied(
                    LimitWindow::VideoMonth,
                    limits.video_generations_monthly,
                    videos,
                    now,
                ));
            }
        }

        Ok(Decision::Allowed)
    }

    /// Pre-handler minute-window increment. Runs before the handler so
    /// retry storms and cancelled requests still consume rate-limit budget.
    #[instrument(skip(self, org), fields(tenant_id = %org.org_id))]
    pub async fn reserve(&self, org: &Organization, endpoint: &str) -> Result<i64, AppError> {
        let now = self.clock.now();
        let key = window::minute_key(org.org_id, endpoint, now);
        let ttl = window::window_ttl_secs(Granularity::Minute, now);
        self.write_counter(&key, 1, ttl).await
    }

    /// Post-handler accounting: advance the day/month (and video) windows
    /// when the handler succeeded, then append the usage event. Failed
    /// requests are appended non-billable so they show up in error rates
    /// but never on an invoice.
    ///
    /// Counter increments happen before the ledger append; a ledger
    /// failure after the increments is a billing-accuracy problem, not a
    /// safety problem, and surfaces as `LedgerWrite`.
    #[instrument(skip(self), fields(tenant_id = %org_id, endpoint = %endpoint))]
    pub async fn commit(
        &self,
        org_id: Uuid,
        api_key_id: Option<Uuid>,
        endpoint: &str,
        cost: i32,
        succeeded: bool,
        status_code: i16,
        latency_ms: Option<i32>,
    ) -> Result<UsageEvent, AppError> {
        let now = self.clock.now();
        let is_video = self.is_video_endpoint(endpoint);

        if succeeded {
            let amount = i64::from(cost);
            self.write_counter(
                &window::day_key(org_id, now),
                amount,
                window::window_ttl_secs(Granularity::Day, now),
            )
            .await?;
            self.write_counter(
                &window::month_key(org_id, now),
                amount,
                window::window_ttl_secs(Granularity::Month, now),
            )
            .await?;
            if is_video {
                self.write_counter(
                    &window::video_month_key(org_id, now),
                    1,
                    window::window_ttl_secs(Granularity::Month, now),
                )
                .await?;
            }
        }

        let event = UsageEvent {
            event_id: Uuid::new_v4(),
            org_id,
            api_key_id,
            endpoint: endpoint.to_string(),
            occurred_utc: now,
            cost,
            billable: succeeded,
            is_video,
            status_code,
            latency_ms,
            created_utc: now,
        };

        self.ledger.append(&event).await.map_err(|e| match e {
            AppError::LedgerWrite(inner) => AppError::LedgerWrite(inner),
            other => AppError::LedgerWrite(anyhow::anyhow!(other)),
        })?;

        Ok(event)
    }

    fn denied(
        &self,
        limit_window: LimitWindow,
        limit: i64,
        current: i64,
        now: DateTime<Utc>,
    ) -> Decision {
        Decision::Denied {
            window: limit_window,
            limit,
            current,
            reset_at: window::reset_at(limit_window.granularity(), now),
        }
    }

    async fn read_counter(&self, key: &str) -> Result<i64, AppError> {
        match self.counters.peek(key).await {
            Ok(count) => {
                self.note_store_healthy();
                Ok(count)
            }
            Err(AppError::StoreUnavailable(err)) => self.apply_failure_policy(err),
            Err(other) => Err(other),
        }
    }

    async fn write_counter(&self, key: &str, amount: i64, ttl: i64) -> Result<i64, AppError> {
        match self.counters.increment(key, amount, ttl).await {
            Ok(count) => {
                self.note_store_healthy();
                Ok(count)
            }
            Err(AppError::StoreUnavailable(err)) => self.apply_failure_policy(err),
            Err(other) => Err(other),
        }
    }

    fn note_store_healthy(&self) {
        let mut first = self
            .first_store_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *first = None;
    }

    /// Fail-closed propagates the outage; fail-open tolerates it for the
    /// configured grace window (measured from the first observed failure)
    /// by treating the counter as empty, then propagates. No internal
    /// retries: retry-with-backoff belongs to the caller, where it cannot
    /// amplify load during an outage.
    fn apply_failure_policy(&self, err: anyhow::Error) -> Result<i64, AppError> {
        match self.policy.failure_mode {
            FailureMode::FailClosed => {
                metrics::record_store_failure("fail_closed");
                Err(AppError::StoreUnavailable(err))
            }
            FailureMode::FailOpen => {
                let now = self.clock.now();
                let mut first = self
                    .first_store_failure
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                let since = *first.get_or_insert(now);
                if now - since <= Duration::seconds(self.policy.fail_open_grace_secs) {
                    warn!(error = %err, "Counter store unavailable; failing open within grace window");
                    metrics::record_store_failure("fail_open");
                    Ok(0)
                } else {
                    metrics::record_store_failure("grace_exhausted");
                    Err(AppError::StoreUnavailable(err))
                }
            }
        }
    }
}
