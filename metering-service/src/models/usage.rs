//! Usage event and aggregate models.

use super::{Tier, TierLimits};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A single billable (or failed, non-billable) API request. Append-only;
/// never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageEvent {
    pub event_id: Uuid,
    pub org_id: Uuid,
    pub api_key_id: Option<Uuid>,
    pub endpoint: String,
    pub occurred_utc: DateTime<Utc>,
    /// Cost in request units; quota windows advance by this amount.
    pub cost: i32,
    /// Set only when the handler completed successfully; failed requests
    /// are recorded for error-rate analytics but never billed.
    pub billable: bool,
    pub is_video: bool,
    pub status_code: i16,
    pub latency_ms: Option<i32>,
    pub created_utc: DateTime<Utc>,
}

/// Filter parameters for listing usage events.
#[derive(Debug, Clone, Default)]
pub struct ListUsageFilter {
    pub endpoint: Option<String>,
    pub billable: Option<bool>,
    pub page_size: i32,
    /// Resume after this timestamp (events are returned ascending).
    pub page_token: Option<DateTime<Utc>>,
}

/// Per-endpoint usage rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointUsage {
    pub endpoint: String,
    pub requests: i64,
    pub cost_units: i64,
    pub errors: i64,
}

/// Read-side summary over a period. Consistent with the raw events it is
/// derived from: no double counting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageAggregate {
    /// Total request units over the period, billable or not.
    pub total_calls: i64,
    /// Request units from successful requests; this is what billing uses.
    pub billable_calls: i64,
    pub total_video_generations: i64,
    pub billable_video_generations: i64,
    pub per_endpoint: Vec<EndpointUsage>,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
}

impl UsageAggregate {
    pub fn empty() -> Self {
        Self {
            total_calls: 0,
            billable_calls: 0,
            total_video_generations: 0,
            billable_video_generations: 0,
            per_endpoint: Vec::new(),
            error_rate: 0.0,
            avg_latency_ms: 0.0,
        }
    }
}

/// Dashboard-facing usage summary: the aggregate plus tier limits and
/// remaining headroom.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub org_id: Uuid,
    pub tier: Tier,
    pub limits: TierLimits,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub aggregate: UsageAggregate,
    pub remaining_daily_calls: i64,
    pub remaining_monthly_calls: i64,
    pub remaining_video_generations: i64,
}
