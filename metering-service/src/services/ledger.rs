//! Usage ledger: the append-only record of billable events.

use crate::models::{EndpointUsage, ListUsageFilter, UsageAggregate, UsageEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metering_core::error::AppError;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Durable append. Never fails silently: a store failure surfaces as
    /// `LedgerWrite`, which callers log and count but do not use to block
    /// the already-served response.
    async fn append(&self, event: &UsageEvent) -> Result<(), AppError>;

    /// Events for one organization in `[start, end)`, timestamp ascending.
    /// Restartable via the filter's page token.
    async fn query(
        &self,
        org_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &ListUsageFilter,
    ) -> Result<Vec<UsageEvent>, AppError>;

    /// Read-side rollup over `[start, end)`, consistent with the raw
    /// events.
    async fn aggregate(
        &self,
        org_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageAggregate, AppError>;
}

/// Fold a set of events into an aggregate. Shared by the in-memory ledger
/// and tests; the Postgres implementation produces the same shape from a
/// grouped query.
pub(crate) fn fold_events<'a>(events: impl Iterator<Item = &'a UsageEvent>) -> UsageAggregate {
    let mut agg = UsageAggregate::empty();
    let mut by_endpoint: BTreeMap<String, EndpointUsage> = BTreeMap::new();
    let mut requests = 0i64;
    let mut errors = 0i64;
    let mut latency_sum = 0i64;
    let mut latency_count = 0i64;

    for event in events {
        let cost = i64::from(event.cost);
        requests += 1;
        agg.total_calls += cost;
        if event.billable {
            agg.billable_calls += cost;
        }
        if event.is_video {
            agg.total_video_generations += 1;
            if event.billable {
                agg.billable_video_generations += 1;
            }
        }
        let is_error = event.status_code >= 400;
        if is_error {
            errors += 1;
        }
        if let Some(latency) = event.latency_ms {
            latency_sum += i64::from(latency);
            latency_count += 1;
        }

        let entry = by_endpoint
            .entry(event.endpoint.clone())
            .or_insert_with(|| EndpointUsage {
                endpoint: event.endpoint.clone(),
                requests: 0,
                cost_units: 0,
                errors: 0,
            });
        entry.requests += 1;
        entry.cost_units += cost;
        if is_error {
            entry.errors += 1;
        }
    }

    agg.per_endpoint = by_endpoint.into_values().collect();
    agg.error_rate = if requests > 0 {
        errors as f64 / requests as f64
    } else {
        0.0
    };
    agg.avg_latency_ms = if latency_count > 0 {
        latency_sum as f64 / latency_count as f64
    } else {
        0.0
    };
    agg
}

/// In-process ledger for tests and single-instance deployments. Appends
/// never conflict; the vector only grows.
#[derive(Default)]
pub struct InMemoryUsageLedger {
    events: Mutex<Vec<UsageEvent>>,
}

impl InMemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UsageLedger for InMemoryUsageLedger {
    async fn append(&self, event: &UsageEvent) -> Result<(), AppError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }

    async fn query(
        &self,
        org_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &ListUsageFilter,
    ) -> Result<Vec<UsageEvent>, AppError> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<UsageEvent> = events
            .iter()
            .filter(|e| e.org_id == org_id)
            .filter(|e| e.occurred_utc >= start && e.occurred_utc < end)
            .filter(|e| {
                filter
                    .endpoint
                    .as_ref()
                    .is_none_or(|endpoint| &e.endpoint == endpoint)
            })
            .filter(|e| filter.billable.is_none_or(|billable| e.billable == billable))
            .filter(|e| {
                filter
                    .page_token
                    .is_none_or(|token| e.occurred_utc > token)
            })
            .cloned()
            .collect();
        matched.sort_by_key(|e| e.occurred_utc);
        if filter.page_size > 0 {
            matched.truncate(filter.page_size as usize);
        }
        Ok(matched)
    }

    async fn aggregate(
        &self,
        org_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageAggregate, AppError> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        Ok(fold_events(events.iter().filter(|e| {
            e.org_id == org_id && e.occurred_utc >= start && e.occurred_utc < end
        })))
    }
}
