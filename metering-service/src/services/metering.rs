//! Metering facade: the surface the API layer calls.
//!
//! One explicit service object constructed at process start and handed to
//! request handlers by reference; no module-level state.

use crate::models::window;
use crate::models::{
    BillingCycle, CreateOrganization, Invoice, IssueApiKey, IssuedApiKey, Organization, Tier,
    UsageSummary,
};
use crate::services::billing::BillingCalculator;
use crate::services::clock::Clock;
use crate::services::counter::CounterStore;
use crate::services::ledger::UsageLedger;
use crate::services::metrics;
use crate::services::rate_limiter::{Decision, RateLimiter};
use crate::services::subscription::{EffectiveLimits, SubscriptionManager};
use crate::services::TierCatalog;
use chrono::{DateTime, Duration, Utc};
use metering_core::error::AppError;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Outcome of `check_and_reserve`.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub org_id: Uuid,
    pub api_key_id: Uuid,
    pub decision: Decision,
}

impl Reservation {
    pub fn is_allowed(&self) -> bool {
        self.decision.is_allowed()
    }
}

pub struct MeteringService {
    subscriptions: SubscriptionManager,
    limiter: RateLimiter,
    billing: BillingCalculator,
    ledger: Arc<dyn UsageLedger>,
    counters: Arc<dyn CounterStore>,
    catalog: TierCatalog,
    clock: Arc<dyn Clock>,
}

impl MeteringService {
    pub fn new(
        subscriptions: SubscriptionManager,
        limiter: RateLimiter,
        billing: BillingCalculator,
        ledger: Arc<dyn UsageLedger>,
        counters: Arc<dyn CounterStore>,
        catalog: TierCatalog,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            subscriptions,
            limiter,
            billing,
            ledger,
            counters,
            catalog,
            clock,
        }
    }

    /// Resolve the bearer token, run the quota check, and on Allowed take
    /// the pre-handler minute-window reservation. The reservation happens
    /// here, before the handler runs, so cancelled or failed requests
    /// still consume rate-limit budget.
    #[instrument(skip(self, token), fields(endpoint = %endpoint))]
    pub async fn check_and_reserve(
        &self,
        token: &str,
        endpoint: &str,
    ) -> Result<Reservation, AppError> {
        let (org, key) = self.subscriptions.resolve_key(token).await?;
        if !key.allows(endpoint) {
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "API key does not permit endpoint {}",
                endpoint
            )));
        }

        let tenant = org.org_id.to_string();
        let decision = self.limiter.check(&org, endpoint).await?;
        match &decision {
            Decision::Allowed => {
                self.limiter.reserve(&org, endpoint).await?;
                if let Err(e) = self.subscriptions.note_key_usage(key.key_id).await {
                    warn!(error = %e, key_id = %key.key_id, "Failed to update key usage counters");
                }
                metrics::record_quota_check(&tenant, "allowed");
            }
            Decision::Denied { window, .. } => {
                metrics::record_quota_check(&tenant, "denied");
                metrics::record_quota_denied(&tenant, window.as_str());
            }
        }

        Ok(Reservation {
            org_id: org.org_id,
            api_key_id: key.key_id,
            decision,
        })
    }

    /// Post-handler accounting. Ledger write failures are logged and
    /// counted but never block the call: the quota increment has already
    /// happened and the response has already been served.
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
    ) -> Result<(), AppError> {
        let is_video = self.limiter.is_video_endpoint(endpoint);
        let tenant = org_id.to_string();

        match self
            .limiter
            .commit(
                org_id,
                api_key_id,
                endpoint,
                cost,
                succeeded,
                status_code,
                latency_ms,
            )
            .await
        {
            Ok(_) => {}
            Err(AppError::LedgerWrite(err)) => {
                warn!(error = %err, tenant_id = %tenant, "Usage ledger append failed");
                metrics::record_ledger_write_failure(&tenant);
            }
            Err(other) => return Err(other),
        }

        if succeeded {
            self.subscriptions
                .note_usage(org_id, i64::from(cost), if is_video { 1 } else { 0 })
                .await?;
        }
        metrics::record_usage_committed(&tenant, succeeded);
        Ok(())
    }

    /// Dashboard summary over the trailing `period_days`.
    pub async fn get_usage_summary(
        &self,
        org_id: Uuid,
        period_days: i64,
    ) -> Result<UsageSummary, AppError> {
        let org = self.subscriptions.organization(org_id).await?;
        let limits = self.catalog.limits_for(org.tier);
        let now = self.clock.now();
        let period_start = now - Duration::days(period_days);

        let aggregate = self.ledger.aggregate(org_id, period_start, now).await?;
        let day = self.counters.peek(&window::day_key(org_id, now)).await?;
        let month = self.counters.peek(&window::month_key(org_id, now)).await?;
        let videos = self
            .counters
            .peek(&window::video_month_key(org_id, now))
            .await?;

        Ok(UsageSummary {
            org_id,
            tier: org.tier,
            limits: limits.clone(),
            period_start,
            period_end: now,
            aggregate,
            remaining_daily_calls: (limits.daily_api_calls - day).max(0),
            remaining_monthly_calls: (limits.monthly_api_calls - month).max(0),
            remaining_video_generations: (limits.video_generations_monthly - videos).max(0),
        })
    }

    pub async fn upgrade_tier(
        &self,
        org_id: Uuid,
        new_tier: &str,
        cycle: BillingCycle,
    ) -> Result<EffectiveLimits, AppError> {
        let tier = Tier::parse(new_tier)
            .ok_or_else(|| AppError::UnknownTier(new_tier.to_string()))?;
        self.subscriptions.upgrade(org_id, tier, cycle).await
    }

    pub async fn downgrade_tier(
        &self,
        org_id: Uuid,
        new_tier: &str,
        cycle: BillingCycle,
    ) -> Result<EffectiveLimits, AppError> {
        let tier = Tier::parse(new_tier)
            .ok_or_else(|| AppError::UnknownTier(new_tier.to_string()))?;
        self.subscriptions.downgrade(org_id, tier, cycle).await
    }

    /// Invoked by the external scheduler at period boundaries.
    pub async fn generate_invoice(
        &self,
        org_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Invoice, AppError> {
        self.billing
            .compute_invoice(org_id, period_start, period_end)
            .await
    }

    /// Payment-processor callback.
    pub async fn record_payment_outcome(
        &self,
        invoice_id: Uuid,
        succeeded: bool,
    ) -> Result<Invoice, AppError> {
        self.billing.record_payment_outcome(invoice_id, succeeded).await
    }

    pub async fn create_organization(
        &self,
        input: CreateOrganization,
    ) -> Result<Organization, AppError> {
        self.subscriptions.create_organization(input).await
    }

    pub async fn organization(&self, org_id: Uuid) -> Result<Organization, AppError> {
        self.subscriptions.organization(org_id).await
    }

    pub async fn issue_api_key(&self, input: IssueApiKey) -> Result<IssuedApiKey, AppError> {
        self.subscriptions.issue_api_key(input).await
    }

    pub async fn revoke_api_key(&self, key_id: Uuid) -> Result<(), AppError> {
        self.subscriptions.revoke_api_key(key_id).await
    }

    pub async fn deactivate_organization(&self, org_id: Uuid) -> Result<Organization, AppError> {
        self.subscriptions.deactivate(org_id).await
    }

    pub async fn reset_period_counters(&self, org_id: Uuid) -> Result<(), AppError> {
        self.subscriptions.reset_period_counters(org_id).await
    }

    /// Health of the shared counter store, surfaced by readiness probes.
    pub async fn counter_store_health(&self) -> Result<(), AppError> {
        self.counters.health_check().await
    }

    /// Seconds-until-reset helper for the API layer's Retry-After header.
    pub fn retry_after(&self, decision: &Decision) -> Option<u64> {
        decision.retry_after_secs(self.clock.now())
    }
}
