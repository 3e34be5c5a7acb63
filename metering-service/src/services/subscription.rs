//! Subscription manager: organization lifecycle, tier transitions, and API
//! key issuance.

use crate::models::{
    hash_token, ApiKey, BillingCycle, CreateOrganization, IssueApiKey, IssuedApiKey, Organization,
    Tier, TierLimits,
};
use crate::services::clock::Clock;
use crate::services::store::{ApiKeyStore, OrgStore};
use crate::services::{metrics, TierCatalog};
use chrono::Months;
use metering_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Limits in force after a tier change.
#[derive(Debug, Clone)]
pub struct EffectiveLimits {
    pub org_id: Uuid,
    pub tier: Tier,
    pub billing_cycle: BillingCycle,
    pub limits: TierLimits,
}

pub struct SubscriptionManager {
    orgs: Arc<dyn OrgStore>,
    keys: Arc<dyn ApiKeyStore>,
    catalog: TierCatalog,
    clock: Arc<dyn Clock>,
}

impl SubscriptionManager {
    pub fn new(
        orgs: Arc<dyn OrgStore>,
        keys: Arc<dyn ApiKeyStore>,
        catalog: TierCatalog,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orgs,
            keys,
            catalog,
            clock,
        }
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_organization(
        &self,
        input: CreateOrganization,
    ) -> Result<Organization, AppError> {
        let org = self.orgs.create_org(&input).await?;
        info!(tenant_id = %org.org_id, "Organization created at free tier");
        Ok(org)
    }

    pub async fn organization(&self, org_id: Uuid) -> Result<Organization, AppError> {
        self.orgs.get_org(org_id).await
    }

    /// Move an organization to a higher tier. Limits apply to the very
    /// next request; there is no grace period.
    pub async fn upgrade(
        &self,
        org_id: Uuid,
        new_tier: Tier,
        cycle: BillingCycle,
    ) -> Result<EffectiveLimits, AppError> {
        self.change_tier(org_id, new_tier, cycle).await
    }

    /// Move an organization to a lower tier. Downgrading below
    /// currently-consumed usage is allowed; the organization is simply
    /// over quota until the next window resets, which `check` reports as
    /// Denied.
    pub async fn downgrade(
        &self,
        org_id: Uuid,
        new_tier: Tier,
        cycle: BillingCycle,
    ) -> Result<EffectiveLimits, AppError> {
        self.change_tier(org_id, new_tier, cycle).await
    }

    #[instrument(skip(self), fields(tenant_id = %org_id, new_tier = %new_tier))]
    async fn change_tier(
        &self,
        org_id: Uuid,
        new_tier: Tier,
        cycle: BillingCycle,
    ) -> Result<EffectiveLimits, AppError> {
        let org = self.orgs.get_org(org_id).await?;
        let previous = org.tier;

        let now = self.clock.now();
        let expires = match cycle {
            BillingCycle::Monthly => now.checked_add_months(Months::new(1)),
            BillingCycle::Yearly => now.checked_add_months(Months::new(12)),
        };

        let updated = self.orgs.set_tier(org_id, new_tier, cycle, expires).await?;
        metrics::record_tier_change(
            &org_id.to_string(),
            previous.as_str(),
            new_tier.as_str(),
        );
        info!(
            tenant_id = %org_id,
            from = %previous,
            to = %new_tier,
            cycle = %cycle.as_str(),
            "Tier changed"
        );

        Ok(EffectiveLimits {
            org_id: updated.org_id,
            tier: updated.tier,
            billing_cycle: updated.billing_cycle,
            limits: self.catalog.limits_for(updated.tier).clone(),
        })
    }

    pub async fn deactivate(&self, org_id: Uuid) -> Result<Organization, AppError> {
        self.orgs.set_active(org_id, false).await
    }

    pub async fn reactivate(&self, org_id: Uuid) -> Result<Organization, AppError> {
        self.orgs.set_active(org_id, true).await
    }

    /// Issue a bearer token for an organization. The plaintext is returned
    /// once; only its digest is stored.
    #[instrument(skip(self, input), fields(tenant_id = %input.org_id))]
    pub async fn issue_api_key(&self, input: IssueApiKey) -> Result<IssuedApiKey, AppError> {
        let org = self.orgs.get_org(input.org_id).await?;
        if !org.is_active {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "organization {} is deactivated",
                org.org_id
            )));
        }

        let raw: [u8; 24] = rand::random();
        let token = format!("mk_{}", hex::encode(raw));

        let key = ApiKey {
            key_id: Uuid::new_v4(),
            org_id: org.org_id,
            label: input.label,
            token_hash: hash_token(&token),
            permissions: input.permissions,
            is_active: true,
            expires_utc: input.expires_utc,
            total_requests: 0,
            last_used_utc: None,
            created_utc: self.clock.now(),
        };
        self.keys.insert_key(&key).await?;
        info!(tenant_id = %org.org_id, key_id = %key.key_id, "API key issued");

        Ok(IssuedApiKey { token, key })
    }

    /// Resolve a bearer token to its organization and key, enforcing
    /// active flags and expiry.
    pub async fn resolve_key(&self, token: &str) -> Result<(Organization, ApiKey), AppError> {
        let key = self
            .keys
            .find_by_hash(&hash_token(token))
            .await?
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("unknown API key")))?;

        if !key.is_active {
            return Err(AppError::Unauthorized(anyhow::anyhow!("API key revoked")));
        }
        if key.is_expired(self.clock.now()) {
            return Err(AppError::Unauthorized(anyhow::anyhow!("API key expired")));
        }

        let org = self.orgs.get_org(key.org_id).await?;
        if !org.is_active {
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "organization is deactivated"
            )));
        }

        Ok((org, key))
    }

    pub async fn revoke_api_key(&self, key_id: Uuid) -> Result<(), AppError> {
        if self.keys.revoke_key(key_id).await? {
            info!(key_id = %key_id, "API key revoked");
            Ok(())
        } else {
            Err(AppError::NotFound(anyhow::anyhow!(
                "API key {} not found",
                key_id
            )))
        }
    }

    pub async fn note_key_usage(&self, key_id: Uuid) -> Result<(), AppError> {
        self.keys.note_key_usage(key_id, self.clock.now()).await
    }

    /// Mirror committed usage onto the organization's display counters.
    pub async fn note_usage(&self, org_id: Uuid, calls: i64, videos: i64) -> Result<(), AppError> {
        self.orgs.add_usage(org_id, calls, videos).await
    }

    /// Reset the current-period display counters; invoked at billing
    /// period boundaries by the external scheduler.
    pub async fn reset_period_counters(&self, org_id: Uuid) -> Result<(), AppError> {
        self.orgs.reset_period_counters(org_id).await
    }
}
