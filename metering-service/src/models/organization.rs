//! Organization (tenant) model.

use super::Tier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Billing cycle for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "yearly" => BillingCycle::Yearly,
            _ => BillingCycle::Monthly,
        }
    }
}

/// Organization: the billing and quota unit. One customer account,
/// potentially with many users and API keys.
///
/// Tier is mutated only by the subscription manager; lifetime and
/// current-period counters only by commit. Organizations are deactivated,
/// never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub org_id: Uuid,
    pub name: String,
    pub country: String,
    pub tier: Tier,
    pub billing_cycle: BillingCycle,
    pub subscription_start: DateTime<Utc>,
    pub subscription_expires: Option<DateTime<Utc>>,
    pub total_calls: i64,
    pub total_video_generations: i64,
    pub period_calls: i64,
    pub period_video_generations: i64,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for creating an organization. New organizations always start on
/// the Free tier.
#[derive(Debug, Clone)]
pub struct CreateOrganization {
    pub name: String,
    pub country: String,
    pub billing_cycle: BillingCycle,
}
