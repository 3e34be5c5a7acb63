//! Subscription tier model.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Developer,
    Professional,
    Enterprise,
    Custom,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Developer => "developer",
            Tier::Professional => "professional",
            Tier::Enterprise => "enterprise",
            Tier::Custom => "custom",
        }
    }

    /// Parse an externally supplied tier name. Unknown names are an error
    /// at the call site, never silently mapped to a default tier.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Tier::Free),
            "developer" => Some(Tier::Developer),
            "professional" => Some(Tier::Professional),
            "enterprise" => Some(Tier::Enterprise),
            "custom" => Some(Tier::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Static limits attached to a tier. Defined once at process start and
/// never mutated at runtime; a new tier is a code change, not a data write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    pub tier: Tier,
    pub monthly_api_calls: i64,
    pub daily_api_calls: i64,
    pub video_generations_monthly: i64,
    pub max_concurrent_requests: i32,
    pub rate_limit_per_minute: i64,
    pub custom_models: bool,
    pub white_label: bool,
    pub bulk_processing: bool,
    pub priority_support: bool,
    pub advanced_analytics: bool,
    pub sla_uptime: f64,
    pub monthly_price: Decimal,
    pub yearly_price: Decimal,
    pub overage_per_call: Decimal,
    pub overage_per_video: Decimal,
}
