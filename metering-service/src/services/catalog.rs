//! Static tier catalog.
//!
//! The single authority for tier limits. The original platform scattered
//! per-endpoint rate constants that disagreed with its tier table; here the
//! catalog is the only place a limit is defined.

use crate::models::{Tier, TierLimits};
use metering_core::error::AppError;
use once_cell::sync::Lazy;
use rust_decimal::Decimal;

static TIERS: Lazy<[TierLimits; 5]> = Lazy::new(|| {
    [
        TierLimits {
            tier: Tier::Free,
            monthly_api_calls: 1_000,
            daily_api_calls: 100,
            video_generations_monthly: 2,
            max_concurrent_requests: 2,
            rate_limit_per_minute: 10,
            custom_models: false,
            white_label: false,
            bulk_processing: false,
            priority_support: false,
            advanced_analytics: false,
            sla_uptime: 99.0,
            monthly_price: Decimal::ZERO,
            yearly_price: Decimal::ZERO,
            // Free usage past the cap is denied, never billed.
            overage_per_call: Decimal::ZERO,
            overage_per_video: Decimal::ZERO,
        },
        TierLimits {
            tier: Tier::Developer,
            monthly_api_calls: 25_000,
            daily_api_calls: 2_000,
            video_generations_monthly: 20,
            max_concurrent_requests: 5,
            rate_limit_per_minute: 60,
            custom_models: false,
            white_label: false,
            bulk_processing: false,
            priority_support: false,
            advanced_analytics: true,
            sla_uptime: 99.5,
            monthly_price: Decimal::new(49, 0),
            yearly_price: Decimal::new(490, 0),
            overage_per_call: Decimal::new(1, 3),
            overage_per_video: Decimal::new(50, 2),
        },
        TierLimits {
            tier: Tier::Professional,
            monthly_api_calls: 250_000,
            daily_api_calls: 15_000,
            video_generations_monthly: 100,
            max_concurrent_requests: 20,
            rate_limit_per_minute: 300,
            custom_models: true,
            white_label: false,
            bulk_processing: true,
            priority_support: true,
            advanced_analytics: true,
            sla_uptime: 99.9,
            monthly_price: Decimal::new(199, 0),
            yearly_price: Decimal::new(1_990, 0),
            overage_per_call: Decimal::new(8, 4),
            overage_per_video: Decimal::new(40, 2),
        },
        TierLimits {
            tier: Tier::Enterprise,
            monthly_api_calls: 2_000_000,
            daily_api_calls: 100_000,
            video_generations_monthly: 500,
            max_concurrent_requests: 100,
            rate_limit_per_minute: 1_200,
            custom_models: true,
            white_label: true,
            bulk_processing: true,
            priority_support: true,
            advanced_analytics: true,
            sla_uptime: 99.99,
            monthly_price: Decimal::new(999, 0),
            yearly_price: Decimal::new(9_990, 0),
            overage_per_call: Decimal::new(5, 4),
            overage_per_video: Decimal::new(25, 2),
        },
        TierLimits {
            tier: Tier::Custom,
            monthly_api_calls: 10_000_000,
            daily_api_calls: 500_000,
            video_generations_monthly: 2_000,
            max_concurrent_requests: 250,
            rate_limit_per_minute: 5_000,
            custom_models: true,
            white_label: true,
            bulk_processing: true,
            priority_support: true,
            advanced_analytics: true,
            sla_uptime: 99.99,
            monthly_price: Decimal::new(2_499, 0),
            yearly_price: Decimal::new(24_990, 0),
            overage_per_call: Decimal::new(3, 4),
            overage_per_video: Decimal::new(15, 2),
        },
    ]
});

/// Lookup over the static tier table. Pure and immutable, therefore
/// thread-safe.
#[derive(Debug, Clone, Copy, Default)]
pub struct TierCatalog;

impl TierCatalog {
    pub fn new() -> Self {
        Self
    }

    /// Limits for a tier. Total over the closed enum.
    pub fn limits_for(&self, tier: Tier) -> &'static TierLimits {
        match tier {
            Tier::Free => &TIERS[0],
            Tier::Developer => &TIERS[1],
            Tier::Professional => &TIERS[2],
            Tier::Enterprise => &TIERS[3],
            Tier::Custom => &TIERS[4],
        }
    }

    /// Limits for an externally supplied tier name.
    pub fn limits_for_name(&self, name: &str) -> Result<&'static TierLimits, AppError> {
        let tier = Tier::parse(name).ok_or_else(|| AppError::UnknownTier(name.to_string()))?;
        Ok(self.limits_for(tier))
    }

    pub fn all(&self) -> &'static [TierLimits] {
        &*TIERS
    }
}
