//! Domain models for metering-service.

mod api_key;
mod invoice;
mod organization;
mod tier;
mod usage;
pub mod window;

pub use api_key::{hash_token, ApiKey, IssueApiKey, IssuedApiKey};
pub use invoice::{Invoice, InvoiceStatus, ListInvoicesFilter};
pub use organization::{BillingCycle, CreateOrganization, Organization};
pub use tier::{Tier, TierLimits};
pub use usage::{
    EndpointUsage, ListUsageFilter, UsageAggregate, UsageEvent, UsageSummary,
};
pub use window::Granularity;
