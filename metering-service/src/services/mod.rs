//! Services module for metering-service.

pub mod billing;
pub mod catalog;
pub mod clock;
pub mod counter;
pub mod database;
pub mod ledger;
pub mod metering;
pub mod metrics;
pub mod rate_limiter;
pub mod store;
pub mod subscription;

pub use billing::{BillingCalculator, TaxTable};
pub use catalog::TierCatalog;
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterStore, InMemoryCounterStore, RedisCounterStore};
pub use database::Database;
pub use ledger::{InMemoryUsageLedger, UsageLedger};
pub use metering::{MeteringService, Reservation};
pub use metrics::{get_metrics, init_metrics};
pub use rate_limiter::{Decision, FailureMode, LimitWindow, QuotaPolicy, RateLimiter};
pub use store::{
    ApiKeyStore, InMemoryApiKeyStore, InMemoryInvoiceStore, InMemoryOrgStore, InvoiceStore,
    OrgStore,
};
pub use subscription::{EffectiveLimits, SubscriptionManager};
