//! Test helper module for metering-service integration tests.
//!
//! Builds the metering facade over the in-memory stores with a manually
//! advanced clock, so window behavior is deterministic and the suite needs
//! no external infrastructure.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use metering_service::models::{BillingCycle, CreateOrganization, IssueApiKey, Organization};
use metering_service::services::{
    BillingCalculator, Clock, InMemoryApiKeyStore, InMemoryCounterStore, InMemoryInvoiceStore,
    InMemoryOrgStore, InMemoryUsageLedger, ManualClock, MeteringService, QuotaPolicy, RateLimiter,
    SubscriptionManager, TierCatalog,
};
use std::sync::Arc;
use uuid::Uuid;

/// Fixed start instant: mid-month, mid-day, so the first advances in a test
/// never cross a window boundary by accident.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 15, 10, 0, 0).unwrap()
}

pub struct TestHarness {
    pub clock: Arc<ManualClock>,
    pub counters: Arc<InMemoryCounterStore>,
    pub ledger: Arc<InMemoryUsageLedger>,
    pub orgs: Arc<InMemoryOrgStore>,
    pub invoices: Arc<InMemoryInvoiceStore>,
    pub metering: Arc<MeteringService>,
}

pub fn harness() -> TestHarness {
    harness_with_policy(QuotaPolicy::default())
}

pub fn harness_with_policy(policy: QuotaPolicy) -> TestHarness {
    let clock = Arc::new(ManualClock::new(start_time()));
    let clock_dyn: Arc<dyn Clock> = clock.clone();

    let counters = Arc::new(InMemoryCounterStore::new(clock_dyn.clone()));
    let ledger = Arc::new(InMemoryUsageLedger::new());
    let orgs = Arc::new(InMemoryOrgStore::new(clock_dyn.clone()));
    let keys = Arc::new(InMemoryApiKeyStore::new());
    let invoices = Arc::new(InMemoryInvoiceStore::new());
    let catalog = TierCatalog::new();

    let subscriptions =
        SubscriptionManager::new(orgs.clone(), keys, catalog, clock_dyn.clone());
    let limiter = RateLimiter::new(
        catalog,
        counters.clone(),
        ledger.clone(),
        clock_dyn.clone(),
        policy,
    );
    let billing = BillingCalculator::new(
        orgs.clone(),
        invoices.clone(),
        ledger.clone(),
        catalog,
        clock_dyn.clone(),
    );
    let metering = Arc::new(MeteringService::new(
        subscriptions,
        limiter,
        billing,
        ledger.clone(),
        counters.clone(),
        catalog,
        clock_dyn,
    ));

    TestHarness {
        clock,
        counters,
        ledger,
        orgs,
        invoices,
        metering,
    }
}

impl TestHarness {
    /// Create an organization and move it to the named tier.
    pub async fn org_with_tier(&self, tier: &str, cycle: BillingCycle) -> Organization {
        let org = self
            .metering
            .create_organization(CreateOrganization {
                name: "Acme Studios".to_string(),
                country: "US".to_string(),
                billing_cycle: cycle,
            })
            .await
            .unwrap();
        if tier != "free" {
            self.metering
                .upgrade_tier(org.org_id, tier, cycle)
                .await
                .unwrap();
        }
        self.metering.organization(org.org_id).await.unwrap()
    }

    /// Issue an unrestricted API key and return the plaintext token.
    pub async fn issue_key(&self, org_id: Uuid) -> String {
        self.metering
            .issue_api_key(IssueApiKey {
                org_id,
                label: "test".to_string(),
                permissions: vec![],
                expires_utc: None,
            })
            .await
            .unwrap()
            .token
    }

    /// Drive one full allowed request: reserve, then commit success.
    pub async fn successful_call(&self, token: &str, endpoint: &str) {
        let reservation = self
            .metering
            .check_and_reserve(token, endpoint)
            .await
            .unwrap();
        assert!(
            reservation.is_allowed(),
            "expected allowed, got {:?}",
            reservation.decision
        );
        self.metering
            .commit(
                reservation.org_id,
                Some(reservation.api_key_id),
                endpoint,
                1,
                true,
                200,
                Some(12),
            )
            .await
            .unwrap();
    }
}
