//! Row-store traits for organizations, API keys, and invoices.
//!
//! Postgres implementations live in `database.rs`; the in-memory variants
//! here back the test harness and single-process deployments.

use crate::models::{
    ApiKey, BillingCycle, CreateOrganization, Invoice, InvoiceStatus, ListInvoicesFilter,
    Organization, Tier,
};
use crate::services::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metering_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[async_trait]
pub trait OrgStore: Send + Sync {
    async fn create_org(&self, input: &CreateOrganization) -> Result<Organization, AppError>;
    async fn get_org(&self, org_id: Uuid) -> Result<Organization, AppError>;
    /// Single-row tier reassignment; the new limits apply to the very next
    /// request.
    async fn set_tier(
        &self,
        org_id: Uuid,
        tier: Tier,
        cycle: BillingCycle,
        expires: Option<DateTime<Utc>>,
    ) -> Result<Organization, AppError>;
    async fn set_active(&self, org_id: Uuid, active: bool) -> Result<Organization, AppError>;
    async fn add_usage(&self, org_id: Uuid, calls: i64, videos: i64) -> Result<(), AppError>;
    async fn reset_period_counters(&self, org_id: Uuid) -> Result<(), AppError>;
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn insert_key(&self, key: &ApiKey) -> Result<(), AppError>;
    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<ApiKey>, AppError>;
    /// Soft delete; returns false when the key does not exist.
    async fn revoke_key(&self, key_id: Uuid) -> Result<bool, AppError>;
    async fn note_key_usage(&self, key_id: Uuid, when: DateTime<Utc>) -> Result<(), AppError>;
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Insert unless the (org, period) pair already has an invoice, in
    /// which case the existing one is returned untouched.
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<Invoice, AppError>;
    async fn find_for_period(
        &self,
        org_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError>;
    /// Payment-processor callback path.
    async fn set_status(
        &self,
        invoice_id: Uuid,
        status: InvoiceStatus,
    ) -> Result<Invoice, AppError>;
    async fn list_invoices(
        &self,
        org_id: Uuid,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, AppError>;
}

fn org_not_found(org_id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("organization {} not found", org_id))
}

pub struct InMemoryOrgStore {
    orgs: Mutex<HashMap<Uuid, Organization>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryOrgStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            orgs: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl OrgStore for InMemoryOrgStore {
    async fn create_org(&self, input: &CreateOrganization) -> Result<Organization, AppError> {
        let now = self.clock.now();
        let org = Organization {
            org_id: Uuid::new_v4(),
            name: input.name.clone(),
            country: input.country.clone(),
            tier: Tier::Free,
            billing_cycle: input.billing_cycle,
            subscription_start: now,
            subscription_expires: None,
            total_calls: 0,
            total_video_generations: 0,
            period_calls: 0,
            period_video_generations: 0,
            is_active: true,
            created_utc: now,
            updated_utc: now,
        };
        self.orgs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(org.org_id, org.clone());
        Ok(org)
    }

    async fn get_org(&self, org_id: Uuid) -> Result<Organization, AppError> {
        self.orgs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&org_id)
            .cloned()
            .ok_or_else(|| org_not_found(org_id))
    }

    async fn set_tier(
        &self,
        org_id: Uuid,
        tier: Tier,
        cycle: BillingCycle,
        expires: Option<DateTime<Utc>>,
    ) -> Result<Organization, AppError> {
        let mut orgs = self.orgs.lock().unwrap_or_else(|e| e.into_inner());
        let org = orgs.get_mut(&org_id).ok_or_else(|| org_not_found(org_id))?;
        org.tier = tier;
        org.billing_cycle = cycle;
        org.subscription_expires = expires;
        org.updated_utc = self.clock.now();
        Ok(org.clone())
    }

    async fn set_active(&self, org_id: Uuid, active: bool) -> Result<Organization, AppError> {
        let mut orgs = self.orgs.lock().unwrap_or_else(|e| e.into_inner());
        let org = orgs.get_mut(&org_id).ok_or_else(|| org_not_found(org_id))?;
        org.is_active = active;
        org.updated_utc = self.clock.now();
        Ok(org.clone())
    }

    async fn add_usage(&self, org_id: Uuid, calls: i64, videos: i64) -> Result<(), AppError> {
        let mut orgs = self.orgs.lock().unwrap_or_else(|e| e.into_inner());
        let org = orgs.get_mut(&org_id).ok_or_else(|| org_not_found(org_id))?;
        org.total_calls += calls;
        org.total_video_generations += videos;
        org.period_calls += calls;
        org.period_video_generations += videos;
        org.updated_utc = self.clock.now();
        Ok(())
    }

    async fn reset_period_counters(&self, org_id: Uuid) -> Result<(), AppError> {
        let mut orgs = self.orgs.lock().unwrap_or_else(|e| e.into_inner());
        let org = orgs.get_mut(&org_id).ok_or_else(|| org_not_found(org_id))?;
        org.period_calls = 0;
        org.period_video_generations = 0;
        org.updated_utc = self.clock.now();
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryApiKeyStore {
    keys: Mutex<HashMap<Uuid, ApiKey>>,
}

impl InMemoryApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApiKeyStore for InMemoryApiKeyStore {
    async fn insert_key(&self, key: &ApiKey) -> Result<(), AppError> {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.key_id, key.clone());
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<ApiKey>, AppError> {
        Ok(self
            .keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|k| k.token_hash == token_hash)
            .cloned())
    }

    async fn revoke_key(&self, key_id: Uuid) -> Result<bool, AppError> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        match keys.get_mut(&key_id) {
            Some(key) => {
                key.is_active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn note_key_usage(&self, key_id: Uuid, when: DateTime<Utc>) -> Result<(), AppError> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(key) = keys.get_mut(&key_id) {
            key.total_requests += 1;
            key.last_used_utc = Some(when);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryInvoiceStore {
    invoices: Mutex<Vec<Invoice>>,
}

impl InMemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvoiceStore for InMemoryInvoiceStore {
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<Invoice, AppError> {
        let mut invoices = self.invoices.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = invoices.iter().find(|i| {
            i.org_id == invoice.org_id
                && i.period_start == invoice.period_start
                && i.period_end == invoice.period_end
        }) {
            return Ok(existing.clone());
        }
        invoices.push(invoice.clone());
        Ok(invoice.clone())
    }

    async fn find_for_period(
        &self,
        org_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError> {
        Ok(self
            .invoices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|i| {
                i.org_id == org_id && i.period_start == period_start && i.period_end == period_end
            })
            .cloned())
    }

    async fn set_status(
        &self,
        invoice_id: Uuid,
        status: InvoiceStatus,
    ) -> Result<Invoice, AppError> {
        let mut invoices = self.invoices.lock().unwrap_or_else(|e| e.into_inner());
        let invoice = invoices
            .iter_mut()
            .find(|i| i.invoice_id == invoice_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("invoice {} not found", invoice_id)))?;
        invoice.status = status;
        Ok(invoice.clone())
    }

    async fn list_invoices(
        &self,
        org_id: Uuid,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, AppError> {
        let invoices = self.invoices.lock().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<Invoice> = invoices
            .iter()
            .filter(|i| i.org_id == org_id)
            .filter(|i| filter.status.is_none_or(|status| i.status == status))
            .filter(|i| filter.page_token.is_none_or(|token| i.period_start > token))
            .cloned()
            .collect();
        matched.sort_by_key(|i| i.period_start);
        if filter.page_size > 0 {
            matched.truncate(filter.page_size as usize);
        }
        Ok(matched)
    }
}
