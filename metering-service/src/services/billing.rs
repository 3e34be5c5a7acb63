//! Billing calculator: period aggregation, overage charges, invoices.

use crate::models::{Invoice, InvoiceStatus, Organization, BillingCycle};
use crate::services::clock::Clock;
use crate::services::ledger::UsageLedger;
use crate::services::store::{InvoiceStore, OrgStore};
use crate::services::{metrics, TierCatalog};
use chrono::{DateTime, Utc};
use metering_core::error::AppError;
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

// VAT/GST rates by ISO country code. Countries not listed bill tax-free.
static TAX_RATES: Lazy<HashMap<&'static str, Decimal>> = Lazy::new(|| {
    HashMap::from([
        ("AE", Decimal::new(5, 2)),
        ("DE", Decimal::new(19, 2)),
        ("FR", Decimal::new(20, 2)),
        ("GB", Decimal::new(20, 2)),
        ("ID", Decimal::new(11, 2)),
        ("MY", Decimal::new(8, 2)),
        ("SA", Decimal::new(15, 2)),
        ("TR", Decimal::new(20, 2)),
    ])
});

/// Static per-country tax lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaxTable;

impl TaxTable {
    pub fn rate_for(country: &str) -> Decimal {
        TAX_RATES.get(country).copied().unwrap_or(Decimal::ZERO)
    }
}

/// Deterministic per-(org, period) invoice number, so regeneration for the
/// same period can never mint a second distinct number.
fn invoice_number(org_id: Uuid, period_start: DateTime<Utc>) -> String {
    let org = org_id.simple().to_string();
    format!("INV-{}-{}-1", period_start.format("%Y%m%d"), &org[..8])
}

pub struct BillingCalculator {
    orgs: Arc<dyn OrgStore>,
    invoices: Arc<dyn InvoiceStore>,
    ledger: Arc<dyn UsageLedger>,
    catalog: TierCatalog,
    clock: Arc<dyn Clock>,
}

impl BillingCalculator {
    pub fn new(
        orgs: Arc<dyn OrgStore>,
        invoices: Arc<dyn InvoiceStore>,
        ledger: Arc<dyn UsageLedger>,
        catalog: TierCatalog,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orgs,
            invoices,
            ledger,
            catalog,
            clock,
        }
    }

    /// Compute the invoice for one closed billing period.
    ///
    /// Idempotent: a period that already has an invoice returns it
    /// unchanged. Mid-period tier changes bill the tier in effect at
    /// period end; proration is out of scope.
    #[instrument(skip(self), fields(tenant_id = %org_id))]
    pub async fn compute_invoice(
        &self,
        org_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Invoice, AppError> {
        if let Some(existing) = self
            .invoices
            .find_for_period(org_id, period_start, period_end)
            .await?
        {
            info!(
                tenant_id = %org_id,
                invoice_id = %existing.invoice_id,
                "Period already invoiced"
            );
            return Ok(existing);
        }

        let org = self.orgs.get_org(org_id).await?;
        let limits = self.catalog.limits_for(org.tier);
        let usage = self.ledger.aggregate(org_id, period_start, period_end).await?;

        let overage_calls = (usage.billable_calls - limits.monthly_api_calls).max(0);
        let overage_call_charge =
            (Decimal::from(overage_calls) * limits.overage_per_call).round_dp(2);

        let overage_videos =
            (usage.billable_video_generations - limits.video_generations_monthly).max(0);
        let overage_video_charge =
            (Decimal::from(overage_videos) * limits.overage_per_video).round_dp(2);

        let base_charge = base_charge(&org, limits.monthly_price, limits.yearly_price);
        let subtotal = (base_charge + overage_call_charge + overage_video_charge).round_dp(2);
        let tax = (subtotal * TaxTable::rate_for(&org.country)).round_dp(2);
        let total = subtotal + tax;

        let now = self.clock.now();
        let invoice = Invoice {
            invoice_id: Uuid::new_v4(),
            org_id,
            invoice_number: invoice_number(org_id, period_start),
            period_start,
            period_end,
            tier: org.tier,
            base_charge,
            overage_calls,
            overage_call_charge,
            overage_videos,
            overage_video_charge,
            subtotal,
            tax,
            total,
            total_calls: usage.billable_calls,
            total_video_generations: usage.billable_video_generations,
            status: InvoiceStatus::Pending,
            created_utc: now,
            updated_utc: now,
        };

        // The store enforces one invoice per (org, period); a concurrent
        // generator loses the race and gets the winner's row back.
        let stored = self.invoices.insert_invoice(&invoice).await?;
        metrics::record_invoice(&org_id.to_string(), stored.status.as_str());
        info!(
            tenant_id = %org_id,
            invoice_id = %stored.invoice_id,
            number = %stored.invoice_number,
            total = %stored.total,
            "Invoice generated"
        );

        Ok(stored)
    }

    /// Payment-processor callback: the outcome updates invoice status and
    /// nothing else; it never feeds back into quota enforcement.
    #[instrument(skip(self))]
    pub async fn record_payment_outcome(
        &self,
        invoice_id: Uuid,
        succeeded: bool,
    ) -> Result<Invoice, AppError> {
        let status = if succeeded {
            InvoiceStatus::Paid
        } else {
            InvoiceStatus::Failed
        };
        let invoice = self.invoices.set_status(invoice_id, status).await?;
        metrics::record_invoice(&invoice.org_id.to_string(), status.as_str());
        Ok(invoice)
    }
}

fn base_charge(org: &Organization, monthly: Decimal, yearly: Decimal) -> Decimal {
    match org.billing_cycle {
        BillingCycle::Monthly => monthly,
        BillingCycle::Yearly => yearly,
    }
}
