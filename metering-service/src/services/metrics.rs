//! Metrics module for metering-service.
//! Provides Prometheus metrics for quota enforcement and per-tenant metering.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "metering_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Quota checks counter (per-tenant metering)
pub static QUOTA_CHECKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Quota denials counter, labeled by the violated window
pub static QUOTA_DENIED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Committed usage counter (per-tenant metering)
pub static USAGE_COMMITTED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Ledger write failures: billing-accuracy risk, alerts operators
pub static LEDGER_WRITE_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Counter store failures, labeled by the policy applied
pub static STORE_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices generated, labeled by status
pub static INVOICES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Tier changes (upgrade/downgrade)
pub static TIER_CHANGES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    QUOTA_CHECKS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_quota_checks_total",
                "Total quota checks by tenant and outcome"
            ),
            &["tenant_id", "outcome"]
        )
        .expect("Failed to register QUOTA_CHECKS_TOTAL")
    });

    QUOTA_DENIED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_quota_denied_total",
                "Total quota denials by tenant and violated window"
            ),
            &["tenant_id", "window"]
        )
        .expect("Failed to register QUOTA_DENIED_TOTAL")
    });

    USAGE_COMMITTED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_usage_committed_total",
                "Total committed usage events by tenant and billable flag"
            ),
            &["tenant_id", "billable"]
        )
        .expect("Failed to register USAGE_COMMITTED_TOTAL")
    });

    LEDGER_WRITE_FAILURES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_ledger_write_failures_total",
                "Usage ledger writes that failed after the quota increment"
            ),
            &["tenant_id"]
        )
        .expect("Failed to register LEDGER_WRITE_FAILURES_TOTAL")
    });

    STORE_FAILURES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_store_failures_total",
                "Counter store failures by applied policy"
            ),
            &["policy"]
        )
        .expect("Failed to register STORE_FAILURES_TOTAL")
    });

    INVOICES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("metering_invoices_total", "Invoices by tenant and status"),
            &["tenant_id", "status"]
        )
        .expect("Failed to register INVOICES_TOTAL")
    });

    TIER_CHANGES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_tier_changes_total",
                "Tier transitions by tenant and direction"
            ),
            &["tenant_id", "from", "to"]
        )
        .expect("Failed to register TIER_CHANGES_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

/// Record a quota check outcome.
pub fn record_quota_check(tenant_id: &str, outcome: &str) {
    if let Some(counter) = QUOTA_CHECKS_TOTAL.get() {
        counter.with_label_values(&[tenant_id, outcome]).inc();
    }
}

/// Record a quota denial with the violated window.
pub fn record_quota_denied(tenant_id: &str, window: &str) {
    if let Some(counter) = QUOTA_DENIED_TOTAL.get() {
        counter.with_label_values(&[tenant_id, window]).inc();
    }
}

/// Record a committed usage event.
pub fn record_usage_committed(tenant_id: &str, billable: bool) {
    if let Some(counter) = USAGE_COMMITTED_TOTAL.get() {
        counter
            .with_label_values(&[tenant_id, if billable { "true" } else { "false" }])
            .inc();
    }
}

/// Record a ledger write failure.
pub fn record_ledger_write_failure(tenant_id: &str) {
    if let Some(counter) = LEDGER_WRITE_FAILURES_TOTAL.get() {
        counter.with_label_values(&[tenant_id]).inc();
    }
}

/// Record a counter store failure and the policy applied to it.
pub fn record_store_failure(policy: &str) {
    if let Some(counter) = STORE_FAILURES_TOTAL.get() {
        counter.with_label_values(&[policy]).inc();
    }
}

/// Record an invoice outcome.
pub fn record_invoice(tenant_id: &str, status: &str) {
    if let Some(counter) = INVOICES_TOTAL.get() {
        counter.with_label_values(&[tenant_id, status]).inc();
    }
}

/// Record a tier transition.
pub fn record_tier_change(tenant_id: &str, from: &str, to: &str) {
    if let Some(counter) = TIER_CHANGES_TOTAL.get() {
        counter.with_label_values(&[tenant_id, from, to]).inc();
    }
}
