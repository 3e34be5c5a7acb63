//! Database service for metering-service.
//!
//! Postgres implementations of the org, API key, usage ledger, and invoice
//! stores.

use crate::models::{
    ApiKey, BillingCycle, CreateOrganization, EndpointUsage, Invoice, InvoiceStatus,
    ListInvoicesFilter, ListUsageFilter, Organization, Tier, UsageAggregate, UsageEvent,
};
use crate::services::ledger::UsageLedger;
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{ApiKeyStore, InvoiceStore, OrgStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metering_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const ORG_COLUMNS: &str = "org_id, name, country, tier, billing_cycle, subscription_start, subscription_expires, total_calls, total_video_generations, period_calls, period_video_generations, is_active, created_utc, updated_utc";

const KEY_COLUMNS: &str = "key_id, org_id, label, token_hash, permissions, is_active, expires_utc, total_requests, last_used_utc, created_utc";

const EVENT_COLUMNS: &str = "event_id, org_id, api_key_id, endpoint, occurred_utc, cost, billable, is_video, status_code, latency_ms, created_utc";

const INVOICE_COLUMNS: &str = "invoice_id, org_id, invoice_number, period_start, period_end, tier, base_charge, overage_calls, overage_call_charge, overage_videos, overage_video_charge, subtotal, tax, total, total_calls, total_video_generations, status, created_utc, updated_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "metering-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

// =============================================================================
// Organization operations
// =============================================================================

#[async_trait]
impl OrgStore for Database {
    #[instrument(skip(self, input), fields(name = %input.name))]
    async fn create_org(&self, input: &CreateOrganization) -> Result<Organization, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_org"])
            .start_timer();

        let org = sqlx::query_as::<_, Organization>(&format!(
            "INSERT INTO organizations (org_id, name, country, billing_cycle) \
             VALUES ($1, $2, $3, $4) RETURNING {ORG_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .bind(&input.country)
        .bind(input.billing_cycle)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create org: {}", e)))?;

        timer.observe_duration();
        info!(tenant_id = %org.org_id, "Organization created");
        Ok(org)
    }

    async fn get_org(&self, org_id: Uuid) -> Result<Organization, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_org"])
            .start_timer();

        let org = sqlx::query_as::<_, Organization>(&format!(
            "SELECT {ORG_COLUMNS} FROM organizations WHERE org_id = $1"
        ))
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to fetch org: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("organization {} not found", org_id)))?;

        timer.observe_duration();
        Ok(org)
    }

    #[instrument(skip(self), fields(tenant_id = %org_id))]
    async fn set_tier(
        &self,
        org_id: Uuid,
        tier: Tier,
        cycle: BillingCycle,
        expires: Option<DateTime<Utc>>,
    ) -> Result<Organization, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_tier"])
            .start_timer();

        let org = sqlx::query_as::<_, Organization>(&format!(
            "UPDATE organizations \
             SET tier = $2, billing_cycle = $3, subscription_expires = $4, updated_utc = NOW() \
             WHERE org_id = $1 RETURNING {ORG_COLUMNS}"
        ))
        .bind(org_id)
        .bind(tier)
        .bind(cycle)
        .bind(expires)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to set tier: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("organization {} not found", org_id)))?;

        timer.observe_duration();
        Ok(org)
    }

    async fn set_active(&self, org_id: Uuid, active: bool) -> Result<Organization, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_active"])
            .start_timer();

        let org = sqlx::query_as::<_, Organization>(&format!(
            "UPDATE organizations SET is_active = $2, updated_utc = NOW() \
             WHERE org_id = $1 RETURNING {ORG_COLUMNS}"
        ))
        .bind(org_id)
        .bind(active)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to set active: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("organization {} not found", org_id)))?;

        timer.observe_duration();
        Ok(org)
    }

    async fn add_usage(&self, org_id: Uuid, calls: i64, videos: i64) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_usage"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE organizations \
             SET total_calls = total_calls + $2, \
                 total_video_generations = total_video_generations + $3, \
                 period_calls = period_calls + $2, \
                 period_video_generations = period_video_generations + $3, \
                 updated_utc = NOW() \
             WHERE org_id = $1",
        )
        .bind(org_id)
        .bind(calls)
        .bind(videos)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to add usage: {}", e)))?;

        timer.observe_duration();
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "organization {} not found",
                org_id
            )));
        }
        Ok(())
    }

    async fn reset_period_counters(&self, org_id: Uuid) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reset_period_counters"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE organizations \
             SET period_calls = 0, period_video_generations = 0, updated_utc = NOW() \
             WHERE org_id = $1",
        )
        .bind(org_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to reset period counters: {}", e))
        })?;

        timer.observe_duration();
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "organization {} not found",
                org_id
            )));
        }
        Ok(())
    }
}

// =============================================================================
// API key operations
// =============================================================================

#[async_trait]
impl ApiKeyStore for Database {
    #[instrument(skip(self, key), fields(tenant_id = %key.org_id))]
    async fn insert_key(&self, key: &ApiKey) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_key"])
            .start_timer();

        sqlx::query(
            "INSERT INTO api_keys (key_id, org_id, label, token_hash, permissions, is_active, expires_utc, total_requests, created_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(key.key_id)
        .bind(key.org_id)
        .bind(&key.label)
        .bind(&key.token_hash)
        .bind(&key.permissions)
        .bind(key.is_active)
        .bind(key.expires_utc)
        .bind(key.total_requests)
        .bind(key.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to insert key: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<ApiKey>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_key_by_hash"])
            .start_timer();

        let key = sqlx::query_as::<_, ApiKey>(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys WHERE token_hash = $1"
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to look up key: {}", e)))?;

        timer.observe_duration();
        Ok(key)
    }

    async fn revoke_key(&self, key_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["revoke_key"])
            .start_timer();

        let result = sqlx::query("UPDATE api_keys SET is_active = FALSE WHERE key_id = $1")
            .bind(key_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to revoke key: {}", e)))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    async fn note_key_usage(&self, key_id: Uuid, when: DateTime<Utc>) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["note_key_usage"])
            .start_timer();

        sqlx::query(
            "UPDATE api_keys SET total_requests = total_requests + 1, last_used_utc = $2 \
             WHERE key_id = $1",
        )
        .bind(key_id)
        .bind(when)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update key usage: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }
}

// =============================================================================
// Usage ledger operations
// =============================================================================

#[derive(Debug, FromRow)]
struct UsageRollupRow {
    endpoint: String,
    is_video: bool,
    requests: i64,
    cost_units: i64,
    billable_cost_units: i64,
    billable_requests: i64,
    errors: i64,
    latency_sum: Option<i64>,
    latency_count: i64,
}

#[async_trait]
impl UsageLedger for Database {
    /// Append-only insert. Failures surface as `LedgerWrite`, which the
    /// caller logs and counts without blocking the served request.
    async fn append(&self, event: &UsageEvent) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["ledger_append"])
            .start_timer();

        sqlx::query(
            "INSERT INTO usage_events (event_id, org_id, api_key_id, endpoint, occurred_utc, cost, billable, is_video, status_code, latency_ms, created_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(event.event_id)
        .bind(event.org_id)
        .bind(event.api_key_id)
        .bind(&event.endpoint)
        .bind(event.occurred_utc)
        .bind(event.cost)
        .bind(event.billable)
        .bind(event.is_video)
        .bind(event.status_code)
        .bind(event.latency_ms)
        .bind(event.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::LedgerWrite(anyhow::anyhow!("Failed to append event: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    async fn query(
        &self,
        org_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &ListUsageFilter,
    ) -> Result<Vec<UsageEvent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["ledger_query"])
            .start_timer();

        let limit = i64::from(if filter.page_size > 0 {
            filter.page_size
        } else {
            100
        });

        let events = sqlx::query_as::<_, UsageEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM usage_events \
             WHERE org_id = $1 AND occurred_utc >= $2 AND occurred_utc < $3 \
               AND ($4::TEXT IS NULL OR endpoint = $4) \
               AND ($5::BOOLEAN IS NULL OR billable = $5) \
               AND ($6::TIMESTAMPTZ IS NULL OR occurred_utc > $6) \
             ORDER BY occurred_utc ASC \
             LIMIT $7"
        ))
        .bind(org_id)
        .bind(start)
        .bind(end)
        .bind(&filter.endpoint)
        .bind(filter.billable)
        .bind(filter.page_token)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to query events: {}", e)))?;

        timer.observe_duration();
        Ok(events)
    }

    async fn aggregate(
        &self,
        org_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageAggregate, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["ledger_aggregate"])
            .start_timer();

        let rows = sqlx::query_as::<_, UsageRollupRow>(
            "SELECT endpoint, \
                    is_video, \
                    COUNT(*) AS requests, \
                    COALESCE(SUM(cost), 0)::BIGINT AS cost_units, \
                    COALESCE(SUM(cost) FILTER (WHERE billable), 0)::BIGINT AS billable_cost_units, \
                    COUNT(*) FILTER (WHERE billable) AS billable_requests, \
                    COUNT(*) FILTER (WHERE status_code >= 400) AS errors, \
                    SUM(latency_ms)::BIGINT AS latency_sum, \
                    COUNT(latency_ms) AS latency_count \
             FROM usage_events \
             WHERE org_id = $1 AND occurred_utc >= $2 AND occurred_utc < $3 \
             GROUP BY endpoint, is_video \
             ORDER BY endpoint",
        )
        .bind(org_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to aggregate: {}", e)))?;

        timer.observe_duration();

        let mut agg = UsageAggregate::empty();
        let mut by_endpoint: BTreeMap<String, EndpointUsage> = BTreeMap::new();
        let mut requests = 0i64;
        let mut errors = 0i64;
        let mut latency_sum = 0i64;
        let mut latency_count = 0i64;

        for row in rows {
            requests += row.requests;
            errors += row.errors;
            agg.total_calls += row.cost_units;
            agg.billable_calls += row.billable_cost_units;
            if row.is_video {
                agg.total_video_generations += row.requests;
                agg.billable_video_generations += row.billable_requests;
            }
            latency_sum += row.latency_sum.unwrap_or(0);
            latency_count += row.latency_count;

            let entry = by_endpoint
                .entry(row.endpoint.clone())
                .or_insert_with(|| EndpointUsage {
                    endpoint: row.endpoint.clone(),
                    requests: 0,
                    cost_units: 0,
                    errors: 0,
                });
            entry.requests += row.requests;
            entry.cost_units += row.cost_units;
            entry.errors += row.errors;
        }

        agg.per_endpoint = by_endpoint.into_values().collect();
        agg.error_rate = if requests > 0 {
            errors as f64 / requests as f64
        } else {
            0.0
        };
        agg.avg_latency_ms = if latency_count > 0 {
            latency_sum as f64 / latency_count as f64
        } else {
            0.0
        };

        Ok(agg)
    }
}

// =============================================================================
// Invoice operations
// =============================================================================

#[async_trait]
impl InvoiceStore for Database {
    #[instrument(skip(self, invoice), fields(tenant_id = %invoice.org_id))]
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        let inserted = sqlx::query_as::<_, Invoice>(&format!(
            "INSERT INTO invoices (invoice_id, org_id, invoice_number, period_start, period_end, tier, base_charge, overage_calls, overage_call_charge, overage_videos, overage_video_charge, subtotal, tax, total, total_calls, total_video_generations, status, created_utc, updated_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19) \
             ON CONFLICT (org_id, period_start, period_end) DO NOTHING \
             RETURNING {INVOICE_COLUMNS}"
        ))
        .bind(invoice.invoice_id)
        .bind(invoice.org_id)
        .bind(&invoice.invoice_number)
        .bind(invoice.period_start)
        .bind(invoice.period_end)
        .bind(invoice.tier)
        .bind(invoice.base_charge)
        .bind(invoice.overage_calls)
        .bind(invoice.overage_call_charge)
        .bind(invoice.overage_videos)
        .bind(invoice.overage_video_charge)
        .bind(invoice.subtotal)
        .bind(invoice.tax)
        .bind(invoice.total)
        .bind(invoice.total_calls)
        .bind(invoice.total_video_generations)
        .bind(invoice.status)
        .bind(invoice.created_utc)
        .bind(invoice.updated_utc)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to insert invoice: {}", e)))?;

        timer.observe_duration();

        match inserted {
            Some(row) => Ok(row),
            // Lost the idempotency race: return the winner's invoice.
            None => self
                .find_for_period(invoice.org_id, invoice.period_start, invoice.period_end)
                .await?
                .ok_or_else(|| {
                    AppError::DatabaseError(anyhow::anyhow!(
                        "invoice conflict without existing row for org {}",
                        invoice.org_id
                    ))
                }),
        }
    }

    async fn find_for_period(
        &self,
        org_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_invoice_for_period"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE org_id = $1 AND period_start = $2 AND period_end = $3"
        ))
        .bind(org_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to fetch invoice: {}", e)))?;

        timer.observe_duration();
        Ok(invoice)
    }

    async fn set_status(
        &self,
        invoice_id: Uuid,
        status: InvoiceStatus,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_invoice_status"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "UPDATE invoices SET status = $2, updated_utc = NOW() \
             WHERE invoice_id = $1 RETURNING {INVOICE_COLUMNS}"
        ))
        .bind(invoice_id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update invoice status: {}", e))
        })?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("invoice {} not found", invoice_id)))?;

        timer.observe_duration();
        Ok(invoice)
    }

    async fn list_invoices(
        &self,
        org_id: Uuid,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let limit = i64::from(if filter.page_size > 0 {
            filter.page_size
        } else {
            100
        });

        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE org_id = $1 \
               AND ($2::VARCHAR IS NULL OR status = $2) \
               AND ($3::TIMESTAMPTZ IS NULL OR period_start > $3) \
             ORDER BY period_start ASC \
             LIMIT $4"
        ))
        .bind(org_id)
        .bind(filter.status)
        .bind(filter.page_token)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list invoices: {}", e)))?;

        timer.observe_duration();
        Ok(invoices)
    }
}
