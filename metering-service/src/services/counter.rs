//! Quota counter stores.
//!
//! The counter store is shared by every server instance serving the same
//! organization, so the only mutation it exposes is an atomic
//! increment-with-TTL; there is no read-modify-write path anywhere.

use crate::services::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use metering_core::error::AppError;
use redis::{aio::ConnectionManager, Client, Script};
use std::sync::Arc;
use tracing::instrument;

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter at `key` by `amount`, setting a TTL
    /// of `ttl_secs` if this is the first increment for the key, and return
    /// the new count. Fails with `StoreUnavailable` when the backing store
    /// is unreachable or times out.
    async fn increment(&self, key: &str, amount: i64, ttl_secs: i64) -> Result<i64, AppError>;

    /// Non-mutating read for display and limit checks. Absent or expired
    /// keys read as 0.
    async fn peek(&self, key: &str) -> Result<i64, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}

// INCRBY and the first-increment EXPIRE run as one script, so a crash
// between the two steps cannot leave an immortal counter behind.
const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if count == tonumber(ARGV[1]) then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return count
";

/// Redis-backed counter store shared across server instances.
#[derive(Clone)]
pub struct RedisCounterStore {
    _client: Client,
    manager: ConnectionManager,
    script: Arc<Script>,
    timeout: std::time::Duration,
}

impl RedisCounterStore {
    pub async fn new(url: &str, timeout: std::time::Duration) -> Result<Self, AppError> {
        tracing::info!(url = %url, "Connecting to counter store");
        let client = Client::open(url)?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            AppError::StoreUnavailable(anyhow::anyhow!("Failed to connect to counter store: {}", e))
        })?;

        tracing::info!("Counter store connection established");

        Ok(Self {
            _client: client,
            manager,
            script: Arc::new(Script::new(INCREMENT_SCRIPT)),
            timeout,
        })
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl std::future::Future<Output = redis::RedisResult<T>> + Send,
    ) -> Result<T, AppError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(AppError::StoreUnavailable(anyhow::anyhow!(
                "counter store {} failed: {}",
                op,
                e
            ))),
            Err(_) => Err(AppError::StoreUnavailable(anyhow::anyhow!(
                "counter store {} timed out after {:?}",
                op,
                self.timeout
            ))),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    #[instrument(skip(self), fields(key = %key))]
    async fn increment(&self, key: &str, amount: i64, ttl_secs: i64) -> Result<i64, AppError> {
        let mut conn = self.manager.clone();
        let script = self.script.clone();
        self.bounded("increment", async move {
            script
                .key(key)
                .arg(amount)
                .arg(ttl_secs)
                .invoke_async(&mut conn)
                .await
        })
        .await
    }

    async fn peek(&self, key: &str) -> Result<i64, AppError> {
        let mut conn = self.manager.clone();
        let count: Option<i64> = self
            .bounded("peek", async move {
                redis::cmd("GET").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(count.unwrap_or(0))
    }

    async fn health_check(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        self.bounded("ping", async move {
            redis::cmd("PING").query_async::<_, ()>(&mut conn).await
        })
        .await
    }
}

#[derive(Debug, Clone)]
struct WindowEntry {
    count: i64,
    expires_at: DateTime<Utc>,
}

/// In-process counter store for tests and single-instance deployments.
/// Expiry is evaluated lazily against the injected clock.
pub struct InMemoryCounterStore {
    entries: DashMap<String, WindowEntry>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Drop entries whose window has passed. Callers may run this
    /// periodically to bound memory; reads already treat expired entries
    /// as absent.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, amount: i64, ttl_secs: i64) -> Result<i64, AppError> {
        let now = self.clock.now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry {
                count: 0,
                expires_at: now + Duration::seconds(ttl_secs),
            });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + Duration::seconds(ttl_secs);
        }
        entry.count += amount;
        Ok(entry.count)
    }

    async fn peek(&self, key: &str) -> Result<i64, AppError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.count)
            .unwrap_or(0))
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}
