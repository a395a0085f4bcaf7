//! Durable persistence: Postgres repositories (tenants, usage, audit) and
//! the Redis usage store, plus the retention cleaner that trims old records
//! on an interval.
//!
//! Documents are stored as JSON text next to a few indexed columns; the
//! domain structs own the schema, the database just keeps them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::Client;
use tracing::{error, info};

use crate::audit::{AuditLog, AuditRepo};
use crate::idempotency::IdempotencyStore;
use crate::registry::TenantRepo;
use crate::risk::UsageStore;
use crate::types::Tenant;

/// Connect and spawn the connection driver task.
pub async fn connect_postgres(dsn: &str) -> anyhow::Result<Client> {
    let tls = MakeTlsConnector::new(TlsConnector::builder().build()?);
    let (client, connection) = tokio_postgres::connect(dsn, tls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!(error = %e, "postgres connection terminated");
        }
    });
    Ok(client)
}

// ---------------------------------------------------------------------------
// Tenants
// ---------------------------------------------------------------------------

pub struct PostgresTenantRepo {
    client: Client,
}

impl PostgresTenantRepo {
    pub async fn new(client: Client) -> anyhow::Result<Self> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS tenants (
                    id TEXT PRIMARY KEY,
                    api_key TEXT UNIQUE NOT NULL,
                    doc TEXT NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )",
            )
            .await?;
        Ok(Self { client })
    }

    fn decode(doc: &str) -> Option<Tenant> {
        serde_json::from_str(doc).ok()
    }
}

#[async_trait]
impl TenantRepo for PostgresTenantRepo {
    async fn get_by_api_key(&self, api_key: &str) -> anyhow::Result<Option<Tenant>> {
        let row = self
            .client
            .query_opt("SELECT doc FROM tenants WHERE api_key = $1", &[&api_key])
            .await?;
        Ok(row.and_then(|r| Self::decode(r.get(0))))
    }

    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<Tenant>> {
        let row = self
            .client
            .query_opt("SELECT doc FROM tenants WHERE id = $1", &[&id])
            .await?;
        Ok(row.and_then(|r| Self::decode(r.get(0))))
    }

    async fn list(&self) -> anyhow::Result<Vec<Tenant>> {
        let rows = self
            .client
            .query("SELECT doc FROM tenants ORDER BY id", &[])
            .await?;
        Ok(rows.iter().filter_map(|r| Self::decode(r.get(0))).collect())
    }

    async fn create(&self, tenant: &Tenant) -> anyhow::Result<()> {
        let doc = serde_json::to_string(tenant)?;
        self.client
            .execute(
                "INSERT INTO tenants (id, api_key, doc) VALUES ($1, $2, $3)",
                &[&tenant.id, &tenant.api_key, &doc],
            )
            .await?;
        Ok(())
    }

    async fn update(&self, tenant: &Tenant) -> anyhow::Result<()> {
        let doc = serde_json::to_string(tenant)?;
        self.client
            .execute(
                "UPDATE tenants SET api_key = $2, doc = $3, updated_at = now() WHERE id = $1",
                &[&tenant.id, &tenant.api_key, &doc],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.client
            .execute("DELETE FROM tenants WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Daily usage
// ---------------------------------------------------------------------------

fn utc_date() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

pub struct PostgresUsageRepo {
    client: Client,
}

impl PostgresUsageRepo {
    pub async fn new(client: Client) -> anyhow::Result<Self> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS daily_usage (
                    tenant_id TEXT NOT NULL,
                    day TEXT NOT NULL,
                    orders INTEGER NOT NULL DEFAULT 0,
                    volume DOUBLE PRECISION NOT NULL DEFAULT 0,
                    PRIMARY KEY (tenant_id, day)
                )",
            )
            .await?;
        Ok(Self { client })
    }

    pub async fn cleanup(&self, older_than: Duration) -> anyhow::Result<()> {
        let cutoff = (Utc::now() - chrono::Duration::from_std(older_than)?)
            .format("%Y-%m-%d")
            .to_string();
        self.client
            .execute("DELETE FROM daily_usage WHERE day < $1", &[&cutoff])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UsageStore for PostgresUsageRepo {
    async fn get_daily_usage(&self, tenant_id: &str) -> anyhow::Result<(u32, f64)> {
        let row = self
            .client
            .query_opt(
                "SELECT orders, volume FROM daily_usage WHERE tenant_id = $1 AND day = $2",
                &[&tenant_id, &utc_date()],
            )
            .await?;
        Ok(row
            .map(|r| (r.get::<_, i32>(0) as u32, r.get::<_, f64>(1)))
            .unwrap_or((0, 0.0)))
    }

    async fn add_daily_usage(&self, tenant_id: &str, orders: u32, volume: f64) -> anyhow::Result<()> {
        self.client
            .execute(
                "INSERT INTO daily_usage (tenant_id, day, orders, volume)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (tenant_id, day) DO UPDATE
                 SET orders = daily_usage.orders + EXCLUDED.orders,
                     volume = daily_usage.volume + EXCLUDED.volume",
                &[&tenant_id, &utc_date(), &(orders as i32), &volume],
            )
            .await?;
        Ok(())
    }
}

/// Redis-backed usage store: a hash per (tenant, UTC day) with an expiry
/// comfortably past the retention window.
pub struct RedisUsageStore {
    client: redis::Client,
}

impl RedisUsageStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    fn key(tenant_id: &str) -> String {
        format!("usage:{}:{}", tenant_id, utc_date())
    }
}

#[async_trait]
impl UsageStore for RedisUsageStore {
    async fn get_daily_usage(&self, tenant_id: &str) -> anyhow::Result<(u32, f64)> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (orders, volume): (Option<u32>, Option<f64>) = redis::pipe()
            .cmd("HGET")
            .arg(Self::key(tenant_id))
            .arg("orders")
            .cmd("HGET")
            .arg(Self::key(tenant_id))
            .arg("volume")
            .query_async(&mut conn)
            .await?;
        Ok((orders.unwrap_or(0), volume.unwrap_or(0.0)))
    }

    async fn add_daily_usage(&self, tenant_id: &str, orders: u32, volume: f64) -> anyhow::Result<()> {
        let key = Self::key(tenant_id);
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = redis::pipe()
            .cmd("HINCRBY")
            .arg(&key)
            .arg("orders")
            .arg(orders as i64)
            .ignore()
            .cmd("HINCRBYFLOAT")
            .arg(&key)
            .arg("volume")
            .arg(volume)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(40 * 24 * 60 * 60)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

pub struct PostgresAuditRepo {
    client: Client,
}

impl PostgresAuditRepo {
    pub async fn new(client: Client) -> anyhow::Result<Self> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS audit_logs (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL DEFAULT '',
                    status_code INTEGER NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    doc TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS audit_logs_tenant_created
                    ON audit_logs (tenant_id, created_at DESC)",
            )
            .await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AuditRepo for PostgresAuditRepo {
    async fn insert(&self, entry: &AuditLog) -> anyhow::Result<()> {
        let doc = serde_json::to_string(entry)?;
        self.client
            .execute(
                "INSERT INTO audit_logs (id, tenant_id, status_code, created_at, doc)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &entry.id,
                    &entry.tenant_id,
                    &(entry.status_code as i32),
                    &entry.created_at,
                    &doc,
                ],
            )
            .await?;
        Ok(())
    }

    async fn list(
        &self,
        tenant_id: &str,
        limit: usize,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<AuditLog>> {
        let limit = if limit == 0 { 100 } else { limit } as i64;
        let rows = self
            .client
            .query(
                "SELECT doc FROM audit_logs
                 WHERE ($1 = '' OR tenant_id = $1)
                   AND ($2::timestamptz IS NULL OR created_at >= $2)
                   AND ($3::timestamptz IS NULL OR created_at <= $3)
                 ORDER BY created_at DESC
                 LIMIT $4",
                &[&tenant_id, &from, &to, &limit],
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| serde_json::from_str(r.get(0)).ok())
            .collect())
    }

    async fn cleanup(&self, older_than: Duration) -> anyhow::Result<()> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than)?;
        self.client
            .execute("DELETE FROM audit_logs WHERE created_at < $1", &[&cutoff])
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Retention cleaner
// ---------------------------------------------------------------------------

pub struct RetentionCleaner {
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub audit: Option<Arc<dyn AuditRepo>>,
    pub usage: Option<Arc<PostgresUsageRepo>>,
    pub idempotency_retention: Duration,
    pub audit_retention: Duration,
    pub usage_retention: Duration,
    pub interval: Duration,
}

impl RetentionCleaner {
    /// Background task trimming expired records every `interval`.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so startup stays quiet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.idempotency.cleanup(self.idempotency_retention).await;
                if let Some(audit) = &self.audit {
                    if let Err(e) = audit.cleanup(self.audit_retention).await {
                        error!(error = %e, "audit cleanup failed");
                    }
                }
                if let Some(usage) = &self.usage {
                    if let Err(e) = usage.cleanup(self.usage_retention).await {
                        error!(error = %e, "usage cleanup failed");
                    }
                }
                info!("retention cleanup pass complete");
            }
        })
    }
}
