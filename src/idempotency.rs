//! Idempotency store: at-most-once effect per (tenant, client key).
//!
//! `get_or_lock` is an atomic test-and-set. The first caller for a key gets
//! `None` back and owns execution; everyone else gets the existing record,
//! either still `processing` (the request is in flight, answer 409) or
//! completed (replay the cached response verbatim). Server errors unlock the
//! key so the client can retry.
//!
//! Three interchangeable backends: process-local map, Redis (`SET NX PX`),
//! and Postgres (`INSERT … ON CONFLICT DO NOTHING`).

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, warn};

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub status: u16,
    pub body: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub processing: bool,
}

impl IdempotencyRecord {
    fn locked() -> Self {
        Self {
            status: 0,
            body: Vec::new(),
            created_at: Utc::now(),
            processing: true,
        }
    }
}

/// Contract shared by all backends.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomic test-and-set. `None` means the caller inserted the lock and is
    /// the executor; `Some(record)` means a prior request holds the key.
    async fn get_or_lock(&self, key: &str) -> Option<IdempotencyRecord>;
    /// Transition the key to completed with the response to replay.
    async fn save(&self, key: &str, status: u16, body: &[u8]);
    /// Delete the key (after server errors, to permit retry).
    async fn unlock(&self, key: &str);
    /// Trim records older than the retention window.
    async fn cleanup(&self, older_than: Duration);
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryIdempotencyStore {
    records: Mutex<FxHashMap<String, IdempotencyRecord>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn get_or_lock(&self, key: &str) -> Option<IdempotencyRecord> {
        let mut records = self.records.lock();
        if let Some(existing) = records.get(key) {
            return Some(existing.clone());
        }
        records.insert(key.to_string(), IdempotencyRecord::locked());
        None
    }

    async fn save(&self, key: &str, status: u16, body: &[u8]) {
        self.records.lock().insert(
            key.to_string(),
            IdempotencyRecord {
                status,
                body: body.to_vec(),
                created_at: Utc::now(),
                processing: false,
            },
        );
    }

    async fn unlock(&self, key: &str) {
        self.records.lock().remove(key);
    }

    async fn cleanup(&self, older_than: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        self.records.lock().retain(|_, r| r.created_at >= cutoff);
    }
}

// ---------------------------------------------------------------------------
// Redis backend
// ---------------------------------------------------------------------------

/// Record wire format in Redis: JSON with the body base64ed.
#[derive(Serialize, Deserialize)]
struct RedisRecordWire {
    status: u16,
    body: String,
    created_at: i64,
    processing: bool,
}

pub struct RedisIdempotencyStore {
    client: redis::Client,
    ttl: Duration,
    prefix: &'static str,
}

impl RedisIdempotencyStore {
    pub fn new(client: redis::Client, ttl: Duration) -> Self {
        let ttl = if ttl < DEFAULT_TTL { DEFAULT_TTL } else { ttl };
        Self {
            client,
            ttl,
            prefix: "idem:",
        }
    }

    async fn conn(&self) -> Option<redis::aio::MultiplexedConnection> {
        match self.client.get_multiplexed_async_connection().await {
            Ok(c) => Some(c),
            Err(e) => {
                error!(error = %e, "redis connection failed");
                None
            }
        }
    }

    fn encode(record: &IdempotencyRecord) -> String {
        serde_json::to_string(&RedisRecordWire {
            status: record.status,
            body: BASE64_STD.encode(&record.body),
            created_at: record.created_at.timestamp(),
            processing: record.processing,
        })
        .unwrap_or_default()
    }

    fn decode(raw: &str) -> Option<IdempotencyRecord> {
        let wire: RedisRecordWire = serde_json::from_str(raw).ok()?;
        Some(IdempotencyRecord {
            status: wire.status,
            body: BASE64_STD.decode(&wire.body).unwrap_or_default(),
            created_at: DateTime::from_timestamp(wire.created_at, 0).unwrap_or_else(Utc::now),
            processing: wire.processing,
        })
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn get_or_lock(&self, key: &str) -> Option<IdempotencyRecord> {
        let mut conn = self.conn().await?;
        let full_key = format!("{}{}", self.prefix, key);
        let payload = Self::encode(&IdempotencyRecord::locked());

        // SET NX PX is the whole test-and-set: OK means we hold the lock.
        let set: Result<Option<String>, _> = redis::cmd("SET")
            .arg(&full_key)
            .arg(&payload)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await;
        match set {
            Ok(Some(ref ok)) if ok == "OK" => return None,
            Ok(_) => {}
            Err(e) => {
                // Fail open as the executor: refusing every request when
                // Redis blips would take the whole gateway down.
                warn!(error = %e, "redis SET NX failed");
                return None;
            }
        }

        let got: Result<Option<String>, _> =
            redis::cmd("GET").arg(&full_key).query_async(&mut conn).await;
        match got {
            Ok(Some(raw)) => Self::decode(&raw),
            _ => None,
        }
    }

    async fn save(&self, key: &str, status: u16, body: &[u8]) {
        let Some(mut conn) = self.conn().await else {
            return;
        };
        let record = IdempotencyRecord {
            status,
            body: body.to_vec(),
            created_at: Utc::now(),
            processing: false,
        };
        let result: Result<(), _> = redis::cmd("SET")
            .arg(format!("{}{}", self.prefix, key))
            .arg(Self::encode(&record))
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            error!(error = %e, "redis save failed");
        }
    }

    async fn unlock(&self, key: &str) {
        let Some(mut conn) = self.conn().await else {
            return;
        };
        let result: Result<(), _> = redis::cmd("DEL")
            .arg(format!("{}{}", self.prefix, key))
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            error!(error = %e, "redis unlock failed");
        }
    }

    async fn cleanup(&self, _older_than: Duration) {
        // PX expiry already bounds record lifetime.
    }
}

// ---------------------------------------------------------------------------
// Postgres backend
// ---------------------------------------------------------------------------

pub struct PostgresIdempotencyStore {
    client: tokio_postgres::Client,
}

impl PostgresIdempotencyStore {
    pub async fn new(client: tokio_postgres::Client) -> anyhow::Result<Self> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS idempotency_keys (
                    key TEXT PRIMARY KEY,
                    status_code INTEGER NOT NULL DEFAULT 0,
                    response_body BYTEA,
                    processing BOOLEAN NOT NULL DEFAULT true,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )",
            )
            .await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn get_or_lock(&self, key: &str) -> Option<IdempotencyRecord> {
        let inserted = self
            .client
            .execute(
                "INSERT INTO idempotency_keys (key, processing, created_at)
                 VALUES ($1, true, now())
                 ON CONFLICT (key) DO NOTHING",
                &[&key],
            )
            .await;
        match inserted {
            Ok(1) => return None,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "postgres idempotency insert failed");
                return None;
            }
        }

        let row = self
            .client
            .query_opt(
                "SELECT status_code, response_body, created_at, processing
                 FROM idempotency_keys WHERE key = $1",
                &[&key],
            )
            .await
            .ok()??;

        let status: i32 = row.get(0);
        let body: Option<Vec<u8>> = row.get(1);
        let created_at: DateTime<Utc> = row.get(2);
        let processing: bool = row.get(3);
        Some(IdempotencyRecord {
            status: status as u16,
            body: body.unwrap_or_default(),
            created_at,
            processing,
        })
    }

    async fn save(&self, key: &str, status: u16, body: &[u8]) {
        if let Err(e) = self
            .client
            .execute(
                "UPDATE idempotency_keys
                 SET status_code = $2, response_body = $3, processing = false
                 WHERE key = $1",
                &[&key, &(status as i32), &body],
            )
            .await
        {
            error!(error = %e, "postgres idempotency save failed");
        }
    }

    async fn unlock(&self, key: &str) {
        if let Err(e) = self
            .client
            .execute("DELETE FROM idempotency_keys WHERE key = $1", &[&key])
            .await
        {
            error!(error = %e, "postgres idempotency unlock failed");
        }
    }

    async fn cleanup(&self, older_than: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        if let Err(e) = self
            .client
            .execute(
                "DELETE FROM idempotency_keys WHERE created_at < $1",
                &[&cutoff],
            )
            .await
        {
            error!(error = %e, "postgres idempotency cleanup failed");
        }
    }
}

/// Key layout: `tenant_id:client_supplied_value`.
pub fn idempotency_key(tenant_id: &str, client_key: &str) -> String {
    format!("{tenant_id}:{client_key}")
}
