//! Per-request audit trail.
//!
//! Every request produces one record. Bodies on sensitive paths are redacted
//! before the record leaves the middleware: secret-bearing keys become `***`
//! and a body that fails to parse as JSON is replaced with `[redacted]`
//! wholesale (raw bytes on those paths are never logged). Delivery is a
//! bounded queue with a single consumer that fans out to an in-memory ring,
//! a JSONL file rotated by UTC date, and optionally a durable repository.
//! When the queue is full the record is dropped so the request path never
//! blocks on auditing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::metrics;

const QUEUE_DEPTH: usize = 1000;
const RING_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    /// Request ID (UUID v4), echoed to the client as X-Request-ID.
    pub id: String,
    #[serde(default)]
    pub tenant_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub request_body: String,
    #[serde(default)]
    pub response_body: String,
    pub status_code: u16,
    pub latency_ms: i64,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// Durable audit storage.
#[async_trait]
pub trait AuditRepo: Send + Sync {
    async fn insert(&self, entry: &AuditLog) -> anyhow::Result<()>;
    async fn list(
        &self,
        tenant_id: &str,
        limit: usize,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<AuditLog>>;
    async fn cleanup(&self, older_than: Duration) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Redaction
// ---------------------------------------------------------------------------

const SENSITIVE_PATH_PREFIXES: [&str; 3] = ["/v1/tenants", "/v1/orders", "/v1/account"];

pub fn is_sensitive_path(path: &str) -> bool {
    SENSITIVE_PATH_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

fn is_sensitive_key(key: &str) -> bool {
    matches!(
        key.trim().to_lowercase().as_str(),
        "api_key"
            | "api_secret"
            | "api_passphrase"
            | "l2_api_key"
            | "l2_api_secret"
            | "l2_api_passphrase"
            | "private_key"
            | "signature"
            | "signer"
            | "sig"
            | "signature_type"
            | "admin_key"
            | "admin_secret_key"
    )
}

fn redact_value(v: &mut Value) {
    match v {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *val = Value::String("***".to_string());
                } else {
                    redact_value(val);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_value(item);
            }
        }
        _ => {}
    }
}

/// Redact a request/response body for the audit record. Non-sensitive paths
/// pass through untouched; sensitive paths get the key walk, or a blanket
/// `[redacted]` when the body is not valid JSON.
pub fn redact_body(path: &str, body: &[u8]) -> String {
    if body.is_empty() {
        return String::new();
    }
    if !is_sensitive_path(path) {
        return String::from_utf8_lossy(body).into_owned();
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(mut v) => {
            redact_value(&mut v);
            v.to_string()
        }
        Err(_) => "[redacted]".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Ring buffer for the recent-query API
// ---------------------------------------------------------------------------

struct AuditRing {
    records: Vec<AuditLog>,
    next: usize,
}

impl AuditRing {
    fn new() -> Self {
        Self {
            records: Vec::with_capacity(RING_CAPACITY),
            next: 0,
        }
    }

    fn add(&mut self, entry: AuditLog) {
        if self.records.len() < RING_CAPACITY {
            self.records.push(entry);
        } else {
            self.records[self.next] = entry;
            self.next = (self.next + 1) % RING_CAPACITY;
        }
    }

    /// Newest first, optionally filtered by tenant.
    fn list(&self, tenant_id: &str, limit: usize) -> Vec<AuditLog> {
        let total = self.records.len();
        let limit = if limit == 0 || limit > RING_CAPACITY {
            RING_CAPACITY
        } else {
            limit
        };
        let mut out = Vec::with_capacity(limit.min(total));
        for i in 0..total {
            let idx = (self.next + total - 1 - i) % total;
            let entry = &self.records[idx];
            if !tenant_id.is_empty() && entry.tenant_id != tenant_id {
                continue;
            }
            out.push(entry.clone());
            if out.len() >= limit {
                break;
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

pub struct AuditSink {
    tx: mpsc::Sender<AuditLog>,
    ring: Arc<Mutex<AuditRing>>,
    repo: Option<Arc<dyn AuditRepo>>,
}

impl AuditSink {
    /// Build the sink and spawn its consumer task. The returned handle
    /// completes once the queue is drained after every sender is dropped.
    pub fn new(
        log_dir: impl Into<PathBuf>,
        repo: Option<Arc<dyn AuditRepo>>,
    ) -> anyhow::Result<(Arc<Self>, tokio::task::JoinHandle<()>)> {
        let log_dir = log_dir.into();
        std::fs::create_dir_all(&log_dir)?;

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let ring = Arc::new(Mutex::new(AuditRing::new()));
        let sink = Arc::new(Self {
            tx,
            ring,
            repo: repo.clone(),
        });

        let handle = tokio::spawn(consume(rx, log_dir, repo));
        Ok((sink, handle))
    }

    /// Enqueue one record. Never blocks: a full queue drops the record.
    pub fn log(&self, entry: AuditLog) {
        self.ring.lock().add(entry.clone());
        if self.tx.try_send(entry).is_err() {
            metrics::AUDIT_DROPPED.inc();
            warn!("audit queue full, dropping record");
        }
    }

    /// Recent records for a tenant: durable repo when available, the ring
    /// otherwise.
    pub async fn list(
        &self,
        tenant_id: &str,
        limit: usize,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Vec<AuditLog> {
        if let Some(repo) = &self.repo {
            if let Ok(records) = repo.list(tenant_id, limit, from, to).await {
                return records;
            }
        }
        self.ring.lock().list(tenant_id, limit)
    }
}

async fn consume(
    mut rx: mpsc::Receiver<AuditLog>,
    log_dir: PathBuf,
    repo: Option<Arc<dyn AuditRepo>>,
) {
    let mut current_date = String::new();
    let mut file: Option<std::fs::File> = None;

    while let Some(entry) = rx.recv().await {
        if let Some(repo) = &repo {
            if let Err(e) = repo.insert(&entry).await {
                error!(error = %e, "audit repo insert failed");
            }
        }

        // Rotate the JSONL file on UTC date change.
        let date = entry.created_at.format("%Y-%m-%d").to_string();
        if date != current_date || file.is_none() {
            let path = log_dir.join(format!("audit-{date}.jsonl"));
            match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                Ok(f) => {
                    current_date = date;
                    file = Some(f);
                }
                Err(e) => {
                    error!(error = %e, path = %path.display(), "audit file open failed");
                    file = None;
                }
            }
        }

        if let Some(f) = file.as_mut() {
            match serde_json::to_string(&entry) {
                Ok(line) => {
                    if let Err(e) = writeln!(f, "{line}") {
                        error!(error = %e, "audit file write failed");
                    }
                }
                Err(e) => error!(error = %e, "audit record serialization failed"),
            }
        }
    }
}
