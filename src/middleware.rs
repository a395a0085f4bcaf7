//! Request pipeline middleware.
//!
//! Chain, outermost first: metrics → audit → auth → read-only guard →
//! rate-limit → idempotency. Error mapping is carried by the typed gateway
//! error's `IntoResponse`; the audit layer owns the request ID and the
//! 4xx/5xx log levels.

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};
use uuid::Uuid;

use crate::audit::{redact_body, AuditLog};
use crate::error::GatewayError;
use crate::idempotency::idempotency_key;
use crate::metrics;
use crate::server::AppState;
use crate::types::Tenant;

pub const HEADER_GATEWAY_KEY: &str = "x-gateway-key";
pub const HEADER_IDEMPOTENCY_KEY: &str = "x-idempotency-key";
pub const HEADER_ADMIN_KEY: &str = "x-admin-key";
pub const HEADER_ADMIN_SECRET: &str = "x-admin-secret";
pub const HEADER_REQUEST_ID: &str = "x-request-id";

/// Shared per-request audit state. The audit layer creates it before auth
/// runs; auth fills in the tenant, handlers may attach business context.
#[derive(Clone, Default)]
pub struct AuditContext(pub Arc<Mutex<AuditContextInner>>);

#[derive(Default)]
pub struct AuditContextInner {
    pub tenant_id: String,
    pub entries: HashMap<String, Value>,
}

impl AuditContext {
    pub fn set_tenant(&self, tenant_id: &str) {
        self.0.lock().tenant_id = tenant_id.to_string();
    }

    pub fn add(&self, key: &str, value: impl Into<Value>) {
        self.0.lock().entries.insert(key.to_string(), value.into());
    }
}

fn header_str<'a>(req: &'a Request, name: &str) -> &'a str {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn is_mutating(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::DELETE | Method::PATCH)
}

// ---------------------------------------------------------------------------
// Metrics (outermost)
// ---------------------------------------------------------------------------

pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    // Matched route pattern keeps label cardinality bounded.
    let path = req
        .extensions()
        .get::<axum::extract::MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let response = next.run(req).await;

    metrics::HTTP_REQUESTS
        .with_label_values(&[&method, &path, response.status().as_str()])
        .observe(start.elapsed().as_secs_f64());
    response
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

pub async fn audit_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let start = Instant::now();
    let request_id = Uuid::new_v4().to_string();

    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let user_agent = header_str(&req, "user-agent").to_string();
    let ip = header_str(&req, "x-forwarded-for")
        .split(',')
        .next()
        .unwrap_or("")
        .trim()
        .to_string();

    let ctx = AuditContext::default();

    // Buffer the request body so both the handler and the audit record see it.
    let (mut parts, body) = req.into_parts();
    let req_bytes = to_bytes(body, usize::MAX).await.unwrap_or_default();
    parts.extensions.insert(ctx.clone());
    let req = Request::from_parts(parts, Body::from(req_bytes.clone()));

    let response = next.run(req).await;

    // Buffer the response body for the audit record and re-emit it.
    let (mut parts, body) = response.into_parts();
    let resp_bytes = to_bytes(body, usize::MAX).await.unwrap_or_default();
    parts.headers.insert(
        HEADER_REQUEST_ID,
        HeaderValue::from_str(&request_id).unwrap_or(HeaderValue::from_static("")),
    );

    let status = parts.status.as_u16();
    if status >= 500 {
        error!(request_id = %request_id, method = %method, path = %path, status, "request failed");
    } else if status >= 400 {
        warn!(request_id = %request_id, method = %method, path = %path, status, "request rejected");
    }

    let (tenant_id, context) = {
        let inner = ctx.0.lock();
        (inner.tenant_id.clone(), inner.entries.clone())
    };
    state.audit.log(AuditLog {
        id: request_id,
        tenant_id,
        method,
        path: path.clone(),
        ip,
        user_agent,
        request_body: redact_body(&path, &req_bytes),
        response_body: redact_body(&path, &resp_bytes),
        status_code: status,
        latency_ms: start.elapsed().as_millis() as i64,
        context,
        created_at: Utc::now(),
    });

    Response::from_parts(parts, Body::from(resp_bytes))
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

pub async fn auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let api_key = header_str(&req, HEADER_GATEWAY_KEY).to_string();

    let tenant = if api_key.is_empty() {
        if state.config.auth.require_api_key {
            None
        } else {
            state.registry.default_tenant()
        }
    } else {
        state.registry.resolve(&api_key).await
    };

    let Some(tenant) = tenant else {
        let msg = if api_key.is_empty() {
            "missing API key"
        } else {
            "invalid API key"
        };
        return GatewayError::AuthFailed(msg.into()).into_response();
    };

    if let Some(ctx) = req.extensions().get::<AuditContext>() {
        ctx.set_tenant(&tenant.id);
    }
    req.extensions_mut().insert(tenant);
    next.run(req).await
}

// ---------------------------------------------------------------------------
// Read-only guard
// ---------------------------------------------------------------------------

pub async fn readonly_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if state.config.server.read_only && is_mutating(req.method()) {
        return GatewayError::ReadOnly.into_response();
    }
    next.run(req).await
}

// ---------------------------------------------------------------------------
// Rate limit
// ---------------------------------------------------------------------------

pub async fn ratelimit_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(tenant) = req.extensions().get::<Arc<Tenant>>().cloned() else {
        return GatewayError::AuthFailed("unauthorized".into()).into_response();
    };

    if let Some(limiter) = state.registry.limiter(&tenant.id) {
        if !limiter.allow() {
            metrics::RATE_LIMITED.inc();
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({
                    "error": "rate limit exceeded",
                    "retry_after": "1s",
                })),
            )
                .into_response();
        }
    }
    next.run(req).await
}

// ---------------------------------------------------------------------------
// Idempotency (innermost)
// ---------------------------------------------------------------------------

pub async fn idempotency_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let client_key = header_str(&req, HEADER_IDEMPOTENCY_KEY).to_string();
    if client_key.is_empty() || !is_mutating(req.method()) {
        return next.run(req).await;
    }
    let Some(tenant) = req.extensions().get::<Arc<Tenant>>().cloned() else {
        return next.run(req).await;
    };

    let full_key = idempotency_key(&tenant.id, &client_key);

    if let Some(record) = state.idempotency.get_or_lock(&full_key).await {
        if record.processing {
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "error": "request in progress" })),
            )
                .into_response();
        }
        // Replay the cached response verbatim.
        metrics::IDEMPOTENT_REPLAYS.inc();
        let status = StatusCode::from_u16(record.status).unwrap_or(StatusCode::OK);
        return Response::builder()
            .status(status)
            .header("content-type", "application/json; charset=utf-8")
            .body(Body::from(record.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    // We hold the lock: run the handler and persist the outcome.
    let response = next.run(req).await;
    let (parts, body) = response.into_parts();
    let bytes = to_bytes(body, usize::MAX).await.unwrap_or_default();

    if parts.status.as_u16() < 500 {
        state
            .idempotency
            .save(&full_key, parts.status.as_u16(), &bytes)
            .await;
    } else {
        // Server errors are retryable: release the key.
        state.idempotency.unlock(&full_key).await;
    }

    Response::from_parts(parts, Body::from(bytes))
}

// ---------------------------------------------------------------------------
// Admin auth
// ---------------------------------------------------------------------------

pub async fn admin_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let configured = &state.config.auth.admin_key;
    if configured.is_empty() {
        return GatewayError::AuthFailed("admin API disabled".into()).into_response();
    }
    if header_str(&req, HEADER_ADMIN_KEY) != configured {
        return GatewayError::AuthFailed("invalid admin key".into()).into_response();
    }
    next.run(req).await
}

/// Extract a request body as bytes, mapping failures onto the error envelope.
pub fn parse_json_body<T: serde::de::DeserializeOwned>(bytes: &Bytes) -> Result<T, GatewayError> {
    serde_json::from_slice(bytes).map_err(|e| GatewayError::InvalidRequest(e.to_string()))
}
