//! HTTP handlers.
//!
//! Handlers stay thin: decode, delegate to the orchestrator, attach audit
//! context, encode. Body parsing is manual so malformed JSON maps onto the
//! gateway error envelope instead of the framework's default reject.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::error::{GatewayError, GatewayResult};
use crate::metrics;
use crate::middleware::{parse_json_body, AuditContext, HEADER_ADMIN_SECRET};
use crate::server::AppState;
use crate::types::{OrderRequest, Tenant};

// ---------------------------------------------------------------------------
// Public endpoints
// ---------------------------------------------------------------------------

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn metrics_exposition() -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

pub async fn place_order(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<Tenant>>,
    Extension(ctx): Extension<AuditContext>,
    body: Bytes,
) -> GatewayResult<Json<serde_json::Value>> {
    let req: OrderRequest = parse_json_body(&body)?;
    match state.gateway.place_order(&tenant, req).await {
        Ok(resp) => {
            ctx.add("status", "success");
            Ok(Json(resp))
        }
        Err(e) => {
            ctx.add("error", e.to_string());
            Err(e)
        }
    }
}

pub async fn build_typed_order(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<Tenant>>,
    Extension(ctx): Extension<AuditContext>,
    body: Bytes,
) -> GatewayResult<Json<serde_json::Value>> {
    let req: OrderRequest = parse_json_body(&body)?;
    match state.gateway.build_typed_order(&tenant, req).await {
        Ok(resp) => Ok(Json(serde_json::to_value(resp).map_err(|e| {
            GatewayError::Internal(format!("response serialization failed: {e}"))
        })?)),
        Err(e) => {
            ctx.add("error", e.to_string());
            Err(e)
        }
    }
}

pub async fn cancel_order(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<Tenant>>,
    Extension(ctx): Extension<AuditContext>,
    Path(order_id): Path<String>,
) -> GatewayResult<Json<serde_json::Value>> {
    if order_id.is_empty() {
        return Err(GatewayError::InvalidRequest("order id is required".into()));
    }
    let resp = state.gateway.cancel_order(&tenant, &order_id).await?;
    ctx.add("action", "cancel_order");
    ctx.add("order_id", order_id);
    Ok(Json(resp))
}

pub async fn cancel_all(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<Tenant>>,
    Extension(ctx): Extension<AuditContext>,
) -> GatewayResult<Json<serde_json::Value>> {
    let resp = state.gateway.cancel_all(&tenant).await?;
    ctx.add("action", "cancel_all");
    Ok(Json(resp))
}

pub async fn activate_panic(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<Tenant>>,
    Extension(ctx): Extension<AuditContext>,
) -> GatewayResult<Json<serde_json::Value>> {
    state.gateway.activate_panic_mode(&tenant).await?;
    ctx.add("action", "panic_mode_activated");
    Ok(Json(json!({
        "status": "panic_mode_active",
        "message": "all trading suspended and orders cancelled",
    })))
}

// ---------------------------------------------------------------------------
// Market data & fills
// ---------------------------------------------------------------------------

pub async fn list_fills(State(state): State<AppState>) -> Json<serde_json::Value> {
    let fills = state.gateway.fills();
    Json(json!({ "count": fills.len(), "fills": fills }))
}

pub async fn market_book(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
) -> GatewayResult<Json<serde_json::Value>> {
    let book = state.gateway.orderbook(&token_id).ok_or_else(|| {
        GatewayError::NotFound("orderbook not found or not subscribed".into())
    })?;
    let (bids, asks) = book.copy();
    Ok(Json(json!({
        "token_id": token_id,
        "last_updated": book.last_updated_at(),
        "bids": bids,
        "asks": asks,
    })))
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

pub async fn proxy_address(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<Tenant>>,
) -> GatewayResult<Json<serde_json::Value>> {
    let address = state.gateway.proxy_address(&tenant)?;
    Ok(Json(json!({ "address": address })))
}

pub async fn deploy_proxy(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<Tenant>>,
    Extension(ctx): Extension<AuditContext>,
) -> GatewayResult<Json<serde_json::Value>> {
    let resp = state.gateway.deploy_proxy(&tenant).await?;
    ctx.add("action", "deploy_proxy");
    Ok(Json(resp))
}

// ---------------------------------------------------------------------------
// Audit query
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

pub async fn list_audit(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<Tenant>>,
    Query(query): Query<AuditQuery>,
) -> Json<serde_json::Value> {
    let records = state
        .audit
        .list(&tenant.id, query.limit.unwrap_or(100), query.from, query.to)
        .await;
    Json(json!({ "count": records.len(), "records": records }))
}

// ---------------------------------------------------------------------------
// Tenant administration
// ---------------------------------------------------------------------------

pub async fn list_tenants(State(state): State<AppState>) -> Json<serde_json::Value> {
    let tenants: Vec<Tenant> = state.registry.list().iter().map(|t| t.masked()).collect();
    Json(json!({ "count": tenants.len(), "tenants": tenants }))
}

pub async fn create_tenant(
    State(state): State<AppState>,
    body: Bytes,
) -> GatewayResult<Json<serde_json::Value>> {
    let tenant: Tenant = parse_json_body(&body)?;
    if tenant.id.is_empty() || tenant.api_key.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "tenant id and api_key are required".into(),
        ));
    }
    if state.registry.get_by_id(&tenant.id).is_some() {
        return Err(GatewayError::InvalidRequest("tenant id already exists".into()));
    }
    if let Some(repo) = state.registry.repo() {
        repo.create(&tenant)
            .await
            .map_err(|e| GatewayError::Internal(format!("tenant persist failed: {e}")))?;
    }
    let registered = state.registry.register(tenant);
    Ok(Json(serde_json::to_value(registered.masked()).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct RevealQuery {
    #[serde(default)]
    pub reveal: Option<String>,
}

pub async fn get_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RevealQuery>,
    headers: HeaderMap,
) -> GatewayResult<Json<serde_json::Value>> {
    let tenant = state
        .registry
        .get_by_id(&id)
        .ok_or_else(|| GatewayError::NotFound("tenant not found".into()))?;

    let reveal = query.reveal.as_deref() == Some("true");
    if reveal {
        // Plaintext secrets demand the second factor.
        let secret = headers
            .get(HEADER_ADMIN_SECRET)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let configured = &state.config.auth.admin_secret_key;
        if configured.is_empty() || secret != configured {
            return Err(GatewayError::AuthFailed("invalid admin secret".into()));
        }
        return Ok(Json(serde_json::to_value(&*tenant).unwrap_or_default()));
    }
    Ok(Json(serde_json::to_value(tenant.masked()).unwrap_or_default()))
}

pub async fn update_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> GatewayResult<Json<serde_json::Value>> {
    let mut tenant: Tenant = parse_json_body(&body)?;
    tenant.id = id;
    if state.registry.get_by_id(&tenant.id).is_none() {
        return Err(GatewayError::NotFound("tenant not found".into()));
    }
    if tenant.api_key.is_empty() {
        return Err(GatewayError::InvalidRequest("api_key is required".into()));
    }
    if let Some(repo) = state.registry.repo() {
        repo.update(&tenant)
            .await
            .map_err(|e| GatewayError::Internal(format!("tenant persist failed: {e}")))?;
    }
    let replaced = state.registry.replace(tenant);
    Ok(Json(serde_json::to_value(replaced.masked()).unwrap_or_default()))
}

pub async fn delete_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> GatewayResult<Json<serde_json::Value>> {
    if state.registry.get_by_id(&id).is_none() {
        return Err(GatewayError::NotFound("tenant not found".into()));
    }
    if let Some(repo) = state.registry.repo() {
        repo.delete(&id)
            .await
            .map_err(|e| GatewayError::Internal(format!("tenant delete failed: {e}")))?;
    }
    state.registry.remove_by_id(&id);
    Ok(Json(json!({ "status": "deleted", "id": id })))
}
