//! HTTP surface assembly: shared state and the route table.

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::api;
use crate::audit::AuditSink;
use crate::config::Config;
use crate::gateway::GatewayService;
use crate::idempotency::IdempotencyStore;
use crate::middleware as mw;
use crate::registry::TenantRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gateway: Arc<GatewayService>,
    pub registry: Arc<TenantRegistry>,
    pub audit: Arc<AuditSink>,
    pub idempotency: Arc<dyn IdempotencyStore>,
}

/// Route table (§ external interfaces):
///
/// Public:   GET /health, GET /metrics
/// Tenant:   orders, panic, fills, market books, account, audit
/// Admin:    tenants CRUD (X-Admin-Key; secret reveal gated separately)
pub fn build_router(state: AppState) -> Router {
    let tenant_routes = Router::new()
        .route("/v1/orders", post(api::place_order).delete(api::cancel_all))
        .route("/v1/orders/typed", post(api::build_typed_order))
        .route("/v1/orders/{id}", delete(api::cancel_order))
        .route("/v1/panic", delete(api::activate_panic))
        .route("/v1/fills", get(api::list_fills))
        .route("/v1/markets/{id}/book", get(api::market_book))
        .route(
            "/v1/account/proxy",
            get(api::proxy_address).post(api::deploy_proxy),
        )
        .route("/v1/audit", get(api::list_audit))
        // Innermost-to-outermost: idempotency, rate-limit, read-only, auth.
        .layer(from_fn_with_state(state.clone(), mw::idempotency_middleware))
        .layer(from_fn_with_state(state.clone(), mw::ratelimit_middleware))
        .layer(from_fn_with_state(state.clone(), mw::readonly_middleware))
        .layer(from_fn_with_state(state.clone(), mw::auth_middleware));

    let admin_routes = Router::new()
        .route("/v1/tenants", get(api::list_tenants).post(api::create_tenant))
        .route(
            "/v1/tenants/{id}",
            get(api::get_tenant)
                .put(api::update_tenant)
                .delete(api::delete_tenant),
        )
        .layer(from_fn_with_state(state.clone(), mw::readonly_middleware))
        .layer(from_fn_with_state(state.clone(), mw::admin_middleware));

    Router::new()
        .route("/health", get(api::health))
        .route("/metrics", get(api::metrics_exposition))
        .merge(tenant_routes)
        .merge(admin_routes)
        .layer(from_fn_with_state(state.clone(), mw::audit_middleware))
        .layer(from_fn(mw::metrics_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
