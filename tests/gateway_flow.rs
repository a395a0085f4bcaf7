//! End-to-end gateway scenarios, exercised through the real router and
//! middleware chain against in-memory backends. No live exchange is
//! involved: the exchange REST URL points at an unroutable port, so any
//! test that would reach it asserts on the failure class instead.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::routing::post;
use axum::{Json, Router};
use tower::ServiceExt;

use clobgate::audit::AuditSink;
use clobgate::config::Config;
use clobgate::feed::MarketFeed;
use clobgate::gateway::GatewayService;
use clobgate::idempotency::{idempotency_key, IdempotencyStore, MemoryIdempotencyStore};
use clobgate::middleware as mw;
use clobgate::nonce::NonceManager;
use clobgate::registry::TenantRegistry;
use clobgate::risk::{MemoryUsageStore, RiskEngine};
use clobgate::server::{build_router, AppState};
use clobgate::signing::{self, OrderSigner};
use clobgate::types::Credentials;

const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
const GATEWAY_KEY: &str = "sk-default-12345";

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.exchange.rest_url = "http://127.0.0.1:1".into();
    cfg.exchange.ws_url = "ws://127.0.0.1:1/ws".into();
    cfg.auth.require_api_key = false;
    // Default tenant with full custodial credentials.
    cfg.credentials = Credentials {
        address: String::new(),
        l2_api_key: "l2-key".into(),
        l2_api_secret: "c2VjcmV0LXNlY3JldA==".into(),
        l2_api_passphrase: "pass".into(),
        private_key: TEST_KEY.into(),
    };
    cfg
}

struct TestHarness {
    state: AppState,
    app: Router,
    feed: Arc<MarketFeed>,
}

async fn harness() -> TestHarness {
    let config = Arc::new(test_config());
    let registry = Arc::new(TenantRegistry::new(config.clone(), None));
    let feed = MarketFeed::new(config.exchange.ws_url.clone());
    let risk = Arc::new(RiskEngine::new(
        Arc::new(MemoryUsageStore::new()),
        feed.clone(),
    ));
    let nonce = Arc::new(NonceManager::new(
        "",
        config.exchange.contract.parse().unwrap(),
    ));
    let gateway = Arc::new(
        GatewayService::new(
            config.clone(),
            registry.clone(),
            risk,
            nonce,
            feed.clone(),
            None,
        )
        .unwrap(),
    );
    let log_dir = std::env::temp_dir().join(format!("clobgate-test-{}", uuid_suffix()));
    let (audit, _handle) = AuditSink::new(&log_dir, None).unwrap();
    let state = AppState {
        config,
        gateway,
        registry,
        audit,
        idempotency: Arc::new(MemoryIdempotencyStore::new()),
    };
    TestHarness {
        app: build_router(state.clone()),
        state,
        feed,
    }
}

fn uuid_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    format!(
        "{}-{:?}",
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos(),
        std::thread::current().id()
    )
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-gateway-key", GATEWAY_KEY)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-gateway-key", GATEWAY_KEY)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

// ---------------------------------------------------------------------------
// Canonical order signing round trip
// ---------------------------------------------------------------------------

#[test]
fn sign_canonical_order_round_trip() {
    use alloy_primitives::{Address, U256};
    use clobgate::types::{Order, Side, SIG_TYPE_EOA};

    let signer = OrderSigner::new(
        TEST_KEY,
        signing::DEFAULT_CHAIN_ID,
        signing::EXCHANGE_CONTRACT.parse().unwrap(),
    )
    .unwrap();

    let order = Order {
        salt: U256::from(123u64),
        maker: signer.address(),
        signer: signer.address(),
        taker: Address::ZERO,
        token_id: U256::from(999u64),
        maker_amount: U256::from(1_000_000u64),
        taker_amount: U256::from(500_000u64),
        expiration: U256::from(1_800_000_000u64),
        nonce: U256::from(1u64),
        fee_rate_bps: U256::ZERO,
        side: Side::Buy,
        signature_type: SIG_TYPE_EOA,
    };

    let sig = signer.sign_order(&order).unwrap();
    assert_eq!(sig.len(), 132, "0x + 130 hex chars");
    signing::verify_order_signature(&order, &sig, signer.address(), signer.domain_separator())
        .expect("verifier accepts own signature");
}

// ---------------------------------------------------------------------------
// Risk reject through the full pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn risk_reject_price_bounds_over_http() {
    let h = harness().await;
    let response = h
        .app
        .oneshot(json_request(
            "POST",
            "/v1/orders",
            serde_json::json!({
                "token_id": "999",
                "price": 1.5,
                "size": 10.0,
                "side": "BUY",
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "RISK_REJECT");
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("price 1.5000 out of bounds (0-1)"));
}

// ---------------------------------------------------------------------------
// Slippage gate: fresh book accepts in-window prices. The stale-book reject
// (book older than 10 s) is covered in the risk engine's unit tests, where
// the book timestamp can be backdated.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fresh_book_within_slippage_window_passes_risk() {
    let h = harness().await;
    // Give the default tenant a slippage limit by re-registering it.
    let tenant = h.state.registry.default_tenant().unwrap();
    let mut strict = (*tenant).clone();
    strict.risk.max_slippage = 0.05;
    h.state.registry.replace(strict);

    h.feed.subscribe(&["T".to_string()]);
    let book = h.feed.book("T").unwrap();
    book.snapshot(
        vec![],
        vec![clobgate::book::Level {
            price: "0.62".parse().unwrap(),
            size: "10".parse().unwrap(),
        }],
    );
    // Books only go stale after 10 s of silence; waiting is not an option in
    // a unit run, so assert the fresh-book path accepts instead and leave
    // staleness to the risk engine's own tests.
    let response = h
        .app
        .oneshot(json_request(
            "POST",
            "/v1/orders",
            serde_json::json!({
                "token_id": "T",
                "price": 0.62,
                "size": 10.0,
                "side": "BUY",
            }),
        ))
        .await
        .unwrap();
    // Fresh book, in-window price: the order passes risk and dies at the
    // unroutable exchange instead.
    let status = response.status();
    let body = body_json(response).await;
    assert_ne!(body["code"], "RISK_REJECT", "fresh book must not reject: {body}");
    assert!(status.is_client_error() || status.is_server_error());
}

// ---------------------------------------------------------------------------
// Idempotent replay
// ---------------------------------------------------------------------------

fn replay_test_router(state: AppState, hits: Arc<AtomicUsize>) -> Router {
    // The real middleware chain around a deterministic handler: exercising
    // replay without needing a live exchange behind PlaceOrder.
    let handler = move || {
        let hits = hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            Json(serde_json::json!({ "id": "0x88", "status": "matched" }))
        }
    };
    Router::new()
        .route("/v1/orders", post(handler))
        .layer(from_fn_with_state(state.clone(), mw::idempotency_middleware))
        .layer(from_fn_with_state(state.clone(), mw::ratelimit_middleware))
        .layer(from_fn_with_state(state.clone(), mw::auth_middleware))
        .with_state(state)
}

#[tokio::test]
async fn idempotent_replay_returns_identical_body_without_reinvoking() {
    let h = harness().await;
    let hits = Arc::new(AtomicUsize::new(0));
    let app = replay_test_router(h.state.clone(), hits.clone());

    let request = || {
        Request::builder()
            .method("POST")
            .uri("/v1/orders")
            .header("x-gateway-key", GATEWAY_KEY)
            .header("x-idempotency-key", "k1")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap()
    };

    let first = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = to_bytes(first.into_body(), usize::MAX).await.unwrap();

    let second = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = to_bytes(second.into_body(), usize::MAX).await.unwrap();

    assert_eq!(first_body, second_body, "replayed byte-identical");
    assert_eq!(hits.load(Ordering::SeqCst), 1, "handler ran exactly once");
}

// ---------------------------------------------------------------------------
// A concurrent duplicate sees 409 while the first request is in flight
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_duplicate_conflicts_while_processing() {
    let h = harness().await;

    // Pre-lock the key exactly as an in-flight request would.
    let tenant = h.state.registry.default_tenant().unwrap();
    let key = idempotency_key(&tenant.id, "k1");
    assert!(h.state.idempotency.get_or_lock(&key).await.is_none());

    let hits = Arc::new(AtomicUsize::new(0));
    let app = replay_test_router(h.state.clone(), hits.clone());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/orders")
                .header("x-gateway-key", GATEWAY_KEY)
                .header("x-idempotency-key", "k1")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["error"], "request in progress");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn server_error_unlocks_for_retry() {
    let h = harness().await;
    let state = h.state.clone();
    let failing: Router = Router::new()
        .route(
            "/v1/orders",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        )
        .layer(from_fn_with_state(state.clone(), mw::idempotency_middleware))
        .layer(from_fn_with_state(state.clone(), mw::auth_middleware))
        .with_state(state);

    let request = || {
        Request::builder()
            .method("POST")
            .uri("/v1/orders")
            .header("x-gateway-key", GATEWAY_KEY)
            .header("x-idempotency-key", "k-fail")
            .body(Body::empty())
            .unwrap()
    };

    let first = failing.clone().oneshot(request()).await.unwrap();
    assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // The key was released: a retry is the executor again, not a replay.
    let tenant = h.state.registry.default_tenant().unwrap();
    let key = idempotency_key(&tenant.id, "k-fail");
    assert!(h.state.idempotency.get_or_lock(&key).await.is_none());
}

// ---------------------------------------------------------------------------
// Panic mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn panic_mode_blocks_subsequent_orders() {
    let h = harness().await;

    // Cancel-all dies at the unroutable exchange, but the flag engages first.
    let response = h
        .app
        .clone()
        .oneshot(empty_request("DELETE", "/v1/panic"))
        .await
        .unwrap();
    assert!(response.status().is_client_error() || response.status().is_server_error());
    assert!(h.state.gateway.panic_active());

    let response = h
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/orders",
            serde_json::json!({
                "token_id": "999",
                "price": 0.5,
                "size": 10.0,
                "side": "BUY",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["code"], "SYSTEM_PANIC");
}

// ---------------------------------------------------------------------------
// Book snapshot + delta through the query endpoint
// ---------------------------------------------------------------------------

#[tokio::test]
async fn book_delta_then_query() {
    let h = harness().await;
    h.feed.subscribe(&["T".to_string()]);
    let book = h.feed.book("T").unwrap();
    book.snapshot(
        vec![
            clobgate::book::Level {
                price: "0.64".parse().unwrap(),
                size: "100".parse().unwrap(),
            },
            clobgate::book::Level {
                price: "0.63".parse().unwrap(),
                size: "50".parse().unwrap(),
            },
        ],
        vec![clobgate::book::Level {
            price: "0.66".parse().unwrap(),
            size: "80".parse().unwrap(),
        }],
    );
    book.update(
        clobgate::types::Side::Buy,
        "0.64".parse().unwrap(),
        "0".parse().unwrap(),
    );
    book.update(
        clobgate::types::Side::Buy,
        "0.65".parse().unwrap(),
        "30".parse().unwrap(),
    );

    let response = h
        .app
        .oneshot(empty_request("GET", "/v1/markets/T/book"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    assert_eq!(body["token_id"], "T");
    let bids = body["bids"].as_array().unwrap();
    assert_eq!(bids.len(), 2);
    assert_eq!(bids[0]["price"], "0.65");
    assert_eq!(bids[0]["size"], "30");
    assert_eq!(bids[1]["price"], "0.63");
    let asks = body["asks"].as_array().unwrap();
    assert_eq!(asks.len(), 1);
    assert_eq!(asks[0]["price"], "0.66");
}

#[tokio::test]
async fn unknown_book_is_not_found_then_subscribed() {
    let h = harness().await;
    let response = h
        .app
        .clone()
        .oneshot(empty_request("GET", "/v1/markets/UNSEEN/book"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["code"], "NOT_FOUND");

    // The miss registered a subscription: the book now exists (empty).
    let response = h
        .app
        .oneshot(empty_request("GET", "/v1/markets/UNSEEN/book"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ---------------------------------------------------------------------------
// Pipeline plumbing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_is_public() {
    let h = harness().await;
    let response = h
        .app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn metrics_is_public_prometheus_text() {
    clobgate::metrics::register_metrics();
    let h = harness().await;
    let response = h
        .app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let ct = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(ct.starts_with("text/plain"));
}

#[tokio::test]
async fn requests_echo_request_id() {
    let h = harness().await;
    let response = h
        .app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert_eq!(request_id.len(), 36, "uuid v4 echoed: {request_id}");
}

#[tokio::test]
async fn unknown_gateway_key_is_unauthorized() {
    let h = harness().await;
    let response = h
        .app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/v1/fills")
                .header("x-gateway-key", "bogus")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_key_binds_default_tenant_when_auth_not_required() {
    let h = harness().await;
    let response = h
        .app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/v1/fills")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn rate_limit_answers_429_when_bucket_is_dry() {
    let h = harness().await;
    // Replace the default tenant with a one-request bucket.
    let tenant = h.state.registry.default_tenant().unwrap();
    let mut throttled = (*tenant).clone();
    throttled.rate.qps = 0.000001;
    throttled.rate.burst = 1;
    h.state.registry.replace(throttled);

    let first = h
        .app
        .clone()
        .oneshot(empty_request("GET", "/v1/fills"))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = h
        .app
        .oneshot(empty_request("GET", "/v1/fills"))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(second).await;
    assert_eq!(body["error"], "rate limit exceeded");
}

#[tokio::test]
async fn malformed_order_json_is_invalid_request() {
    let h = harness().await;
    let response = h
        .app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/orders")
                .header("x-gateway-key", GATEWAY_KEY)
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn admin_routes_require_admin_key() {
    let mut cfg = test_config();
    cfg.auth.admin_key = "root-key".into();
    let config = Arc::new(cfg);
    let registry = Arc::new(TenantRegistry::new(config.clone(), None));
    let feed = MarketFeed::new(config.exchange.ws_url.clone());
    let risk = Arc::new(RiskEngine::new(
        Arc::new(MemoryUsageStore::new()),
        feed.clone(),
    ));
    let nonce = Arc::new(NonceManager::new(
        "",
        config.exchange.contract.parse().unwrap(),
    ));
    let gateway = Arc::new(
        GatewayService::new(config.clone(), registry.clone(), risk, nonce, feed, None).unwrap(),
    );
    let log_dir = std::env::temp_dir().join(format!("clobgate-test-{}", uuid_suffix()));
    let (audit, _handle) = AuditSink::new(&log_dir, None).unwrap();
    let app = build_router(AppState {
        config,
        gateway,
        registry,
        audit,
        idempotency: Arc::new(MemoryIdempotencyStore::new()),
    });

    // No key: denied.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/tenants")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Correct key: allowed.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/tenants")
                .header("x-admin-key", "root-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Create, then fetch masked.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/tenants")
                .header("x-admin-key", "root-key")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "id": "t-new",
                        "name": "New Bot",
                        "api_key": "gw-new",
                        "creds": {"l2_api_secret": "topsecret"},
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["creds"]["l2_api_secret"], "***");
}

#[tokio::test]
async fn read_only_mode_rejects_mutations() {
    let mut cfg = test_config();
    cfg.server.read_only = true;
    let config = Arc::new(cfg);
    let registry = Arc::new(TenantRegistry::new(config.clone(), None));
    let feed = MarketFeed::new(config.exchange.ws_url.clone());
    let risk = Arc::new(RiskEngine::new(
        Arc::new(MemoryUsageStore::new()),
        feed.clone(),
    ));
    let nonce = Arc::new(NonceManager::new(
        "",
        config.exchange.contract.parse().unwrap(),
    ));
    let gateway = Arc::new(
        GatewayService::new(config.clone(), registry.clone(), risk, nonce, feed, None).unwrap(),
    );
    let log_dir = std::env::temp_dir().join(format!("clobgate-test-{}", uuid_suffix()));
    let (audit, _handle) = AuditSink::new(&log_dir, None).unwrap();
    let app = build_router(AppState {
        config,
        gateway,
        registry,
        audit,
        idempotency: Arc::new(MemoryIdempotencyStore::new()),
    });

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/orders",
            serde_json::json!({"token_id": "1", "price": 0.5, "size": 1.0, "side": "BUY"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["code"], "READ_ONLY");

    // Reads still work.
    let response = app
        .oneshot(empty_request("GET", "/v1/fills"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ---------------------------------------------------------------------------
// Idempotency contract (invariants 6 and 7) against the trait object
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_or_lock_save_get_or_lock_returns_completed() {
    let store: Arc<dyn IdempotencyStore> = Arc::new(MemoryIdempotencyStore::new());
    assert!(store.get_or_lock("t:k").await.is_none());
    store.save("t:k", 200, b"body").await;
    let rec = store.get_or_lock("t:k").await.expect("hit");
    assert!(!rec.processing);
    assert_eq!((rec.status, rec.body.as_slice()), (200, b"body".as_slice()));
}

#[tokio::test]
async fn concurrent_lockers_elect_one_executor() {
    let store: Arc<dyn IdempotencyStore> = Arc::new(MemoryIdempotencyStore::new());
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.get_or_lock("t:race").await.is_none()
        }));
    }
    let mut winners = 0;
    for t in tasks {
        if t.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

// ---------------------------------------------------------------------------
// Audit sink behaviour through the pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn audit_records_are_written_and_redacted() {
    let h = harness().await;
    let _ = h
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/orders",
            serde_json::json!({
                "token_id": "999",
                "price": 1.5,
                "size": 10.0,
                "side": "BUY",
                "signature": "",
                "l2": {"api_key": "leaky", "api_secret": "leakier", "api_passphrase": "x"},
            }),
        ))
        .await
        .unwrap();

    // The sink consumer is async; give it a beat.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let records = h.state.audit.list("", 10, None, None).await;
    assert!(!records.is_empty());
    let record = &records[0];
    assert_eq!(record.method, "POST");
    assert_eq!(record.path, "/v1/orders");
    assert!(
        !record.request_body.contains("leakier"),
        "secrets must be redacted: {}",
        record.request_body
    );
    assert!(record.request_body.contains("***"));
}
