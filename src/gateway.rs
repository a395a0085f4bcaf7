//! Gateway orchestrator: the order-submission fast path.
//!
//! PlaceOrder pipeline: panic gate → parse (custodial vs non-custodial) →
//! pre-trade risk → build signable → defensive slippage re-check → nonce →
//! sign (or verify the client signature) → submit → post-trade usage.

use alloy_primitives::{Address, B256, U256};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::eip1271::Eip1271Verifier;
use crate::error::{GatewayError, GatewayResult};
use crate::exchange::{ExchangeClient, RelayerClient};
use crate::feed::MarketFeed;
use crate::metrics;
use crate::nonce::NonceManager;
use crate::registry::TenantRegistry;
use crate::risk::RiskEngine;
use crate::signing::{self, OrderSigner};
use crate::types::{
    Fill, Order, OrderRequest, OrderWire, RiskRequest, SignableOrder, SignedOrderEnvelope, Tenant,
    TypedOrderResponse, SIG_TYPE_EOA, SIG_TYPE_PROXY, SIG_TYPE_SAFE,
};
use crate::user_stream::UserStream;
use crate::wallets;

pub struct GatewayService {
    config: Arc<Config>,
    registry: Arc<TenantRegistry>,
    risk: Arc<RiskEngine>,
    nonce: Arc<NonceManager>,
    feed: Arc<MarketFeed>,
    user_stream: Option<Arc<UserStream>>,
    eip1271: Option<Arc<Eip1271Verifier>>,
    relayer: RelayerClient,
    chain_id: u64,
    domain_separator: B256,
    panic_mode: AtomicBool,
}

impl GatewayService {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<TenantRegistry>,
        risk: Arc<RiskEngine>,
        nonce: Arc<NonceManager>,
        feed: Arc<MarketFeed>,
        user_stream: Option<Arc<UserStream>>,
    ) -> GatewayResult<Self> {
        let contract: Address = config
            .exchange
            .contract
            .parse()
            .map_err(|_| GatewayError::Internal("invalid exchange contract address".into()))?;
        let chain_id = config.chain.chain_id;

        let eip1271 = if config.chain.rpc_url.is_empty() {
            None
        } else {
            Some(Arc::new(Eip1271Verifier::new(
                config.chain.rpc_url.clone(),
                Duration::from_secs(config.chain.eip1271_cache_seconds),
                Duration::from_millis(config.chain.eip1271_timeout_ms),
                config.chain.eip1271_retries,
            )))
        };

        Ok(Self {
            relayer: RelayerClient::new(config.relayer.base_url.clone(), config.relayer.chain_id),
            domain_separator: signing::compute_domain_separator(chain_id, contract),
            chain_id,
            config,
            registry,
            risk,
            nonce,
            feed,
            user_stream,
            eip1271,
            panic_mode: AtomicBool::new(false),
        })
    }

    pub fn panic_active(&self) -> bool {
        self.panic_mode.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // PlaceOrder
    // -----------------------------------------------------------------------

    pub async fn place_order(
        &self,
        tenant: &Tenant,
        req: OrderRequest,
    ) -> GatewayResult<serde_json::Value> {
        if self.panic_active() {
            return Err(GatewayError::SystemPanic);
        }

        let custodial = req.signature.trim().is_empty();
        if !custodial && req.signable.is_none() {
            return Err(GatewayError::InvalidRequest(
                "signable order required when providing signature".into(),
            ));
        }

        // Effective request for risk: reconstructed from the signable order
        // when the client built it.
        let risk_req = match &req.signable {
            Some(signable) => RiskRequest::from_order(&signable.order),
            None => RiskRequest::from_request(&req),
        };

        self.risk.check_order(tenant, &risk_req).await?;

        // Resolve the signer identity up front.
        let (gateway_signer, external_signer) = if custodial {
            (Some(self.registry.signer_for(tenant)?), None)
        } else {
            let addr = self.resolve_external_signer(tenant, &req)?;
            (None, Some(addr))
        };

        // Build the signable order if the client did not.
        let mut signable = match req.signable.clone() {
            Some(mut signable) => {
                if let Some(sig_type) = req.signature_type {
                    signable.order.signature_type = sig_type;
                }
                signable
            }
            None => {
                let signer_addr = match (&gateway_signer, external_signer) {
                    (Some(s), _) => s.address(),
                    (None, Some(addr)) => addr,
                    (None, None) => unreachable!("one signer path is always resolved"),
                };
                self.build_signable(&req, signer_addr)?
            }
        };

        // Defensive slippage re-check on the resolved order: the amounts that
        // will actually be signed, against the live shadow book.
        let resolved = RiskRequest::from_order(&signable.order);
        self.risk.check_slippage(&tenant.risk, &resolved)?;

        // L2 credentials: request override wins over tenant credentials.
        let client = self.resolve_client(tenant, &req, &signable.order)?;

        // No shadow book for this token yet: fall back to the exchange's
        // REST book for the price-deviation gate, and subscribe so the next
        // order sees live data.
        if tenant.risk.max_slippage > 0.0 && self.feed.book(&resolved.token_id).is_none() {
            self.rest_slippage_check(&client, &tenant.risk, &resolved).await?;
        }
        self.feed.subscribe(std::slice::from_ref(&resolved.token_id));

        let response = if let Some(signer) = gateway_signer {
            self.submit_custodial(&client, &signer, &mut signable).await?
        } else {
            self.submit_external(tenant, &client, &signable, &req).await?
        };

        self.risk.post_order_hook(tenant, &risk_req).await;
        metrics::ORDERS_SUBMITTED.with_label_values(&["accepted"]).inc();
        Ok(response)
    }

    fn resolve_external_signer(&self, tenant: &Tenant, req: &OrderRequest) -> GatewayResult<Address> {
        let signable = req.signable.as_ref().expect("checked by caller");
        let order_signer = signable.order.signer;

        if !req.signer.is_empty() {
            let claimed: Address = req
                .signer
                .trim()
                .parse()
                .map_err(|_| GatewayError::InvalidRequest("invalid signer address".into()))?;
            if claimed != order_signer {
                return Err(GatewayError::InvalidRequest(
                    "signer does not match signable order".into(),
                ));
            }
        }
        let signer_str = order_signer.to_string();
        if !tenant.allows_signer(&signer_str) {
            return Err(GatewayError::AuthFailed("signer not allowed for tenant".into()));
        }
        Ok(order_signer)
    }

    fn build_signable(&self, req: &OrderRequest, signer_addr: Address) -> GatewayResult<SignableOrder> {
        let side = req
            .side
            .ok_or_else(|| GatewayError::InvalidRequest("side is required".into()))?;
        let token_id: U256 = req
            .token_id
            .parse()
            .map_err(|_| GatewayError::InvalidRequest("invalid token_id".into()))?;

        let price = Decimal::try_from(req.price)
            .map_err(|_| GatewayError::InvalidRequest("invalid price".into()))?;
        let size = Decimal::try_from(req.size)
            .map_err(|_| GatewayError::InvalidRequest("invalid size".into()))?;
        let (maker_amount, taker_amount) = signing::calculate_amounts(side, price, size);

        let signature_type = req.signature_type.unwrap_or(SIG_TYPE_EOA);
        let maker = self.derive_maker(signer_addr, signature_type)?;

        Ok(SignableOrder {
            order: Order {
                salt: U256::from(signing::generate_salt()),
                maker,
                signer: signer_addr,
                taker: Address::ZERO,
                token_id,
                maker_amount,
                taker_amount,
                expiration: U256::from(req.expiration),
                nonce: U256::ZERO,
                fee_rate_bps: U256::ZERO,
                side,
                signature_type,
            },
            order_type: req.order_type,
            post_only: req.post_only.unwrap_or(false),
        })
    }

    fn derive_maker(&self, signer: Address, signature_type: u8) -> GatewayResult<Address> {
        match signature_type {
            SIG_TYPE_EOA => Ok(signer),
            SIG_TYPE_PROXY => wallets::derive_proxy_wallet(signer, self.chain_id).ok_or_else(|| {
                GatewayError::InvalidRequest("failed to derive proxy wallet for chain".into())
            }),
            SIG_TYPE_SAFE => wallets::derive_safe_wallet(signer, self.chain_id).ok_or_else(|| {
                GatewayError::InvalidRequest("failed to derive safe wallet for chain".into())
            }),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown signature type {other}"
            ))),
        }
    }

    /// Price-deviation gate against the exchange REST book. An empty
    /// relevant side is a hard reject: with no reference price there is
    /// nothing to bound the order against.
    async fn rest_slippage_check(
        &self,
        client: &ExchangeClient,
        risk: &crate::types::RiskConfig,
        req: &RiskRequest,
    ) -> GatewayResult<()> {
        let book = client.order_book(&req.token_id).await?;
        let slippage = Decimal::try_from(risk.max_slippage).unwrap_or_default();
        rest_book_gate(req, slippage, &book)
    }

    fn resolve_client(
        &self,
        tenant: &Tenant,
        req: &OrderRequest,
        order: &Order,
    ) -> GatewayResult<Arc<ExchangeClient>> {
        if let Some(l2) = &req.l2 {
            if l2.is_complete() {
                return Ok(self
                    .registry
                    .client_with_creds(order.signer.to_string(), l2));
            }
        }
        self.registry.client_for(tenant)
    }

    async fn submit_custodial(
        &self,
        client: &ExchangeClient,
        signer: &OrderSigner,
        signable: &mut SignableOrder,
    ) -> GatewayResult<serde_json::Value> {
        // Nonce fetch → sign → submit is strictly sequential.
        let maker = signable.order.maker;
        signable.order.nonce = self.nonce.get(maker).await;

        let timer = std::time::Instant::now();
        let signature = signer.sign_order(&signable.order)?;
        metrics::ORDER_SIGNING_LATENCY.observe(timer.elapsed().as_secs_f64());

        let envelope = SignedOrderEnvelope {
            order: OrderWire {
                order: signable.order.clone(),
                signature,
            },
            owner: client.api_key().to_string(),
            order_type: signable.order_type,
            post_only: signable.post_only,
        };

        match client.post_order(&envelope).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                if matches!(e, GatewayError::Nonce(_)) {
                    // Fire-and-forget resync; the caller retries with the
                    // fresh value.
                    warn!(maker = %maker, "nonce error from exchange, triggering resync");
                    metrics::NONCE_RESYNCS.inc();
                    let nonce = self.nonce.clone();
                    tokio::spawn(async move {
                        let _ = nonce.sync(maker).await;
                    });
                }
                metrics::ORDERS_SUBMITTED.with_label_values(&["failed"]).inc();
                Err(e)
            }
        }
    }

    async fn submit_external(
        &self,
        tenant: &Tenant,
        client: &ExchangeClient,
        signable: &SignableOrder,
        req: &OrderRequest,
    ) -> GatewayResult<serde_json::Value> {
        let sig_type = req
            .signature_type
            .unwrap_or(signable.order.signature_type);

        match sig_type {
            SIG_TYPE_SAFE => {
                if !tenant.risk.allow_unverified_signatures {
                    let verifier = self.eip1271.as_ref().ok_or_else(|| {
                        GatewayError::Internal("rpc url not configured".into())
                    })?;
                    let digest = signing::order_digest(&signable.order, &self.domain_separator);
                    let valid = verifier
                        .verify(signable.order.maker, digest, &req.signature)
                        .await?;
                    if !valid {
                        return Err(GatewayError::AuthFailed("invalid safe signature".into()));
                    }
                }
            }
            SIG_TYPE_EOA | SIG_TYPE_PROXY => {
                signing::verify_order_signature(
                    &signable.order,
                    &req.signature,
                    signable.order.signer,
                    &self.domain_separator,
                )?;
            }
            _ => {
                if !tenant.risk.allow_unverified_signatures {
                    return Err(GatewayError::AuthFailed(
                        "signature type not supported for verification".into(),
                    ));
                }
            }
        }

        let envelope = SignedOrderEnvelope {
            order: OrderWire {
                order: signable.order.clone(),
                signature: req.signature.clone(),
            },
            owner: client.api_key().to_string(),
            order_type: signable.order_type,
            post_only: signable.post_only,
        };

        client.post_order(&envelope).await.inspect_err(|_| {
            metrics::ORDERS_SUBMITTED.with_label_values(&["failed"]).inc();
        })
    }

    // -----------------------------------------------------------------------
    // Cancels, typed orders, panic
    // -----------------------------------------------------------------------

    pub async fn cancel_order(&self, tenant: &Tenant, order_id: &str) -> GatewayResult<serde_json::Value> {
        let client = self.registry.client_for(tenant)?;
        client.cancel_order(order_id).await
    }

    pub async fn cancel_all(&self, tenant: &Tenant) -> GatewayResult<serde_json::Value> {
        let client = self.registry.client_for(tenant)?;
        let resp = client.cancel_all().await?;
        // Cancel-all invalidates every outstanding order of the maker: bump
        // the local nonce so new orders pick up the next value immediately.
        if let Some(maker) = self.maker_for(tenant) {
            self.nonce.increment(maker);
        }
        Ok(resp)
    }

    pub async fn build_typed_order(
        &self,
        tenant: &Tenant,
        req: OrderRequest,
    ) -> GatewayResult<TypedOrderResponse> {
        if req.signer.is_empty() {
            return Err(GatewayError::InvalidRequest("signer is required".into()));
        }
        if !tenant.allows_signer(&req.signer) {
            return Err(GatewayError::AuthFailed("signer not allowed for tenant".into()));
        }
        let risk_req = RiskRequest::from_request(&req);
        self.risk.check_order(tenant, &risk_req).await?;

        let signer_addr: Address = req
            .signer
            .trim()
            .parse()
            .map_err(|_| GatewayError::InvalidRequest("invalid signer address".into()))?;
        let signable = self.build_signable(&req, signer_addr)?;
        let contract: Address = self
            .config
            .exchange
            .contract
            .parse()
            .map_err(|_| GatewayError::Internal("invalid exchange contract address".into()))?;
        let typed_data = signing::build_typed_data(&signable.order, self.chain_id, contract);
        Ok(TypedOrderResponse {
            signable,
            typed_data,
        })
    }

    /// Set the process-global panic flag and cancel the caller's orders.
    /// The flag is not automatically cleared; a restart is the way back.
    pub async fn activate_panic_mode(&self, tenant: &Tenant) -> GatewayResult<()> {
        self.panic_mode.store(true, Ordering::SeqCst);
        metrics::PANIC_MODE.set(1);
        info!(tenant = %tenant.id, "panic mode activated, cancelling all orders");
        self.cancel_all(tenant).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Market data, fills, account
    // -----------------------------------------------------------------------

    pub fn fills(&self) -> Vec<Fill> {
        self.user_stream
            .as_ref()
            .map(|s| s.fills())
            .unwrap_or_default()
    }

    /// Shadow book for a token. An unknown token is subscribed and reported
    /// absent until its first snapshot arrives.
    pub fn orderbook(&self, token_id: &str) -> Option<Arc<crate::book::Orderbook>> {
        match self.feed.book(token_id) {
            Some(book) => Some(book),
            None => {
                self.feed.subscribe(&[token_id.to_string()]);
                None
            }
        }
    }

    /// The deterministic proxy-wallet address for this tenant's signer.
    pub fn proxy_address(&self, tenant: &Tenant) -> GatewayResult<Address> {
        let owner = self
            .maker_for(tenant)
            .ok_or_else(|| GatewayError::InvalidRequest("tenant has no signer address".into()))?;
        wallets::derive_proxy_wallet(owner, self.chain_id)
            .ok_or_else(|| GatewayError::InvalidRequest("no proxy factory for chain".into()))
    }

    /// Deploy the tenant's proxy wallet through the relayer.
    pub async fn deploy_proxy(&self, tenant: &Tenant) -> GatewayResult<serde_json::Value> {
        let owner = self
            .maker_for(tenant)
            .ok_or_else(|| GatewayError::InvalidRequest("tenant has no signer address".into()))?;
        self.relayer.deploy_proxy(&owner.to_string()).await
    }

    fn maker_for(&self, tenant: &Tenant) -> Option<Address> {
        if !tenant.creds.private_key.is_empty() {
            if let Ok(signer) = self.registry.signer_for(tenant) {
                return Some(signer.address());
            }
        }
        tenant.creds.address.parse().ok()
    }
}

/// Bound an order price against the REST book's top of the relevant side.
fn rest_book_gate(
    req: &RiskRequest,
    slippage: Decimal,
    book: &crate::exchange::RestBook,
) -> GatewayResult<()> {
    match req.side {
        crate::types::Side::Buy => {
            let Some(level) = book.asks.first() else {
                return Err(GatewayError::RiskReject(
                    "order book empty for slippage check".into(),
                ));
            };
            let best_ask: Decimal = level.price.parse().map_err(|_| {
                GatewayError::RiskReject("invalid ask price for slippage check".into())
            })?;
            let max_allowed = best_ask * (Decimal::ONE + slippage);
            if req.price > max_allowed {
                return Err(GatewayError::RiskReject(format!(
                    "price {:.4} exceeds max slippage",
                    req.price_f64()
                )));
            }
        }
        crate::types::Side::Sell => {
            let Some(level) = book.bids.first() else {
                return Err(GatewayError::RiskReject(
                    "order book empty for slippage check".into(),
                ));
            };
            let best_bid: Decimal = level.price.parse().map_err(|_| {
                GatewayError::RiskReject("invalid bid price for slippage check".into())
            })?;
            let min_allowed = best_bid * (Decimal::ONE - slippage);
            if req.price < min_allowed {
                return Err(GatewayError::RiskReject(format!(
                    "price {:.4} exceeds max slippage",
                    req.price_f64()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::MemoryUsageStore;
    use crate::types::{Credentials, RiskConfig};

    const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn build_gateway() -> (GatewayService, Arc<TenantRegistry>) {
        let mut raw = Config::default();
        // Unroutable endpoint: submissions fail fast instead of reaching a
        // live exchange from unit tests.
        raw.exchange.rest_url = "http://127.0.0.1:1".into();
        let config = Arc::new(raw);
        let registry = Arc::new(TenantRegistry::new(config.clone(), None));
        let feed = MarketFeed::new("wss://example.invalid/ws");
        let risk = Arc::new(RiskEngine::new(Arc::new(MemoryUsageStore::new()), feed.clone()));
        let nonce = Arc::new(NonceManager::new(
            "",
            config.exchange.contract.parse().unwrap(),
        ));
        let gw = GatewayService::new(config, registry.clone(), risk, nonce, feed, None).unwrap();
        (gw, registry)
    }

    fn custodial_tenant() -> Tenant {
        Tenant {
            id: "t1".into(),
            api_key: "gw-1".into(),
            creds: Credentials {
                private_key: TEST_KEY.into(),
                l2_api_key: "k".into(),
                l2_api_secret: "c2VjcmV0".into(),
                l2_api_passphrase: "p".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn basic_request() -> OrderRequest {
        OrderRequest {
            token_id: "999".into(),
            price: 0.5,
            size: 100.0,
            side: Some(crate::types::Side::Buy),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn panic_mode_rejects_all_orders() {
        let (gw, _) = build_gateway();
        gw.panic_mode.store(true, Ordering::SeqCst);
        let err = gw
            .place_order(&custodial_tenant(), basic_request())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SYSTEM_PANIC");
    }

    #[tokio::test]
    async fn signature_without_signable_is_invalid() {
        let (gw, _) = build_gateway();
        let mut req = basic_request();
        req.signature = "0xabcd".into();
        let err = gw
            .place_order(&custodial_tenant(), req)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
        assert!(err.to_string().contains("signable order required"));
    }

    #[tokio::test]
    async fn risk_reject_carries_reason() {
        let (gw, _) = build_gateway();
        let mut req = basic_request();
        req.price = 1.5;
        let err = gw
            .place_order(&custodial_tenant(), req)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RISK_REJECT");
        assert!(err.to_string().contains("price 1.5000 out of bounds (0-1)"));
    }

    #[tokio::test]
    async fn custodial_without_private_key_is_rejected() {
        let (gw, _) = build_gateway();
        let mut tenant = custodial_tenant();
        tenant.creds.private_key = String::new();
        let err = gw.place_order(&tenant, basic_request()).await.unwrap_err();
        assert!(err.to_string().contains("signature required"));
    }

    #[test]
    fn build_signable_derives_maker_per_signature_type() {
        let (gw, registry) = build_gateway();
        let tenant = custodial_tenant();
        let signer = registry.signer_for(&tenant).unwrap();

        let mut req = basic_request();
        let eoa = gw.build_signable(&req, signer.address()).unwrap();
        assert_eq!(eoa.order.maker, signer.address());
        assert_eq!(eoa.order.signature_type, SIG_TYPE_EOA);

        req.signature_type = Some(SIG_TYPE_PROXY);
        let proxy = gw.build_signable(&req, signer.address()).unwrap();
        assert_ne!(proxy.order.maker, signer.address());
        assert_eq!(proxy.order.signature_type, SIG_TYPE_PROXY);

        req.signature_type = Some(SIG_TYPE_SAFE);
        let safe = gw.build_signable(&req, signer.address()).unwrap();
        assert_ne!(safe.order.maker, proxy.order.maker);
    }

    #[test]
    fn build_signable_amounts_match_price_and_size() {
        let (gw, registry) = build_gateway();
        let tenant = custodial_tenant();
        let signer = registry.signer_for(&tenant).unwrap();
        let signable = gw.build_signable(&basic_request(), signer.address()).unwrap();
        // BUY 100 @ 0.50: pay 50 USDC, receive 100 tokens.
        assert_eq!(signable.order.maker_amount, U256::from(50_000_000u64));
        assert_eq!(signable.order.taker_amount, U256::from(100_000_000u64));
        assert_eq!(signable.order.token_id, U256::from(999u64));
        assert_eq!(signable.order.taker, Address::ZERO);
    }

    #[tokio::test]
    async fn typed_order_requires_signer() {
        let (gw, _) = build_gateway();
        let err = gw
            .build_typed_order(&custodial_tenant(), basic_request())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("signer is required"));
    }

    #[tokio::test]
    async fn typed_order_returns_signable_and_typed_data() {
        let (gw, _) = build_gateway();
        let mut req = basic_request();
        req.signer = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".into();
        let resp = gw
            .build_typed_order(&custodial_tenant(), req)
            .await
            .unwrap();
        assert_eq!(resp.typed_data["primaryType"], "Order");
        assert_eq!(
            resp.signable.order.signer.to_string().to_lowercase(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[tokio::test]
    async fn typed_order_enforces_signer_whitelist() {
        let (gw, _) = build_gateway();
        let mut tenant = custodial_tenant();
        tenant.allowed_signers = vec!["0x1111111111111111111111111111111111111111".into()];
        let mut req = basic_request();
        req.signer = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".into();
        let err = gw.build_typed_order(&tenant, req).await.unwrap_err();
        assert_eq!(err.code(), "AUTH_FAILED");
    }

    #[tokio::test]
    async fn external_signer_mismatch_is_rejected() {
        let (gw, _) = build_gateway();
        let signer: Address = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
            .parse()
            .unwrap();
        let signable = gw.build_signable(&basic_request(), signer).unwrap();
        let mut req = basic_request();
        req.signable = Some(signable);
        req.signature = "0x00".into();
        req.signer = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".into();
        let err = gw
            .place_order(&custodial_tenant(), req)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("signer does not match"));
    }

    #[tokio::test]
    async fn external_bad_signature_fails_verification() {
        let (gw, _) = build_gateway();
        let signer: Address = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
            .parse()
            .unwrap();
        let signable = gw.build_signable(&basic_request(), signer).unwrap();
        let mut req = basic_request();
        req.signable = Some(signable);
        // 65 zero bytes: structurally valid, cryptographically garbage.
        req.signature = format!("0x{}", "00".repeat(65));
        let err = gw
            .place_order(&custodial_tenant(), req)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AUTH_FAILED");
    }

    #[tokio::test]
    async fn external_valid_signature_reaches_submission() {
        let (gw, registry) = build_gateway();
        let tenant = custodial_tenant();
        let signer = registry.signer_for(&tenant).unwrap();
        let mut signable = gw.build_signable(&basic_request(), signer.address()).unwrap();
        signable.order.nonce = U256::ZERO;
        let signature = signer.sign_order(&signable.order).unwrap();

        let mut req = basic_request();
        req.signable = Some(signable);
        req.signature = signature;
        // Verification passes; the submission then fails against the real
        // exchange host, surfacing as an upstream/internal error rather than
        // AUTH_FAILED.
        let err = gw.place_order(&tenant, req).await.unwrap_err();
        assert_ne!(err.code(), "AUTH_FAILED");
    }

    #[tokio::test]
    async fn safe_orders_without_rpc_cannot_verify() {
        let (gw, registry) = build_gateway();
        let tenant = custodial_tenant();
        let signer = registry.signer_for(&tenant).unwrap();
        let mut req = basic_request();
        req.signature_type = Some(SIG_TYPE_SAFE);
        let signable = gw.build_signable(&req, signer.address()).unwrap();
        req.signable = Some(signable);
        req.signature = format!("0x{}", "11".repeat(65));
        let err = gw.place_order(&tenant, req).await.unwrap_err();
        assert!(err.to_string().contains("rpc url not configured"));
    }

    #[tokio::test]
    async fn unsupported_signature_type_needs_opt_in() {
        let (gw, registry) = build_gateway();
        let tenant = custodial_tenant();
        let signer = registry.signer_for(&tenant).unwrap();
        let signable = gw.build_signable(&basic_request(), signer.address()).unwrap();

        let mut req = basic_request();
        let mut odd = signable.clone();
        odd.order.signature_type = 7;
        req.signable = Some(odd);
        req.signature = "0x1234".into();
        req.signature_type = Some(7);
        let err = gw.place_order(&tenant, req.clone()).await.unwrap_err();
        assert!(err.to_string().contains("not supported"));

        // With the tenant opt-in the gateway forwards unverified.
        let mut lax = tenant.clone();
        lax.risk = RiskConfig {
            allow_unverified_signatures: true,
            ..Default::default()
        };
        let err = gw.place_order(&lax, req).await.unwrap_err();
        assert!(!err.to_string().contains("not supported"));
    }

    #[test]
    fn proxy_address_derives_from_tenant_key() {
        let (gw, _) = build_gateway();
        let tenant = custodial_tenant();
        let proxy = gw.proxy_address(&tenant).unwrap();
        assert_ne!(proxy, Address::ZERO);
        // Deterministic.
        assert_eq!(proxy, gw.proxy_address(&tenant).unwrap());
    }

    #[test]
    fn orderbook_subscribes_unknown_tokens() {
        let (gw, _) = build_gateway();
        assert!(gw.orderbook("fresh-token").is_none());
        // The subscription created the (empty) book.
        assert!(gw.orderbook("fresh-token").is_some());
    }

    fn rest_book(bids: &[(&str, &str)], asks: &[(&str, &str)]) -> crate::exchange::RestBook {
        let level = |(price, size): &(&str, &str)| crate::exchange::RestLevel {
            price: price.to_string(),
            size: size.to_string(),
        };
        crate::exchange::RestBook {
            bids: bids.iter().map(level).collect(),
            asks: asks.iter().map(level).collect(),
        }
    }

    fn gate_req(price: &str, side: crate::types::Side) -> RiskRequest {
        RiskRequest {
            token_id: "T".into(),
            price: price.parse().unwrap(),
            size: Decimal::from(10),
            side,
        }
    }

    #[test]
    fn rest_gate_rejects_empty_relevant_side() {
        let slippage = Decimal::new(5, 2);
        // BUY needs asks; a bids-only book must not pass unchecked.
        let err = rest_book_gate(
            &gate_req("0.50", crate::types::Side::Buy),
            slippage,
            &rest_book(&[("0.49", "10")], &[]),
        )
        .unwrap_err();
        assert_eq!(err.code(), "RISK_REJECT");
        assert!(err.to_string().contains("order book empty"));

        let err = rest_book_gate(
            &gate_req("0.50", crate::types::Side::Sell),
            slippage,
            &rest_book(&[], &[("0.51", "10")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("order book empty"));
    }

    #[test]
    fn rest_gate_bounds_both_sides() {
        let slippage = Decimal::new(5, 2);
        let book = rest_book(&[("0.60", "10")], &[("0.62", "10")]);

        // Buy limit: 0.62 * 1.05 = 0.651.
        rest_book_gate(&gate_req("0.651", crate::types::Side::Buy), slippage, &book).unwrap();
        let err = rest_book_gate(&gate_req("0.66", crate::types::Side::Buy), slippage, &book)
            .unwrap_err();
        assert!(err.to_string().contains("exceeds max slippage"));

        // Sell floor: 0.60 * 0.95 = 0.57.
        rest_book_gate(&gate_req("0.57", crate::types::Side::Sell), slippage, &book).unwrap();
        let err = rest_book_gate(&gate_req("0.56", crate::types::Side::Sell), slippage, &book)
            .unwrap_err();
        assert!(err.to_string().contains("exceeds max slippage"));
    }

    #[test]
    fn rest_gate_rejects_unparseable_top_of_book() {
        let slippage = Decimal::new(5, 2);
        let err = rest_book_gate(
            &gate_req("0.50", crate::types::Side::Buy),
            slippage,
            &rest_book(&[], &[("not-a-price", "10")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid ask price"));
    }
}
