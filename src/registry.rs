//! Tenant registry: gateway-key → tenant resolution, per-tenant rate
//! limiters, and lazily-built exchange clients and order signers.
//!
//! One RwLock guards all four maps. Resolution order is in-memory map, then
//! the durable repository; a repo hit is cached and gets its limiter
//! allocated on the way in.

use alloy_primitives::Address;
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::exchange::{ExchangeClient, ExchangeCreds};
use crate::ratelimit::TokenBucket;
use crate::signing::OrderSigner;
use crate::types::{RateLimitConfig, Tenant};

/// Durable tenant storage behind the in-memory cache.
#[async_trait]
pub trait TenantRepo: Send + Sync {
    async fn get_by_api_key(&self, api_key: &str) -> anyhow::Result<Option<Tenant>>;
    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<Tenant>>;
    async fn list(&self) -> anyhow::Result<Vec<Tenant>>;
    async fn create(&self, tenant: &Tenant) -> anyhow::Result<()>;
    async fn update(&self, tenant: &Tenant) -> anyhow::Result<()>;
    async fn delete(&self, id: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
struct Inner {
    /// Gateway access key → tenant.
    tenants: FxHashMap<String, Arc<Tenant>>,
    /// Tenant ID → token bucket.
    limiters: FxHashMap<String, Arc<TokenBucket>>,
    /// Tenant ID → exchange client (lazily built).
    clients: FxHashMap<String, Arc<ExchangeClient>>,
    /// Tenant ID → order signer (custodial tenants only, lazily built).
    signers: FxHashMap<String, Arc<OrderSigner>>,
    default_tenant: Option<Arc<Tenant>>,
}

pub struct TenantRegistry {
    inner: RwLock<Inner>,
    config: Arc<Config>,
    repo: Option<Arc<dyn TenantRepo>>,
}

impl TenantRegistry {
    pub fn new(config: Arc<Config>, repo: Option<Arc<dyn TenantRepo>>) -> Self {
        let registry = Self {
            inner: RwLock::new(Inner::default()),
            config: config.clone(),
            repo,
        };

        if !config.tenants.is_empty() {
            for tc in &config.tenants {
                let tenant = Tenant {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    api_key: tc.api_key.clone(),
                    allowed_signers: tc.signers.clone(),
                    creds: tc.credentials.clone(),
                    risk: config.risk.merged_with(&tc.risk),
                    rate: tc.rate_limit.clone().unwrap_or_default(),
                };
                registry.register(tenant);
            }
            return registry;
        }

        // Single-tenant compatibility: a default tenant built from the
        // top-level credentials, bound when auth is not required.
        if config.credentials.has_l2() || !config.auth.api_key.is_empty() {
            let mut api_key = config.auth.api_key.clone();
            if api_key.is_empty() {
                api_key = "sk-default-12345".to_string();
            }
            let tenant = Tenant {
                id: "default-tenant".into(),
                name: "Default User".into(),
                api_key,
                allowed_signers: Vec::new(),
                creds: config.credentials.clone(),
                risk: config.risk.merged_with(&Default::default()),
                rate: RateLimitConfig::default(),
            };
            let arc = registry.register(tenant);
            registry.inner.write().default_tenant = Some(arc);
        }

        registry
    }

    /// Insert a tenant and allocate its limiter.
    pub fn register(&self, tenant: Tenant) -> Arc<Tenant> {
        let tenant = Arc::new(tenant);
        let mut inner = self.inner.write();
        let bucket = if tenant.rate.qps == 0.0 {
            TokenBucket::unlimited()
        } else {
            TokenBucket::new(tenant.rate.qps, tenant.rate.burst)
        };
        inner.limiters.insert(tenant.id.clone(), Arc::new(bucket));
        inner.tenants.insert(tenant.api_key.clone(), tenant.clone());
        info!(tenant = %tenant.id, "tenant registered");
        tenant
    }

    /// Replace a tenant wholesale: cached client, signer and limiter are
    /// rebuilt on next use.
    pub fn replace(&self, tenant: Tenant) -> Arc<Tenant> {
        self.remove_by_id(&tenant.id);
        self.register(tenant)
    }

    pub fn remove_by_id(&self, id: &str) {
        let mut inner = self.inner.write();
        inner.tenants.retain(|_, t| t.id != id);
        inner.limiters.remove(id);
        inner.clients.remove(id);
        inner.signers.remove(id);
        if inner
            .default_tenant
            .as_ref()
            .is_some_and(|t| t.id == id)
        {
            inner.default_tenant = None;
        }
    }

    /// Map lookup only; no repository fallback.
    pub fn get_by_api_key(&self, api_key: &str) -> Option<Arc<Tenant>> {
        self.inner.read().tenants.get(api_key).cloned()
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<Tenant>> {
        self.inner
            .read()
            .tenants
            .values()
            .find(|t| t.id == id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<Tenant>> {
        let inner = self.inner.read();
        let mut seen = std::collections::HashSet::new();
        inner
            .tenants
            .values()
            .filter(|t| seen.insert(t.id.clone()))
            .cloned()
            .collect()
    }

    /// Full resolution: memory map, then durable repo (cached on hit).
    pub async fn resolve(&self, api_key: &str) -> Option<Arc<Tenant>> {
        if let Some(t) = self.get_by_api_key(api_key) {
            return Some(t);
        }
        let repo = self.repo.as_ref()?;
        match repo.get_by_api_key(api_key).await {
            Ok(Some(tenant)) => Some(self.register(tenant)),
            _ => None,
        }
    }

    pub fn default_tenant(&self) -> Option<Arc<Tenant>> {
        self.inner.read().default_tenant.clone()
    }

    pub fn limiter(&self, tenant_id: &str) -> Option<Arc<TokenBucket>> {
        self.inner.read().limiters.get(tenant_id).cloned()
    }

    pub fn repo(&self) -> Option<Arc<dyn TenantRepo>> {
        self.repo.clone()
    }

    /// Order signer for a custodial tenant (built from its private key).
    pub fn signer_for(&self, tenant: &Tenant) -> GatewayResult<Arc<OrderSigner>> {
        if let Some(signer) = self.inner.read().signers.get(&tenant.id) {
            return Ok(signer.clone());
        }
        if tenant.creds.private_key.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "signature required or tenant private key not configured".into(),
            ));
        }
        let contract: Address = self
            .config
            .exchange
            .contract
            .parse()
            .map_err(|_| GatewayError::Internal("invalid exchange contract address".into()))?;
        let signer = Arc::new(OrderSigner::new(
            &tenant.creds.private_key,
            self.config.chain.chain_id,
            contract,
        )?);
        self.inner
            .write()
            .signers
            .insert(tenant.id.clone(), signer.clone());
        Ok(signer)
    }

    /// Exchange client for a tenant, built on first use and cached.
    /// Custodial tenants announce the address derived from their key;
    /// non-custodial tenants announce their configured address.
    pub fn client_for(&self, tenant: &Tenant) -> GatewayResult<Arc<ExchangeClient>> {
        if let Some(client) = self.inner.read().clients.get(&tenant.id) {
            return Ok(client.clone());
        }
        if !tenant.creds.has_l2() {
            return Err(GatewayError::InvalidRequest(
                "missing L2 api credentials".into(),
            ));
        }

        let address = if !tenant.creds.private_key.is_empty() {
            self.signer_for(tenant)?.address().to_string()
        } else if !tenant.creds.address.is_empty() {
            tenant.creds.address.clone()
        } else {
            return Err(GatewayError::InvalidRequest(
                "tenant has neither a private key nor a signer address".into(),
            ));
        };

        let client = Arc::new(ExchangeClient::new(
            self.config.exchange.rest_url.clone(),
            ExchangeCreds {
                address,
                api_key: tenant.creds.l2_api_key.clone(),
                api_secret: tenant.creds.l2_api_secret.clone(),
                passphrase: tenant.creds.l2_api_passphrase.clone(),
            },
            Some(self.config.builder.clone()),
        ));
        self.inner
            .write()
            .clients
            .insert(tenant.id.clone(), client.clone());
        Ok(client)
    }

    /// One-off client built from request-supplied L2 credentials.
    pub fn client_with_creds(&self, address: String, creds: &crate::types::L2Creds) -> Arc<ExchangeClient> {
        Arc::new(ExchangeClient::new(
            self.config.exchange.rest_url.clone(),
            ExchangeCreds {
                address,
                api_key: creds.api_key.clone(),
                api_secret: creds.api_secret.clone(),
                passphrase: creds.api_passphrase.clone(),
            },
            Some(self.config.builder.clone()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Credentials;

    fn config_with_tenant() -> Arc<Config> {
        let mut cfg = Config::default();
        cfg.tenants = vec![crate::config::TenantConfig {
            id: "t1".into(),
            name: "Bot".into(),
            api_key: "gw-1".into(),
            signers: vec![],
            credentials: Credentials {
                l2_api_key: "k".into(),
                l2_api_secret: "c2VjcmV0".into(),
                l2_api_passphrase: "p".into(),
                ..Default::default()
            },
            risk: Default::default(),
            rate_limit: Some(RateLimitConfig { qps: 5.0, burst: 5 }),
        }];
        Arc::new(cfg)
    }

    #[test]
    fn seeds_config_tenants_with_limiters() {
        let registry = TenantRegistry::new(config_with_tenant(), None);
        let t = registry.get_by_api_key("gw-1").expect("tenant");
        assert_eq!(t.id, "t1");
        assert!(registry.limiter("t1").is_some());
        assert!(registry.get_by_api_key("nope").is_none());
    }

    #[test]
    fn default_tenant_from_top_level_credentials() {
        let mut cfg = Config::default();
        cfg.credentials = Credentials {
            l2_api_key: "k".into(),
            l2_api_secret: "s".into(),
            l2_api_passphrase: "p".into(),
            ..Default::default()
        };
        let registry = TenantRegistry::new(Arc::new(cfg), None);
        let def = registry.default_tenant().expect("default tenant");
        assert_eq!(def.id, "default-tenant");
        assert_eq!(def.api_key, "sk-default-12345");
        assert!(registry.get_by_api_key("sk-default-12345").is_some());
    }

    #[test]
    fn replace_rebuilds_cached_state() {
        let registry = TenantRegistry::new(config_with_tenant(), None);
        let t = registry.get_by_api_key("gw-1").unwrap();
        let _ = registry.client_for(&t).unwrap();

        let mut updated = (*t).clone();
        updated.api_key = "gw-2".into();
        registry.replace(updated);

        assert!(registry.get_by_api_key("gw-1").is_none());
        assert!(registry.get_by_api_key("gw-2").is_some());
        // Client cache was invalidated with the old entry.
        assert!(registry.inner.read().clients.is_empty());
    }

    #[test]
    fn remove_clears_all_maps() {
        let registry = TenantRegistry::new(config_with_tenant(), None);
        let t = registry.get_by_api_key("gw-1").unwrap();
        let _ = registry.client_for(&t).unwrap();
        registry.remove_by_id("t1");
        assert!(registry.get_by_api_key("gw-1").is_none());
        assert!(registry.limiter("t1").is_none());
    }

    #[test]
    fn custodial_tenant_gets_cached_signer() {
        let registry = TenantRegistry::new(config_with_tenant(), None);
        let t = registry.get_by_api_key("gw-1").unwrap();
        let mut custodial = (*t).clone();
        custodial.creds.private_key =
            "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".into();
        let a = registry.signer_for(&custodial).unwrap();
        let b = registry.signer_for(&custodial).unwrap();
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn non_custodial_without_address_is_rejected() {
        let registry = TenantRegistry::new(config_with_tenant(), None);
        let t = registry.get_by_api_key("gw-1").unwrap();
        let err = registry.client_for(&t).unwrap_err();
        assert!(err.to_string().contains("neither a private key"));
    }

    #[test]
    fn missing_l2_creds_is_invalid_request() {
        let mut cfg = Config::default();
        cfg.tenants = vec![crate::config::TenantConfig {
            id: "t2".into(),
            api_key: "gw-2".into(),
            ..Default::default()
        }];
        let registry = TenantRegistry::new(Arc::new(cfg), None);
        let t = registry.get_by_api_key("gw-2").unwrap();
        let err = registry.client_for(&t).unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }
}
