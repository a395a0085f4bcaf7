//! Gateway configuration.
//!
//! Layered: `config/default.{toml,yaml}` then `config/local.*`, then
//! environment variables with the `CLOBGATE` prefix (`CLOBGATE_SERVER__PORT`
//! etc.). `load_with_defaults` builds a usable config from plain environment
//! variables alone, for containers without a config file.

use serde::Deserialize;

use crate::signing;
use crate::types::{Credentials, RateLimitConfig, RiskConfig};

fn default_port() -> u16 {
    8080
}
fn default_chain_id() -> u64 {
    signing::DEFAULT_CHAIN_ID
}
fn default_exchange_contract() -> String {
    signing::EXCHANGE_CONTRACT.to_string()
}
fn default_rest_url() -> String {
    "https://clob.polymarket.com".to_string()
}
fn default_ws_url() -> String {
    "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string()
}
fn default_relayer_url() -> String {
    "https://relayer-v2.polymarket.com".to_string()
}
fn default_max_slippage() -> f64 {
    0.05
}
fn default_idempotency_ttl_secs() -> u64 {
    86_400
}
fn default_eip1271_cache_secs() -> u64 {
    60
}
fn default_eip1271_timeout_ms() -> u64 {
    5_000
}
fn default_eip1271_retries() -> u32 {
    1
}
fn default_idempotency_retention_hours() -> u64 {
    168
}
fn default_audit_retention_days() -> u64 {
    30
}
fn default_usage_retention_days() -> u64 {
    30
}
fn default_cleanup_interval_minutes() -> u64 {
    60
}
fn default_audit_dir() -> String {
    "logs".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub builder: BuilderConfig,
    /// Default-tenant exchange credentials (single-tenant compatibility).
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub risk: RiskDefaults,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Reject all mutating endpoints with READ_ONLY when set.
    #[serde(default)]
    pub read_only: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    /// When false, unauthenticated requests bind the default tenant.
    #[serde(default)]
    pub require_api_key: bool,
    /// Gateway key of the default tenant.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub admin_key: String,
    #[serde(default)]
    pub admin_secret_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub dsn: String,
    #[serde(default = "default_idempotency_retention_hours")]
    pub idempotency_retention_hours: u64,
    #[serde(default = "default_audit_retention_days")]
    pub audit_retention_days: u64,
    #[serde(default = "default_usage_retention_days")]
    pub usage_retention_days: u64,
    #[serde(default = "default_cleanup_interval_minutes")]
    pub cleanup_interval_minutes: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            idempotency_retention_hours: default_idempotency_retention_hours(),
            audit_retention_days: default_audit_retention_days(),
            usage_retention_days: default_usage_retention_days(),
            cleanup_interval_minutes: default_cleanup_interval_minutes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            password: String::new(),
            db: 0,
            idempotency_ttl_seconds: default_idempotency_ttl_secs(),
        }
    }
}

impl RedisConfig {
    /// `redis://[:password@]host:port/db` connection URL.
    pub fn url(&self) -> Option<String> {
        if self.addr.is_empty() {
            return None;
        }
        let auth = if self.password.is_empty() {
            String::new()
        } else {
            format!(":{}@", self.password)
        };
        Some(format!("redis://{}{}/{}", auth, self.addr, self.db))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    #[serde(default)]
    pub rpc_url: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_eip1271_cache_secs")]
    pub eip1271_cache_seconds: u64,
    #[serde(default = "default_eip1271_timeout_ms")]
    pub eip1271_timeout_ms: u64,
    #[serde(default = "default_eip1271_retries")]
    pub eip1271_retries: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: String::new(),
            chain_id: default_chain_id(),
            eip1271_cache_seconds: default_eip1271_cache_secs(),
            eip1271_timeout_ms: default_eip1271_timeout_ms(),
            eip1271_retries: default_eip1271_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_exchange_contract")]
    pub contract: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            ws_url: default_ws_url(),
            contract: default_exchange_contract(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    #[serde(default = "default_relayer_url")]
    pub base_url: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            base_url: default_relayer_url(),
            chain_id: default_chain_id(),
        }
    }
}

/// Builder-attribution credentials embedded on every outbound order.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BuilderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub api_passphrase: String,
}

/// Risk defaults applied to tenants without explicit overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskDefaults {
    #[serde(default)]
    pub max_order_value: f64,
    #[serde(default)]
    pub max_daily_value: f64,
    #[serde(default)]
    pub max_daily_orders: u32,
    #[serde(default = "default_max_slippage")]
    pub max_slippage: f64,
    #[serde(default)]
    pub restricted_markets: Vec<String>,
    #[serde(default)]
    pub allow_unverified_signatures: bool,
}

impl Default for RiskDefaults {
    fn default() -> Self {
        Self {
            max_order_value: 0.0,
            max_daily_value: 0.0,
            max_daily_orders: 0,
            max_slippage: default_max_slippage(),
            restricted_markets: Vec::new(),
            allow_unverified_signatures: false,
        }
    }
}

impl RiskDefaults {
    /// Merge with a tenant override; override wins where positive/non-empty.
    pub fn merged_with(&self, over: &RiskConfig) -> RiskConfig {
        RiskConfig {
            max_order_value: pick_f64(self.max_order_value, over.max_order_value),
            max_daily_value: pick_f64(self.max_daily_value, over.max_daily_value),
            max_daily_orders: pick_u32(self.max_daily_orders, over.max_daily_orders),
            max_slippage: pick_f64(self.max_slippage, over.max_slippage),
            restricted_markets: if over.restricted_markets.is_empty() {
                self.restricted_markets.clone()
            } else {
                over.restricted_markets.clone()
            },
            allow_unverified_signatures: self.allow_unverified_signatures
                || over.allow_unverified_signatures,
        }
    }
}

fn pick_f64(base: f64, over: f64) -> f64 {
    if over > 0.0 {
        over
    } else {
        base
    }
}
fn pick_u32(base: u32, over: u32) -> u32 {
    if over > 0 {
        over
    } else {
        base
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuditConfig {
    #[serde(default = "default_audit_dir")]
    pub log_dir: String,
}

/// Per-tenant configuration entry.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TenantConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub api_key: String,
    #[serde(default)]
    pub signers: Vec<String>,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("CLOBGATE").separator("__"))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Environment-only fallback for deployments without a config file.
    pub fn load_with_defaults() -> Self {
        let env = |k: &str| std::env::var(k).unwrap_or_default();
        Self {
            server: ServerConfig {
                port: std::env::var("CLOBGATE_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_port),
                read_only: env("CLOBGATE_READ_ONLY") == "true",
            },
            auth: AuthConfig {
                require_api_key: env("CLOBGATE_REQUIRE_API_KEY") == "true",
                api_key: env("CLOBGATE_API_KEY"),
                admin_key: env("CLOBGATE_ADMIN_KEY"),
                admin_secret_key: env("CLOBGATE_ADMIN_SECRET_KEY"),
            },
            database: DatabaseConfig {
                dsn: env("DATABASE_DSN"),
                ..Default::default()
            },
            redis: RedisConfig {
                addr: env("REDIS_ADDR"),
                password: env("REDIS_PASSWORD"),
                ..Default::default()
            },
            chain: ChainConfig {
                rpc_url: env("CHAIN_RPC_URL"),
                ..Default::default()
            },
            exchange: ExchangeConfig {
                rest_url: std::env::var("EXCHANGE_REST_URL").unwrap_or_else(|_| default_rest_url()),
                ws_url: std::env::var("EXCHANGE_WS_URL").unwrap_or_else(|_| default_ws_url()),
                contract: std::env::var("EXCHANGE_CONTRACT")
                    .unwrap_or_else(|_| default_exchange_contract()),
            },
            relayer: RelayerConfig::default(),
            builder: BuilderConfig {
                api_key: env("BUILDER_API_KEY"),
                api_secret: env("BUILDER_API_SECRET"),
                api_passphrase: env("BUILDER_API_PASSPHRASE"),
            },
            credentials: Credentials {
                address: env("EXCHANGE_ADDRESS"),
                l2_api_key: env("EXCHANGE_API_KEY"),
                l2_api_secret: env("EXCHANGE_API_SECRET"),
                l2_api_passphrase: env("EXCHANGE_API_PASSPHRASE"),
                private_key: env("EXCHANGE_PRIVATE_KEY"),
            },
            risk: RiskDefaults::default(),
            audit: AuditConfig {
                log_dir: std::env::var("AUDIT_LOG_DIR").unwrap_or_else(|_| default_audit_dir()),
            },
            tenants: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.chain.chain_id, 137);
        assert_eq!(cfg.redis.idempotency_ttl_seconds, 86_400);
        assert_eq!(cfg.database.idempotency_retention_hours, 168);
        assert_eq!(cfg.chain.eip1271_cache_seconds, 60);
        assert_eq!(cfg.chain.eip1271_retries, 1);
        assert!(!cfg.server.read_only);
    }

    #[test]
    fn redis_url_composition() {
        let mut r = RedisConfig::default();
        assert!(r.url().is_none());
        r.addr = "localhost:6379".into();
        assert_eq!(r.url().unwrap(), "redis://localhost:6379/0");
        r.password = "pw".into();
        r.db = 2;
        assert_eq!(r.url().unwrap(), "redis://:pw@localhost:6379/2");
    }

    #[test]
    fn risk_defaults_merge() {
        let base = RiskDefaults {
            max_order_value: 1000.0,
            max_slippage: 0.05,
            restricted_markets: vec!["1".into()],
            ..Default::default()
        };
        let over = RiskConfig {
            max_order_value: 50.0,
            ..Default::default()
        };
        let merged = base.merged_with(&over);
        assert_eq!(merged.max_order_value, 50.0);
        assert_eq!(merged.max_slippage, 0.05);
        assert_eq!(merged.restricted_markets, vec!["1".to_string()]);
    }

    #[test]
    fn tenant_config_parses_from_json() {
        let raw = serde_json::json!({
            "id": "t1",
            "name": "Bot One",
            "api_key": "gw-key-1",
            "signers": ["0xabc"],
            "credentials": {"l2_api_key": "k", "l2_api_secret": "s", "l2_api_passphrase": "p"},
            "risk": {"max_order_value": 500.0},
        });
        let tc: TenantConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(tc.id, "t1");
        assert_eq!(tc.risk.max_order_value, 500.0);
        assert!(tc.rate_limit.is_none());
    }
}
