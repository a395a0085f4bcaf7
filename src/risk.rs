//! Pre-trade risk engine.
//!
//! Checks run in a fixed order and the first failure short-circuits with a
//! reason-tagged reject (the tag doubles as a prometheus counter label).
//! All price arithmetic is decimal; a float comparison at the slippage
//! boundary can flip a reject into an accept.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use crate::error::{GatewayError, GatewayResult};
use crate::feed::MarketFeed;
use crate::metrics;
use crate::types::{RiskConfig, RiskRequest, Side, Tenant};

/// Book data older than this cannot safely gate a price check.
const STALE_BOOK_AGE: Duration = Duration::from_secs(10);

/// Accumulated daily usage, keyed by (tenant, UTC date).
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn get_daily_usage(&self, tenant_id: &str) -> anyhow::Result<(u32, f64)>;
    async fn add_daily_usage(&self, tenant_id: &str, orders: u32, volume: f64) -> anyhow::Result<()>;
}

/// Process-local usage store. Key includes the UTC date so counters reset at
/// midnight without a cleaner.
#[derive(Default)]
pub struct MemoryUsageStore {
    usage: RwLock<FxHashMap<(String, String), (u32, f64)>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(tenant_id: &str) -> (String, String) {
        (tenant_id.to_string(), Utc::now().format("%Y-%m-%d").to_string())
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn get_daily_usage(&self, tenant_id: &str) -> anyhow::Result<(u32, f64)> {
        Ok(self
            .usage
            .read()
            .get(&Self::key(tenant_id))
            .copied()
            .unwrap_or((0, 0.0)))
    }

    async fn add_daily_usage(&self, tenant_id: &str, orders: u32, volume: f64) -> anyhow::Result<()> {
        let mut map = self.usage.write();
        let entry = map.entry(Self::key(tenant_id)).or_insert((0, 0.0));
        entry.0 += orders;
        entry.1 += volume;
        Ok(())
    }
}

pub struct RiskEngine {
    usage: Arc<dyn UsageStore>,
    feed: Arc<MarketFeed>,
}

impl RiskEngine {
    pub fn new(usage: Arc<dyn UsageStore>, feed: Arc<MarketFeed>) -> Self {
        Self { usage, feed }
    }

    /// Run every pre-trade check; an error means the order must be rejected.
    pub async fn check_order(&self, tenant: &Tenant, req: &RiskRequest) -> GatewayResult<()> {
        let config = &tenant.risk;

        // 1. Price bounds (fat-finger check).
        if req.price <= Decimal::ZERO || req.price >= Decimal::ONE {
            return Err(reject(
                "price_bounds",
                format!("price {:.4} out of bounds (0-1)", req.price_f64()),
            ));
        }

        // 2. Size.
        if req.size <= Decimal::ZERO {
            return Err(reject("invalid_size", "size must be positive".to_string()));
        }

        let order_val = req.order_value();

        // 3. Per-order value cap.
        let max_order_value = Decimal::try_from(config.max_order_value).unwrap_or_default();
        if max_order_value > Decimal::ZERO && order_val > max_order_value {
            return Err(reject(
                "max_value",
                format!("order value {order_val:.2} exceeds limit {max_order_value:.2}"),
            ));
        }

        // 4. Price deviation against the shadow book.
        self.check_slippage(config, req)?;

        // 5. Restricted markets.
        if config.restricted_markets.iter().any(|id| *id == req.token_id) {
            return Err(reject(
                "restricted_market",
                format!("market {} is restricted", req.token_id),
            ));
        }

        // 6/7. Daily caps. A usage-store failure is a hard reject: trading
        // blind past a daily limit is worse than refusing an order.
        if config.max_daily_value > 0.0 || config.max_daily_orders > 0 {
            let (current_orders, current_vol) = self
                .usage
                .get_daily_usage(&tenant.id)
                .await
                .map_err(|e| GatewayError::Internal(format!("risk check failed: {e}")))?;

            let current_vol = Decimal::try_from(current_vol).unwrap_or_default();
            let max_daily_value = Decimal::try_from(config.max_daily_value).unwrap_or_default();
            if max_daily_value > Decimal::ZERO && current_vol + order_val > max_daily_value {
                return Err(reject(
                    "daily_volume_limit",
                    format!(
                        "daily volume limit exceeded (curr: {current_vol:.2}, new: {order_val:.2}, max: {max_daily_value:.2})"
                    ),
                ));
            }
            if config.max_daily_orders > 0 && current_orders + 1 > config.max_daily_orders {
                return Err(reject(
                    "daily_order_limit",
                    format!(
                        "daily order limit exceeded (curr: {current_orders}, max: {})",
                        config.max_daily_orders
                    ),
                ));
            }
        }

        Ok(())
    }

    /// Slippage gate against the live shadow book. No book ⇒ pass (the REST
    /// fallback in the orchestrator covers it); a stale book is a hard fail.
    pub fn check_slippage(&self, config: &RiskConfig, req: &RiskRequest) -> GatewayResult<()> {
        if config.max_slippage <= 0.0 {
            return Ok(());
        }
        let Some(book) = self.feed.book(&req.token_id) else {
            return Ok(());
        };
        if book.age() > STALE_BOOK_AGE {
            return Err(reject(
                "stale_data",
                "market data stale (>10s), cannot verify price safely".to_string(),
            ));
        }

        let slippage = Decimal::try_from(config.max_slippage).unwrap_or_default();
        let one = Decimal::ONE;

        match req.side {
            Side::Buy => {
                if let Some(best_ask) = book.best_ask() {
                    let max_price = best_ask * (one + slippage);
                    if req.price > max_price {
                        return Err(reject(
                            "slippage",
                            format!(
                                "buy price {:.4} deviates too much from best ask {best_ask:.4} (limit: {max_price:.4})",
                                req.price_f64()
                            ),
                        ));
                    }
                }
            }
            Side::Sell => {
                if let Some(best_bid) = book.best_bid() {
                    let min_price = best_bid * (one - slippage);
                    if req.price < min_price {
                        return Err(reject(
                            "slippage",
                            format!(
                                "sell price {:.4} deviates too much from best bid {best_bid:.4} (limit: {min_price:.4})",
                                req.price_f64()
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Post-trade accumulation, run synchronously once the exchange accepted
    /// the order. One immediate retry; after that the failure is logged loudly
    /// rather than dropped silently.
    pub async fn post_order_hook(&self, tenant: &Tenant, req: &RiskRequest) {
        use rust_decimal::prelude::ToPrimitive;
        let volume = req.order_value().to_f64().unwrap_or(0.0);
        for attempt in 0..2 {
            match self.usage.add_daily_usage(&tenant.id, 1, volume).await {
                Ok(()) => return,
                Err(e) if attempt == 0 => {
                    tracing::warn!(tenant = %tenant.id, error = %e, "usage write failed, retrying");
                }
                Err(e) => {
                    error!(
                        tenant = %tenant.id,
                        volume,
                        error = %e,
                        "usage write failed after retry; daily counters are behind"
                    );
                }
            }
        }
    }
}

fn reject(tag: &str, message: String) -> GatewayError {
    metrics::RISK_REJECTS.with_label_values(&[tag]).inc();
    GatewayError::RiskReject(message)
}
