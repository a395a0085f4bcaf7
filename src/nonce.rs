//! Optimistic exchange-nonce manager.
//!
//! The exchange contract keeps a per-maker counter (`nonces(address)`); an
//! order is only valid while its nonce equals the current counter, and a
//! cancel-all bumps it. The manager caches the counter per maker, increments
//! locally on invalidating operations so new orders pick up the next value
//! immediately, and re-syncs from the chain when the exchange reports a
//! nonce mismatch.

use alloy_primitives::{Address, U256};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::time::Duration;
use tracing::{info, warn};

use crate::rpc;

/// `nonces(address)` selector: keccak256("nonces(address)")[..4].
const NONCES_SELECTOR: [u8; 4] = [0x7e, 0xce, 0xbe, 0x00];

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct NonceManager {
    http: reqwest::Client,
    rpc_url: String,
    exchange: Address,
    cache: RwLock<FxHashMap<Address, U256>>,
}

impl NonceManager {
    pub fn new(rpc_url: impl Into<String>, exchange: Address) -> Self {
        Self {
            http: reqwest::Client::new(),
            rpc_url: rpc_url.into(),
            exchange,
            cache: RwLock::new(FxHashMap::default()),
        }
    }

    /// Current valid order nonce for a maker: cached value, or a chain sync
    /// on first sight.
    pub async fn get(&self, maker: Address) -> U256 {
        if let Some(cached) = self.cache.read().get(&maker) {
            return *cached;
        }
        self.sync(maker).await
    }

    /// Force a chain fetch of `nonces(maker)` and replace the cache entry.
    /// An unreachable RPC degrades to the last cached value (or zero for a
    /// fresh maker, which is correct for accounts that never cancelled-all).
    pub async fn sync(&self, maker: Address) -> U256 {
        let fetched = self.fetch_from_chain(maker).await;
        match fetched {
            Ok(nonce) => {
                self.cache.write().insert(maker, nonce);
                info!(maker = %maker, nonce = %nonce, "synced exchange nonce");
                nonce
            }
            Err(e) => {
                warn!(maker = %maker, error = %e, "exchange nonce sync failed");
                let mut cache = self.cache.write();
                *cache.entry(maker).or_insert(U256::ZERO)
            }
        }
    }

    /// Locally bump the cached nonce. Called on operations that invalidate
    /// all outstanding orders of a maker (cancel-all), so new orders use the
    /// next value before the chain reflects it.
    pub fn increment(&self, maker: Address) {
        let mut cache = self.cache.write();
        if let Some(v) = cache.get_mut(&maker) {
            *v += U256::from(1u64);
        }
    }

    pub fn cached(&self, maker: Address) -> Option<U256> {
        self.cache.read().get(&maker).copied()
    }

    async fn fetch_from_chain(&self, maker: Address) -> Result<U256, String> {
        if self.rpc_url.is_empty() {
            return Err("rpc url not configured".into());
        }
        // calldata: selector || left-pad(address, 32)
        let mut calldata = [0u8; 36];
        calldata[0..4].copy_from_slice(&NONCES_SELECTOR);
        calldata[16..36].copy_from_slice(maker.as_slice());

        let out = rpc::eth_call(&self.http, &self.rpc_url, self.exchange, &calldata, CALL_TIMEOUT)
            .await?;
        if out.len() < 32 {
            return Err(format!("short eth_call result: {} bytes", out.len()));
        }
        Ok(U256::from_be_slice(&out[..32]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn maker() -> Address {
        "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
            .parse()
            .unwrap()
    }

    fn manager() -> NonceManager {
        // Empty RPC URL: sync degrades to the cached/zero path.
        NonceManager::new("", crate::signing::EXCHANGE_CONTRACT.parse().unwrap())
    }

    #[tokio::test]
    async fn unseen_maker_defaults_to_zero_without_rpc() {
        let m = manager();
        assert_eq!(m.get(maker()).await, U256::ZERO);
        assert_eq!(m.cached(maker()), Some(U256::ZERO));
    }

    #[tokio::test]
    async fn increment_bumps_cached_value() {
        let m = manager();
        let _ = m.get(maker()).await;
        m.increment(maker());
        assert_eq!(m.get(maker()).await, U256::from(1u64));
        m.increment(maker());
        assert_eq!(m.cached(maker()), Some(U256::from(2u64)));
    }

    #[test]
    fn increment_without_cache_entry_is_a_noop() {
        let m = manager();
        m.increment(maker());
        assert_eq!(m.cached(maker()), None);
    }

    #[test]
    fn calldata_layout() {
        // selector || 12 zero bytes || 20-byte address
        let mut calldata = [0u8; 36];
        calldata[0..4].copy_from_slice(&NONCES_SELECTOR);
        calldata[16..36].copy_from_slice(maker().as_slice());
        assert_eq!(&calldata[0..4], &[0x7e, 0xce, 0xbe, 0x00]);
        assert_eq!(&calldata[4..16], &[0u8; 12]);
    }
}
