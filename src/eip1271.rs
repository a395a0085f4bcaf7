//! EIP-1271 contract-signature verification over JSON-RPC.
//!
//! Safe orders (signatureType = 2) are signed by a contract wallet, not an
//! EOA, so recovery cannot prove them. The contract exposes
//! `isValidSignature(bytes32,bytes)` and answers with a magic value when the
//! signature is valid. Validity is memoized per (contract, digest, signature)
//! with a short TTL since one client commonly resubmits the same signed order
//! in a burst.

use alloy_primitives::{Address, B256};
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::{GatewayError, GatewayResult};
use crate::rpc;

/// `isValidSignature(bytes32,bytes)` selector, which is also the magic
/// return value on success.
const MAGIC_VALUE: [u8; 4] = [0x16, 0x26, 0xba, 0x7e];

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRIES: u32 = 1;

pub struct Eip1271Verifier {
    http: reqwest::Client,
    rpc_url: String,
    cache_ttl: Duration,
    timeout: Duration,
    retries: u32,
    cache: DashMap<String, (bool, Instant)>,
}

impl Eip1271Verifier {
    pub fn new(rpc_url: impl Into<String>, cache_ttl: Duration, timeout: Duration, retries: u32) -> Self {
        Self {
            http: reqwest::Client::new(),
            rpc_url: rpc_url.into(),
            cache_ttl: if cache_ttl.is_zero() { DEFAULT_CACHE_TTL } else { cache_ttl },
            timeout: if timeout.is_zero() { DEFAULT_TIMEOUT } else { timeout },
            retries,
            cache: DashMap::new(),
        }
    }

    /// Ask `contract` whether `signature` is valid for `digest`.
    pub async fn verify(&self, contract: Address, digest: B256, signature_hex: &str) -> GatewayResult<bool> {
        if self.rpc_url.is_empty() {
            return Err(GatewayError::Internal("rpc url not configured".into()));
        }
        let sig_bytes = hex::decode(signature_hex.trim_start_matches("0x"))
            .map_err(|_| GatewayError::AuthFailed("invalid signature encoding".into()))?;

        let key = cache_key(contract, digest, signature_hex);
        if let Some(entry) = self.cache.get(&key) {
            let (valid, stored_at) = *entry;
            if stored_at.elapsed() < self.cache_ttl {
                return Ok(valid);
            }
            drop(entry);
            self.cache.remove(&key);
        }

        let calldata = encode_is_valid_signature(digest, &sig_bytes);

        let mut last_err = String::new();
        for attempt in 0..=self.retries {
            if attempt > 0 {
                // Linear backoff: 200 ms x attempt.
                tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
            }
            match rpc::eth_call(&self.http, &self.rpc_url, contract, &calldata, self.timeout).await {
                Ok(out) => {
                    let valid = out.len() >= 4 && out[..4] == MAGIC_VALUE;
                    self.cache.insert(key, (valid, Instant::now()));
                    return Ok(valid);
                }
                Err(e) => {
                    warn!(contract = %contract, attempt, error = %e, "eip1271 call failed");
                    last_err = e;
                }
            }
        }
        Err(GatewayError::Upstream(format!(
            "eip1271 verification failed: {last_err}"
        )))
    }
}

fn cache_key(contract: Address, digest: B256, signature_hex: &str) -> String {
    format!(
        "{}:{}:{}",
        contract.to_string().to_lowercase(),
        digest,
        signature_hex.to_lowercase()
    )
}

/// abi.encode a call to isValidSignature(bytes32 _hash, bytes _signature):
/// selector || hash || offset(0x40) || len || signature padded to 32.
fn encode_is_valid_signature(digest: B256, signature: &[u8]) -> Vec<u8> {
    let padded_len = signature.len().div_ceil(32) * 32;
    let mut data = Vec::with_capacity(4 + 32 + 32 + 32 + padded_len);
    data.extend_from_slice(&MAGIC_VALUE);
    data.extend_from_slice(digest.as_slice());
    let mut offset = [0u8; 32];
    offset[31] = 0x40;
    data.extend_from_slice(&offset);
    let mut len = [0u8; 32];
    len[24..].copy_from_slice(&(signature.len() as u64).to_be_bytes());
    data.extend_from_slice(&len);
    data.extend_from_slice(signature);
    data.resize(4 + 32 + 32 + 32 + padded_len, 0);
    data
}
