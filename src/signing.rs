//! EIP-712 order signing for the CTF Exchange.
//!
//! Matches the on-chain Order struct from:
//! https://github.com/Polymarket/ctf-exchange/blob/main/src/exchange/libraries/OrderStructs.sol
//!
//! The domain separator is computed once at construction and reused for every
//! signature. The struct hash is abi-encoded into a stack buffer; no
//! reflective ABI helpers on the hot path; a single sign stays well under
//! the 1 ms budget.

use crate::error::{GatewayError, GatewayResult};
use crate::types::{Order, Side};
use alloy_primitives::{keccak256, Address, B256, U256};
use ethers::signers::{LocalWallet, Signer as _};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;

// EIP-712 domain, matching Hashing.sol constructor("Polymarket CTF Exchange", "1")
pub const DOMAIN_NAME: &str = "Polymarket CTF Exchange";
pub const DOMAIN_VERSION: &str = "1";

/// Polygon mainnet.
pub const DEFAULT_CHAIN_ID: u64 = 137;

/// CTF Exchange contract on Polygon.
pub const EXCHANGE_CONTRACT: &str = "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E";

// ORDER_TYPEHASH must match OrderStructs.sol exactly
const ORDER_TYPEHASH_STR: &[u8] = b"Order(uint256 salt,address maker,address signer,address taker,uint256 tokenId,uint256 makerAmount,uint256 takerAmount,uint256 expiration,uint256 nonce,uint256 feeRateBps,uint8 side,uint8 signatureType)";

const DOMAIN_TYPEHASH_STR: &[u8] =
    b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";

/// Compute the EIP-712 domain separator.
/// keccak256(abi.encode(typeHash, nameHash, versionHash, chainId, verifyingContract))
pub fn compute_domain_separator(chain_id: u64, verifying_contract: Address) -> B256 {
    let domain_type_hash = keccak256(DOMAIN_TYPEHASH_STR);
    let name_hash = keccak256(DOMAIN_NAME.as_bytes());
    let version_hash = keccak256(DOMAIN_VERSION.as_bytes());

    let mut encoded = [0u8; 160];
    encoded[0..32].copy_from_slice(domain_type_hash.as_slice());
    encoded[32..64].copy_from_slice(name_hash.as_slice());
    encoded[64..96].copy_from_slice(version_hash.as_slice());
    encoded[96..128].copy_from_slice(&U256::from(chain_id).to_be_bytes::<32>());
    // address is left-padded to 32 bytes in abi.encode
    encoded[128 + 12..160].copy_from_slice(verifying_contract.as_slice());

    keccak256(encoded)
}

/// keccak256(abi.encode(ORDER_TYPEHASH, ...12 fields...)).
/// Addresses and uint8 values are left-padded to 32 bytes.
pub fn order_struct_hash(order: &Order) -> B256 {
    let order_type_hash = keccak256(ORDER_TYPEHASH_STR);

    // 13 words * 32 bytes, stack-allocated.
    let mut encoded = [0u8; 416];
    let mut pos = 0;
    macro_rules! word {
        ($bytes:expr) => {{
            encoded[pos..pos + 32].copy_from_slice(&$bytes);
            pos += 32;
        }};
    }
    macro_rules! addr {
        ($a:expr) => {{
            encoded[pos + 12..pos + 32].copy_from_slice($a.as_slice());
            pos += 32;
        }};
    }
    word!(order_type_hash.0);
    word!(order.salt.to_be_bytes::<32>());
    addr!(order.maker);
    addr!(order.signer);
    addr!(order.taker);
    word!(order.token_id.to_be_bytes::<32>());
    word!(order.maker_amount.to_be_bytes::<32>());
    word!(order.taker_amount.to_be_bytes::<32>());
    word!(order.expiration.to_be_bytes::<32>());
    word!(order.nonce.to_be_bytes::<32>());
    word!(order.fee_rate_bps.to_be_bytes::<32>());
    word!(U256::from(order.side.as_u8()).to_be_bytes::<32>());
    word!(U256::from(order.signature_type).to_be_bytes::<32>());
    debug_assert_eq!(pos, 416);

    keccak256(encoded)
}

/// Final EIP-712 digest: keccak256("\x19\x01" || domainSeparator || structHash).
pub fn order_digest(order: &Order, domain_separator: &B256) -> B256 {
    let struct_hash = order_struct_hash(order);
    let mut buf = [0u8; 66];
    buf[0] = 0x19;
    buf[1] = 0x01;
    buf[2..34].copy_from_slice(domain_separator.as_slice());
    buf[34..66].copy_from_slice(struct_hash.as_slice());
    keccak256(buf)
}

/// Recover the signing address from a digest and a 65-byte signature.
pub fn recover_signer(digest: B256, signature_hex: &str) -> GatewayResult<Address> {
    let raw = hex::decode(signature_hex.trim_start_matches("0x"))
        .map_err(|_| GatewayError::AuthFailed("invalid signature encoding".into()))?;
    if raw.len() != 65 {
        return Err(GatewayError::AuthFailed(format!(
            "invalid signature length {}",
            raw.len()
        )));
    }
    let mut v = raw[64];
    if v >= 27 {
        v -= 27;
    }
    let sig = ethers::types::Signature {
        r: ethers::types::U256::from_big_endian(&raw[0..32]),
        s: ethers::types::U256::from_big_endian(&raw[32..64]),
        v: (v + 27) as u64,
    };
    let hash = ethers::types::H256::from(<[u8; 32]>::from(digest));
    let recovered = sig
        .recover(hash)
        .map_err(|e| GatewayError::AuthFailed(format!("signature recovery failed: {e}")))?;
    Ok(Address::from_slice(recovered.as_bytes()))
}

/// Verify that `signature_hex` over `order` was produced by `expected_signer`.
pub fn verify_order_signature(
    order: &Order,
    signature_hex: &str,
    expected_signer: Address,
    domain_separator: &B256,
) -> GatewayResult<()> {
    let digest = order_digest(order, domain_separator);
    let recovered = recover_signer(digest, signature_hex)?;
    if recovered != expected_signer {
        return Err(GatewayError::AuthFailed(format!(
            "invalid signature: recovered {recovered}, expected {expected_signer}"
        )));
    }
    Ok(())
}

/// EIP-712 typed-data JSON for offline signing by non-custodial clients.
pub fn build_typed_data(order: &Order, chain_id: u64, verifying_contract: Address) -> serde_json::Value {
    json!({
        "types": {
            "EIP712Domain": [
                {"name": "name", "type": "string"},
                {"name": "version", "type": "string"},
                {"name": "chainId", "type": "uint256"},
                {"name": "verifyingContract", "type": "address"},
            ],
            "Order": [
                {"name": "salt", "type": "uint256"},
                {"name": "maker", "type": "address"},
                {"name": "signer", "type": "address"},
                {"name": "taker", "type": "address"},
                {"name": "tokenId", "type": "uint256"},
                {"name": "makerAmount", "type": "uint256"},
                {"name": "takerAmount", "type": "uint256"},
                {"name": "expiration", "type": "uint256"},
                {"name": "nonce", "type": "uint256"},
                {"name": "feeRateBps", "type": "uint256"},
                {"name": "side", "type": "uint8"},
                {"name": "signatureType", "type": "uint8"},
            ],
        },
        "primaryType": "Order",
        "domain": {
            "name": DOMAIN_NAME,
            "version": DOMAIN_VERSION,
            "chainId": chain_id,
            "verifyingContract": verifying_contract,
        },
        "message": {
            "salt": order.salt.to_string(),
            "maker": order.maker,
            "signer": order.signer,
            "taker": order.taker,
            "tokenId": order.token_id.to_string(),
            "makerAmount": order.maker_amount.to_string(),
            "takerAmount": order.taker_amount.to_string(),
            "expiration": order.expiration.to_string(),
            "nonce": order.nonce.to_string(),
            "feeRateBps": order.fee_rate_bps.to_string(),
            "side": order.side.as_u8(),
            "signatureType": order.signature_type,
        },
    })
}

/// Order signer holding a local private key and a pre-computed domain
/// separator for one (chainId, verifyingContract) pair.
pub struct OrderSigner {
    wallet: LocalWallet,
    address: Address,
    chain_id: u64,
    verifying_contract: Address,
    domain_separator: B256,
}

impl OrderSigner {
    pub fn new(private_key_hex: &str, chain_id: u64, verifying_contract: Address) -> GatewayResult<Self> {
        let key = private_key_hex.trim().trim_start_matches("0x");
        if key.is_empty() {
            return Err(GatewayError::InvalidRequest("private key is required".into()));
        }
        let wallet: LocalWallet = key
            .parse()
            .map_err(|e| GatewayError::InvalidRequest(format!("invalid private key: {e}")))?;
        let address = Address::from_slice(wallet.address().as_bytes());
        Ok(Self {
            wallet,
            address,
            chain_id,
            verifying_contract,
            domain_separator: compute_domain_separator(chain_id, verifying_contract),
        })
    }

    #[inline(always)]
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn verifying_contract(&self) -> Address {
        self.verifying_contract
    }

    pub fn domain_separator(&self) -> &B256 {
        &self.domain_separator
    }

    pub fn digest(&self, order: &Order) -> B256 {
        order_digest(order, &self.domain_separator)
    }

    /// Sign the order and return the 65-byte signature as 0x-hex
    /// (r || s || v, v in {27, 28}).
    pub fn sign_order(&self, order: &Order) -> GatewayResult<String> {
        let digest = self.digest(order);
        let hash = ethers::types::H256::from(<[u8; 32]>::from(digest));
        let sig = self
            .wallet
            .sign_hash(hash)
            .map_err(|e| GatewayError::Internal(format!("signing failed: {e}")))?;

        let mut raw = [0u8; 65];
        sig.r.to_big_endian(&mut raw[0..32]);
        sig.s.to_big_endian(&mut raw[32..64]);
        let mut v = sig.v as u8;
        if v < 27 {
            v += 27;
        }
        raw[64] = v;
        Ok(format!("0x{}", hex::encode(raw)))
    }
}

/// Generate a random salt capped at 2^53-1 so the exchange backend can parse
/// it as a JSON number without precision loss.
pub fn generate_salt() -> u64 {
    use rand::Rng;
    rand::thread_rng().gen_range(0..=9_007_199_254_740_991u64)
}

/// Convert a decimal amount to on-chain token units (6 decimals),
/// rounding to the nearest unit.
fn to_token_units(x: Decimal) -> U256 {
    let scaled = (x * Decimal::new(1_000_000, 0)).round();
    U256::from(scaled.to_u128().unwrap_or(0))
}

/// Maker/taker amounts from human price and size.
///
/// Exchange precision rules:
///   BUY:  makerAmount = USDC paid      (2 decimal places)
///         takerAmount = tokens bought  (4 decimal places)
///   SELL: makerAmount = tokens sold    (2 decimal places)
///         takerAmount = USDC received  (4 decimal places)
pub fn calculate_amounts(side: Side, price: Decimal, size: Decimal) -> (U256, U256) {
    let size_2dp = size.round_dp(2);
    match side {
        Side::Buy => {
            let usdc = (size_2dp * price).round_dp(2);
            let tokens = size_2dp.round_dp(4);
            (to_token_units(usdc), to_token_units(tokens))
        }
        Side::Sell => {
            let tokens = size_2dp;
            let usdc = (size_2dp * price).round_dp(4);
            (to_token_units(tokens), to_token_units(usdc))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SIG_TYPE_EOA;

    // Well-known test key (hardhat account #0); never used with funds.
    const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn test_signer() -> OrderSigner {
        OrderSigner::new(
            TEST_KEY,
            DEFAULT_CHAIN_ID,
            EXCHANGE_CONTRACT.parse().unwrap(),
        )
        .unwrap()
    }

    fn sample_order(signer: Address) -> Order {
        Order {
            salt: U256::from(123u64),
            maker: signer,
            signer,
            taker: Address::ZERO,
            token_id: U256::from(999u64),
            maker_amount: U256::from(1_000_000u64),
            taker_amount: U256::from(500_000u64),
            expiration: U256::from(1_800_000_000u64),
            nonce: U256::from(1u64),
            fee_rate_bps: U256::ZERO,
            side: Side::Buy,
            signature_type: SIG_TYPE_EOA,
        }
    }

    #[test]
    fn domain_separator_is_independent_of_order() {
        let contract: Address = EXCHANGE_CONTRACT.parse().unwrap();
        let a = compute_domain_separator(DEFAULT_CHAIN_ID, contract);
        let b = compute_domain_separator(DEFAULT_CHAIN_ID, contract);
        assert_eq!(a, b);
        // Different chain -> different separator.
        let c = compute_domain_separator(1, contract);
        assert_ne!(a, c);
    }

    #[test]
    fn sign_produces_65_byte_signature_and_verifies() {
        let signer = test_signer();
        let order = sample_order(signer.address());
        let sig = signer.sign_order(&order).unwrap();
        // 0x + 130 hex chars
        assert_eq!(sig.len(), 132);
        assert!(sig.starts_with("0x"));
        let v = u8::from_str_radix(&sig[130..], 16).unwrap();
        assert!(v == 27 || v == 28);

        verify_order_signature(&order, &sig, signer.address(), signer.domain_separator())
            .expect("own signature must verify");
    }

    #[test]
    fn signing_does_not_mutate_order() {
        let signer = test_signer();
        let order = sample_order(signer.address());
        let before = order.clone();
        let _ = signer.sign_order(&order).unwrap();
        assert_eq!(order, before);
    }

    #[test]
    fn verify_rejects_wrong_signer() {
        let signer = test_signer();
        let order = sample_order(signer.address());
        let sig = signer.sign_order(&order).unwrap();
        let other: Address = "0x000000000000000000000000000000000000dEaD"
            .parse()
            .unwrap();
        assert!(verify_order_signature(&order, &sig, other, signer.domain_separator()).is_err());
    }

    #[test]
    fn verify_rejects_bad_length() {
        let signer = test_signer();
        let order = sample_order(signer.address());
        let err = verify_order_signature(&order, "0xdeadbeef", signer.address(), signer.domain_separator())
            .unwrap_err();
        assert_eq!(err.code(), "AUTH_FAILED");
    }

    #[test]
    fn verify_accepts_low_v_normalization() {
        let signer = test_signer();
        let order = sample_order(signer.address());
        let sig = signer.sign_order(&order).unwrap();
        // Rewrite v to the raw recovery id (0/1); the verifier must normalize.
        let mut raw = hex::decode(&sig[2..]).unwrap();
        raw[64] -= 27;
        let low_v = format!("0x{}", hex::encode(raw));
        verify_order_signature(&order, &low_v, signer.address(), signer.domain_separator())
            .expect("low-v signature must verify after normalization");
    }

    #[test]
    fn digest_changes_with_any_field() {
        let signer = test_signer();
        let order = sample_order(signer.address());
        let base = signer.digest(&order);
        let mut changed = order.clone();
        changed.nonce = U256::from(2u64);
        assert_ne!(base, signer.digest(&changed));
        let mut changed = order;
        changed.side = Side::Sell;
        assert_ne!(base, signer.digest(&changed));
    }

    #[test]
    fn buy_amounts_follow_exchange_precision() {
        // 100 tokens at 0.55 -> pay 55 USDC, receive 100 tokens
        let (maker, taker) =
            calculate_amounts(Side::Buy, Decimal::new(55, 2), Decimal::from(100));
        assert_eq!(maker, U256::from(55_000_000u64));
        assert_eq!(taker, U256::from(100_000_000u64));
    }

    #[test]
    fn sell_amounts_follow_exchange_precision() {
        let (maker, taker) =
            calculate_amounts(Side::Sell, Decimal::new(64, 2), Decimal::from(50));
        assert_eq!(maker, U256::from(50_000_000u64));
        assert_eq!(taker, U256::from(32_000_000u64));
    }

    #[test]
    fn salt_fits_json_number() {
        for _ in 0..100 {
            assert!(generate_salt() <= 9_007_199_254_740_991);
        }
    }

    #[test]
    fn typed_data_lists_twelve_order_fields() {
        let signer = test_signer();
        let order = sample_order(signer.address());
        let td = build_typed_data(&order, DEFAULT_CHAIN_ID, signer.verifying_contract());
        assert_eq!(td["primaryType"], "Order");
        assert_eq!(td["types"]["Order"].as_array().unwrap().len(), 12);
        assert_eq!(td["domain"]["chainId"], 137);
        assert_eq!(td["message"]["salt"], "123");
    }
}
