//! Deterministic proxy-wallet derivation.
//!
//! The exchange charges the `maker` of an order. For EOA orders the maker is
//! the signer itself; for proxy and Safe orders the maker is a contract
//! wallet deployed (or deployable) at a CREATE2 address derived from the
//! signer. Both factories use `keccak256(pad32(owner))` as the CREATE2 salt,
//! so the address is a pure function of (owner, chain).

use alloy_primitives::{keccak256, Address, B256};

/// Polymarket proxy-wallet factory on Polygon.
const PROXY_FACTORY_137: &str = "0xaB45c5A4B0c941a2F231C04C3f49182e1A254052";
/// keccak256 of the proxy wallet init code.
const PROXY_INIT_CODE_HASH: &str =
    "0xd2b65b2cc04f0b3a5bc5113175a798d9c90cf16b2e291f14bdfd125a37c37b33";

/// Gnosis Safe factory used by the exchange on Polygon.
const SAFE_FACTORY_137: &str = "0xaacFeEa03eb1561C4e67d661e40682Bd20E3541b";
/// keccak256 of the Safe proxy init code.
const SAFE_INIT_CODE_HASH: &str =
    "0x2d83d9ec32b50a6a5a9d6aafa9ef1b58f4b38efbcba42bbfef07f9b8a0ba0d06";

#[derive(Debug, Clone, Copy)]
enum WalletKind {
    Proxy,
    Safe,
}

fn factory_for(kind: WalletKind, chain_id: u64) -> Option<(Address, B256)> {
    // Only Polygon mainnet is wired today; other chains need their own
    // factory deployments.
    if chain_id != 137 {
        return None;
    }
    let (factory, init_hash) = match kind {
        WalletKind::Proxy => (PROXY_FACTORY_137, PROXY_INIT_CODE_HASH),
        WalletKind::Safe => (SAFE_FACTORY_137, SAFE_INIT_CODE_HASH),
    };
    let factory: Address = factory.parse().ok()?;
    let raw = hex::decode(init_hash.trim_start_matches("0x")).ok()?;
    Some((factory, B256::from_slice(&raw)))
}

/// CREATE2: keccak256(0xff ++ factory ++ salt ++ initCodeHash)[12..].
fn create2(factory: Address, salt: B256, init_code_hash: B256) -> Address {
    let mut buf = [0u8; 85];
    buf[0] = 0xff;
    buf[1..21].copy_from_slice(factory.as_slice());
    buf[21..53].copy_from_slice(salt.as_slice());
    buf[53..85].copy_from_slice(init_code_hash.as_slice());
    Address::from_slice(&keccak256(buf)[12..])
}

fn owner_salt(owner: Address) -> B256 {
    let mut padded = [0u8; 32];
    padded[12..].copy_from_slice(owner.as_slice());
    keccak256(padded)
}

fn derive(kind: WalletKind, owner: Address, chain_id: u64) -> Option<Address> {
    let (factory, init_hash) = factory_for(kind, chain_id)?;
    Some(create2(factory, owner_salt(owner), init_hash))
}

/// Proxy wallet (signatureType = 1) address for an owner.
pub fn derive_proxy_wallet(owner: Address, chain_id: u64) -> Option<Address> {
    derive(WalletKind::Proxy, owner, chain_id)
}

/// Safe wallet (signatureType = 2) address for an owner.
pub fn derive_safe_wallet(owner: Address, chain_id: u64) -> Option<Address> {
    derive(WalletKind::Safe, owner, chain_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> Address {
        "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
            .parse()
            .unwrap()
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_proxy_wallet(owner(), 137).unwrap();
        let b = derive_proxy_wallet(owner(), 137).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn proxy_and_safe_differ() {
        let proxy = derive_proxy_wallet(owner(), 137).unwrap();
        let safe = derive_safe_wallet(owner(), 137).unwrap();
        assert_ne!(proxy, safe);
        assert_ne!(proxy, owner());
    }

    #[test]
    fn different_owners_get_different_wallets() {
        let other: Address = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8"
            .parse()
            .unwrap();
        assert_ne!(
            derive_proxy_wallet(owner(), 137).unwrap(),
            derive_proxy_wallet(other, 137).unwrap()
        );
    }

    #[test]
    fn unknown_chain_has_no_factory() {
        assert!(derive_proxy_wallet(owner(), 1).is_none());
        assert!(derive_safe_wallet(owner(), 80001).is_none());
    }
}
