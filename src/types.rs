//! Core domain types shared across the gateway.
//!
//! The `Order` struct mirrors the on-chain Order struct from the CTF
//! Exchange (OrderStructs.sol): twelve fields, in the exact order they are
//! abi-encoded into the EIP-712 struct hash. On the HTTP wire the exchange
//! expects camelCase field names with uint256 values as decimal strings.

use alloy_primitives::{Address, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side. Encoded as uint8 in the struct hash (0=BUY, 1=SELL) and as
/// an uppercase string on the JSON wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    #[inline(always)]
    pub fn as_u8(self) -> u8 {
        match self {
            Side::Buy => 0,
            Side::Sell => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// Exchange order time-in-force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrderType {
    #[default]
    #[serde(rename = "GTC")]
    Gtc,
    #[serde(rename = "GTD")]
    Gtd,
    #[serde(rename = "FAK")]
    Fak,
    #[serde(rename = "FOK")]
    Fok,
}

/// Signature schemes accepted by the exchange.
pub const SIG_TYPE_EOA: u8 = 0;
pub const SIG_TYPE_PROXY: u8 = 1;
pub const SIG_TYPE_SAFE: u8 = 2;

/// uint256 fields travel as decimal strings on the exchange wire.
pub mod u256_dec {
    use alloy_primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &U256, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse::<U256>().map_err(serde::de::Error::custom)
    }
}

/// The canonical twelve-field order struct signed with EIP-712 and submitted
/// to the exchange once signed. Field order matters: it is the abi.encode
/// order of the struct hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    #[serde(with = "u256_dec")]
    pub salt: U256,
    pub maker: Address,
    pub signer: Address,
    pub taker: Address,
    #[serde(rename = "tokenId", with = "u256_dec")]
    pub token_id: U256,
    #[serde(rename = "makerAmount", with = "u256_dec")]
    pub maker_amount: U256,
    #[serde(rename = "takerAmount", with = "u256_dec")]
    pub taker_amount: U256,
    #[serde(with = "u256_dec")]
    pub expiration: U256,
    #[serde(with = "u256_dec")]
    pub nonce: U256,
    #[serde(rename = "feeRateBps", with = "u256_dec")]
    pub fee_rate_bps: U256,
    pub side: Side,
    #[serde(rename = "signatureType")]
    pub signature_type: u8,
}

/// An order ready to be signed (or already signed by the client), together
/// with the submission parameters that are not part of the signed struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignableOrder {
    pub order: Order,
    #[serde(default)]
    pub order_type: OrderType,
    #[serde(default)]
    pub post_only: bool,
}

/// The envelope POSTed to the exchange order endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SignedOrderEnvelope {
    pub order: OrderWire,
    pub owner: String,
    #[serde(rename = "orderType")]
    pub order_type: OrderType,
    #[serde(rename = "postOnly")]
    pub post_only: bool,
}

/// Wire form of a signed order: the twelve struct fields plus the signature.
#[derive(Debug, Clone, Serialize)]
pub struct OrderWire {
    #[serde(flatten)]
    pub order: Order,
    pub signature: String,
}

/// Incoming client order request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderRequest {
    #[serde(default)]
    pub token_id: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub size: f64,
    pub side: Option<Side>,
    #[serde(default)]
    pub order_type: OrderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_only: Option<bool>,
    /// Absolute unix seconds; 0 means GTC (never expires).
    #[serde(default)]
    pub expiration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signable: Option<SignableOrder>,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub signer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l2: Option<L2Creds>,
}

/// Per-request L2 credential override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L2Creds {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub api_passphrase: String,
}

impl L2Creds {
    pub fn is_complete(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty() && !self.api_passphrase.is_empty()
    }
}

/// Response of the typed-order build endpoint: the signable order plus the
/// EIP-712 typed-data JSON the client signs offline.
#[derive(Debug, Clone, Serialize)]
pub struct TypedOrderResponse {
    pub signable: SignableOrder,
    pub typed_data: serde_json::Value,
}

/// Risk limits applied per tenant. Zero disables a limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default)]
    pub max_order_value: f64,
    #[serde(default)]
    pub max_daily_value: f64,
    #[serde(default)]
    pub max_daily_orders: u32,
    /// Max deviation from best book price, e.g. 0.05 = 5%.
    #[serde(default)]
    pub max_slippage: f64,
    #[serde(default)]
    pub restricted_markets: Vec<String>,
    #[serde(default)]
    pub allow_unverified_signatures: bool,
}

/// Token-bucket parameters per tenant. `qps == 0` disables the limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub qps: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            qps: 10.0,
            burst: 20,
        }
    }
}

/// Exchange-side credentials of a tenant. The private key is only present
/// for custodial tenants; non-custodial tenants carry just an address.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub l2_api_key: String,
    #[serde(default)]
    pub l2_api_secret: String,
    #[serde(default)]
    pub l2_api_passphrase: String,
    #[serde(default)]
    pub private_key: String,
}

impl Credentials {
    pub fn has_l2(&self) -> bool {
        !self.l2_api_key.is_empty()
            && !self.l2_api_secret.is_empty()
            && !self.l2_api_passphrase.is_empty()
    }
}

/// An authenticated client of the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub api_key: String,
    #[serde(default)]
    pub allowed_signers: Vec<String>,
    #[serde(default)]
    pub creds: Credentials,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default, rename = "rate_limit")]
    pub rate: RateLimitConfig,
}

impl Tenant {
    /// Empty whitelist allows any signer.
    pub fn allows_signer(&self, signer: &str) -> bool {
        if self.allowed_signers.is_empty() {
            return true;
        }
        let wanted = signer.trim().to_lowercase();
        self.allowed_signers
            .iter()
            .any(|s| s.trim().to_lowercase() == wanted)
    }

    /// Copy safe to return from the API: secrets blanked.
    pub fn masked(&self) -> Tenant {
        let mut t = self.clone();
        if !t.creds.l2_api_secret.is_empty() {
            t.creds.l2_api_secret = "***".into();
        }
        if !t.creds.l2_api_passphrase.is_empty() {
            t.creds.l2_api_passphrase = "***".into();
        }
        if !t.creds.private_key.is_empty() {
            t.creds.private_key = "***".into();
        }
        t
    }
}

/// A fill delivered on the user execution stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    #[serde(default)]
    pub id: String,
    pub market: String,
    pub price: String,
    pub size: String,
    pub side: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Normalized view of an order used by the risk engine, derived either from
/// the raw request or reconstructed from a client-built signable order.
#[derive(Debug, Clone)]
pub struct RiskRequest {
    pub token_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub side: Side,
}

/// USDC and conditional tokens both use 6 decimals on the exchange.
pub const TOKEN_DECIMALS: u32 = 6;

fn units_to_decimal(v: U256) -> Decimal {
    // Amounts fit comfortably in u128 (6-decimal USDC); saturate otherwise.
    let raw: u128 = v.try_into().unwrap_or(u128::MAX);
    Decimal::from_i128_with_scale(raw as i128, TOKEN_DECIMALS)
}

impl RiskRequest {
    pub fn from_request(req: &OrderRequest) -> Self {
        Self {
            token_id: req.token_id.clone(),
            price: Decimal::try_from(req.price).unwrap_or_default(),
            size: Decimal::try_from(req.size).unwrap_or_default(),
            side: req.side.unwrap_or(Side::Buy),
        }
    }

    /// Reconstruct price/size from the maker/taker amounts of a client-built
    /// order. BUY: size = takerAmount, price = maker/taker. SELL: size =
    /// makerAmount, price = taker/maker.
    pub fn from_order(order: &Order) -> Self {
        let maker = units_to_decimal(order.maker_amount);
        let taker = units_to_decimal(order.taker_amount);
        let (price, size) = match order.side {
            Side::Buy if !taker.is_zero() => (maker / taker, taker),
            Side::Sell if !maker.is_zero() => (taker / maker, maker),
            _ => (Decimal::ZERO, Decimal::ZERO),
        };
        Self {
            token_id: order.token_id.to_string(),
            price,
            size,
            side: order.side,
        }
    }

    pub fn order_value(&self) -> Decimal {
        self.price * self.size
    }

    pub fn price_f64(&self) -> f64 {
        self.price.to_f64().unwrap_or(0.0)
    }
}
