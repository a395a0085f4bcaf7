//! Exchange HTTP client.
//!
//! Speaks the CLOB REST protocol: signed-order submission, cancels, and the
//! book-query endpoint. Every authenticated request carries L2 HMAC headers
//! (`POLY_*`); when builder-attribution credentials are configured they are
//! attached alongside as `POLY_BUILDER_*` headers so the integrator gets
//! volume credit for the order flow.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::BuilderConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::types::SignedOrderEnvelope;

type HmacSha256 = Hmac<Sha256>;

/// Credentials of the account the client acts for.
#[derive(Debug, Clone)]
pub struct ExchangeCreds {
    /// On-chain address announced in POLY_ADDRESS.
    pub address: String,
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
}

/// Book levels as the REST book endpoint returns them.
#[derive(Debug, Clone, Deserialize)]
pub struct RestLevel {
    pub price: String,
    pub size: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RestBook {
    #[serde(default)]
    pub bids: Vec<RestLevel>,
    #[serde(default)]
    pub asks: Vec<RestLevel>,
}

#[derive(Debug)]
pub struct ExchangeClient {
    http: reqwest::Client,
    rest_url: String,
    creds: ExchangeCreds,
    builder: Option<BuilderConfig>,
}

impl ExchangeClient {
    pub fn new(rest_url: impl Into<String>, creds: ExchangeCreds, builder: Option<BuilderConfig>) -> Self {
        // Connection pooling: keep-alive skips the TCP+TLS handshake on the
        // submission fast path.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            rest_url: rest_url.into(),
            creds,
            builder: builder.filter(|b| !b.api_key.is_empty()),
        }
    }

    pub fn address(&self) -> &str {
        &self.creds.address
    }

    pub fn api_key(&self) -> &str {
        &self.creds.api_key
    }

    /// Submit a signed order. Returns the exchange response JSON on success;
    /// the raw error text is propagated for upstream classification (nonce
    /// errors trigger a resync in the orchestrator).
    pub async fn post_order(&self, envelope: &SignedOrderEnvelope) -> GatewayResult<serde_json::Value> {
        let body = serde_json::to_string(envelope)
            .map_err(|e| GatewayError::Internal(format!("order serialization failed: {e}")))?;
        self.send("POST", "/order", Some(body)).await
    }

    pub async fn cancel_order(&self, order_id: &str) -> GatewayResult<serde_json::Value> {
        let body = serde_json::json!({ "orderID": order_id }).to_string();
        self.send("DELETE", "/order", Some(body)).await
    }

    pub async fn cancel_all(&self) -> GatewayResult<serde_json::Value> {
        self.send("DELETE", "/cancel-all", None).await
    }

    /// Unauthenticated REST book query, used as slippage fallback when the
    /// shadow book has no state for a token.
    pub async fn order_book(&self, token_id: &str) -> GatewayResult<RestBook> {
        let url = format!("{}/book?token_id={}", self.rest_url, token_id);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("book query failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(GatewayError::Upstream(format!(
                "book query failed: {}",
                resp.status()
            )));
        }
        resp.json::<RestBook>()
            .await
            .map_err(|e| GatewayError::Upstream(format!("book decode failed: {e}")))
    }

    async fn send(
        &self,
        method: &str,
        path: &str,
        body: Option<String>,
    ) -> GatewayResult<serde_json::Value> {
        let url = format!("{}{}", self.rest_url, path);
        let body_str = body.unwrap_or_default();
        let headers = self.auth_headers(method, path, &body_str)?;

        let mut req = match method {
            "POST" => self.http.post(&url),
            "DELETE" => self.http.delete(&url),
            _ => self.http.get(&url),
        };
        req = req.header("Content-Type", "application/json");
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if !body_str.is_empty() {
            req = req.body(body_str);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("exchange request failed: {e}")))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let preview = if text.len() > 300 { &text[..300] } else { &text };
            error!(%status, body = preview, method, path, "exchange request rejected");
            return Err(GatewayError::classify(format!(
                "exchange api error ({status}): {preview}"
            )));
        }

        serde_json::from_str(&text).or_else(|_| {
            warn!(method, path, "exchange returned non-JSON success body");
            Ok(serde_json::json!({ "raw": text }))
        })
    }

    /// L2 HMAC headers: sign `timestamp + method + path [+ body]` with the
    /// urlsafe-base64-decoded API secret.
    fn auth_headers(&self, method: &str, path: &str, body: &str) -> GatewayResult<Vec<(String, String)>> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let sig = compute_hmac(&self.creds.api_secret, &timestamp, method, path, body)?;

        let mut headers = vec![
            ("POLY_ADDRESS".to_string(), self.creds.address.clone()),
            ("POLY_SIGNATURE".to_string(), sig),
            ("POLY_TIMESTAMP".to_string(), timestamp.clone()),
            ("POLY_API_KEY".to_string(), self.creds.api_key.clone()),
            ("POLY_PASSPHRASE".to_string(), self.creds.passphrase.clone()),
        ];

        if let Some(b) = &self.builder {
            let builder_sig = compute_hmac(&b.api_secret, &timestamp, method, path, body)?;
            headers.push(("POLY_BUILDER_API_KEY".to_string(), b.api_key.clone()));
            headers.push(("POLY_BUILDER_SIGNATURE".to_string(), builder_sig));
            headers.push(("POLY_BUILDER_TIMESTAMP".to_string(), timestamp));
            headers.push(("POLY_BUILDER_PASSPHRASE".to_string(), b.api_passphrase.clone()));
        }

        Ok(headers)
    }
}

fn compute_hmac(
    secret_b64: &str,
    timestamp: &str,
    method: &str,
    path: &str,
    body: &str,
) -> GatewayResult<String> {
    let secret = URL_SAFE
        .decode(secret_b64)
        .map_err(|e| GatewayError::Internal(format!("bad API secret base64: {e}")))?;
    let mut mac = HmacSha256::new_from_slice(&secret)
        .map_err(|e| GatewayError::Internal(format!("hmac init failed: {e}")))?;
    let mut message = format!("{timestamp}{method}{path}");
    if !body.is_empty() {
        message.push_str(body);
    }
    mac.update(message.as_bytes());
    Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
}

/// Relayer client for deploying proxy wallets on behalf of tenants.
pub struct RelayerClient {
    http: reqwest::Client,
    base_url: String,
    chain_id: u64,
}

impl RelayerClient {
    pub fn new(base_url: impl Into<String>, chain_id: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            chain_id,
        }
    }

    pub async fn deploy_proxy(&self, owner: &str) -> GatewayResult<serde_json::Value> {
        let url = format!("{}/deploy", self.base_url);
        let payload = serde_json::json!({
            "owner": owner,
            "chain_id": self.chain_id,
        });
        let resp = self
            .http
            .post(&url)
            .json(&payload)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("relayer request failed: {e}")))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("relayer decode failed: {e}")))?;
        if !status.is_success() {
            return Err(GatewayError::Upstream(format!(
                "relayer rejected deploy ({status}): {body}"
            )));
        }
        Ok(body)
    }
}
