//! Thin JSON-RPC `eth_call` helper shared by the nonce manager and the
//! EIP-1271 verifier. Calls are read-only, against the latest block.

use alloy_primitives::Address;
use std::time::Duration;

/// Perform `eth_call` with pre-encoded calldata; returns the raw result bytes.
pub async fn eth_call(
    client: &reqwest::Client,
    rpc_url: &str,
    to: Address,
    calldata: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, String> {
    let payload = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "eth_call",
        "params": [
            { "to": to, "data": format!("0x{}", hex::encode(calldata)) },
            "latest"
        ],
        "id": 1
    });

    let resp = client
        .post(rpc_url)
        .json(&payload)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| format!("rpc transport error: {e}"))?;

    let json: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| format!("rpc response decode error: {e}"))?;

    if let Some(err) = json.get("error") {
        return Err(format!("rpc error: {err}"));
    }
    let result = json
        .get("result")
        .and_then(|r| r.as_str())
        .ok_or_else(|| "rpc response missing result".to_string())?;

    hex::decode(result.trim_start_matches("0x")).map_err(|e| format!("rpc result not hex: {e}"))
}
