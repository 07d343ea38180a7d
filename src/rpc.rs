//! Chain RPC seam and a NEAR JSON-RPC client.
//!
//! The orchestrator only ever talks to [`ChainRpc`]; [`NearRpcClient`] is the
//! production implementation over `reqwest`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{ChainError, ConfigError};

/// Block header fields used for freshness binding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: u64,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockInfo {
    pub header: BlockHeader,
}

/// Access-key state as reported by the chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessKeyInfo {
    pub nonce: u64,
    #[serde(default)]
    pub block_height: u64,
    #[serde(default)]
    pub block_hash: String,
}

/// Chain queries consumed by the confirmation flow.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Latest final block.
    async fn view_block(&self) -> Result<BlockInfo, ChainError>;

    /// Access-key state for `public_key` on `account_id`.
    async fn view_access_key(
        &self,
        account_id: &str,
        public_key: &str,
    ) -> Result<AccessKeyInfo, ChainError>;

    /// Broadcast a signed, base64-encoded transaction and wait for the outcome.
    async fn send_transaction(&self, signed_tx_base64: &str)
    -> Result<serde_json::Value, ChainError>;
}

/// Hosts allowed to use plain `http://` RPC endpoints.
const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "[::1]"];

/// Validate an RPC endpoint: https only (http for loopback), no userinfo.
pub fn validate_rpc_url(raw: &str, key: &str) -> Result<url::Url, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    };

    let parsed = url::Url::parse(raw.trim()).map_err(|e| invalid(format!("URL parse failed: {e}")))?;

    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(invalid("URL contains userinfo which is not allowed".to_string()));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| invalid("URL has no host".to_string()))?
        .to_ascii_lowercase();

    match parsed.scheme() {
        "https" => Ok(parsed),
        "http" if LOOPBACK_HOSTS.contains(&host.as_str()) => Ok(parsed),
        "http" => Err(invalid(format!(
            "insecure scheme for non-loopback host {host} (only https allowed)"
        ))),
        other => Err(invalid(format!("unsupported scheme: {other}"))),
    }
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// NEAR JSON-RPC client.
pub struct NearRpcClient {
    endpoint: url::Url,
    client: Client,
    next_id: AtomicU64,
}

impl NearRpcClient {
    pub fn new(endpoint: url::Url, timeout: Duration) -> Self {
        Self {
            endpoint,
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }

    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id.to_string(),
            "method": method,
            "params": params,
        });

        tracing::debug!(method, id, "chain rpc call");

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::RequestFailed {
                method: method.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ChainError::RequestFailed {
                method: method.to_string(),
                reason: format!("HTTP {status}: {text}"),
            });
        }

        let envelope: RpcEnvelope = response.json().await?;
        if let Some(error) = envelope.error {
            return Err(ChainError::RequestFailed {
                method: method.to_string(),
                reason: error.to_string(),
            });
        }

        let result = envelope.result.ok_or_else(|| ChainError::InvalidResponse {
            method: method.to_string(),
            reason: "missing result".to_string(),
        })?;

        // Query errors are reported inside `result` rather than `error`.
        if let Some(error) = result.get("error").and_then(|v| v.as_str()) {
            return Err(ChainError::RequestFailed {
                method: method.to_string(),
                reason: error.to_string(),
            });
        }

        Ok(result)
    }
}

#[async_trait]
impl ChainRpc for NearRpcClient {
    async fn view_block(&self) -> Result<BlockInfo, ChainError> {
        let result = self
            .call("block", serde_json::json!({ "finality": "final" }))
            .await?;
        serde_json::from_value(result).map_err(|e| ChainError::InvalidResponse {
            method: "block".to_string(),
            reason: e.to_string(),
        })
    }

    async fn view_access_key(
        &self,
        account_id: &str,
        public_key: &str,
    ) -> Result<AccessKeyInfo, ChainError> {
        let result = self
            .call(
                "query",
                serde_json::json!({
                    "request_type": "view_access_key",
                    "finality": "final",
                    "account_id": account_id,
                    "public_key": public_key,
                }),
            )
            .await
            .map_err(|e| match e {
                ChainError::RequestFailed { ref reason, .. }
                    if reason.contains("does not exist") || reason.contains("UNKNOWN_ACCESS_KEY") =>
                {
                    ChainError::AccessKeyNotFound {
                        account_id: account_id.to_string(),
                        public_key: public_key.to_string(),
                    }
                }
                other => other,
            })?;
        serde_json::from_value(result).map_err(|e| ChainError::InvalidResponse {
            method: "query.view_access_key".to_string(),
            reason: e.to_string(),
        })
    }

    async fn send_transaction(
        &self,
        signed_tx_base64: &str,
    ) -> Result<serde_json::Value, ChainError> {
        self.call("broadcast_tx_commit", serde_json::json!([signed_tx_base64]))
            .await
    }
}
