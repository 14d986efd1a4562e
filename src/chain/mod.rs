//! Chain-client seam: one trait, two implementations.
//!
//! Everything above this layer sees decoded [`ChainEvent`]s only.
//! Each client owns its cursor, gates events on its confirmation
//! depth, and retries transient RPC failures with exponential backoff
//! before surfacing `ChainUnavailable`.

pub mod evm;
pub mod near;

use crate::error::{OrchestratorError, Result};
use crate::types::{ChainEvent, ChainSide, Urgency};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Per-request timeout on chain RPC calls.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(15);

/// First retry delay; doubles per attempt.
pub const BACKOFF_BASE_MS: u64 = 500;

/// Ceiling on a single backoff delay.
pub const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Total retry budget before a call is declared unavailable.
pub const RETRY_WINDOW: Duration = Duration::from_secs(300);

#[async_trait]
pub trait ChainClient: Send + Sync {
    fn side(&self) -> ChainSide;

    /// Confirmations required before an event is emitted downstream.
    fn confirmations(&self) -> u64;

    /// Current chain head. Single attempt — callers that want
    /// resilience go through [`ChainClient::poll_confirmed`].
    async fn head_block(&self) -> Result<u64>;

    /// Decoded events between the persisted cursor and the
    /// confirmation-gated tip. Advances and persists the cursor on
    /// success. Retries internally; an error here means the retry
    /// window is exhausted.
    async fn poll_confirmed(&self) -> Result<Vec<ChainEvent>>;

    /// Rough wall-clock estimate for a confirmation at the given
    /// urgency.
    fn estimate_confirmation_time(&self, level: Urgency) -> Duration;

    /// Read-only contract call, used for quote/price reads only.
    async fn submit_readonly_call(&self, target: &str, method: &str, args: Value)
        -> Result<Vec<u8>>;
}

/// Exponential backoff delay for the given attempt.
pub fn backoff_delay(attempt: u32) -> Duration {
    let ms = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(20));
    Duration::from_millis(ms).min(BACKOFF_CAP)
}

/// Shared JSON-RPC transport over reqwest.
#[derive(Clone)]
pub struct RpcTransport {
    client: reqwest::Client,
    url: String,
}

impl RpcTransport {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|e| OrchestratorError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One POST, no retries. Returns the JSON-RPC `result` value.
    pub async fn post_once(&self, body: &Value) -> Result<Value> {
        let resp = self.client.post(&self.url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(OrchestratorError::ChainUnavailable(format!(
                "rpc http {status}"
            )));
        }
        let envelope: Value = resp.json().await?;
        extract_rpc_result(envelope)
    }

    /// POST with exponential backoff until [`RETRY_WINDOW`] elapses.
    pub async fn post_with_retry(&self, body: &Value) -> Result<Value> {
        let started = tokio::time::Instant::now();
        let mut attempt: u32 = 0;
        loop {
            match self.post_once(body).await {
                Ok(v) => return Ok(v),
                Err(e) if started.elapsed() < RETRY_WINDOW => {
                    let delay = backoff_delay(attempt);
                    debug!(
                        url = %self.url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "rpc retry"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Build a JSON-RPC 2.0 envelope.
pub fn rpc_request(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    })
}

fn extract_rpc_result(envelope: Value) -> Result<Value> {
    if let Some(err) = envelope.get("error") {
        if !err.is_null() {
            return Err(OrchestratorError::ChainUnavailable(format!(
                "rpc error: {err}"
            )));
        }
    }
    envelope
        .get("result")
        .cloned()
        .ok_or_else(|| OrchestratorError::ChainUnavailable("rpc response missing result".into()))
}

/// Parse a `0x…` quantity into u64 (`eth_blockNumber` and friends).
pub fn parse_hex_u64(v: &Value) -> Result<u64> {
    let s = v
        .as_str()
        .ok_or_else(|| OrchestratorError::ChainUnavailable(format!("expected hex string, got {v}")))?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| OrchestratorError::ChainUnavailable(format!("bad hex quantity '{s}': {e}")))
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(10), BACKOFF_CAP);
        assert_eq!(backoff_delay(63), BACKOFF_CAP);
    }

    #[test]
    fn rpc_request_shape() {
        let req = rpc_request("eth_blockNumber", json!([]));
        assert_eq!(req["jsonrpc"], "2.0");
        assert_eq!(req["method"], "eth_blockNumber");
        assert!(req["params"].is_array());
    }

    #[test]
    fn extract_result_prefers_error() {
        let err = extract_rpc_result(json!({"error": {"code": -32000, "message": "nope"}}));
        assert!(err.is_err());
        let ok = extract_rpc_result(json!({"result": "0x10"})).unwrap();
        assert_eq!(ok, json!("0x10"));
        assert!(extract_rpc_result(json!({"jsonrpc": "2.0"})).is_err());
    }

    #[test]
    fn hex_quantity_parses() {
        assert_eq!(parse_hex_u64(&json!("0x10")).unwrap(), 16);
        assert_eq!(parse_hex_u64(&json!("0x0")).unwrap(), 0);
        assert!(parse_hex_u64(&json!(12)).is_err());
        assert!(parse_hex_u64(&json!("0xzz")).is_err());
    }
}
