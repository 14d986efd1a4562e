//! Destination-chain client (NEAR). Polls the HTLC contract's event
//! log through `call_function` queries and decodes the JSON records it
//! returns.

use super::{rpc_request, ChainClient, RpcTransport};
use crate::error::{OrchestratorError, Result};
use crate::persist::CursorFile;
use crate::types::{ChainEvent, ChainSide, EventKind, Hashlock, Urgency};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::DateTime;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Average destination-chain block time.
const BLOCK_TIME: Duration = Duration::from_secs(1);

/// One event record as the HTLC contract's `get_events` view method
/// returns it.
#[derive(Debug, Deserialize)]
struct HtlcEventRecord {
    event: String,
    hashlock: String,
    htlc_id: String,
    #[serde(default)]
    amount: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    secret: Option<String>,
    /// Refund deadline, epoch seconds.
    #[serde(default)]
    timeout: Option<u64>,
    tx_hash: String,
    #[serde(default)]
    log_index: u32,
    block_height: u64,
}

pub struct NearChainClient {
    transport: RpcTransport,
    confirmations: u64,
    /// HTLC contract account queried for events.
    contract: String,
    cursor_file: CursorFile,
    cursor: Mutex<Option<u64>>,
}

impl NearChainClient {
    pub fn new(
        transport: RpcTransport,
        confirmations: u64,
        contract: String,
        cursor_file: CursorFile,
    ) -> Result<Self> {
        let cursor = cursor_file.load()?;
        Ok(Self {
            transport,
            confirmations: confirmations.max(1),
            contract,
            cursor_file,
            cursor: Mutex::new(cursor),
        })
    }

    fn view_call(&self, method_name: &str, args: &Value) -> Value {
        rpc_request(
            "query",
            json!({
                "request_type": "call_function",
                "finality": "final",
                "account_id": self.contract,
                "method_name": method_name,
                "args_base64": B64.encode(args.to_string()),
            }),
        )
    }
}

#[async_trait]
impl ChainClient for NearChainClient {
    fn side(&self) -> ChainSide {
        ChainSide::Dst
    }

    fn confirmations(&self) -> u64 {
        self.confirmations
    }

    async fn head_block(&self) -> Result<u64> {
        let result = self
            .transport
            .post_once(&rpc_request("block", json!({"finality": "final"})))
            .await?;
        result["header"]["height"].as_u64().ok_or_else(|| {
            OrchestratorError::ChainUnavailable("block response missing header.height".into())
        })
    }

    async fn poll_confirmed(&self) -> Result<Vec<ChainEvent>> {
        let head = {
            let result = self
                .transport
                .post_with_retry(&rpc_request("block", json!({"finality": "final"})))
                .await?;
            result["header"]["height"].as_u64().ok_or_else(|| {
                OrchestratorError::ChainUnavailable("block response missing header.height".into())
            })?
        };
        let tip = head.saturating_sub(self.confirmations - 1);

        let from = {
            let mut cursor = self.cursor.lock().unwrap();
            match *cursor {
                Some(last) => last + 1,
                None => {
                    *cursor = Some(tip);
                    drop(cursor);
                    self.cursor_file.store(tip)?;
                    return Ok(Vec::new());
                }
            }
        };
        if from > tip {
            return Ok(Vec::new());
        }

        let call = self.view_call("get_events", &json!({"from_block": from, "to_block": tip}));
        let result = self.transport.post_with_retry(&call).await?;
        let records = decode_view_result(&result)?;

        let mut events = Vec::new();
        for record in records {
            match record.into_event() {
                Ok(Some(ev)) => events.push(ev),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "undecodable destination event"),
            }
        }
        events.sort_by_key(|e| (e.block_number, e.log_index));

        *self.cursor.lock().unwrap() = Some(tip);
        self.cursor_file.store(tip)?;
        debug!(from, to = tip, events = events.len(), "destination poll");
        Ok(events)
    }

    fn estimate_confirmation_time(&self, level: Urgency) -> Duration {
        let factor: u32 = match level {
            Urgency::Fast => 1,
            Urgency::Normal => 2,
            Urgency::Slow => 4,
        };
        BLOCK_TIME * self.confirmations as u32 * factor
    }

    async fn submit_readonly_call(
        &self,
        target: &str,
        method: &str,
        args: Value,
    ) -> Result<Vec<u8>> {
        let call = rpc_request(
            "query",
            json!({
                "request_type": "call_function",
                "finality": "final",
                "account_id": target,
                "method_name": method,
                "args_base64": B64.encode(args.to_string()),
            }),
        );
        let result = self.transport.post_once(&call).await?;
        serde_json::from_value::<Vec<u8>>(result["result"].clone()).map_err(|e| {
            OrchestratorError::ChainUnavailable(format!("call_function: bad result bytes: {e}"))
        })
    }
}

/// A `call_function` result carries the return value as a byte array.
fn decode_view_result(result: &Value) -> Result<Vec<HtlcEventRecord>> {
    let bytes: Vec<u8> = serde_json::from_value(result["result"].clone()).map_err(|e| {
        OrchestratorError::ChainUnavailable(format!("call_function: bad result bytes: {e}"))
    })?;
    serde_json::from_slice(&bytes).map_err(|e| {
        OrchestratorError::ChainUnavailable(format!("get_events: bad payload: {e}"))
    })
}

impl HtlcEventRecord {
    fn into_event(self) -> Result<Option<ChainEvent>> {
        let kind = match self.event.as_str() {
            "htlc_created" => EventKind::HtlcCreated,
            "htlc_withdrawn" => EventKind::HtlcWithdrawn,
            "htlc_refunded" => EventKind::HtlcRefunded,
            other => {
                debug!(event = other, "ignoring unknown destination event kind");
                return Ok(None);
            }
        };

        let hashlock: Hashlock = self.hashlock.parse().map_err(|e| {
            OrchestratorError::ChainUnavailable(format!("event hashlock: {e}"))
        })?;
        let amount = match &self.amount {
            Some(s) => Some(s.parse::<u128>().map_err(|e| {
                OrchestratorError::ChainUnavailable(format!("event amount '{s}': {e}"))
            })?),
            None => None,
        };
        let timeout = match self.timeout {
            Some(secs) => Some(DateTime::from_timestamp(secs as i64, 0).ok_or_else(|| {
                OrchestratorError::ChainUnavailable(format!("event timeout out of range: {secs}"))
            })?),
            None => None,
        };

        Ok(Some(ChainEvent {
            chain: ChainSide::Dst,
            kind,
            hashlock,
            contract_ref: self.htlc_id,
            tx_ref: self.tx_hash,
            log_index: self.log_index,
            block_number: self.block_height,
            amount,
            token: self.token,
            secret: self.secret,
            timelocks: None,
            timeout,
        }))
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const H: &str = "0x0202020202020202020202020202020202020202020202020202020202020202";

    fn record(event: &str) -> HtlcEventRecord {
        HtlcEventRecord {
            event: event.into(),
            hashlock: H.into(),
            htlc_id: "htlc-77".into(),
            amount: Some("50000000".into()),
            token: Some("wrap.near".into()),
            secret: None,
            timeout: Some(1_700_003_600),
            tx_hash: "9xKq".into(),
            log_index: 0,
            block_height: 555,
        }
    }

    #[test]
    fn created_record_maps_to_event() {
        let ev = record("htlc_created").into_event().unwrap().unwrap();
        assert_eq!(ev.kind, EventKind::HtlcCreated);
        assert_eq!(ev.chain, ChainSide::Dst);
        assert_eq!(ev.amount, Some(50_000_000));
        assert_eq!(ev.contract_ref, "htlc-77");
        assert_eq!(
            ev.timeout,
            Some(DateTime::from_timestamp(1_700_003_600, 0).unwrap())
        );
    }

    #[test]
    fn withdrawn_record_carries_secret() {
        let mut r = record("htlc_withdrawn");
        r.secret = Some("ab".repeat(32));
        let ev = r.into_event().unwrap().unwrap();
        assert_eq!(ev.kind, EventKind::HtlcWithdrawn);
        assert_eq!(ev.secret.as_deref(), Some("ab".repeat(32).as_str()));
    }

    #[test]
    fn unknown_event_kind_skipped() {
        assert!(record("htlc_minted").into_event().unwrap().is_none());
    }

    #[test]
    fn bad_hashlock_is_an_error() {
        let mut r = record("htlc_created");
        r.hashlock = "0x1234".into();
        assert!(r.into_event().is_err());
    }

    #[test]
    fn bad_amount_is_an_error() {
        let mut r = record("htlc_created");
        r.amount = Some("fifty".into());
        assert!(r.into_event().is_err());
    }

    #[test]
    fn view_result_decodes_byte_payload() {
        let records = json!([{
            "event": "htlc_created",
            "hashlock": H,
            "htlc_id": "htlc-1",
            "amount": "1",
            "tx_hash": "tx",
            "block_height": 1,
        }]);
        let bytes: Vec<u8> = records.to_string().into_bytes();
        let result = json!({"result": bytes, "block_height": 10});
        let decoded = decode_view_result(&result).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].htlc_id, "htlc-1");
    }

    #[test]
    fn garbage_view_result_rejected() {
        let result = json!({"result": [123, 34]});
        assert!(decode_view_result(&result).is_err());
    }
}
