//! Source-chain client (EVM). Decodes escrow factory events by topic
//! hash from `eth_getLogs` batches and gates them on confirmation
//! depth before anything downstream sees them.

use super::{parse_hex_u64, rpc_request, ChainClient, RpcTransport};
use crate::error::{OrchestratorError, Result};
use crate::persist::CursorFile;
use crate::types::{ChainEvent, ChainSide, EventKind, Hashlock, Timelocks, Urgency};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Average source-chain block time used for confirmation estimates.
const BLOCK_TIME: Duration = Duration::from_secs(2);

/// Topic0 hashes of the escrow factory events this client tracks.
///
/// The values depend on the exact event signatures of the deployed
/// factory build, so they are supplied through configuration (from the
/// contract's artifact metadata) rather than hardcoded here. Stored
/// lowercase and matched verbatim against log topics.
#[derive(Debug, Clone)]
pub struct EventTopics {
    escrow_created: String,
    withdrawn: String,
    cancelled: String,
}

impl EventTopics {
    pub fn new(escrow_created: &str, withdrawn: &str, cancelled: &str) -> Result<Self> {
        Ok(Self {
            escrow_created: normalize_topic(escrow_created)?,
            withdrawn: normalize_topic(withdrawn)?,
            cancelled: normalize_topic(cancelled)?,
        })
    }

    fn kind_of(&self, topic0: &str) -> Option<EventKind> {
        let topic0 = topic0.to_lowercase();
        if topic0 == self.escrow_created {
            Some(EventKind::EscrowCreated)
        } else if topic0 == self.withdrawn {
            Some(EventKind::Withdrawn)
        } else if topic0 == self.cancelled {
            Some(EventKind::Cancelled)
        } else {
            None
        }
    }
}

fn normalize_topic(raw: &str) -> Result<String> {
    let topic = raw.trim().to_lowercase();
    let hex_part = topic.strip_prefix("0x").ok_or_else(|| {
        OrchestratorError::InvalidInput(format!("topic '{raw}' must be 0x-prefixed"))
    })?;
    if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(OrchestratorError::InvalidInput(format!(
            "topic '{raw}' must be 32 bytes of hex"
        )));
    }
    Ok(topic)
}

pub struct EvmChainClient {
    transport: RpcTransport,
    confirmations: u64,
    /// Optional escrow factory address to narrow the log filter.
    factory: Option<String>,
    topics: EventTopics,
    cursor_file: CursorFile,
    /// Last processed block; `None` until the first poll anchors it at
    /// the confirmed tip.
    cursor: Mutex<Option<u64>>,
}

impl EvmChainClient {
    pub fn new(
        transport: RpcTransport,
        confirmations: u64,
        factory: Option<String>,
        topics: EventTopics,
        cursor_file: CursorFile,
    ) -> Result<Self> {
        let cursor = cursor_file.load()?;
        Ok(Self {
            transport,
            confirmations: confirmations.max(1),
            factory,
            topics,
            cursor_file,
            cursor: Mutex::new(cursor),
        })
    }

    fn log_filter(&self, from: u64, to: u64) -> Value {
        let mut filter = json!({
            "fromBlock": format!("0x{from:x}"),
            "toBlock": format!("0x{to:x}"),
            "topics": [[
                self.topics.escrow_created,
                self.topics.withdrawn,
                self.topics.cancelled,
            ]],
        });
        if let Some(factory) = &self.factory {
            filter["address"] = json!(factory);
        }
        json!([filter])
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn side(&self) -> ChainSide {
        ChainSide::Src
    }

    fn confirmations(&self) -> u64 {
        self.confirmations
    }

    async fn head_block(&self) -> Result<u64> {
        let result = self
            .transport
            .post_once(&rpc_request("eth_blockNumber", json!([])))
            .await?;
        parse_hex_u64(&result)
    }

    async fn poll_confirmed(&self) -> Result<Vec<ChainEvent>> {
        let head = self
            .transport
            .post_with_retry(&rpc_request("eth_blockNumber", json!([])))
            .await
            .and_then(|v| parse_hex_u64(&v))?;
        let tip = head.saturating_sub(self.confirmations - 1);

        let from = {
            let mut cursor = self.cursor.lock().unwrap();
            match *cursor {
                Some(last) => last + 1,
                None => {
                    // First poll: anchor at the confirmed tip and start
                    // tailing from the next block.
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

        let logs = self
            .transport
            .post_with_retry(&rpc_request("eth_getLogs", self.log_filter(from, tip)))
            .await?;
        let logs = logs.as_array().cloned().unwrap_or_default();

        let mut events = Vec::new();
        for log in &logs {
            match decode_log(log, &self.topics) {
                Ok(Some(ev)) => events.push(ev),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "undecodable source log"),
            }
        }
        events.sort_by_key(|e| (e.block_number, e.log_index));

        *self.cursor.lock().unwrap() = Some(tip);
        self.cursor_file.store(tip)?;
        debug!(from, to = tip, events = events.len(), "source poll");
        Ok(events)
    }

    fn estimate_confirmation_time(&self, level: Urgency) -> Duration {
        let factor = match level {
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
        let suffix = args.as_str().unwrap_or_default();
        let data = format!("{method}{}", suffix.trim_start_matches("0x"));
        let result = self
            .transport
            .post_once(&rpc_request(
                "eth_call",
                json!([{"to": target, "data": data}, "latest"]),
            ))
            .await?;
        let hex_str = result
            .as_str()
            .ok_or_else(|| OrchestratorError::ChainUnavailable("eth_call: non-string result".into()))?;
        hex::decode(hex_str.trim_start_matches("0x"))
            .map_err(|e| OrchestratorError::ChainUnavailable(format!("eth_call: bad hex: {e}")))
    }
}

/// Decode one `eth_getLogs` entry. Returns `Ok(None)` for topics we do
/// not track.
fn decode_log(log: &Value, tracked: &EventTopics) -> Result<Option<ChainEvent>> {
    let topics: Vec<&str> = log["topics"]
        .as_array()
        .map(|a| a.iter().filter_map(|t| t.as_str()).collect())
        .unwrap_or_default();
    let Some(&topic0) = topics.first() else {
        return Ok(None);
    };

    let Some(kind) = tracked.kind_of(topic0) else {
        return Ok(None);
    };

    let hashlock: Hashlock = topics
        .get(1)
        .ok_or_else(|| bad_log("missing hashlock topic"))?
        .parse()
        .map_err(bad_log)?;

    let block_number = parse_hex_u64(&log["blockNumber"])?;
    let log_index = parse_hex_u64(&log["logIndex"])? as u32;
    let tx_ref = log["transactionHash"]
        .as_str()
        .ok_or_else(|| bad_log("missing transactionHash"))?
        .to_string();
    let words = data_words(log["data"].as_str().unwrap_or("0x"))?;

    let event = match kind {
        EventKind::EscrowCreated => {
            // data: escrow address, token, amount, then the five
            // timelocks in dst-first order.
            if words.len() < 8 {
                return Err(bad_log("escrow event: short data"));
            }
            let timelocks = Timelocks {
                dst_withdrawal: word_timestamp(&words[3])?,
                dst_cancellation: word_timestamp(&words[4])?,
                src_withdrawal: word_timestamp(&words[5])?,
                src_public_withdrawal: word_timestamp(&words[6])?,
                src_cancellation: word_timestamp(&words[7])?,
            };
            ChainEvent {
                chain: ChainSide::Src,
                kind,
                hashlock,
                contract_ref: word_address(&words[0]),
                tx_ref,
                log_index,
                block_number,
                amount: Some(word_u128(&words[2])),
                token: Some(word_address(&words[1])),
                secret: None,
                timeout: Some(timelocks.src_cancellation),
                timelocks: Some(timelocks),
            }
        }
        EventKind::Withdrawn => {
            if words.is_empty() {
                return Err(bad_log("withdrawn event: missing secret word"));
            }
            ChainEvent {
                chain: ChainSide::Src,
                kind,
                hashlock,
                contract_ref: log["address"].as_str().unwrap_or_default().to_string(),
                tx_ref,
                log_index,
                block_number,
                amount: None,
                token: None,
                secret: Some(hex::encode(words[0])),
                timelocks: None,
                timeout: None,
            }
        }
        _ => ChainEvent {
            chain: ChainSide::Src,
            kind,
            hashlock,
            contract_ref: log["address"].as_str().unwrap_or_default().to_string(),
            tx_ref,
            log_index,
            block_number,
            amount: None,
            token: None,
            secret: None,
            timelocks: None,
            timeout: None,
        },
    };
    Ok(Some(event))
}

fn bad_log(msg: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::ChainUnavailable(format!("log decode: {msg}"))
}

/// Split ABI-encoded data into 32-byte words.
fn data_words(data: &str) -> Result<Vec<[u8; 32]>> {
    let raw = hex::decode(data.trim_start_matches("0x"))
        .map_err(|e| bad_log(format!("bad data hex: {e}")))?;
    if raw.len() % 32 != 0 {
        return Err(bad_log("data not word-aligned"));
    }
    Ok(raw
        .chunks_exact(32)
        .map(|c| {
            let mut word = [0u8; 32];
            word.copy_from_slice(c);
            word
        })
        .collect())
}

fn word_u128(word: &[u8; 32]) -> u128 {
    u128::from_be_bytes(word[16..32].try_into().unwrap())
}

fn word_u64(word: &[u8; 32]) -> u64 {
    u64::from_be_bytes(word[24..32].try_into().unwrap())
}

fn word_address(word: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(&word[12..32]))
}

fn word_timestamp(word: &[u8; 32]) -> Result<DateTime<Utc>> {
    let secs = word_u64(word);
    DateTime::from_timestamp(secs as i64, 0)
        .ok_or_else(|| bad_log(format!("timestamp out of range: {secs}")))
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // Config fixtures standing in for the deployed factory's topics.
    const CREATED_TOPIC: &str =
        "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const WITHDRAWN_TOPIC: &str =
        "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const CANCELLED_TOPIC: &str =
        "0xcccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";

    fn tracked() -> EventTopics {
        EventTopics::new(CREATED_TOPIC, WITHDRAWN_TOPIC, CANCELLED_TOPIC).unwrap()
    }

    fn word_from_u64(v: u64) -> String {
        format!("{v:064x}")
    }

    fn escrow_log(hashlock: &str, amount: u64, timelocks: [u64; 5]) -> Value {
        let mut data = String::from("0x");
        // escrow address word
        data.push_str(&format!("{:0>64}", "00aa"));
        // token address word
        data.push_str(&format!("{:0>64}", "00bb"));
        data.push_str(&word_from_u64(amount));
        for t in timelocks {
            data.push_str(&word_from_u64(t));
        }
        json!({
            "address": "0xfactory",
            "topics": [CREATED_TOPIC, hashlock],
            "data": data,
            "blockNumber": "0x64",
            "transactionHash": "0xdeadbeef",
            "logIndex": "0x2",
        })
    }

    const H: &str = "0x0101010101010101010101010101010101010101010101010101010101010101";

    #[test]
    fn decodes_escrow_created_with_timelocks() {
        let base = 1_700_000_000u64;
        let log = escrow_log(
            H,
            1_000_000,
            [base + 100, base + 200, base + 300, base + 400, base + 500],
        );
        let ev = decode_log(&log, &tracked()).unwrap().unwrap();
        assert_eq!(ev.kind, EventKind::EscrowCreated);
        assert_eq!(ev.chain, ChainSide::Src);
        assert_eq!(ev.hashlock, H.parse().unwrap());
        assert_eq!(ev.amount, Some(1_000_000));
        assert_eq!(ev.block_number, 100);
        assert_eq!(ev.log_index, 2);
        let tl = ev.timelocks.unwrap();
        assert!(tl.ordering_holds());
        assert_eq!(
            tl.dst_withdrawal,
            DateTime::from_timestamp(base as i64 + 100, 0).unwrap()
        );
        assert_eq!(ev.timeout, Some(tl.src_cancellation));
    }

    #[test]
    fn decodes_withdrawn_secret() {
        let secret = "a1".repeat(32);
        let log = json!({
            "address": "0xescrow",
            "topics": [WITHDRAWN_TOPIC, H],
            "data": format!("0x{secret}"),
            "blockNumber": "0x65",
            "transactionHash": "0xfeed",
            "logIndex": "0x0",
        });
        let ev = decode_log(&log, &tracked()).unwrap().unwrap();
        assert_eq!(ev.kind, EventKind::Withdrawn);
        assert_eq!(ev.secret.as_deref(), Some(secret.as_str()));
    }

    #[test]
    fn decodes_cancelled() {
        let log = json!({
            "address": "0xescrow",
            "topics": [CANCELLED_TOPIC, H],
            "data": "0x",
            "blockNumber": "0x66",
            "transactionHash": "0xdead",
            "logIndex": "0x1",
        });
        let ev = decode_log(&log, &tracked()).unwrap().unwrap();
        assert_eq!(ev.kind, EventKind::Cancelled);
        assert!(ev.secret.is_none());
    }

    #[test]
    fn unknown_topic_is_skipped() {
        let log = json!({
            "topics": ["0x1111111111111111111111111111111111111111111111111111111111111111", H],
            "data": "0x",
            "blockNumber": "0x1",
            "transactionHash": "0x1",
            "logIndex": "0x0",
        });
        assert!(decode_log(&log, &tracked()).unwrap().is_none());
    }

    #[test]
    fn short_escrow_data_is_an_error() {
        let log = json!({
            "address": "0xfactory",
            "topics": [CREATED_TOPIC, H],
            "data": "0x",
            "blockNumber": "0x1",
            "transactionHash": "0x1",
            "logIndex": "0x0",
        });
        assert!(decode_log(&log, &tracked()).is_err());
    }

    #[test]
    fn word_helpers() {
        let mut w = [0u8; 32];
        w[31] = 0x2a;
        assert_eq!(word_u64(&w), 42);
        assert_eq!(word_u128(&w), 42);
        w[12] = 0xab;
        assert!(word_address(&w).starts_with("0xab"));
        assert_eq!(word_address(&w).len(), 42);
    }

    #[test]
    fn unaligned_data_rejected() {
        assert!(data_words("0xabcd11").is_err());
        assert_eq!(data_words("0x").unwrap().len(), 0);
    }

    #[test]
    fn topic_matching_is_case_insensitive() {
        let log = json!({
            "address": "0xescrow",
            "topics": [CANCELLED_TOPIC.to_uppercase().replace("0X", "0x"), H],
            "data": "0x",
            "blockNumber": "0x66",
            "transactionHash": "0xdead",
            "logIndex": "0x1",
        });
        let ev = decode_log(&log, &tracked()).unwrap().unwrap();
        assert_eq!(ev.kind, EventKind::Cancelled);
    }

    #[test]
    fn malformed_topics_rejected_at_construction() {
        let good = format!("0x{}", "ab".repeat(32));
        assert!(EventTopics::new(&good, &good, &good).is_ok());
        // No prefix.
        assert!(EventTopics::new(&"ab".repeat(32), &good, &good).is_err());
        // Wrong length.
        assert!(EventTopics::new("0xabcd", &good, &good).is_err());
        // Not hex.
        assert!(EventTopics::new(&format!("0x{}", "zz".repeat(32)), &good, &good).is_err());
    }
}
