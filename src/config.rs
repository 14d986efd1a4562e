//! Configuration for the orchestrator, read from the environment.

use crate::chain::evm::EventTopics;

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

/// One Chainlink-compatible USD feed on the source chain, parsed from
/// `SRC_PRICE_FEEDS` as `SYMBOL:address:decimals`.
#[derive(Debug, Clone)]
pub struct PriceFeed {
    pub symbol: String,
    pub address: String,
    /// Token decimals used for the snapshot entry this feed updates.
    pub decimals: u8,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket server listens on.
    pub port: u16,

    /// Source-chain (EVM) JSON-RPC endpoint. Required.
    pub src_chain_rpc: String,

    /// Destination-chain (NEAR) JSON-RPC endpoint. Required.
    pub dst_chain_rpc: String,

    /// Confirmations required before a source-chain event is trusted.
    pub src_confirmations: u64,

    /// Confirmations required before a destination-chain event is trusted.
    pub dst_confirmations: u64,

    /// Optional source escrow factory address used to narrow log filters.
    pub src_escrow_factory: Option<String>,

    /// Topic0 hashes of the escrow factory's events, taken from the
    /// deployed contract's artifact metadata.
    pub src_event_topics: EventTopics,

    /// Price feeds polled for the quote snapshot. Empty disables the
    /// refresh task.
    pub src_price_feeds: Vec<PriceFeed>,

    /// Destination HTLC contract account.
    pub dst_htlc_contract: String,

    /// Accepted API keys (comma-separated in the environment).
    pub api_keys: Vec<String>,

    /// Root of the persistent state directory.
    pub state_dir: PathBuf,

    /// Default session lifetime when the request does not set one.
    pub session_default_ttl_seconds: u64,

    /// Cap on WebSocket subscribers per session channel.
    pub max_subscribers_per_session: usize,

    /// Log filter (debug|info|warn|error).
    pub log_level: String,

    /// Chain polling cadence in milliseconds.
    pub poll_interval_ms: u64,

    /// Dutch-auction start premium over the oracle rate.
    pub quote_premium_bps: u16,

    /// Protocol fee taken from the source amount.
    pub protocol_fee_bps: u16,

    /// How long terminal sessions (and their secrets) are retained.
    pub session_retention_seconds: u64,
}

/// Per-request expiry bounds: 10 minutes to 24 hours.
pub const MIN_SESSION_TTL_SECS: u64 = 600;
pub const MAX_SESSION_TTL_SECS: u64 = 86_400;

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            port: std::env::var("ORCHESTRATOR_PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()
                .context("Invalid ORCHESTRATOR_PORT")?,
            src_chain_rpc: std::env::var("SRC_CHAIN_RPC")
                .context("SRC_CHAIN_RPC is required")?,
            dst_chain_rpc: std::env::var("DST_CHAIN_RPC")
                .context("DST_CHAIN_RPC is required")?,
            src_confirmations: std::env::var("SRC_CONFIRMATIONS")
                .unwrap_or_else(|_| "5".into())
                .parse()
                .context("Invalid SRC_CONFIRMATIONS")?,
            dst_confirmations: std::env::var("DST_CONFIRMATIONS")
                .unwrap_or_else(|_| "1".into())
                .parse()
                .context("Invalid DST_CONFIRMATIONS")?,
            src_escrow_factory: std::env::var("SRC_ESCROW_FACTORY").ok(),
            src_event_topics: EventTopics::new(
                &std::env::var("SRC_ESCROW_CREATED_TOPIC")
                    .context("SRC_ESCROW_CREATED_TOPIC is required")?,
                &std::env::var("SRC_WITHDRAWN_TOPIC")
                    .context("SRC_WITHDRAWN_TOPIC is required")?,
                &std::env::var("SRC_CANCELLED_TOPIC")
                    .context("SRC_CANCELLED_TOPIC is required")?,
            )
            .context("Invalid source event topics")?,
            src_price_feeds: parse_price_feeds(
                &std::env::var("SRC_PRICE_FEEDS").unwrap_or_default(),
            )
            .context("Invalid SRC_PRICE_FEEDS")?,
            dst_htlc_contract: std::env::var("DST_HTLC_CONTRACT")
                .unwrap_or_else(|_| "htlc.orchestrator.near".into()),
            api_keys: std::env::var("API_KEYS")
                .unwrap_or_default()
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
            state_dir: std::env::var("STATE_DIR")
                .unwrap_or_else(|_| "./state".into())
                .into(),
            session_default_ttl_seconds: std::env::var("SESSION_DEFAULT_TTL_SECONDS")
                .unwrap_or_else(|_| "3600".into())
                .parse()
                .context("Invalid SESSION_DEFAULT_TTL_SECONDS")?,
            max_subscribers_per_session: std::env::var("MAX_SUBSCRIBERS_PER_SESSION")
                .unwrap_or_else(|_| "64".into())
                .parse()
                .context("Invalid MAX_SUBSCRIBERS_PER_SESSION")?,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            poll_interval_ms: std::env::var("CHAIN_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "2000".into())
                .parse()
                .unwrap_or(2000),
            quote_premium_bps: std::env::var("QUOTE_PREMIUM_BPS")
                .unwrap_or_else(|_| "200".into())
                .parse()
                .unwrap_or(200),
            protocol_fee_bps: std::env::var("PROTOCOL_FEE_BPS")
                .unwrap_or_else(|_| "30".into())
                .parse()
                .unwrap_or(30),
            session_retention_seconds: std::env::var("SESSION_RETENTION_SECONDS")
                .unwrap_or_else(|_| "3600".into())
                .parse()
                .unwrap_or(3600),
        })
    }

    /// Clamp a requested session TTL into the allowed window, falling
    /// back to the configured default when absent.
    pub fn effective_ttl(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.session_default_ttl_seconds)
            .clamp(MIN_SESSION_TTL_SECS, MAX_SESSION_TTL_SECS)
    }
}

/// Parse `SYMBOL:address:decimals` entries, comma-separated.
fn parse_price_feeds(raw: &str) -> Result<Vec<PriceFeed>> {
    let mut feeds = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.split(':');
        let (symbol, address, decimals) = match (parts.next(), parts.next(), parts.next()) {
            (Some(s), Some(a), Some(d)) if parts.next().is_none() => (s, a, d),
            _ => bail!("feed entry '{entry}' is not SYMBOL:address:decimals"),
        };
        if symbol.is_empty() || address.is_empty() {
            bail!("feed entry '{entry}' has an empty symbol or address");
        }
        feeds.push(PriceFeed {
            symbol: symbol.to_string(),
            address: address.to_string(),
            decimals: decimals
                .parse()
                .with_context(|| format!("feed entry '{entry}': bad decimals"))?,
        });
    }
    Ok(feeds)
}

// ── Tests ───────────────────────────────────────────────────────
