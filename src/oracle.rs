//! Price-feed refresh — keeps the quote snapshot current by polling
//! Chainlink-compatible USD aggregators on the source chain through
//! read-only calls. The chain client's `submit_readonly_call` is the
//! only on-chain access here; nothing is ever written.

use crate::chain::ChainClient;
use crate::config::PriceFeed;
use crate::error::{OrchestratorError, Result};
use crate::quote::{PriceSnapshot, TokenPrice};

use serde_json::json;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// `latestAnswer()` selector on Chainlink-compatible aggregators.
const LATEST_ANSWER_SELECTOR: &str = "0x50d25bcd";

/// USD aggregators answer with eight decimals.
const FEED_ANSWER_SCALE: f64 = 1e8;

/// Refresh cadence; quotes are valid for 30s, so match that.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Poll every configured feed on an interval and fold the answers into
/// the shared snapshot. A failing feed keeps its last known price.
pub fn spawn_refresher(
    client: Arc<dyn ChainClient>,
    feeds: Vec<PriceFeed>,
    prices: Arc<RwLock<PriceSnapshot>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            for feed in &feeds {
                match client
                    .submit_readonly_call(&feed.address, LATEST_ANSWER_SELECTOR, json!(""))
                    .await
                {
                    Ok(bytes) => match decode_answer(&bytes) {
                        Ok(usd) => {
                            prices.write().unwrap().set_price(
                                &feed.symbol,
                                TokenPrice {
                                    usd,
                                    decimals: feed.decimals,
                                },
                            );
                            debug!(symbol = %feed.symbol, usd, "price refreshed");
                        }
                        Err(e) => {
                            warn!(symbol = %feed.symbol, error = %e, "bad feed answer")
                        }
                    },
                    Err(e) => warn!(symbol = %feed.symbol, error = %e, "price feed unreachable"),
                }
            }
        }
        info!("price refresher stopped");
    })
}

/// Decode a `latestAnswer()` return value (one int256 word) into a USD
/// price. Non-positive or out-of-range answers are rejected so a
/// broken feed can never zero out the snapshot.
pub fn decode_answer(bytes: &[u8]) -> Result<f64> {
    if bytes.len() < 32 {
        return Err(OrchestratorError::ChainUnavailable(format!(
            "feed answer too short: {} bytes",
            bytes.len()
        )));
    }
    let word = &bytes[..32];
    if word[0] & 0x80 != 0 {
        return Err(OrchestratorError::ChainUnavailable(
            "feed answered a negative price".into(),
        ));
    }
    if word[..16].iter().any(|b| *b != 0) {
        return Err(OrchestratorError::ChainUnavailable(
            "feed answer out of range".into(),
        ));
    }
    let raw = u128::from_be_bytes(word[16..32].try_into().unwrap());
    let usd = raw as f64 / FEED_ANSWER_SCALE;
    if usd <= 0.0 {
        return Err(OrchestratorError::ChainUnavailable(
            "feed answered zero".into(),
        ));
    }
    Ok(usd)
}

// ── Tests ───────────────────────────────────────────────────────
