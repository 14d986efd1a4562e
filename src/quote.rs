//! Dutch-auction quote computation.
//!
//! Pure — a quote is a function of the request, a price snapshot, and
//! fee parameters. No state, no I/O; safe to call concurrently.

use crate::error::{OrchestratorError, Result};
use crate::types::{amount_str, Urgency};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Quote validity window.
pub const QUOTE_TTL_SECS: i64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct QuoteRequest {
    pub source_chain: String,
    pub destination_chain: String,
    pub source_token: String,
    pub destination_token: String,
    #[serde(with = "amount_str")]
    pub source_amount: u128,
    #[serde(default)]
    pub urgency: Urgency,
    pub slippage_tolerance_bps: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DutchAuction {
    /// Whole-token price at auction start (`rate × (1 + premium)`).
    pub start_price: f64,
    /// Floor price (`rate × (1 − slippage)`).
    pub end_price: f64,
    pub duration_seconds: u64,
}

impl DutchAuction {
    /// Linear decay from start to end over the duration, clamped at
    /// the floor.
    pub fn price_at(&self, elapsed_seconds: u64) -> f64 {
        if elapsed_seconds >= self.duration_seconds || self.duration_seconds == 0 {
            return self.end_price;
        }
        let progress = elapsed_seconds as f64 / self.duration_seconds as f64;
        self.start_price - (self.start_price - self.end_price) * progress
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteFees {
    /// Protocol fee, destination token units.
    #[serde(with = "amount_str")]
    pub protocol: u128,
    /// Flat network (gas) allowance, destination token units.
    #[serde(with = "amount_str")]
    pub network: u128,
    #[serde(with = "amount_str")]
    pub total: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteResponse {
    #[serde(with = "amount_str")]
    pub dst_amount: u128,
    /// Whole-token exchange rate (destination per source).
    pub rate: f64,
    pub dutch_auction: DutchAuction,
    pub fees: QuoteFees,
    pub valid_until: DateTime<Utc>,
}

/// Per-token USD price and precision, captured once per quote.
#[derive(Debug, Clone, Copy)]
pub struct TokenPrice {
    pub usd: f64,
    pub decimals: u8,
}

/// Immutable market snapshot handed to the quote computation.
#[derive(Debug, Clone, Default)]
pub struct PriceSnapshot {
    tokens: HashMap<String, TokenPrice>,
}

impl PriceSnapshot {
    pub fn new(tokens: HashMap<String, TokenPrice>) -> Self {
        Self { tokens }
    }

    pub fn token(&self, symbol: &str) -> Option<TokenPrice> {
        self.tokens.get(symbol).copied()
    }

    /// Replace or insert one token's entry; the oracle refresh task
    /// feeds this.
    pub fn set_price(&mut self, symbol: &str, price: TokenPrice) {
        self.tokens.insert(symbol.to_string(), price);
    }

    /// Fallback table used until the oracle refresh task has run.
    pub fn with_defaults() -> Self {
        let mut tokens = HashMap::new();
        tokens.insert("ETH".into(), TokenPrice { usd: 3000.0, decimals: 18 });
        tokens.insert("USDC".into(), TokenPrice { usd: 1.0, decimals: 6 });
        tokens.insert("USDT".into(), TokenPrice { usd: 1.0, decimals: 6 });
        tokens.insert("NEAR".into(), TokenPrice { usd: 5.0, decimals: 24 });
        tokens.insert("wNEAR".into(), TokenPrice { usd: 5.0, decimals: 24 });
        Self { tokens }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FeeParams {
    pub protocol_bps: u16,
    /// Auction start premium over the oracle rate.
    pub premium_bps: u16,
    /// Flat gas allowance in destination token units.
    pub network_fee: u128,
}

/// Compute a quote. Durations are urgency-bound: 180s fast, 300s
/// normal, 600s slow.
pub fn compute_quote(
    req: &QuoteRequest,
    snapshot: &PriceSnapshot,
    fees: &FeeParams,
    now: DateTime<Utc>,
) -> Result<QuoteResponse> {
    if req.source_amount == 0 {
        return Err(OrchestratorError::InvalidInput(
            "source_amount must be positive".into(),
        ));
    }
    if req.slippage_tolerance_bps >= 10_000 {
        return Err(OrchestratorError::InvalidInput(
            "slippage_tolerance_bps must be below 10000".into(),
        ));
    }

    let src = snapshot.token(&req.source_token).ok_or_else(|| {
        OrchestratorError::InvalidInput(format!("unknown token {}", req.source_token))
    })?;
    let dst = snapshot.token(&req.destination_token).ok_or_else(|| {
        OrchestratorError::InvalidInput(format!("unknown token {}", req.destination_token))
    })?;
    if dst.usd <= 0.0 || src.usd <= 0.0 {
        return Err(OrchestratorError::InvalidInput("stale price snapshot".into()));
    }

    // Whole-token rate, then rescaled to smallest-unit terms.
    let rate = src.usd / dst.usd;
    let unit_scale = 10f64.powi(dst.decimals as i32 - src.decimals as i32);
    let gross = req.source_amount as f64 * rate * unit_scale;

    let protocol = (gross * bps_frac(fees.protocol_bps)) as u128;
    let network = fees.network_fee;
    let total = protocol + network;

    let dst_amount = (gross as u128).saturating_sub(total);
    if dst_amount == 0 {
        return Err(OrchestratorError::InvalidInput(
            "amount too small to cover fees".into(),
        ));
    }

    let duration_seconds = match req.urgency {
        Urgency::Fast => 180,
        Urgency::Normal => 300,
        Urgency::Slow => 600,
    };

    Ok(QuoteResponse {
        dst_amount,
        rate,
        dutch_auction: DutchAuction {
            start_price: rate * (1.0 + bps_frac(fees.premium_bps)),
            end_price: rate * (1.0 - bps_frac(req.slippage_tolerance_bps)),
            duration_seconds,
        },
        fees: QuoteFees {
            protocol,
            network,
            total,
        },
        valid_until: now + Duration::seconds(QUOTE_TTL_SECS),
    })
}

fn bps_frac(bps: u16) -> f64 {
    bps as f64 / 10_000.0
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn request(amount: u128, urgency: Urgency) -> QuoteRequest {
        QuoteRequest {
            source_chain: "base".into(),
            destination_chain: "near".into(),
            source_token: "USDC".into(),
            destination_token: "wNEAR".into(),
            source_amount: amount,
            urgency,
            slippage_tolerance_bps: 100,
        }
    }

    fn fees() -> FeeParams {
        FeeParams {
            protocol_bps: 30,
            premium_bps: 200,
            network_fee: 1_000,
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn price_bounds_hold() {
        let q = compute_quote(
            &request(1_000_000, Urgency::Normal),
            &PriceSnapshot::with_defaults(),
            &fees(),
            now(),
        )
        .unwrap();
        assert!(q.dutch_auction.end_price <= q.rate);
        assert!(q.rate <= q.dutch_auction.start_price);
    }

    #[test]
    fn dst_amount_covers_end_price_floor() {
        let req = request(1_000_000, Urgency::Normal);
        let q = compute_quote(&req, &PriceSnapshot::with_defaults(), &fees(), now()).unwrap();
        // 1 USDC at $1 against wNEAR at $5: 0.2 wNEAR gross, minus fees.
        let unit_scale = 10f64.powi(24 - 6);
        let floor = (req.source_amount as f64
            * q.dutch_auction.end_price
            * unit_scale
            * (1.0 - 30.0 / 10_000.0)) as u128
            - 1_000;
        assert!(q.dst_amount >= floor, "{} < {}", q.dst_amount, floor);
    }

    #[test]
    fn duration_follows_urgency() {
        let snapshot = PriceSnapshot::with_defaults();
        for (urgency, expected) in [
            (Urgency::Fast, 180),
            (Urgency::Normal, 300),
            (Urgency::Slow, 600),
        ] {
            let q = compute_quote(&request(1_000_000, urgency), &snapshot, &fees(), now()).unwrap();
            assert_eq!(q.dutch_auction.duration_seconds, expected);
        }
    }

    #[test]
    fn valid_until_is_thirty_seconds() {
        let q = compute_quote(
            &request(1_000_000, Urgency::Normal),
            &PriceSnapshot::with_defaults(),
            &fees(),
            now(),
        )
        .unwrap();
        assert_eq!(q.valid_until, now() + Duration::seconds(30));
    }

    #[test]
    fn linear_decay_is_monotonic() {
        let auction = DutchAuction {
            start_price: 1.02,
            end_price: 0.99,
            duration_seconds: 300,
        };
        assert!((auction.price_at(0) - 1.02).abs() < 1e-9);
        assert!((auction.price_at(300) - 0.99).abs() < 1e-9);
        assert!((auction.price_at(1000) - 0.99).abs() < 1e-9);
        let mid = auction.price_at(150);
        assert!(mid < 1.02 && mid > 0.99);
        // Halfway point of a linear decay is the arithmetic mean.
        assert!((mid - (1.02 + 0.99) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn zero_amount_rejected() {
        let err = compute_quote(
            &request(0, Urgency::Normal),
            &PriceSnapshot::with_defaults(),
            &fees(),
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    }

    #[test]
    fn unknown_token_rejected() {
        let mut req = request(1_000_000, Urgency::Normal);
        req.destination_token = "DOGE".into();
        assert!(compute_quote(&req, &PriceSnapshot::with_defaults(), &fees(), now()).is_err());
    }

    #[test]
    fn fees_add_up() {
        let q = compute_quote(
            &request(1_000_000, Urgency::Normal),
            &PriceSnapshot::with_defaults(),
            &fees(),
            now(),
        )
        .unwrap();
        assert_eq!(q.fees.total, q.fees.protocol + q.fees.network);
        assert_eq!(q.fees.network, 1_000);
    }
}
