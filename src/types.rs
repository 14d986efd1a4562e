//! Core domain types — sessions, locks, timelocks, chain events.
//!
//! Everything the session state machine and the API surface agree on
//! lives here. Amounts are `u128` in memory (NEAR yocto amounts do not
//! fit in 64 bits) and decimal strings on the wire.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// ── Hashlock ────────────────────────────────────────────────────

/// 32-byte SHA-256 hashlock, rendered as `0x…` hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hashlock(pub [u8; 32]);

impl Hashlock {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Hashlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hashlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hashlock({})", self.to_hex())
    }
}

impl FromStr for Hashlock {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.trim_start_matches("0x").trim_start_matches("0X");
        let raw = hex::decode(stripped).map_err(|e| format!("invalid hashlock hex: {e}"))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| "hashlock must be exactly 32 bytes".to_string())?;
        Ok(Hashlock(bytes))
    }
}

impl Serialize for Hashlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hashlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Amount serde helpers ────────────────────────────────────────

/// Serialize `u128` amounts as decimal strings (JSON numbers lose
/// precision past 2^53).
pub mod amount_str {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|e| serde::de::Error::custom(format!("invalid amount '{s}': {e}")))
    }
}

/// Same as [`amount_str`] but for optional amounts.
pub mod amount_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<u128>, serializer: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(n) => serializer.serialize_some(&n.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u128>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            None => Ok(None),
            Some(s) => s
                .parse()
                .map(Some)
                .map_err(|e| serde::de::Error::custom(format!("invalid amount '{s}': {e}"))),
        }
    }
}

// ── Session status ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Created,
    SourceLocking,
    SourceLocked,
    DestinationLocking,
    BothLocked,
    RevealingSecret,
    Completed,
    TimedOut,
    Refunding,
    Refunded,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Terminal states are absorbing; nothing transitions out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Refunded
                | SessionStatus::Failed
                | SessionStatus::Cancelled
        )
    }

    /// The secret may only leave the process at or past `BothLocked`
    /// on the success path.
    pub fn allows_secret_release(&self) -> bool {
        matches!(
            self,
            SessionStatus::BothLocked | SessionStatus::RevealingSecret | SessionStatus::Completed
        )
    }

    /// Rank along the success path, used to reject backwards
    /// transitions. Timeout-path states rank above every non-terminal
    /// success state.
    pub fn rank(&self) -> u8 {
        match self {
            SessionStatus::Created => 0,
            SessionStatus::SourceLocking => 1,
            SessionStatus::SourceLocked => 2,
            SessionStatus::DestinationLocking => 3,
            SessionStatus::BothLocked => 4,
            SessionStatus::RevealingSecret => 5,
            SessionStatus::TimedOut => 6,
            SessionStatus::Refunding => 7,
            SessionStatus::Completed | SessionStatus::Refunded | SessionStatus::Failed
            | SessionStatus::Cancelled => 8,
        }
    }

    /// Coarse progress percentage for clients.
    pub fn progress_pct(&self) -> u8 {
        match self {
            SessionStatus::Created => 0,
            SessionStatus::SourceLocking => 15,
            SessionStatus::SourceLocked => 30,
            SessionStatus::DestinationLocking => 45,
            SessionStatus::BothLocked => 60,
            SessionStatus::RevealingSecret => 75,
            SessionStatus::TimedOut => 60,
            SessionStatus::Refunding => 80,
            SessionStatus::Completed
            | SessionStatus::Refunded
            | SessionStatus::Failed
            | SessionStatus::Cancelled => 100,
        }
    }

    /// Short phase label for `session_update` frames.
    pub fn phase(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::SourceLocking | SessionStatus::SourceLocked => "source_lock",
            SessionStatus::DestinationLocking | SessionStatus::BothLocked => "destination_lock",
            SessionStatus::RevealingSecret => "reveal",
            SessionStatus::Completed => "settled",
            SessionStatus::TimedOut | SessionStatus::Refunding | SessionStatus::Refunded => {
                "refund"
            }
            SessionStatus::Failed | SessionStatus::Cancelled => "aborted",
        }
    }
}

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidLock,
    InvariantViolation,
    UnexpectedCancel,
}

// ── Chain sides and urgency ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainSide {
    Src,
    Dst,
}

impl fmt::Display for ChainSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainSide::Src => write!(f, "src"),
            ChainSide::Dst => write!(f, "dst"),
        }
    }
}

/// Confirmation urgency, shared by quotes and execution requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Fast,
    Normal,
    Slow,
}

impl Default for Urgency {
    fn default() -> Self {
        Urgency::Normal
    }
}

// ── Timelocks ───────────────────────────────────────────────────

/// Absolute deadlines governing both escrows. The ordering
/// `dst_withdrawal < dst_cancellation < src_withdrawal <
/// src_public_withdrawal < src_cancellation` is what makes the swap
/// atomic: the destination leg settles strictly before the source leg
/// can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timelocks {
    pub src_withdrawal: DateTime<Utc>,
    pub src_public_withdrawal: DateTime<Utc>,
    pub src_cancellation: DateTime<Utc>,
    pub dst_withdrawal: DateTime<Utc>,
    pub dst_cancellation: DateTime<Utc>,
}

impl Timelocks {
    /// Default ladder derived from the session window. Observed
    /// on-chain values replace these once the source escrow is seen.
    pub fn derive(created_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        let ttl = (expires_at - created_at).num_seconds().max(1);
        let at = |pct: i64| created_at + Duration::seconds(ttl * pct / 100);
        Timelocks {
            dst_withdrawal: at(10),
            dst_cancellation: at(35),
            src_withdrawal: at(50),
            src_public_withdrawal: at(70),
            src_cancellation: at(90),
        }
    }

    pub fn ordering_holds(&self) -> bool {
        self.dst_withdrawal < self.dst_cancellation
            && self.dst_cancellation < self.src_withdrawal
            && self.src_withdrawal < self.src_public_withdrawal
            && self.src_public_withdrawal < self.src_cancellation
    }

    /// All deadlines must sit inside the session window, with a small
    /// tolerance past expiry for chain clock skew.
    pub fn within_window(&self, created_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> bool {
        let upper = expires_at + Duration::seconds(TIMELOCK_TOLERANCE_SECS);
        [
            self.src_withdrawal,
            self.src_public_withdrawal,
            self.src_cancellation,
            self.dst_withdrawal,
            self.dst_cancellation,
        ]
        .iter()
        .all(|t| *t >= created_at && *t <= upper)
    }
}

/// Clock-skew tolerance applied past `expires_at` when validating
/// observed timelocks.
pub const TIMELOCK_TOLERANCE_SECS: i64 = 300;

// ── Locks and execution steps ───────────────────────────────────

/// An observed on-chain lock (source escrow or destination HTLC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Transaction hash that created the lock.
    pub chain_ref: String,
    /// Escrow address or HTLC id.
    pub contract_ref: String,
    #[serde(with = "amount_str")]
    pub amount: u128,
    /// Deadline after which this lock becomes refundable.
    pub timeout: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
}

/// One observed step of the swap execution. Append-only and exposed
/// verbatim to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: u32,
    pub contract: String,
    pub function: String,
    pub params: serde_json::Value,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ── Session ─────────────────────────────────────────────────────

/// One leg of the swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLeg {
    pub chain_id: String,
    pub token: String,
    #[serde(with = "amount_str")]
    pub amount: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<Lock>,
}

/// The central per-swap record. Mutated exclusively by the session
/// worker that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub hashlock: Hashlock,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub source: ChainLeg,
    pub destination: ChainLeg,
    pub maker: String,
    /// Source-chain principal authorized to retrieve the secret.
    pub taker: String,
    /// Destination-chain receiver, when `taker` is not a
    /// destination-chain address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_address: Option<String>,
    pub slippage_bps: u16,
    pub urgency: Urgency,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub timelocks: Timelocks,
    pub execution_trace: Vec<ExecutionStep>,
}

impl Session {
    /// The single timer each session arms: whichever of session expiry
    /// and source cancellation comes first.
    pub fn timer_deadline(&self) -> DateTime<Utc> {
        self.expires_at.min(self.timelocks.src_cancellation)
    }

    /// Append a trace step, assigning the next sequence id.
    pub fn push_step(
        &mut self,
        contract: &str,
        function: &str,
        params: serde_json::Value,
        status: StepStatus,
        tx_ref: Option<String>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) {
        let id = self.execution_trace.len() as u32 + 1;
        self.execution_trace.push(ExecutionStep {
            id,
            contract: contract.to_string(),
            function: function.to_string(),
            params,
            status,
            tx_ref,
            gas_used: None,
            error,
            timestamp: now,
        });
    }
}

// ── Chain events ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    EscrowCreated,
    Withdrawn,
    Cancelled,
    HtlcCreated,
    HtlcWithdrawn,
    HtlcRefunded,
}

impl EventKind {
    pub fn side(&self) -> ChainSide {
        match self {
            EventKind::EscrowCreated | EventKind::Withdrawn | EventKind::Cancelled => {
                ChainSide::Src
            }
            EventKind::HtlcCreated | EventKind::HtlcWithdrawn | EventKind::HtlcRefunded => {
                ChainSide::Dst
            }
        }
    }
}

/// A decoded, confirmation-gated on-chain event. Decoding happens at
/// the chain-client boundary; everything downstream works with this
/// shape only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub chain: ChainSide,
    pub kind: EventKind,
    pub hashlock: Hashlock,
    pub contract_ref: String,
    pub tx_ref: String,
    pub log_index: u32,
    pub block_number: u64,
    #[serde(with = "amount_opt", default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Revealed preimage, present on withdraw events. Hex without 0x.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Full timelock set, present on source escrow creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timelocks: Option<Timelocks>,
    /// Lock-specific refund deadline, present on lock events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<DateTime<Utc>>,
}

impl ChainEvent {
    /// Dedup identity: one event per (chain, tx, log position).
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.chain, self.tx_ref, self.log_index)
    }
}

// ── Tests ───────────────────────────────────────────────────────
