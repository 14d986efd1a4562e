//! Session manager — one serialized worker per session.
//!
//! All session mutation flows through the owning worker's inbox:
//! correlated chain events, timer expirations, and API commands. The
//! transition rules themselves ([`apply_event`], [`apply_timeout`])
//! are synchronous functions over the session record, which keeps the
//! state machine testable without any runtime plumbing.

use crate::bus::{BusEvent, EventBus, UpdateData};
use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::persist::StateDir;
use crate::secret::{hashlock_of, SecretManager};
use crate::store::SessionStore;
use crate::types::{
    amount_str, ChainEvent, ChainLeg, ChainSide, EventKind, FailureReason, Lock, Session,
    SessionStatus, StepStatus, Urgency,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Inbox depth per session worker.
const WORKER_QUEUE: usize = 64;

/// Cadence of the active-session snapshot ticker.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);

/// Cadence of the terminal-session retention sweeper.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
pub struct SessionRequest {
    pub source_chain: String,
    pub destination_chain: String,
    pub source_token: String,
    pub destination_token: String,
    #[serde(with = "amount_str")]
    pub source_amount: u128,
    #[serde(with = "amount_str")]
    pub destination_amount: u128,
    pub maker: String,
    /// Source-chain principal authorized to retrieve the secret.
    pub taker: String,
    pub slippage_tolerance_bps: u16,
    #[serde(default)]
    pub destination_address: Option<String>,
    #[serde(default)]
    pub expires_in_seconds: Option<u64>,
    #[serde(default)]
    pub urgency: Urgency,
}

pub enum SessionCommand {
    Chain(ChainEvent),
    Execute {
        confirmation_level: Urgency,
        reply: oneshot::Sender<Result<()>>,
    },
    CheckTimeout {
        reply: oneshot::Sender<Result<SessionStatus>>,
    },
    SecretReleased {
        principal: String,
    },
}

pub struct SessionManager {
    store: Arc<SessionStore>,
    secrets: Arc<SecretManager>,
    bus: Arc<EventBus>,
    state: StateDir,
    config: Arc<Config>,
    workers: Mutex<HashMap<String, mpsc::Sender<SessionCommand>>>,
    shutdown: watch::Receiver<bool>,
}

impl SessionManager {
    pub fn new(
        store: Arc<SessionStore>,
        secrets: Arc<SecretManager>,
        bus: Arc<EventBus>,
        state: StateDir,
        config: Arc<Config>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            secrets,
            bus,
            state,
            config,
            workers: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    // ── Session creation ─────────────────────────────────────────

    pub fn create_session(self: &Arc<Self>, req: SessionRequest) -> Result<Session> {
        validate_request(&req)?;
        let now = Utc::now();
        let ttl = self.config.effective_ttl(req.expires_in_seconds);
        let expires_at = now + ChronoDuration::seconds(ttl as i64);

        let session_id = format!("sess-{}", Uuid::new_v4());
        let hashlock = self.secrets.mint(&session_id, now)?;

        let session = Session {
            session_id: session_id.clone(),
            hashlock,
            status: SessionStatus::Created,
            failure_reason: None,
            source: ChainLeg {
                chain_id: req.source_chain,
                token: req.source_token,
                amount: req.source_amount,
                lock: None,
            },
            destination: ChainLeg {
                chain_id: req.destination_chain,
                token: req.destination_token,
                amount: req.destination_amount,
                lock: None,
            },
            maker: req.maker,
            taker: req.taker,
            destination_address: req.destination_address,
            slippage_bps: req.slippage_tolerance_bps,
            urgency: req.urgency,
            created_at: now,
            updated_at: now,
            expires_at,
            timelocks: crate::types::Timelocks::derive(now, expires_at),
            execution_trace: vec![],
        };

        if let Err(e) = self.store.insert(session.clone()) {
            self.secrets.wipe(&session_id);
            return Err(e);
        }
        if let Err(e) = self.state.save_session(&session) {
            warn!(session_id = %session_id, error = %e, "initial snapshot failed");
        }
        self.spawn_worker(session_id.clone());
        self.emit_update(&session, None);
        info!(
            session_id = %session_id,
            hashlock = %session.hashlock,
            expires_at = %expires_at,
            "session created"
        );
        Ok(session)
    }

    /// Re-adopt a session loaded from disk after restart: index it and
    /// re-arm its worker. The caller reconciles terminal snapshots
    /// separately.
    pub fn adopt(self: &Arc<Self>, session: Session) -> Result<()> {
        let session_id = session.session_id.clone();
        self.store.insert(session)?;
        self.spawn_worker(session_id);
        Ok(())
    }

    /// Load snapshots and re-arm every non-terminal session. Returns
    /// how many sessions came back to life.
    pub fn reconcile_from_disk(self: &Arc<Self>) -> Result<usize> {
        let mut adopted = 0;
        for session in self.state.load_sessions()? {
            if session.status.is_terminal() {
                continue;
            }
            let id = session.session_id.clone();
            match self.adopt(session) {
                Ok(()) => adopted += 1,
                Err(e) => warn!(session_id = %id, error = %e, "could not re-adopt session"),
            }
        }
        info!(adopted, "sessions reconciled from disk");
        Ok(adopted)
    }

    // ── Command surface used by the API layer ────────────────────

    pub async fn deliver(&self, session_id: &str, cmd: SessionCommand) -> Result<()> {
        let sender = self
            .workers
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("session {session_id}")))?;
        sender.send(cmd).await.map_err(|_| {
            OrchestratorError::StateConflict(format!("session {session_id} worker is gone"))
        })
    }

    pub async fn execute(&self, session_id: &str, confirmation_level: Urgency) -> Result<()> {
        let session = self
            .store
            .get(session_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("session {session_id}")))?;
        if session.status.is_terminal() {
            return Err(terminal_conflict(&session));
        }
        let (reply, rx) = oneshot::channel();
        self.deliver(
            session_id,
            SessionCommand::Execute {
                confirmation_level,
                reply,
            },
        )
        .await?;
        rx.await
            .map_err(|_| OrchestratorError::Internal("session worker stopped".into()))?
    }

    pub async fn check_timeout(&self, session_id: &str) -> Result<SessionStatus> {
        let session = self
            .store
            .get(session_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("session {session_id}")))?;
        if session.status.is_terminal() {
            return Ok(session.status);
        }
        let (reply, rx) = oneshot::channel();
        self.deliver(session_id, SessionCommand::CheckTimeout { reply })
            .await?;
        rx.await
            .map_err(|_| OrchestratorError::Internal("session worker stopped".into()))?
    }

    pub async fn notify_secret_released(&self, session_id: &str, principal: &str) {
        let _ = self
            .deliver(
                session_id,
                SessionCommand::SecretReleased {
                    principal: principal.to_string(),
                },
            )
            .await;
    }

    // ── Worker plumbing ──────────────────────────────────────────

    fn spawn_worker(self: &Arc<Self>, session_id: String) {
        let (tx, mut rx) = mpsc::channel(WORKER_QUEUE);
        self.workers.lock().unwrap().insert(session_id.clone(), tx);
        let mgr = self.clone();
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let Some(session) = mgr.store.get(&session_id) else {
                    break;
                };
                if session.status.is_terminal() {
                    break;
                }

                // Once on the refund path the only remaining input is
                // the on-chain refund event, so idle between events.
                let sleep_for = if matches!(
                    session.status,
                    SessionStatus::TimedOut | SessionStatus::Refunding
                ) {
                    Duration::from_secs(3600)
                } else {
                    (session.timer_deadline() - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                };

                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(cmd) => mgr.handle_command(&session_id, cmd),
                        None => break,
                    },
                    _ = tokio::time::sleep(sleep_for) => {
                        mgr.run_timeout_check(&session_id);
                    }
                    _ = shutdown.changed() => break,
                }
            }
            mgr.workers.lock().unwrap().remove(&session_id);
            debug!(session_id = %session_id, "session worker stopped");
        });
    }

    fn handle_command(&self, session_id: &str, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Chain(event) => self.run_chain_event(session_id, &event),
            SessionCommand::Execute {
                confirmation_level,
                reply,
            } => {
                let _ = reply.send(self.run_execute(session_id, confirmation_level));
            }
            SessionCommand::CheckTimeout { reply } => {
                self.run_timeout_check(session_id);
                let result = self
                    .store
                    .get(session_id)
                    .map(|s| s.status)
                    .ok_or_else(|| OrchestratorError::NotFound(format!("session {session_id}")));
                let _ = reply.send(result);
            }
            SessionCommand::SecretReleased { principal } => {
                self.run_secret_released(session_id, &principal)
            }
        }
    }

    fn run_chain_event(&self, session_id: &str, event: &ChainEvent) {
        let Some(mut session) = self.store.get(session_id) else {
            return;
        };
        let steps_before = session.execution_trace.len();
        let entered = apply_event(&mut session, event, Utc::now());
        self.commit(session, steps_before, &entered, Some(event));
    }

    fn run_timeout_check(&self, session_id: &str) {
        let Some(mut session) = self.store.get(session_id) else {
            return;
        };
        let steps_before = session.execution_trace.len();
        let entered = apply_timeout(&mut session, Utc::now());
        self.commit(session, steps_before, &entered, None);
    }

    fn run_execute(&self, session_id: &str, confirmation_level: Urgency) -> Result<()> {
        let Some(mut session) = self.store.get(session_id) else {
            return Err(OrchestratorError::NotFound(format!("session {session_id}")));
        };
        if session.status.is_terminal() {
            return Err(terminal_conflict(&session));
        }
        let steps_before = session.execution_trace.len();
        session.push_step(
            "limit-order-protocol",
            "fillOrder",
            json!({ "confirmation_level": confirmation_level }),
            StepStatus::Pending,
            None,
            None,
            Utc::now(),
        );
        session.updated_at = Utc::now();
        self.commit(session, steps_before, &[], None);
        Ok(())
    }

    fn run_secret_released(&self, session_id: &str, principal: &str) {
        let Some(mut session) = self.store.get(session_id) else {
            return;
        };
        if session.status != SessionStatus::BothLocked {
            return;
        }
        let steps_before = session.execution_trace.len();
        session.status = SessionStatus::RevealingSecret;
        session.updated_at = Utc::now();
        session.push_step(
            "orchestrator",
            "release_secret",
            json!({ "principal": principal }),
            StepStatus::Completed,
            None,
            None,
            Utc::now(),
        );
        self.commit(session, steps_before, &[SessionStatus::RevealingSecret], None);
    }

    /// Write the mutated session back, emit step and update frames in
    /// order, and persist terminal snapshots immediately.
    fn commit(
        &self,
        session: Session,
        steps_before: usize,
        entered: &[SessionStatus],
        event: Option<&ChainEvent>,
    ) {
        let session_id = session.session_id.clone();
        if self
            .store
            .update(&session_id, |s| *s = session.clone())
            .is_err()
        {
            return;
        }

        for step in &session.execution_trace[steps_before..] {
            self.bus.publish(BusEvent::ExecutionStep {
                session_id: session_id.clone(),
                step: step.clone(),
            });
        }
        for status in entered {
            self.emit_status(&session, *status, event);
        }

        if session.status.is_terminal() {
            if let Err(e) = self.state.save_session(&session) {
                warn!(session_id = %session_id, error = %e, "terminal snapshot failed");
            }
            if session.status == SessionStatus::Completed {
                info!(session_id = %session_id, "swap completed");
            }
        }
    }

    fn emit_update(&self, session: &Session, event: Option<&ChainEvent>) {
        self.emit_status(session, session.status, event);
    }

    fn emit_status(&self, session: &Session, status: SessionStatus, event: Option<&ChainEvent>) {
        self.bus.publish(BusEvent::SessionUpdate {
            session_id: session.session_id.clone(),
            status,
            data: UpdateData {
                progress: status.progress_pct(),
                phase: status.phase().to_string(),
                tx_ref: event.map(|e| e.tx_ref.clone()),
                contract_ref: event.map(|e| e.contract_ref.clone()),
            },
        });
    }

    // ── Background tasks ─────────────────────────────────────────

    /// Route correlated events from the monitor into session inboxes.
    pub fn spawn_router(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<(String, ChainEvent)>,
    ) -> JoinHandle<()> {
        let mgr = self.clone();
        tokio::spawn(async move {
            while let Some((session_id, event)) = rx.recv().await {
                if let Err(e) = mgr.deliver(&session_id, SessionCommand::Chain(event)).await {
                    debug!(session_id = %session_id, error = %e, "event for inactive session");
                }
            }
        })
    }

    /// Snapshot active sessions every few seconds so a crash loses at
    /// most one tick of progress.
    pub fn spawn_snapshot_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let mgr = self.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                for session in mgr.store.list_active() {
                    if let Err(e) = mgr.state.save_session(&session) {
                        warn!(session_id = %session.session_id, error = %e, "snapshot failed");
                    }
                }
            }
        })
    }

    /// Drop terminal sessions (and wipe their secrets) once the
    /// retention window has passed.
    pub fn spawn_retention_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let mgr = self.clone();
        let mut shutdown = self.shutdown.clone();
        let retention = ChronoDuration::seconds(mgr.config.session_retention_seconds as i64);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                let now = Utc::now();
                for session in mgr.store.list() {
                    if session.status.is_terminal() && now - session.updated_at > retention {
                        info!(session_id = %session.session_id, "retiring terminal session");
                        mgr.secrets.wipe(&session.session_id);
                        mgr.store.remove(&session.session_id);
                    }
                }
                // Backstop: no secret outlives the longest possible
                // session plus its retention window.
                let backstop = ChronoDuration::seconds(
                    (crate::config::MAX_SESSION_TTL_SECS
                        + mgr.config.session_retention_seconds) as i64,
                );
                mgr.secrets.purge_older_than(backstop, now);
            }
        })
    }

    /// Live session workers; used by shutdown to wait for quiescence.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Flush every session snapshot; called once on shutdown.
    pub fn persist_all(&self) {
        for session in self.store.list() {
            if let Err(e) = self.state.save_session(&session) {
                warn!(session_id = %session.session_id, error = %e, "shutdown snapshot failed");
            }
        }
    }
}

fn terminal_conflict(session: &Session) -> OrchestratorError {
    match session.failure_reason {
        Some(FailureReason::InvariantViolation) | Some(FailureReason::InvalidLock) => {
            OrchestratorError::InvariantViolation(format!(
                "session {} failed validation",
                session.session_id
            ))
        }
        _ => OrchestratorError::StateConflict(format!(
            "session {} is {:?}",
            session.session_id, session.status
        )),
    }
}

fn validate_request(req: &SessionRequest) -> Result<()> {
    if req.source_amount == 0 || req.destination_amount == 0 {
        return Err(OrchestratorError::InvalidInput(
            "amounts must be positive".into(),
        ));
    }
    if req.slippage_tolerance_bps >= 10_000 {
        return Err(OrchestratorError::InvalidInput(
            "slippage_tolerance_bps must be below 10000".into(),
        ));
    }
    if req.maker.trim().is_empty() {
        return Err(OrchestratorError::InvalidInput("maker is required".into()));
    }
    if !is_evm_address(&req.taker) {
        // Legacy request shapes put a destination-chain account in
        // `taker`; those must use `destination_address` instead.
        return Err(OrchestratorError::InvalidInput(
            "taker must be a source-chain (0x…) address; use destination_address for the \
             destination receiver"
                .into(),
        ));
    }
    if req.destination_address.as_deref().map_or(true, str::is_empty) {
        return Err(OrchestratorError::InvalidInput(
            "destination_address is required".into(),
        ));
    }
    if req.source_chain == req.destination_chain {
        return Err(OrchestratorError::InvalidInput(
            "source and destination chains must differ".into(),
        ));
    }
    Ok(())
}

fn is_evm_address(s: &str) -> bool {
    s.len() == 42
        && s.starts_with("0x")
        && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

// ── Transition rules ────────────────────────────────────────────

/// Apply one chain event to a session. Returns the statuses entered,
/// in order, so the caller can emit `session_update` frames that
/// mirror the transition sequence. Terminal sessions ignore
/// everything (replay idempotence).
pub fn apply_event(
    session: &mut Session,
    event: &ChainEvent,
    now: DateTime<Utc>,
) -> Vec<SessionStatus> {
    if session.status.is_terminal() {
        return vec![];
    }
    match event.kind {
        EventKind::EscrowCreated => apply_source_lock(session, event, now),
        EventKind::HtlcCreated => apply_destination_lock(session, event, now),
        EventKind::Withdrawn | EventKind::HtlcWithdrawn => apply_withdraw(session, event, now),
        EventKind::Cancelled | EventKind::HtlcRefunded => apply_cancel(session, event, now),
    }
}

fn apply_source_lock(
    session: &mut Session,
    event: &ChainEvent,
    now: DateTime<Utc>,
) -> Vec<SessionStatus> {
    if session.source.lock.is_some() {
        // Double-locking with the same hashlock: the first valid lock
        // wins, later ones are recorded as conflicts.
        warn!(
            session_id = %session.session_id,
            tx_ref = %event.tx_ref,
            "conflicting source escrow ignored"
        );
        session.push_step(
            "escrow-factory",
            "createSrcEscrow",
            json!({ "conflict": true }),
            StepStatus::Failed,
            Some(event.tx_ref.clone()),
            Some("conflicting source escrow for this hashlock".into()),
            now,
        );
        session.updated_at = now;
        return vec![];
    }

    if !amount_covers(event.amount, session.source.amount) {
        return fail(
            session,
            FailureReason::InvalidLock,
            event,
            "source escrow underfunded",
            now,
        );
    }
    if !token_matches(event.token.as_deref(), &session.source.token) {
        return fail(
            session,
            FailureReason::InvalidLock,
            event,
            "source escrow locks the wrong token",
            now,
        );
    }
    let Some(timelocks) = event.timelocks else {
        return fail(
            session,
            FailureReason::InvariantViolation,
            event,
            "source escrow carries no timelocks",
            now,
        );
    };
    if !timelocks.ordering_holds()
        || !timelocks.within_window(session.created_at, session.expires_at)
    {
        return fail(
            session,
            FailureReason::InvariantViolation,
            event,
            "source escrow timelocks violate ordering",
            now,
        );
    }

    session.timelocks = timelocks;
    session.source.lock = Some(Lock {
        chain_ref: event.tx_ref.clone(),
        contract_ref: event.contract_ref.clone(),
        amount: event.amount.unwrap_or_default(),
        timeout: timelocks.src_cancellation,
        observed_at: now,
    });
    session.push_step(
        "escrow-factory",
        "createSrcEscrow",
        json!({ "amount": event.amount.unwrap_or_default().to_string() }),
        StepStatus::Completed,
        Some(event.tx_ref.clone()),
        None,
        now,
    );
    session.updated_at = now;

    let mut entered = vec![SessionStatus::SourceLocking, SessionStatus::SourceLocked];
    session.status = SessionStatus::SourceLocked;

    // The destination side may have been observed first; catch up now.
    if session.destination.lock.is_some() {
        entered.push(SessionStatus::DestinationLocking);
        entered.push(SessionStatus::BothLocked);
        session.status = SessionStatus::BothLocked;
    }
    entered
}

fn apply_destination_lock(
    session: &mut Session,
    event: &ChainEvent,
    now: DateTime<Utc>,
) -> Vec<SessionStatus> {
    if session.destination.lock.is_some() {
        warn!(
            session_id = %session.session_id,
            tx_ref = %event.tx_ref,
            "conflicting destination lock ignored"
        );
        session.push_step(
            "htlc",
            "create",
            json!({ "conflict": true }),
            StepStatus::Failed,
            Some(event.tx_ref.clone()),
            Some("conflicting destination lock for this hashlock".into()),
            now,
        );
        session.updated_at = now;
        return vec![];
    }

    if !amount_covers(event.amount, session.destination.amount) {
        return fail(
            session,
            FailureReason::InvalidLock,
            event,
            "destination lock underfunded",
            now,
        );
    }
    if !token_matches(event.token.as_deref(), &session.destination.token) {
        return fail(
            session,
            FailureReason::InvalidLock,
            event,
            "destination lock holds the wrong token",
            now,
        );
    }

    session.destination.lock = Some(Lock {
        chain_ref: event.tx_ref.clone(),
        contract_ref: event.contract_ref.clone(),
        amount: event.amount.unwrap_or_default(),
        timeout: event.timeout.unwrap_or(session.timelocks.dst_cancellation),
        observed_at: now,
    });
    session.push_step(
        "htlc",
        "create",
        json!({ "amount": event.amount.unwrap_or_default().to_string() }),
        StepStatus::Completed,
        Some(event.tx_ref.clone()),
        None,
        now,
    );
    session.updated_at = now;

    if session.status == SessionStatus::SourceLocked {
        session.status = SessionStatus::BothLocked;
        vec![SessionStatus::DestinationLocking, SessionStatus::BothLocked]
    } else {
        // Destination observed before the source escrow: hold in the
        // current state until the source side catches up.
        warn!(
            session_id = %session.session_id,
            status = ?session.status,
            "destination locked before source; waiting for source escrow"
        );
        vec![]
    }
}

fn apply_withdraw(
    session: &mut Session,
    event: &ChainEvent,
    now: DateTime<Utc>,
) -> Vec<SessionStatus> {
    let Some(secret_hex) = event.secret.as_deref() else {
        return vec![];
    };
    let Ok(secret) = hex::decode(secret_hex.trim_start_matches("0x")) else {
        return vec![];
    };
    if hashlock_of(&secret) != session.hashlock {
        // Attacker noise: a withdraw claim whose preimage does not
        // hash to our lock.
        warn!(
            session_id = %session.session_id,
            tx_ref = %event.tx_ref,
            "withdraw event with mismatched preimage ignored"
        );
        return vec![];
    }
    if matches!(
        session.status,
        SessionStatus::TimedOut | SessionStatus::Refunding
    ) {
        // Timed-out sessions never revive into success.
        warn!(
            session_id = %session.session_id,
            "valid preimage observed after timeout; session stays on the refund path"
        );
        return vec![];
    }

    let (contract, function) = match event.kind {
        EventKind::HtlcWithdrawn => ("htlc", "withdraw"),
        _ => ("escrow", "withdraw"),
    };
    session.push_step(
        contract,
        function,
        json!({ "secret_revealed": true }),
        StepStatus::Completed,
        Some(event.tx_ref.clone()),
        None,
        now,
    );
    session.status = SessionStatus::Completed;
    session.updated_at = now;
    vec![SessionStatus::Completed]
}

fn apply_cancel(
    session: &mut Session,
    event: &ChainEvent,
    now: DateTime<Utc>,
) -> Vec<SessionStatus> {
    let deadline = match event.chain {
        ChainSide::Src => session.timelocks.src_cancellation,
        ChainSide::Dst => session.timelocks.dst_cancellation,
    };
    if now >= deadline {
        session.push_step(
            if event.chain == ChainSide::Src { "escrow" } else { "htlc" },
            "refund",
            json!({}),
            StepStatus::Completed,
            Some(event.tx_ref.clone()),
            None,
            now,
        );
        session.status = SessionStatus::Refunded;
        session.updated_at = now;
        vec![SessionStatus::Refunded]
    } else {
        fail(
            session,
            FailureReason::UnexpectedCancel,
            event,
            "lock cancelled before its cancellation timelock",
            now,
        )
    }
}

/// Evaluate the session timer. Expiry without completion moves the
/// session onto the refund path.
pub fn apply_timeout(session: &mut Session, now: DateTime<Utc>) -> Vec<SessionStatus> {
    if session.status.is_terminal()
        || matches!(
            session.status,
            SessionStatus::TimedOut | SessionStatus::Refunding
        )
    {
        return vec![];
    }
    if now < session.timer_deadline() {
        return vec![];
    }
    session.push_step(
        "orchestrator",
        "timeout",
        json!({ "deadline": session.timer_deadline() }),
        StepStatus::Completed,
        None,
        None,
        now,
    );
    session.status = SessionStatus::Refunding;
    session.updated_at = now;
    vec![SessionStatus::TimedOut, SessionStatus::Refunding]
}

fn amount_covers(observed: Option<u128>, expected: u128) -> bool {
    observed.map_or(false, |a| a >= expected)
}

/// Token identity check. Requests may carry a symbol while events
/// carry an on-chain address; comparison only binds when both sides
/// speak the same kind of identifier.
fn token_matches(observed: Option<&str>, expected: &str) -> bool {
    match observed {
        None => true,
        Some(t) => {
            if t.starts_with("0x") != expected.starts_with("0x") {
                true
            } else {
                t.eq_ignore_ascii_case(expected)
            }
        }
    }
}

fn fail(
    session: &mut Session,
    reason: FailureReason,
    event: &ChainEvent,
    message: &str,
    now: DateTime<Utc>,
) -> Vec<SessionStatus> {
    warn!(
        session_id = %session.session_id,
        tx_ref = %event.tx_ref,
        reason = ?reason,
        message,
        "session failed"
    );
    session.push_step(
        "orchestrator",
        "validate_lock",
        json!({ "kind": format!("{:?}", event.kind) }),
        StepStatus::Failed,
        Some(event.tx_ref.clone()),
        Some(message.to_string()),
        now,
    );
    session.status = SessionStatus::Failed;
    session.failure_reason = Some(reason);
    session.updated_at = now;
    vec![SessionStatus::Failed]
}

// ── Tests ───────────────────────────────────────────────────────
