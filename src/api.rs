//! REST surface for the orchestrator.
//!
//! Everything under `/api/v1` except `/health` requires the
//! `X-API-Key` header. Errors leave through the taxonomy in
//! `error.rs`, serialized as `{"error":{"code","message"}}`.

use crate::bus::{BusEvent, EventBus};
use crate::chain::ChainClient;
use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::manager::{SessionManager, SessionRequest};
use crate::quote::{compute_quote, FeeParams, PriceSnapshot, QuoteRequest, QuoteResponse};
use crate::secret::SecretManager;
use crate::store::SessionStore;
use crate::types::{
    ExecutionStep, FailureReason, Hashlock, Lock, Session, SessionStatus, Timelocks, Urgency,
};

use axum::extract::{Path, Query, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Budget for the `/health` chain probes.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<SessionStore>,
    pub secrets: Arc<SecretManager>,
    pub manager: Arc<SessionManager>,
    pub bus: Arc<EventBus>,
    pub src_client: Arc<dyn ChainClient>,
    pub dst_client: Arc<dyn ChainClient>,
    /// Latest oracle snapshot, shared with the price refresh task.
    pub prices: Arc<RwLock<PriceSnapshot>>,
}

impl AppState {
    pub fn fee_params(&self) -> FeeParams {
        FeeParams {
            protocol_bps: self.config.protocol_fee_bps,
            premium_bps: self.config.quote_premium_bps,
            network_fee: 1_000,
        }
    }
}

// ── Response types ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub connections: Connections,
    pub active_sessions: usize,
}

#[derive(Serialize)]
pub struct Connections {
    pub src: bool,
    pub dst: bool,
}

#[derive(Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub hashlock: Hashlock,
    pub status: SessionStatus,
    pub expires_at: DateTime<Utc>,
}

/// Full projection served by `GET /sessions/{id}`.
#[derive(Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub hashlock: Hashlock,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub progress: u8,
    pub phase: String,
    pub source: LegView,
    pub destination: LegView,
    pub maker: String,
    pub taker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_address: Option<String>,
    pub locks: LocksView,
    pub steps: Vec<ExecutionStep>,
    pub timelocks: Timelocks,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct LegView {
    pub chain_id: String,
    pub token: String,
    pub amount: String,
}

#[derive(Serialize)]
pub struct LocksView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<Lock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst: Option<Lock>,
}

#[derive(Serialize)]
pub struct ExecuteResponse {
    pub accepted: bool,
    /// Rough wall-clock estimate until both legs confirm at the
    /// requested level.
    pub estimated_confirmation_seconds: u64,
}

#[derive(Serialize)]
pub struct SecretResponse {
    pub secret: String,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: SessionStatus,
}

#[derive(Serialize)]
pub struct StepsResponse {
    pub steps: Vec<ExecutionStep>,
}

#[derive(Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    #[allow(dead_code)]
    pub limit_order: Option<serde_json::Value>,
    #[serde(default)]
    pub confirmation_level: Option<Urgency>,
}

#[derive(Deserialize)]
pub struct SecretQuery {
    pub principal: String,
}

fn project(session: Session) -> SessionView {
    SessionView {
        progress: session.status.progress_pct(),
        phase: session.status.phase().to_string(),
        locks: LocksView {
            src: session.source.lock.clone(),
            dst: session.destination.lock.clone(),
        },
        source: LegView {
            chain_id: session.source.chain_id,
            token: session.source.token,
            amount: session.source.amount.to_string(),
        },
        destination: LegView {
            chain_id: session.destination.chain_id,
            token: session.destination.token,
            amount: session.destination.amount.to_string(),
        },
        session_id: session.session_id,
        hashlock: session.hashlock,
        status: session.status,
        failure_reason: session.failure_reason,
        maker: session.maker,
        taker: session.taker,
        destination_address: session.destination_address,
        steps: session.execution_trace,
        timelocks: session.timelocks,
        created_at: session.created_at,
        expires_at: session.expires_at,
    }
}

// ── Handlers ────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let probe = |client: Arc<dyn ChainClient>| async move {
        tokio::time::timeout(HEALTH_PROBE_TIMEOUT, client.head_block())
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    };
    let (src, dst) = tokio::join!(
        probe(state.src_client.clone()),
        probe(state.dst_client.clone())
    );
    Json(HealthResponse {
        status: if src && dst { "healthy" } else { "degraded" }.into(),
        connections: Connections { src, dst },
        active_sessions: state.store.active_count(),
    })
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SessionRequest>,
) -> Result<(StatusCode, Json<SessionSummary>)> {
    let session = state.manager.create_session(req)?;
    Ok((
        StatusCode::CREATED,
        Json(SessionSummary {
            session_id: session.session_id,
            hashlock: session.hashlock,
            status: session.status,
            expires_at: session.expires_at,
        }),
    ))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>> {
    let session = state
        .store
        .get(&id)
        .ok_or_else(|| OrchestratorError::NotFound(format!("session {id}")))?;
    Ok(Json(project(session)))
}

async fn execute_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>> {
    let level = req.confirmation_level.unwrap_or_default();
    state.manager.execute(&id, level).await?;
    let eta = state.src_client.estimate_confirmation_time(level)
        + state.dst_client.estimate_confirmation_time(level);
    info!(session_id = %id, eta_secs = eta.as_secs(), "execution signalled");
    Ok(Json(ExecuteResponse {
        accepted: true,
        estimated_confirmation_seconds: eta.as_secs(),
    }))
}

async fn get_secret(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<SecretQuery>,
) -> Result<Json<SecretResponse>> {
    let session = state
        .store
        .get(&id)
        .ok_or_else(|| OrchestratorError::NotFound(format!("session {id}")))?;

    match state.secrets.release(&session, &q.principal, Utc::now()) {
        Ok(secret) => {
            state.bus.publish(BusEvent::Audit {
                code: "secret_released".into(),
                message: format!("released to {}", q.principal),
                session_id: Some(id.clone()),
            });
            state.manager.notify_secret_released(&id, &q.principal).await;
            Ok(Json(SecretResponse {
                secret: format!("0x{}", hex::encode(secret)),
            }))
        }
        Err(e) => {
            // Denials are part of the audit trail; the secret itself
            // never appears in any of this.
            warn!(session_id = %id, principal = %q.principal, "secret release denied");
            state.bus.publish(BusEvent::Audit {
                code: "secret_denied".into(),
                message: format!("principal {}", q.principal),
                session_id: Some(id),
            });
            Err(e)
        }
    }
}

async fn check_timeout(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>> {
    let status = state.manager.check_timeout(&id).await?;
    Ok(Json(StatusResponse { status }))
}

async fn execution_steps(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StepsResponse>> {
    let session = state
        .store
        .get(&id)
        .ok_or_else(|| OrchestratorError::NotFound(format!("session {id}")))?;
    Ok(Json(StepsResponse {
        steps: session.execution_trace,
    }))
}

async fn quote(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QuoteRequest>,
) -> Result<Json<QuoteResponse>> {
    let snapshot = state.prices.read().unwrap().clone();
    let response = compute_quote(&req, &snapshot, &state.fee_params(), Utc::now())?;
    Ok(Json(response))
}

// ── Auth middleware ─────────────────────────────────────────────

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response> {
    if state.config.api_keys.is_empty() {
        // No keys configured: open mode, for local development only.
        return Ok(next.run(req).await);
    }
    let presented = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());
    match presented {
        Some(key) if state.config.api_keys.iter().any(|k| k == key) => Ok(next.run(req).await),
        Some(_) => Err(OrchestratorError::Unauthenticated("unknown API key".into())),
        None => Err(OrchestratorError::Unauthenticated(
            "missing X-API-Key header".into(),
        )),
    }
}

// ── Router ──────────────────────────────────────────────────────

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let protected = Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/execute", post(execute_session))
        .route("/sessions/:id/secret", get(get_secret))
        .route("/sessions/:id/check-timeout", post(check_timeout))
        .route("/sessions/:id/execution-steps", get(execution_steps))
        .route("/quote", post(quote))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let api = Router::new()
        .route("/health", get(health))
        .merge(protected);

    Router::new()
        .nest("/api/v1", api)
        .route("/ws", get(crate::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// ── Tests ───────────────────────────────────────────────────────
