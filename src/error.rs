//! Error taxonomy shared by every component, plus the HTTP mapping.
//!
//! API handlers never swallow errors — they return this type and the
//! `IntoResponse` impl translates it into the JSON error envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed request.
    #[error("{0}")]
    InvalidInput(String),

    /// Missing or unknown API key.
    #[error("{0}")]
    Unauthenticated(String),

    /// Authenticated but not allowed — release policy, wrong principal.
    #[error("{0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Timelock ordering, hashlock mismatch, window violations.
    #[error("{0}")]
    InvariantViolation(String),

    /// Transient chain-side failure that outlived its retry budget.
    #[error("chain unavailable: {0}")]
    ChainUnavailable(String),

    /// Operation conflicts with the session's current state.
    #[error("{0}")]
    StateConflict(String),

    /// Unexpected bug; full detail is logged, the message returned to
    /// callers is sanitized.
    #[error("internal error")]
    Internal(String),
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidInput(_) => "invalid_input",
            OrchestratorError::Unauthenticated(_) => "unauthenticated",
            OrchestratorError::Unauthorized(_) => "unauthorized",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::InvariantViolation(_) => "invariant_violation",
            OrchestratorError::ChainUnavailable(_) => "chain_unavailable",
            OrchestratorError::StateConflict(_) => "state_conflict",
            OrchestratorError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            OrchestratorError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            OrchestratorError::Unauthorized(_) => StatusCode::FORBIDDEN,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::InvariantViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            OrchestratorError::ChainUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::StateConflict(_) => StatusCode::CONFLICT,
            OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        if let OrchestratorError::Internal(detail) = &self {
            tracing::error!(detail = %detail, "internal error");
        }
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(e: reqwest::Error) -> Self {
        OrchestratorError::ChainUnavailable(e.to_string())
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(e: std::io::Error) -> Self {
        OrchestratorError::Internal(format!("io: {e}"))
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Internal(format!("serialization: {e}"))
    }
}

// ── Tests ───────────────────────────────────────────────────────
