use super::state::AppState;
use crate::error::SessionError;
use crate::session::{SessionSnapshot, SessionStatus};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: Option<String>,
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match &self {
            SessionError::AlreadyActive | SessionError::InvalidState { .. } => StatusCode::CONFLICT,
            SessionError::PermissionDenied { .. } | SessionError::Unauthorized(_) => {
                StatusCode::FORBIDDEN
            }
            SessionError::Transport(_) | SessionError::TransportClosedUnexpectedly(_) => {
                StatusCode::BAD_GATEWAY
            }
            SessionError::ControllerGone => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::DecodePlayback(_)
            | SessionError::Persistence(_)
            | SessionError::TranscriptTimeout => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let kind = serde_json::to_value(&self)
            .ok()
            .and_then(|v| v.get("kind").and_then(|k| k.as_str()).map(str::to_string));

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                kind,
            }),
        )
            .into_response()
    }
}

fn session_response(snapshot: SessionSnapshot, message: &str) -> Response {
    (
        StatusCode::OK,
        Json(SessionResponse {
            session_id: snapshot.session_id,
            status: snapshot.status,
            message: message.to_string(),
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /session/start
/// Start the live session
pub async fn start_session(State(state): State<AppState>) -> Response {
    info!("Start requested over HTTP");

    match state.controller.start().await {
        Ok(()) => session_response(state.controller.snapshot(), "Session starting"),
        Err(e) => {
            warn!("Failed to start session: {}", e);
            e.into_response()
        }
    }
}

/// POST /session/stop
/// Stop the live session
pub async fn stop_session(State(state): State<AppState>) -> Response {
    info!("Stop requested over HTTP");

    match state.controller.stop().await {
        Ok(()) => session_response(state.controller.snapshot(), "Session stopped"),
        Err(e) => {
            error!("Failed to stop session: {}", e);
            e.into_response()
        }
    }
}

/// POST /session/retry
/// Recover from the error state
pub async fn retry_session(State(state): State<AppState>) -> Response {
    info!("Retry requested over HTTP");

    match state.controller.retry().await {
        Ok(()) => session_response(state.controller.snapshot(), "Session retrying"),
        Err(e) => {
            warn!("Failed to retry session: {}", e);
            e.into_response()
        }
    }
}

/// GET /session/status
/// Current session snapshot
pub async fn get_session_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.controller.snapshot()))
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
