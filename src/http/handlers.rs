use super::state::AppState;
use crate::error::SessionError;
use crate::session::{SessionState, SessionStats, TranscriptEntry};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;
use tracing::{error, info};

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub state: SessionState,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct StopSessionResponse {
    pub state: SessionState,
    pub message: String,
    pub stats: SessionStats,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: SessionState,
    /// Human-readable status line
    pub status: String,
    pub stats: SessionStats,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: String) -> axum::response::Response {
    (status, Json(ErrorResponse { error })).into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /session/start
/// Start a call with the agent
pub async fn start_session(State(state): State<AppState>) -> impl IntoResponse {
    info!("Start requested over HTTP");

    match state.session.start().await {
        Ok(()) => {
            let stats = state.session.stats().await;
            (
                StatusCode::OK,
                Json(StartSessionResponse {
                    session_id: stats.session_id.clone(),
                    state: state.session.state(),
                    message: "Call started".to_string(),
                }),
            )
                .into_response()
        }
        Err(SessionError::AlreadyActive) => {
            error_response(StatusCode::CONFLICT, SessionError::AlreadyActive.to_string())
        }
        Err(e) => {
            error!("Failed to start session: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to start session: {}", e),
            )
        }
    }
}

/// POST /session/stop
/// Hang up; valid in any state
pub async fn stop_session(State(state): State<AppState>) -> impl IntoResponse {
    info!("Stop requested over HTTP");

    let stats = state.session.stop().await;
    (
        StatusCode::OK,
        Json(StopSessionResponse {
            state: state.session.state(),
            message: "Call ended".to_string(),
            stats,
        }),
    )
}

/// GET /session/status
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let session_state = state.session.state();
    (
        StatusCode::OK,
        Json(StatusResponse {
            status: session_state.status_text(),
            state: session_state,
            stats: state.session.stats().await,
        }),
    )
}

/// GET /session/transcript
/// Transcript of the current (or last) call
pub async fn get_transcript(State(state): State<AppState>) -> impl IntoResponse {
    let entries: Vec<TranscriptEntry> = state.session.transcript_entries().await;
    (StatusCode::OK, Json(entries))
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
