//! Session REST routes

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;

use super::ApiState;
use crate::Error;
use crate::session::{NewSession, SessionMode, SessionStatus};

/// Response for a created session
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_id: String,
    pub status: SessionStatus,
    pub mode: SessionMode,
}

/// Status snapshot of a session
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub story_id: String,
    pub status: SessionStatus,
    pub mode: SessionMode,
    pub is_speaking: bool,
    pub is_generating: bool,
    pub playback_position_ms: u64,
    pub turn_count: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

fn error_response(status: StatusCode, err: &Error) -> Response {
    (
        status,
        Json(ErrorBody {
            code: err.code(),
            message: err.to_string(),
        }),
    )
        .into_response()
}

async fn create_session(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<NewSession>,
) -> Response {
    match state.registry.create(request).await {
        Ok(machine) => (
            StatusCode::CREATED,
            Json(CreatedSession {
                session_id: machine.id().to_string(),
                status: machine.status(),
                mode: machine.mode(),
            }),
        )
            .into_response(),
        Err(e @ Error::Protocol(_)) => error_response(StatusCode::BAD_REQUEST, &e),
        Err(e) => {
            tracing::error!(error = %e, "failed to create session");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}

async fn get_session(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Response {
    let live = match state.registry.get(&id).await {
        Ok(live) => live,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    };

    if let Some(machine) = live {
        let session = machine.snapshot();
        return Json(SessionStatusResponse {
            session_id: session.id,
            story_id: session.story_id,
            status: session.status,
            mode: session.mode,
            is_speaking: session.is_speaking,
            is_generating: machine.is_generating(),
            playback_position_ms: session.playback_position_ms,
            turn_count: machine.history().len(),
            created_at: session.created_at,
        })
        .into_response();
    }

    // ended sessions are only known to the store
    match state.registry.services().store.get(&id) {
        Ok(Some(session)) => Json(SessionStatusResponse {
            session_id: session.id,
            story_id: session.story_id,
            status: session.status,
            mode: session.mode,
            is_speaking: false,
            is_generating: false,
            playback_position_ms: session.playback_position_ms,
            turn_count: 0,
            created_at: session.created_at,
        })
        .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, &Error::SessionNotFound(id)),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

/// Build session router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", post(create_session))
        .route("/{id}", get(get_session))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            super::auth::require_api_key,
        ))
        .with_state(state)
}
