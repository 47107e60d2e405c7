//! Session introspection endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use uuid::Uuid;

use super::ApiState;
use crate::session::SessionSummary;

/// Build sessions router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_sessions))
        .route("/{id}", get(get_session))
        .with_state(state)
}

async fn list_sessions(State(state): State<Arc<ApiState>>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.summaries())
}

async fn get_session(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSummary>, StatusCode> {
    state
        .sessions
        .summaries()
        .into_iter()
        .find(|summary| summary.id == id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
