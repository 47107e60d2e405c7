//! Health and capability endpoints

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use super::ApiState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub sessions: usize,
}

/// Which backend capabilities new sessions receive
#[derive(Debug, Serialize)]
pub struct CapabilitiesResponse {
    pub detector: CheckResult,
    pub trigger: CheckResult,
    pub transcriber: CheckResult,
    pub generator: CheckResult,
    pub synthesizer: CheckResult,
}

/// Result of a single capability check
#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckResult {
    const fn ok() -> Self {
        Self {
            status: "ok",
            message: None,
        }
    }

    fn unavailable() -> Self {
        Self {
            status: "unavailable",
            message: Some("not configured".to_string()),
        }
    }

    fn from_present(present: bool) -> Self {
        if present { Self::ok() } else { Self::unavailable() }
    }
}

/// Build health router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/capabilities", get(capabilities))
        .with_state(state)
}

/// Liveness probe
async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.sessions.len(),
    })
}

async fn capabilities(State(state): State<Arc<ApiState>>) -> Json<CapabilitiesResponse> {
    let backends = &state.backends;
    Json(CapabilitiesResponse {
        detector: CheckResult::from_present(backends.detector.is_some()),
        trigger: CheckResult::from_present(backends.trigger.is_some()),
        transcriber: CheckResult::from_present(backends.transcriber.is_some()),
        generator: CheckResult::from_present(backends.generator.is_some()),
        synthesizer: CheckResult::from_present(backends.synthesizer.is_some()),
    })
}
