//! API endpoint integration tests

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use murmur_gateway::api::{ApiServer, ApiState};
use murmur_gateway::backends::Backends;
use murmur_gateway::session::Outbound;
use murmur_gateway::{Session, State};
use tower::ServiceExt;

mod common;
use common::{EchoSynthesizer, FixedTrigger, test_settings};

fn test_state(backends: Backends) -> Arc<ApiState> {
    Arc::new(ApiState::new(backends, test_settings()))
}

fn build_test_router(state: Arc<ApiState>) -> axum::Router {
    ApiServer::new(state, 0, None).router()
}

async fn get_json(router: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn health_reports_ok() {
    let (status, json) = get_json(build_test_router(test_state(Backends::default())), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(json["sessions"], 0);
}

#[tokio::test]
async fn capabilities_reflect_backends() {
    let backends = Backends {
        trigger: Some(Arc::new(FixedTrigger::new(true))),
        synthesizer: Some(Arc::new(EchoSynthesizer::default())),
        ..Backends::default()
    };
    let (status, json) =
        get_json(build_test_router(test_state(backends)), "/api/capabilities").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["trigger"]["status"], "ok");
    assert_eq!(json["synthesizer"]["status"], "ok");
    assert_eq!(json["transcriber"]["status"], "unavailable");
    assert_eq!(json["transcriber"]["message"], "not configured");
    assert!(json["trigger"].get("message").is_none());
}

#[tokio::test]
async fn sessions_are_listed() {
    let state = test_state(Backends::default());
    let (outbound, _rx) = Outbound::channel(8);
    let session = Session::start(Backends::default(), test_settings(), outbound).await;
    state.sessions.insert(Arc::clone(&session));

    let (status, json) = get_json(build_test_router(state.clone()), "/api/sessions").await;
    assert_eq!(status, StatusCode::OK);
    let list = json.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], session.id().to_string());
    assert_eq!(list[0]["state"], "IDLE");

    let uri = format!("/api/sessions/{}", session.id());
    let (status, json) = get_json(build_test_router(state.clone()), &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], session.id().to_string());

    assert_eq!(state.sessions.close_all().await, 1);
    assert_eq!(session.state(), State::Disconnected);
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let uri = format!("/api/sessions/{}", uuid::Uuid::new_v4());
    let (status, _) = get_json(build_test_router(test_state(Backends::default())), &uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn websocket_route_requires_upgrade() {
    let response = build_test_router(test_state(Backends::default()))
        .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn unknown_route_is_not_found_without_static_dir() {
    let (status, _) = get_json(build_test_router(test_state(Backends::default())), "/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
