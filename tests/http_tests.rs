// HTTP control API tests

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{test_config, MockAgent, TIMEOUT};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;
use triage_voice::audio::{AudioBackend, AudioSink, CaptureConfig, NullSink};
use triage_voice::error::CaptureError;
use triage_voice::session::{BackendProvider, PlaybackConfig, SinkProvider};
use triage_voice::{create_router, AppState, VoiceSession};

async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_health() {
    let app = create_router(AppState::new(VoiceSession::new(test_config("ws://127.0.0.1:9/ws"))));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"OK");
}

#[tokio::test]
async fn test_status_and_transcript_when_idle() {
    let app = create_router(AppState::new(VoiceSession::new(test_config("ws://127.0.0.1:9/ws"))));

    let (status, json) = call(&app, "GET", "/session/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"]["state"], "idle");
    assert_eq!(json["status"], "Ready");
    assert_eq!(json["stats"]["frames_sent"], 0);

    let (status, json) = call(&app, "GET", "/session/transcript").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, Value::Array(vec![]));
}

#[tokio::test]
async fn test_start_with_denied_microphone() {
    let backends: BackendProvider = Arc::new(
        |_: &CaptureConfig| -> Result<Box<dyn AudioBackend>, CaptureError> {
            Err(CaptureError::PermissionDenied("blocked by user".to_string()))
        },
    );
    let sinks: SinkProvider = Arc::new(
        |_: &PlaybackConfig| -> anyhow::Result<Box<dyn AudioSink>> {
            Ok(Box::new(NullSink::default()))
        },
    );
    let session =
        VoiceSession::with_providers(test_config("ws://127.0.0.1:9/ws"), backends, sinks);
    let app = create_router(AppState::new(session));

    let (status, json) = call(&app, "POST", "/session/start").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json["error"].as_str().unwrap().contains("blocked by user"));

    let (_, json) = call(&app, "GET", "/session/status").await;
    assert_eq!(json["state"]["state"], "error");
    assert_eq!(json["state"]["kind"], "permission_denied");
}

#[tokio::test]
async fn test_start_stop_cycle() {
    let mut agent = MockAgent::start().await;
    let state = AppState::new(VoiceSession::new(test_config(&agent.url)));
    let app = create_router(state.clone());
    let mut transcript = state.session.subscribe_transcript();

    let (status, json) = call(&app, "POST", "/session/start").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"]["state"], "listening");
    let session_id = json["session_id"].as_str().unwrap().to_string();
    assert!(!session_id.is_empty());

    let mut conn = agent.next_connection().await;
    assert_eq!(conn.next_text().await.as_deref(), Some(r#"{"type":"start"}"#));

    let (status, json) = call(&app, "POST", "/session/start").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "session already active");

    conn.send_text(r#"{"type":"greeting","text":"Hello"}"#);
    tokio::time::timeout(TIMEOUT, transcript.recv())
        .await
        .unwrap()
        .unwrap();

    let (status, json) = call(&app, "POST", "/session/stop").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"]["state"], "idle");
    assert_eq!(json["stats"]["session_id"], session_id);

    // The transcript survives the end of the call
    let (_, json) = call(&app, "GET", "/session/transcript").await;
    let entries = json.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["role"], "agent");
    assert_eq!(entries[0]["text"], "Hello");
}
