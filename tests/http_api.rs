//! HTTP surface served on an ephemeral port and driven with reqwest.

use lmsession::connection::ConnectionInfo;
use lmsession::http_server::{router, AppState};
use lmsession::registry::SessionRegistry;
use lmsession::service::ChatService;
use lmsession::session::SessionContext;
use lmsession::testing::ScriptedConnector;
use serde_json::{json, Value};
use std::sync::Arc;

async fn spawn_server(backend: &ScriptedConnector) -> String {
    let connection = ConnectionInfo::new("localhost", "1234", None).unwrap();
    let context = SessionContext::new(Arc::new(backend.clone()), connection);
    let service = ChatService::new(Arc::new(SessionRegistry::new(context)));
    let app = router(AppState::new(service), &[]);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let backend = ScriptedConnector::new(["m1"]).with_fragments(["He", "llo"]);
    let base = spawn_server(&backend).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{}/sessions", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["session_id"].as_str().unwrap().to_string();

    let status = client
        .put(format!("{}/sessions/{}/model", base, id))
        .json(&json!({ "model": "m1" }))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 200);

    let reply: Value = client
        .post(format!("{}/sessions/{}/messages", base, id))
        .json(&json!({ "text": "hi" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reply["text"], "Hello");

    let detail: Value = client
        .get(format!("{}/sessions/{}", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["turns"], 2);
    assert_eq!(detail["conversation"][1]["role"], "assistant");
    assert_eq!(detail["conversation"][1]["text"], "Hello");

    let status = client
        .delete(format!("{}/sessions/{}", base, id))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 204);
}

#[tokio::test]
async fn unknown_session_maps_to_404() {
    let base = spawn_server(&ScriptedConnector::new(["m1"])).await;
    let response = reqwest::Client::new()
        .post(format!("{}/sessions/unknown-id/messages", base))
        .json(&json!({ "text": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "session_not_found");
}

#[tokio::test]
async fn missing_model_maps_to_400() {
    let base = spawn_server(&ScriptedConnector::new(["m1"])).await;
    let client = reqwest::Client::new();
    client
        .put(format!("{}/sessions/s1", base))
        .send()
        .await
        .unwrap();

    let response = client
        .post(format!("{}/sessions/s1/messages", base))
        .json(&json!({ "text": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "model_not_selected");
}

#[tokio::test]
async fn stream_endpoint_emits_fragments_then_done() {
    let backend = ScriptedConnector::new(["m1"]).with_fragments(["a", "b"]);
    let base = spawn_server(&backend).await;
    let client = reqwest::Client::new();
    client
        .put(format!("{}/sessions/s1", base))
        .send()
        .await
        .unwrap();
    client
        .put(format!("{}/sessions/s1/model", base))
        .json(&json!({ "model": "m1" }))
        .send()
        .await
        .unwrap();

    let body = client
        .post(format!("{}/sessions/s1/messages/stream", base))
        .json(&json!({ "text": "go" }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let fragment_a = body.find("event: fragment\ndata: a").unwrap();
    let fragment_b = body.find("event: fragment\ndata: b").unwrap();
    let done = body.find("event: done").unwrap();
    assert!(fragment_a < fragment_b && fragment_b < done);
    assert!(!body.contains("event: error"));
}

#[tokio::test]
async fn stream_failure_emits_error_event() {
    let backend = ScriptedConnector::new(["m1"]).with_fragments(["a", "b"]);
    backend.set_fail_after(Some(1));
    let base = spawn_server(&backend).await;
    let client = reqwest::Client::new();
    client
        .put(format!("{}/sessions/s1", base))
        .send()
        .await
        .unwrap();
    client
        .put(format!("{}/sessions/s1/model", base))
        .json(&json!({ "model": "m1" }))
        .send()
        .await
        .unwrap();

    let body = client
        .post(format!("{}/sessions/s1/messages/stream", base))
        .json(&json!({ "text": "go" }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("event: error"));
    assert!(body.contains("\"kind\":\"stream\""));
    assert!(!body.contains("event: done"));
}

#[tokio::test]
async fn cancel_on_idle_session_reports_false() {
    let base = spawn_server(&ScriptedConnector::new(["m1"])).await;
    let client = reqwest::Client::new();
    client
        .put(format!("{}/sessions/s1", base))
        .send()
        .await
        .unwrap();
    let body: Value = client
        .post(format!("{}/sessions/s1/cancel", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["cancelled"], false);
}

#[tokio::test]
async fn stream_fragments_with_carriage_returns_complete() {
    let backend = ScriptedConnector::new(["m1"]).with_fragments(["line one\r\n", "line two\r"]);
    let base = spawn_server(&backend).await;
    let client = reqwest::Client::new();
    client
        .put(format!("{}/sessions/s1", base))
        .send()
        .await
        .unwrap();
    client
        .put(format!("{}/sessions/s1/model", base))
        .json(&json!({ "model": "m1" }))
        .send()
        .await
        .unwrap();

    let body = client
        .post(format!("{}/sessions/s1/messages/stream", base))
        .json(&json!({ "text": "go" }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(body.contains("event: fragment\ndata: line one\ndata: \n"));
    assert!(body.contains("event: fragment\ndata: line two\ndata: \n"));
    assert!(body.contains("event: done"));
    assert!(!body.contains("event: error"));
    assert!(!body.contains('\r'));

    let detail: Value = client
        .get(format!("{}/sessions/s1", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["conversation"][1]["text"], "line one\r\nline two\r");
}
