//! Webhook HTTP surface: signature verification and status codes.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use vigil::adapters::sqlite::KnowledgeBase;
use vigil::domain::models::config::GithubConfig;
use vigil::infrastructure::ai::{RequestGate, RetryPolicy};
use vigil::infrastructure::http::{build_router, webhook::sign_body, WebhookState};
use vigil::infrastructure::notify::LogNotifier;
use vigil::infrastructure::state::StateStore;
use vigil::services::planner::Planner;
use vigil::services::push_ingestor::PushIngestor;

const SECRET: &str = "s3cret";

async fn spawn_server(ready: bool) -> (String, TempDir) {
    let dir = TempDir::new().unwrap();
    let planner = Arc::new(Planner::new(
        vec![],
        RequestGate::new(Duration::from_millis(1)),
        RetryPolicy::new(1, 1, 2),
        0.3,
    ));
    let pool = vigil::adapters::sqlite::connection::create_test_pool()
        .await
        .unwrap();
    let kb = Arc::new(KnowledgeBase::with_pool(pool).await.unwrap());
    let notifier = Arc::new(LogNotifier::new(false));
    let state = StateStore::new(dir.path()).unwrap();

    let ingestor = Arc::new(PushIngestor::new(
        GithubConfig::default(),
        planner,
        kb,
        notifier,
        state,
    ));
    ingestor.set_ready(ready);

    let app = build_router(WebhookState {
        secret: SECRET.to_string(),
        ingestor,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), dir)
}

#[tokio::test]
async fn test_valid_signature_returns_200() {
    let (base, _dir) = spawn_server(true).await;
    let body = br#"{"zen":"test"}"#.to_vec();
    let signature = sign_body(SECRET, &body);

    let response = reqwest::Client::new()
        .post(format!("{base}/webhook"))
        .header("X-Hub-Signature-256", signature)
        .header("X-GitHub-Event", "ping")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn test_tampered_body_returns_401() {
    let (base, _dir) = spawn_server(true).await;
    let signature = sign_body(SECRET, br#"{"zen":"test"}"#);

    let response = reqwest::Client::new()
        .post(format!("{base}/webhook"))
        .header("X-Hub-Signature-256", signature)
        .header("X-GitHub-Event", "ping")
        // One byte differs from the signed body.
        .body(r#"{"zen":"tesT"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn test_missing_signature_returns_401() {
    let (base, _dir) = spawn_server(true).await;
    let response = reqwest::Client::new()
        .post(format!("{base}/webhook"))
        .header("X-GitHub-Event", "push")
        .body(r#"{"zen":"test"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn test_not_ready_returns_202() {
    let (base, _dir) = spawn_server(false).await;
    let body = br#"{"zen":"test"}"#.to_vec();
    let signature = sign_body(SECRET, &body);

    let response = reqwest::Client::new()
        .post(format!("{base}/webhook"))
        .header("X-Hub-Signature-256", signature)
        .header("X-GitHub-Event", "push")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 202);
}

#[tokio::test]
async fn test_health_endpoint() {
    let (base, _dir) = spawn_server(true).await;
    let response = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "github-webhook");
    assert!(body["timestamp"].as_str().is_some());
}
