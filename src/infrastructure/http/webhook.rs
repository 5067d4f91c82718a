//! Webhook HTTP server.
//!
//! `POST /webhook` verifies the shared-secret HMAC (SHA-256 of the
//! raw body, compared in constant time) before dispatching to the
//! push ingestor: 200 accepted, 202 queued while the pipeline is not
//! yet ready, 401 on signature failure, 500 on handler error.
//! `GET /health` reports service health.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::services::push_ingestor::PushIngestor;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct WebhookState {
    pub secret: String,
    pub ingestor: Arc<PushIngestor>,
}

/// Constant-time verification of `X-Hub-Signature-256`.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    // verify_slice is constant-time.
    mac.verify_slice(&expected).is_ok()
}

pub fn build_router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: WebhookState, port: u16) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "webhook server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if !verify_signature(&state.secret, &body, signature) {
        warn!("webhook signature verification failed");
        return (StatusCode::UNAUTHORIZED, "signature verification failed").into_response();
    }

    let event_type = headers
        .get("X-GitHub-Event")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("ping")
        .to_string();

    if !state.ingestor.is_ready() {
        info!(event = %event_type, "pipeline not ready, queuing delivery");
        return (StatusCode::ACCEPTED, "queued").into_response();
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "webhook body is not valid JSON");
            return (StatusCode::INTERNAL_SERVER_ERROR, "invalid payload").into_response();
        }
    };

    match state.ingestor.handle_webhook(&event_type, &payload).await {
        Ok(()) => (StatusCode::OK, "accepted").into_response(),
        Err(e) => {
            error!(error = %e, event = %event_type, "webhook handler failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "handler error").into_response()
        }
    }
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "github-webhook",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Sign a body the way the webhook sender does. Test helper.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_round_trip() {
        let secret = "s3cret";
        let body = br#"{"zen":"test"}"#;
        let header = sign_body(secret, body);
        assert!(verify_signature(secret, body, &header));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let secret = "s3cret";
        let header = sign_body(secret, br#"{"zen":"test"}"#);
        assert!(!verify_signature(secret, br#"{"zen":"tesT"}"#, &header));
    }

    #[test]
    fn test_bad_header_shapes_rejected() {
        let secret = "s3cret";
        let body = br#"{"zen":"test"}"#;
        assert!(!verify_signature(secret, body, ""));
        assert!(!verify_signature(secret, body, "sha1=abcdef"));
        assert!(!verify_signature(secret, body, "sha256=nothex"));
        assert!(!verify_signature(secret, body, "sha256=deadbeef"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = br#"{"zen":"test"}"#;
        let header = sign_body("s3cret", body);
        assert!(!verify_signature("other", body, &header));
    }
}
