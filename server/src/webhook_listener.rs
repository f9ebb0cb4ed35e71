//! HTTP ingress for provider completion callbacks (spec §4.7 ingress #1).
//! The exact signing scheme is provider-specific and out of scope (§1);
//! this listener verifies against a single shared secret configured for
//! the deployment, which is the minimal mechanism the spec's abstract
//! "verifies the callback against the provider's signing scheme" step
//! requires us to have in place (see DESIGN.md).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use mediaforge_core::gateway::{normalize_provider_outputs, CompletionGateway};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct WebhookListenerState {
    pub gateway: Arc<CompletionGateway>,
    pub callback_secret: Option<String>,
}

pub fn router(state: WebhookListenerState) -> Router {
    Router::new()
        .route("/jobs/:job_record_id/callback", post(handle_callback))
        .with_state(state)
}

async fn handle_callback(
    State(state): State<WebhookListenerState>,
    Path(job_record_id): Path<Uuid>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    if let Some(secret) = &state.callback_secret {
        let signature = headers
            .get("x-provider-signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify(secret, &body, signature) {
            return (StatusCode::UNAUTHORIZED, "bad signature").into_response();
        }
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return (StatusCode::BAD_REQUEST, "malformed callback body").into_response(),
    };

    let status = payload.get("status").and_then(|v| v.as_str()).unwrap_or("completed");

    let result = if status == "failed" {
        let error = payload
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("provider reported failure")
            .to_string();
        state.gateway.fail(job_record_id, error).await
    } else {
        match normalize_provider_outputs(&payload) {
            Ok(outputs) => state.gateway.complete(job_record_id, outputs).await,
            Err(e) => {
                tracing::warn!(job_record_id = %job_record_id, error = %e, "unparseable callback payload");
                return (StatusCode::BAD_REQUEST, "unrecognized output shape").into_response();
            }
        }
    };

    match result {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"ok": true}))).into_response(),
        Err(e) => {
            tracing::error!(job_record_id = %job_record_id, error = %e, "callback processing failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "processing failed").into_response()
        }
    }
}

fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex_sig) = signature.strip_prefix("sha256=").or(Some(signature)) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());
    expected == hex_sig
}
